//! Shared utilities for integration tests: raw-TCP upstreams that count
//! connections, and a helper that runs the proxy on an ephemeral port.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cors_relay::config::ProxyConfig;
use cors_relay::http::HttpServer;
use cors_relay::lifecycle::Shutdown;
use cors_relay::security::ConcurrencyGuard;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// A mock upstream that records what it receives.
pub struct Upstream {
    pub addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl Upstream {
    /// Absolute URL on this upstream, as the proxy expects it in the path.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// TCP connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Highest number of requests handled at the same time.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Raw head and body of every request received.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> Option<String> {
        self.requests().pop()
    }
}

/// Build a raw HTTP/1.1 response that closes the connection.
pub fn http_response(status: &str, headers: &[(&str, &str)], body: &str) -> String {
    let mut out = format!("HTTP/1.1 {}\r\n", status);
    for (name, value) in headers {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    out.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    ));
    out
}

/// Start an upstream whose reply is computed from the raw request text and
/// its own address. Each reply is sent after `delay`.
pub async fn start_upstream<F>(delay: Duration, respond: F) -> Upstream
where
    F: Fn(&str, SocketAddr) -> String + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let upstream = Upstream {
        addr,
        connections: Arc::new(AtomicUsize::new(0)),
        active: Arc::new(AtomicUsize::new(0)),
        peak: Arc::new(AtomicUsize::new(0)),
        requests: Arc::new(Mutex::new(Vec::new())),
    };

    let respond = Arc::new(respond);
    let connections = upstream.connections.clone();
    let active = upstream.active.clone();
    let peak = upstream.peak.clone();
    let requests = upstream.requests.clone();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            connections.fetch_add(1, Ordering::SeqCst);
            let respond = respond.clone();
            let active = active.clone();
            let peak = peak.clone();
            let requests = requests.clone();

            tokio::spawn(async move {
                let Some(request) = read_request(&mut socket).await else {
                    return;
                };
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                requests.lock().unwrap().push(request.clone());

                tokio::time::sleep(delay).await;
                let reply = respond(&request, addr);
                active.fetch_sub(1, Ordering::SeqCst);
                let _ = socket.write_all(reply.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    upstream
}

/// Upstream that always answers 200 with `body`.
pub async fn start_fixed_upstream(body: &'static str) -> Upstream {
    start_upstream(Duration::ZERO, move |_, _| {
        http_response("200 OK", &[("Content-Type", "text/plain")], body)
    })
    .await
}

/// Upstream that answers every request with a 302 back to itself.
pub async fn start_redirect_loop() -> Upstream {
    start_upstream(Duration::ZERO, |_, addr| {
        let location = format!("http://{}/loop", addr);
        http_response("302 Found", &[("Location", &location)], "")
    })
    .await
}

/// Upstream that waits `delay` before answering 200.
pub async fn start_slow_upstream(delay: Duration) -> Upstream {
    start_upstream(delay, |_, _| http_response("200 OK", &[], "slow")).await
}

/// Upstream that sends the response head and the first `sent` bytes of a
/// longer body, then stalls. The flag flips once the proxy closes the
/// connection.
pub async fn start_stalling_upstream(sent: usize) -> (Upstream, Arc<AtomicBool>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let upstream = Upstream {
        addr,
        connections: Arc::new(AtomicUsize::new(0)),
        active: Arc::new(AtomicUsize::new(0)),
        peak: Arc::new(AtomicUsize::new(0)),
        requests: Arc::new(Mutex::new(Vec::new())),
    };
    let closed = Arc::new(AtomicBool::new(false));

    let connections = upstream.connections.clone();
    let requests = upstream.requests.clone();
    let flag = closed.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            connections.fetch_add(1, Ordering::SeqCst);
            let requests = requests.clone();
            let flag = flag.clone();
            tokio::spawn(async move {
                let Some(request) = read_request(&mut socket).await else {
                    return;
                };
                requests.lock().unwrap().push(request);

                let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", sent * 100);
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(&vec![b'x'; sent]).await;

                let mut buf = [0u8; 64];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => continue,
                    }
                }
                flag.store(true, Ordering::SeqCst);
            });
        }
    });

    (upstream, closed)
}

/// Poll `condition` every 10 ms until it holds or `limit` passes.
pub async fn eventually(limit: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// An address with nothing listening on it.
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

async fn read_request(socket: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let head_end = loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_ascii_lowercase();
    let content_length = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok());
    let chunked = head.contains("transfer-encoding: chunked");

    loop {
        let body = &buf[head_end..];
        let complete = match content_length {
            Some(len) => body.len() >= len,
            None if chunked => find(body, b"0\r\n\r\n").is_some(),
            None => true,
        };
        if complete {
            break;
        }
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    Some(String::from_utf8_lossy(&buf).into_owned())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// A proxy running on an ephemeral port.
pub struct Proxy {
    pub addr: SocketAddr,
    pub guard: Arc<ConcurrencyGuard>,
    pub shutdown: Shutdown,
    pub handle: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl Proxy {
    /// Proxy URL for an absolute upstream URL.
    pub fn url(&self, target: &str) -> String {
        format!("http://{}/{}", self.addr, target)
    }

    pub fn base(&self) -> String {
        format!("http://{}", self.addr)
    }
}

/// Start the proxy with `config`; the bind address is replaced.
pub async fn start_proxy(mut config: ProxyConfig) -> Proxy {
    config.listener.bind_address = "127.0.0.1:0".into();
    let listener = TcpListener::bind(&config.listener.bind_address).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = Shutdown::new();
    let server = HttpServer::new(config);
    let guard = server.guard();
    let handle = tokio::spawn(server.run(listener, shutdown.subscribe()));

    Proxy {
        addr,
        guard,
        shutdown,
        handle,
    }
}

/// Client that never reuses connections or goes through a system proxy.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}
