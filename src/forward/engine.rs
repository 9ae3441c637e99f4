//! Upstream forwarding with in-proxy redirect handling.
//!
//! # Responsibilities
//! - Send the rewritten request to the target and stream the body both ways
//! - Bound the exchange by the connect, idle and total timeouts
//! - Follow 301/302/303 up to `max_redirects`, re-checking every hop
//! - Map transport failures onto `ProxyError`
//!
//! # Design Decisions
//! - One attempt per request: redirects are followed, failures never retried
//! - 307/308 are not followed here (the body may already be consumed);
//!   they go back to the browser pointing at the proxy

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, HttpBody};
use axum::http::{header, HeaderMap, Method, Request, Response, StatusCode};
use tokio::time::Instant;

use crate::config::ProxyConfig;
use crate::cors::policy::CorsPolicy;
use crate::cors::target::{self, Target, TargetPolicy};
use crate::error::{ProxyError, ProxyResult};
use crate::forward::body;
use crate::forward::client::{build_client, PrivateTargetError, UpstreamClient};
use crate::observability::metrics;

/// A redirect followed inside the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectHop {
    pub status: StatusCode,
    pub location: String,
}

/// Everything needed to forward one request.
pub struct ForwardRequest {
    pub method: Method,
    pub target: Target,
    /// Headers already rewritten for upstream.
    pub headers: HeaderMap,
    /// Inbound headers, used to re-run the origin policy on redirects.
    pub inbound_headers: HeaderMap,
    pub body: Body,
    pub request_id: String,
}

/// Upstream response plus the path taken to get it.
pub struct Forwarded {
    pub response: Response<Body>,
    pub first_target: Target,
    pub final_target: Target,
    pub redirects: Vec<RedirectHop>,
}

/// Forwarding engine shared by all handlers.
#[derive(Clone)]
pub struct Forwarder {
    client: UpstreamClient,
    policy: Arc<CorsPolicy>,
    target_policy: TargetPolicy,
    max_redirects: u32,
    request_timeout: Duration,
    idle_timeout: Duration,
}

impl Forwarder {
    pub fn new(config: &ProxyConfig, policy: Arc<CorsPolicy>) -> Self {
        Self {
            client: build_client(
                config.timeouts.connect(),
                config.timeouts.idle(),
                config.forwarding.deny_private_targets,
            ),
            policy,
            target_policy: TargetPolicy {
                deny_private: config.forwarding.deny_private_targets,
            },
            max_redirects: config.forwarding.max_redirects,
            request_timeout: config.timeouts.request(),
            idle_timeout: config.timeouts.idle(),
        }
    }

    pub fn target_policy(&self) -> TargetPolicy {
        self.target_policy
    }

    /// Forward the request, following redirects, and return the upstream
    /// response with its body still streaming.
    pub async fn forward(&self, request: ForwardRequest) -> ProxyResult<Forwarded> {
        let ForwardRequest {
            mut method,
            target,
            mut headers,
            inbound_headers,
            body: inbound_body,
            request_id,
        } = request;

        let deadline = Instant::now() + self.request_timeout;
        let first_target = target.clone();
        let mut target = target;
        let mut body = if inbound_body.is_end_stream() {
            None
        } else {
            Some(body::with_timeouts(inbound_body, "request", self.idle_timeout, deadline))
        };
        let mut redirects = Vec::new();

        loop {
            let upstream_request = build_request(&method, &target, &headers, body.take())?;

            tracing::debug!(
                request_id = %request_id,
                method = %method,
                target = %target,
                hop = redirects.len(),
                "Forwarding upstream"
            );

            let remaining = deadline.saturating_duration_since(Instant::now());
            let response = match tokio::time::timeout(remaining, self.client.request(upstream_request)).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => return Err(classify(&e, &target)),
                Err(_) => return Err(ProxyError::UpstreamTimeout(target.to_string())),
            };

            let status = response.status();
            let location = response
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);

            if let (true, Some(location)) = (is_followed_redirect(status), location) {
                if redirects.len() as u32 >= self.max_redirects {
                    tracing::warn!(
                        request_id = %request_id,
                        limit = self.max_redirects,
                        target = %target,
                        "Redirect limit reached"
                    );
                    return Err(ProxyError::TooManyRedirects {
                        limit: self.max_redirects,
                        target: target.to_string(),
                    });
                }

                let next = target::resolve_location(&target, &location, self.target_policy)?;
                self.policy.check(&inbound_headers)?;

                tracing::debug!(
                    request_id = %request_id,
                    status = %status,
                    from = %target,
                    to = %next,
                    "Following redirect"
                );
                metrics::record_redirect();

                redirects.push(RedirectHop {
                    status,
                    location: next.to_string(),
                });
                if method != Method::HEAD {
                    method = Method::GET;
                }
                headers.remove(header::CONTENT_LENGTH);
                headers.remove(header::CONTENT_TYPE);
                target = next;
                continue;
            }

            let (parts, incoming) = response.into_parts();
            let streamed = body::with_timeouts(Body::new(incoming), "response", self.idle_timeout, deadline);
            return Ok(Forwarded {
                response: Response::from_parts(parts, streamed),
                first_target,
                final_target: target,
                redirects,
            });
        }
    }
}

fn build_request(
    method: &Method,
    target: &Target,
    headers: &HeaderMap,
    body: Option<Body>,
) -> ProxyResult<Request<Body>> {
    let mut builder = Request::builder().method(method.clone()).uri(target.to_uri()?);
    if let Some(map) = builder.headers_mut() {
        map.extend(headers.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    builder
        .body(body.unwrap_or_else(Body::empty))
        .map_err(|e| ProxyError::Internal(e.to_string()))
}

/// Redirects the proxy resolves itself; the request becomes a body-less GET.
pub fn is_followed_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::SEE_OTHER
    )
}

fn classify(err: &hyper_util::client::legacy::Error, target: &Target) -> ProxyError {
    if let Some(private) = find_source::<PrivateTargetError>(err) {
        return ProxyError::InvalidTarget(format!("\"{}\": {}", target, private));
    }
    if is_timeout(err) {
        return ProxyError::UpstreamTimeout(target.to_string());
    }
    ProxyError::UpstreamUnreachable {
        target: target.to_string(),
        message: error_chain(err),
    }
}

fn find_source<'a, T: StdError + 'static>(err: &'a (dyn StdError + 'static)) -> Option<&'a T> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(found) = e.downcast_ref::<T>() {
            return Some(found);
        }
        current = e.source();
    }
    None
}

fn is_timeout(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::TimedOut {
                return true;
            }
        }
        current = e.source();
    }
    false
}

fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut current = err.source();
    while let Some(e) = current {
        message.push_str(": ");
        message.push_str(&e.to_string());
        current = e.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_see_other_family_is_followed() {
        assert!(is_followed_redirect(StatusCode::MOVED_PERMANENTLY));
        assert!(is_followed_redirect(StatusCode::FOUND));
        assert!(is_followed_redirect(StatusCode::SEE_OTHER));
        assert!(!is_followed_redirect(StatusCode::TEMPORARY_REDIRECT));
        assert!(!is_followed_redirect(StatusCode::PERMANENT_REDIRECT));
        assert!(!is_followed_redirect(StatusCode::OK));
    }

    #[test]
    fn timeout_detected_through_sources() {
        #[derive(Debug)]
        struct Wrapper(std::io::Error);

        impl std::fmt::Display for Wrapper {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "connect error")
            }
        }

        impl StdError for Wrapper {
            fn source(&self) -> Option<&(dyn StdError + 'static)> {
                Some(&self.0)
            }
        }

        let timed_out = Wrapper(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"));
        assert!(is_timeout(&timed_out));
        assert_eq!(error_chain(&timed_out), "connect error: slow");

        let refused = Wrapper(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"));
        assert!(!is_timeout(&refused));
    }

    #[tokio::test]
    async fn name_resolving_to_private_address_is_invalid_target() {
        use crate::forward::client::{http_connector, tests::StaticResolver, FilteredResolver};
        use hyper_util::client::legacy::Client;
        use hyper_util::rt::TokioExecutor;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let resolver = FilteredResolver::new(StaticResolver(vec![([127, 0, 0, 1], port).into()]), true);
        let client = Client::builder(TokioExecutor::new())
            .build::<_, Body>(http_connector(resolver, Duration::from_secs(1)));

        let url = format!("/http://internal.example:{}/admin", port);
        let target = target::resolve(&url, TargetPolicy { deny_private: true }).unwrap();
        let request = build_request(&Method::GET, &target, &HeaderMap::new(), None).unwrap();
        let err = client.request(request).await.unwrap_err();

        assert!(matches!(classify(&err, &target), ProxyError::InvalidTarget(_)));
        let accepted = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
        assert!(accepted.is_err(), "upstream must not be contacted");
    }

    #[test]
    fn request_carries_rewritten_headers() {
        let target = target::resolve("/http://example.com/a?b=1", TargetPolicy::default()).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-custom", "1".parse().unwrap());

        let request = build_request(&Method::POST, &target, &headers, None).unwrap();
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.uri().to_string(), "http://example.com/a?b=1");
        assert_eq!(request.headers()["x-custom"], "1");
    }
}
