//! Outbound HTTP(S) client construction.
//!
//! # Design Decisions
//! - One pool for `http` and `https` targets
//! - With `deny_private_targets`, private addresses are dropped after DNS
//!   resolution, so a public name pointing at loopback or a link-local
//!   metadata address cannot be reached either; redirect hops go through
//!   the same connector

use std::error::Error as StdError;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Once;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{
        connect::{
            dns::{GaiResolver, Name},
            HttpConnector,
        },
        Client,
    },
    rt::TokioExecutor,
};
use thiserror::Error;
use tower::Service;

use crate::cors::target::is_private_ip;

type BoxError = Box<dyn StdError + Send + Sync>;

/// Client used for every upstream request.
pub type UpstreamClient = Client<HttpsConnector<HttpConnector<FilteredResolver>>, Body>;

/// Every address a name resolved to was private.
#[derive(Debug, Error)]
#[error("{host} resolves only to private addresses")]
pub struct PrivateTargetError {
    pub host: String,
}

/// DNS resolver that can refuse private addresses.
#[derive(Debug, Clone)]
pub struct FilteredResolver<R = GaiResolver> {
    inner: R,
    deny_private: bool,
}

impl<R> FilteredResolver<R> {
    pub fn new(inner: R, deny_private: bool) -> Self {
        Self { inner, deny_private }
    }
}

impl<R> Service<Name> for FilteredResolver<R>
where
    R: Service<Name>,
    R::Response: Iterator<Item = SocketAddr> + Send + 'static,
    R::Error: Into<BoxError> + Send + 'static,
    R::Future: Send + 'static,
{
    type Response = std::vec::IntoIter<SocketAddr>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, name: Name) -> Self::Future {
        let host = name.as_str().to_string();
        let deny_private = self.deny_private;
        let lookup = self.inner.call(name);

        Box::pin(async move {
            let resolved: Vec<SocketAddr> = lookup.await.map_err(Into::into)?.collect();
            if !deny_private {
                return Ok(resolved.into_iter());
            }

            let public: Vec<SocketAddr> = resolved
                .into_iter()
                .filter(|addr| !is_private_ip(addr.ip()))
                .collect();
            if public.is_empty() {
                tracing::warn!(host = %host, "Refusing target that resolves to private addresses");
                return Err(Box::new(PrivateTargetError { host }) as BoxError);
            }
            Ok(public.into_iter())
        })
    }
}

fn init_crypto_provider() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Plain TCP connector with the proxy's connect settings.
pub fn http_connector<R>(resolver: R, connect_timeout: Duration) -> HttpConnector<R> {
    let mut http = HttpConnector::new_with_resolver(resolver);
    http.enforce_http(false);
    http.set_connect_timeout(Some(connect_timeout));
    http.set_nodelay(true);
    http
}

/// Build the upstream client.
///
/// `http` and `https` targets share one pool; the TCP connect phase is
/// bounded by `connect_timeout`.
pub fn build_client(
    connect_timeout: Duration,
    idle_pool_timeout: Duration,
    deny_private: bool,
) -> UpstreamClient {
    init_crypto_provider();

    let resolver = FilteredResolver::new(GaiResolver::new(), deny_private);
    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .wrap_connector(http_connector(resolver, connect_timeout));

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(idle_pool_timeout)
        .build(https)
}
