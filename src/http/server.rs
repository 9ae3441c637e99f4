//! HTTP server setup and the proxy handler.
//!
//! # Responsibilities
//! - Create Axum Router with all handlers
//! - Wire up middleware (request ID, tracing, body limit)
//! - Bind server to listener with graceful shutdown
//! - Drive each request through admission, target resolution, origin
//!   policy, preflight or forwarding, and response rewriting

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::Instrument;

use crate::config::ProxyConfig;
use crate::cors::headers::{is_preflight, prepare_upstream_headers, preflight_response, CorsContext};
use crate::cors::policy::CorsPolicy;
use crate::cors::target;
use crate::error::{ProxyError, ProxyResult};
use crate::forward::{body, ForwardRequest, Forwarder};
use crate::http::request::{proxy_base, request_id, MakeRequestUuidV4, RequestLifecycle, RequestState};
use crate::http::response::{error_response, finish_forwarded};
use crate::observability::metrics;
use crate::security::{ConcurrencyGuard, RateLimiter};

const USAGE: &str = "\
This API enables cross-origin requests to anywhere.

Usage:

/               Shows help
/iscorsneeded   This is the only resource on this host which is served without CORS headers.
/<url>          Create a request to <url>, and includes CORS headers in the response.

<url> must be an absolute http:// or https:// URL.

Preflight (OPTIONS with Access-Control-Request-Method) requests are answered
by the proxy itself. Redirects (301/302/303) are followed by the proxy; the
response carries x-request-url, x-final-url and x-cors-redirect-n headers.
";

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub policy: Arc<CorsPolicy>,
    pub forwarder: Forwarder,
    pub guard: Arc<ConcurrencyGuard>,
    pub rate_limiter: Arc<RateLimiter>,
}

/// HTTP server for the CORS proxy.
pub struct HttpServer {
    router: Router,
    config: ProxyConfig,
    guard: Arc<ConcurrencyGuard>,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: ProxyConfig) -> Self {
        let policy = Arc::new(CorsPolicy::from_config(&config.cors));
        let guard = Arc::new(ConcurrencyGuard::new(&config.limits));

        let state = AppState {
            forwarder: Forwarder::new(&config, policy.clone()),
            policy,
            guard: guard.clone(),
            rate_limiter: Arc::new(RateLimiter::new(&config.rate_limit)),
        };

        let router = Self::build_router(&config, state);
        Self {
            router,
            config,
            guard,
        }
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(config: &ProxyConfig, state: AppState) -> Router {
        Router::new()
            .route("/", any(usage_handler))
            .route("/iscorsneeded", any(is_cors_needed))
            .route("/{*target}", any(proxy_handler))
            .with_state(state)
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::x_request_id(MakeRequestUuidV4))
                    .layer(TraceLayer::new_for_http())
                    .layer(PropagateRequestIdLayer::x_request_id())
                    .layer(middleware::from_fn_with_state(
                        config.limits.max_body_bytes,
                        readable_body_limit,
                    ))
                    .layer(RequestBodyLimitLayer::new(config.limits.max_body_bytes)),
            )
    }

    /// Run the server until `shutdown` fires, then drain open connections.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            max_concurrent = self.guard.max_concurrent(),
            "HTTP server starting"
        );

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received, draining connections");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Shared concurrency guard, for inspecting in-flight counts.
    pub fn guard(&self) -> Arc<ConcurrencyGuard> {
        self.guard.clone()
    }
}

/// Re-render the body-limit layer's bare 413 as a proxy error so the
/// browser can read it.
async fn readable_body_limit(State(limit): State<usize>, request: Request, next: Next) -> Response {
    let origin = request.headers().get(header::ORIGIN).cloned();
    let response = next.run(request).await;

    let bare_rejection = response.status() == StatusCode::PAYLOAD_TOO_LARGE
        && !response.headers().contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN);
    if bare_rejection {
        metrics::record_rejected("body_limit");
        return error_response(ProxyError::PayloadTooLarge(limit), origin.as_ref());
    }
    response
}

async fn usage_handler() -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8")),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*")),
        ],
        USAGE,
    )
        .into_response()
}

async fn is_cors_needed() -> &'static str {
    "no"
}

/// Main proxy handler.
async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let request_id = request_id(request.headers());
    let span = tracing::info_span!(
        "proxy",
        request_id = %request_id,
        method = %request.method(),
        peer = %peer
    );

    let method = request.method().clone();
    let origin = request.headers().get(header::ORIGIN).cloned();
    let mut lifecycle = RequestLifecycle::new(request_id.clone());

    let result = handle(&state, peer, request, request_id, &mut lifecycle)
        .instrument(span)
        .await;

    match result {
        Ok((response, outcome)) => {
            metrics::record_request(&method, response.status().as_u16(), outcome, lifecycle.started());
            if lifecycle.state() == RequestState::ResponseStreaming {
                let (parts, streamed) = response.into_parts();
                return Response::from_parts(parts, body::hold(streamed, lifecycle));
            }
            response
        }
        Err(err) => {
            metrics::record_request(&method, err.status().as_u16(), err.kind(), lifecycle.started());
            tracing::info!(
                state = %lifecycle.state(),
                error = %err,
                status = err.status().as_u16(),
                "Request failed"
            );
            error_response(err, origin.as_ref())
        }
    }
}

async fn handle(
    state: &AppState,
    peer: SocketAddr,
    request: Request,
    request_id: String,
    lifecycle: &mut RequestLifecycle,
) -> ProxyResult<(Response, &'static str)> {
    lifecycle.admitted(state.guard.admit().await?);

    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok());
    state.rate_limiter.check(origin, peer.ip())?;

    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let target = target::resolve(path_and_query, state.forwarder.target_policy())?;
    lifecycle.advance(RequestState::TargetResolved);

    let decision = state.policy.check(request.headers())?;
    let ctx = CorsContext::new(decision, request.headers());
    lifecycle.advance(RequestState::OriginChecked);

    if is_preflight(request.method(), request.headers()) {
        lifecycle.advance(RequestState::PreflightResponded);
        return Ok((preflight_response(&ctx, &state.policy), "preflight"));
    }

    let (parts, inbound_body) = request.into_parts();
    let upstream_headers = prepare_upstream_headers(&parts.headers, &state.policy);
    lifecycle.advance(RequestState::Forwarding);

    let forwarded = state
        .forwarder
        .forward(ForwardRequest {
            method: parts.method.clone(),
            target,
            headers: upstream_headers,
            inbound_headers: parts.headers.clone(),
            body: inbound_body,
            request_id,
        })
        .await?;

    tracing::debug!(
        status = %forwarded.response.status(),
        redirects = forwarded.redirects.len(),
        final_target = %forwarded.final_target,
        "Upstream responded"
    );

    let response = finish_forwarded(forwarded, &ctx, &state.policy, &proxy_base(&parts.headers));
    lifecycle.advance(RequestState::ResponseStreaming);
    Ok((response, "forwarded"))
}

