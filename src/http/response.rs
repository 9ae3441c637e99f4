//! Response handling and transformation.
//!
//! # Responsibilities
//! - Turn the upstream response into the client response (CORS, debug headers)
//! - Point pass-through redirects back at the proxy
//! - Render `ProxyError` as a status plus JSON body
//!
//! # Design Decisions
//! - Streaming responses avoid buffering entire body
//! - Error responses still carry `Access-Control-Allow-Origin` so the
//!   browser can read why the proxy refused

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Response};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::cors::headers::{
    apply_cors, proxied_location, redirect_header_name, strip_response_headers, CorsContext,
    X_FINAL_URL, X_REQUEST_URL,
};
use crate::cors::policy::CorsPolicy;
use crate::cors::target;
use crate::error::ProxyError;
use crate::forward::Forwarded;

impl IntoResponse for ProxyError {
    fn into_response(self) -> axum::response::Response {
        let body = Json(json!({
            "error": self.kind(),
            "message": self.to_string(),
        }));
        (self.status(), body).into_response()
    }
}

/// Render an error, echoing the caller's origin so the body is readable.
pub fn error_response(err: ProxyError, origin: Option<&HeaderValue>) -> axum::response::Response {
    let mut response = err.into_response();
    let headers = response.headers_mut();
    match origin {
        Some(origin) => {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
            headers.append(header::VARY, HeaderValue::from_static("origin"));
        }
        None => {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        }
    }
    response
}

/// Build the client response from a forwarded upstream response.
pub fn finish_forwarded(
    forwarded: Forwarded,
    ctx: &CorsContext,
    policy: &CorsPolicy,
    proxy_base: &str,
) -> Response<Body> {
    let Forwarded {
        response,
        first_target,
        final_target,
        redirects,
    } = forwarded;
    let (mut parts, body) = response.into_parts();
    let headers: &mut HeaderMap = &mut parts.headers;

    strip_response_headers(headers);

    if parts.status.is_redirection() {
        let rewritten = headers
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|loc| target::resolve_location(&final_target, loc, Default::default()).ok())
            .and_then(|next| proxied_location(proxy_base, next.as_str()));
        if let Some(location) = rewritten {
            headers.insert(header::LOCATION, location);
        }
    }

    for (hop, redirect) in redirects.iter().enumerate() {
        let value = format!("{} {}", redirect.status.as_u16(), redirect.location);
        if let (Some(name), Ok(value)) = (redirect_header_name(hop as u32 + 1), HeaderValue::from_str(&value)) {
            headers.insert(name, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(first_target.as_str()) {
        headers.insert(X_REQUEST_URL, value);
    }
    if let Ok(value) = HeaderValue::from_str(final_target.as_str()) {
        headers.insert(X_FINAL_URL, value);
    }

    apply_cors(headers, ctx, policy, false);
    Response::from_parts(parts, body)
}
