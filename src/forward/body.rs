//! Streaming body adapters.
//!
//! Bodies are never buffered: each chunk is passed through as it arrives.
//! The adapters only add deadlines and keep RAII guards alive for as long
//! as the body is being streamed.

use std::time::Duration;

use axum::body::{Body, Bytes};
use futures_util::{stream, StreamExt};
use thiserror::Error;
use tokio::time::Instant;

/// Why a streamed body was cut short.
#[derive(Debug, Error)]
pub enum BodyError {
    #[error("{side} body idle for more than {idle:?}")]
    Idle { side: &'static str, idle: Duration },

    #[error("{side} body exceeded the transfer deadline")]
    Deadline { side: &'static str },

    #[error("{side} body stream failed: {source}")]
    Stream {
        side: &'static str,
        #[source]
        source: axum::Error,
    },
}

/// Bound the gap between chunks by `idle` and the whole transfer by `deadline`.
///
/// When either fires the stream yields an error, which makes hyper abort the
/// connection carrying it; the peer connection is dropped with it.
pub fn with_timeouts(body: Body, side: &'static str, idle: Duration, deadline: Instant) -> Body {
    let inner = body.into_data_stream();
    let timed = stream::unfold(Some(inner), move |state| async move {
        let mut inner = match state {
            Some(inner) => inner,
            None => return None,
        };

        let now = Instant::now();
        if now >= deadline {
            tracing::warn!(side, "Body transfer deadline reached");
            return Some((Err(BodyError::Deadline { side }), None));
        }
        let wait = idle.min(deadline - now);

        match tokio::time::timeout(wait, inner.next()).await {
            Ok(Some(Ok(chunk))) => Some((Ok::<Bytes, BodyError>(chunk), Some(inner))),
            Ok(Some(Err(source))) => Some((Err(BodyError::Stream { side, source }), None)),
            Ok(None) => None,
            Err(_) if Instant::now() >= deadline => {
                tracing::warn!(side, "Body transfer deadline reached");
                Some((Err(BodyError::Deadline { side }), None))
            }
            Err(_) => {
                tracing::warn!(side, idle_ms = idle.as_millis() as u64, "Body idle timeout");
                Some((Err(BodyError::Idle { side, idle }), None))
            }
        }
    });
    Body::from_stream(timed)
}

/// Keep `guard` alive until the body has been fully streamed or dropped.
pub fn hold<G>(body: Body, guard: G) -> Body
where
    G: Send + 'static,
{
    let stream = body.into_data_stream().map(move |chunk| {
        let _held = &guard;
        chunk
    });
    Body::from_stream(stream)
}
