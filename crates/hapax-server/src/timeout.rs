//! Per-request timeout middleware with a late-write guard (§4.5).
//!
//! Runs the handler as a concurrent task under a deadline. If the deadline
//! fires first, a 504 is emitted only if nothing has been written yet;
//! otherwise the handler's (possibly partial) response wins and the
//! handler is left to finish on its own task.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::{
    extract::Extension,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::error::ErrorBody;
use crate::metrics::Metrics;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct TimeoutConfig(pub Duration);

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self(DEFAULT_TIMEOUT)
    }
}

/// Signal set on the first byte the handler writes. The timeout branch
/// checks this non-destructively before emitting its own headers, so a
/// handler that has already started writing is never double-written.
#[derive(Clone, Default)]
pub struct WriteGuard(Arc<AtomicBool>);

impl WriteGuard {
    pub fn mark_written(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn has_written(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub async fn timeout_middleware(
    Extension(config): Extension<TimeoutConfig>,
    Extension(metrics): Extension<Metrics>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let request_id = req
        .extensions()
        .get::<hapax_core::RequestContext>()
        .map(|c| c.request_id_string())
        .unwrap_or_default();

    let write_guard = WriteGuard::default();
    req.extensions_mut().insert(write_guard.clone());

    let deadline = req
        .extensions()
        .get::<hapax_core::RequestContext>()
        .and_then(|c| c.test_timeout)
        .unwrap_or(config.0);

    let handler = next.run(req);
    tokio::pin!(handler);

    tokio::select! {
        response = &mut handler => response,
        _ = tokio::time::sleep(deadline) => {
            if write_guard.has_written() {
                // The handler already started writing; let it finish and
                // surface whatever it produces rather than double-writing.
                handler.await
            } else {
                metrics.inc_timeout_rejections();
                warn!(request_id = %request_id, "request timed out");
                let body = ErrorBody::new("internal", "Request timeout", request_id);
                (axum::http::StatusCode::GATEWAY_TIMEOUT, axum::Json(body)).into_response()
            }
        }
    }
}
