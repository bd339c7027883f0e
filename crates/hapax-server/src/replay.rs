//! HTTP/3 0-RTT replay protection (§4.6).
//!
//! Active only for POST requests when 0-RTT is enabled and replay is
//! disallowed. Fingerprints `URL || Content-Type || Authorization || body`
//! with SHA-256, and rejects a repeat within the window with 425 Too Early.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Bytes,
    extract::Extension,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::ErrorBody;
use crate::metrics::Metrics;

pub const SEEN_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Whether this connection negotiated 0-RTT and replay protection should
/// run. Plain HTTP/1 and HTTP/2 connections never set this extension, so
/// the middleware is a no-op for them.
#[derive(Debug, Clone, Copy)]
pub struct ZeroRtt(pub bool);

/// Process-wide seen-fingerprint map (§3 ReplaySeenMap). Entries older than
/// `SEEN_WINDOW` are evicted lazily on insertion.
#[derive(Clone, Default)]
pub struct ReplayGuard {
    seen: Arc<DashMap<[u8; 32], Instant>>,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `fingerprint` was already seen within the window
    /// (a replay); otherwise records it and returns `false`.
    pub fn check_and_record(&self, fingerprint: [u8; 32]) -> bool {
        let is_replay = self.seen.contains_key(&fingerprint);
        if !is_replay {
            self.seen.insert(fingerprint, Instant::now());
        }
        self.evict_expired();
        is_replay
    }

    fn evict_expired(&self) {
        let cutoff = Instant::now() - SEEN_WINDOW;
        self.seen.retain(|_, seen_at| *seen_at > cutoff);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }
}

pub fn fingerprint(url: &str, content_type: &str, authorization: &str, body: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(content_type.as_bytes());
    hasher.update(authorization.as_bytes());
    hasher.update(body);
    hasher.finalize().into()
}

pub async fn replay_protect_middleware(
    Extension(guard): Extension<ReplayGuard>,
    Extension(metrics): Extension<Metrics>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let zero_rtt = req
        .extensions()
        .get::<ZeroRtt>()
        .copied()
        .unwrap_or(ZeroRtt(false));

    if req.method() != axum::http::Method::POST || !zero_rtt.0 {
        return next.run(req).await;
    }

    let request_id = req
        .extensions()
        .get::<hapax_core::RequestContext>()
        .map(|c| c.request_id_string())
        .unwrap_or_default();

    let url = req.uri().to_string();
    let content_type = req
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let authorization = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "failed to buffer request body for replay fingerprinting");
            Bytes::new()
        }
    };

    let fp = fingerprint(&url, &content_type, &authorization, &bytes);
    if guard.check_and_record(fp) {
        metrics.inc_replay_rejections();
        warn!(request_id = %request_id, "rejected replayed 0-RTT request");
        let body = ErrorBody::new("replay", "Replayed request rejected", request_id);
        return (axum::http::StatusCode::TOO_EARLY, axum::Json(body)).into_response();
    }

    // Re-wrap the fully-buffered body so downstream handlers still see it.
    let req = Request::from_parts(parts, axum::body::Body::from(bytes));
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_inputs_fingerprint_identically() {
        let a = fingerprint("/v1/completions", "application/json", "Bearer x", b"{}");
        let b = fingerprint("/v1/completions", "application/json", "Bearer x", b"{}");
        assert_eq!(a, b);
    }

    #[test]
    fn differing_bodies_fingerprint_differently() {
        let a = fingerprint("/v1/completions", "application/json", "Bearer x", b"{}");
        let b = fingerprint("/v1/completions", "application/json", "Bearer x", b"{\"a\":1}");
        assert_ne!(a, b);
    }

    #[test]
    fn second_identical_fingerprint_is_flagged_as_a_replay() {
        let guard = ReplayGuard::new();
        let fp = fingerprint("/v1/completions", "application/json", "Bearer x", b"{}");
        assert!(!guard.check_and_record(fp));
        assert!(guard.check_and_record(fp));
    }
}
