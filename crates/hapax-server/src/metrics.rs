//! Prometheus-compatible metrics endpoint for the Hapax gateway.
//!
//! Tracks request counts, breaker state, queue occupancy, rate-limit
//! rejections, and replay detections — the process-wide registry named as
//! a cross-cutting concern in §2. Grounded on the hand-rolled registry this
//! codebase already ships for its own `/metrics` endpoint; no external
//! metrics crate is introduced.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;

/// Global metrics registry.
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    http_requests_total: AtomicU64,
    http_errors_total: AtomicU64,
    rate_limit_rejections_total: AtomicU64,
    queue_full_rejections_total: AtomicU64,
    timeout_rejections_total: AtomicU64,
    replay_rejections_total: AtomicU64,
    provider_failures_total: AtomicU64,
    breaker_trips_total: AtomicU64,
    dedup_hits_total: AtomicU64,
    queue_length: AtomicI64,
    /// Breaker state per provider name, encoded 0=closed, 1=open, 2=half-open.
    breaker_state: DashMap<String, AtomicI64>,
    started_at: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                http_requests_total: AtomicU64::new(0),
                http_errors_total: AtomicU64::new(0),
                rate_limit_rejections_total: AtomicU64::new(0),
                queue_full_rejections_total: AtomicU64::new(0),
                timeout_rejections_total: AtomicU64::new(0),
                replay_rejections_total: AtomicU64::new(0),
                provider_failures_total: AtomicU64::new(0),
                breaker_trips_total: AtomicU64::new(0),
                dedup_hits_total: AtomicU64::new(0),
                queue_length: AtomicI64::new(0),
                breaker_state: DashMap::new(),
                started_at: Instant::now(),
            }),
        }
    }

    pub fn inc_http_requests(&self) {
        self.inner.http_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_http_errors(&self) {
        self.inner.http_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rate_limit_rejections(&self) {
        self.inner.rate_limit_rejections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_queue_full_rejections(&self) {
        self.inner.queue_full_rejections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_timeout_rejections(&self) {
        self.inner.timeout_rejections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_replay_rejections(&self) {
        self.inner.replay_rejections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_provider_failures(&self) {
        self.inner.provider_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_breaker_trips(&self) {
        self.inner.breaker_trips_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dedup_hits(&self) {
        self.inner.dedup_hits_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_queue_length(&self, length: i64) {
        self.inner.queue_length.store(length, Ordering::Relaxed);
    }

    pub fn set_breaker_state(&self, name: &str, state: hapax_provider::BreakerState) {
        let encoded = match state {
            hapax_provider::BreakerState::Closed => 0,
            hapax_provider::BreakerState::Open => 1,
            hapax_provider::BreakerState::HalfOpen => 2,
        };
        self.inner
            .breaker_state
            .entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .store(encoded, Ordering::Relaxed);
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let m = &self.inner;
        let uptime = m.started_at.elapsed().as_secs();

        let mut breaker_lines = String::new();
        for entry in m.breaker_state.iter() {
            breaker_lines.push_str(&format!(
                "hapax_circuit_breaker_state{{provider=\"{}\"}} {}\n",
                entry.key(),
                entry.value().load(Ordering::Relaxed)
            ));
        }

        format!(
            r#"# HELP hapax_uptime_seconds Time since the server started.
# TYPE hapax_uptime_seconds gauge
hapax_uptime_seconds {uptime}

# HELP hapax_http_requests_total Total HTTP requests served.
# TYPE hapax_http_requests_total counter
hapax_http_requests_total {http_requests}

# HELP hapax_http_errors_total Total HTTP errors (4xx/5xx).
# TYPE hapax_http_errors_total counter
hapax_http_errors_total {http_errors}

# HELP hapax_rate_limit_rejections_total Total 429 rate-limit rejections.
# TYPE hapax_rate_limit_rejections_total counter
hapax_rate_limit_rejections_total {rate_limit}

# HELP hapax_queue_full_rejections_total Total 503 admission-queue rejections.
# TYPE hapax_queue_full_rejections_total counter
hapax_queue_full_rejections_total {queue_full}

# HELP hapax_timeout_rejections_total Total 504 timeout responses.
# TYPE hapax_timeout_rejections_total counter
hapax_timeout_rejections_total {timeouts}

# HELP hapax_replay_rejections_total Total 425 replay rejections.
# TYPE hapax_replay_rejections_total counter
hapax_replay_rejections_total {replays}

# HELP hapax_provider_failures_total Total upstream provider failures observed by breakers.
# TYPE hapax_provider_failures_total counter
hapax_provider_failures_total {provider_failures}

# HELP hapax_circuit_breaker_trips_total Total circuit breaker trips to open.
# TYPE hapax_circuit_breaker_trips_total counter
hapax_circuit_breaker_trips_total {breaker_trips}

# HELP hapax_dedup_hits_total Total requests collapsed onto an in-flight single-flight group.
# TYPE hapax_dedup_hits_total counter
hapax_dedup_hits_total {dedup_hits}

# HELP hapax_queue_length Current admission queue length.
# TYPE hapax_queue_length gauge
hapax_queue_length {queue_length}

# HELP hapax_circuit_breaker_state Circuit breaker state per provider (0=closed, 1=open, 2=half-open).
# TYPE hapax_circuit_breaker_state gauge
{breaker_lines}"#,
            uptime = uptime,
            http_requests = m.http_requests_total.load(Ordering::Relaxed),
            http_errors = m.http_errors_total.load(Ordering::Relaxed),
            rate_limit = m.rate_limit_rejections_total.load(Ordering::Relaxed),
            queue_full = m.queue_full_rejections_total.load(Ordering::Relaxed),
            timeouts = m.timeout_rejections_total.load(Ordering::Relaxed),
            replays = m.replay_rejections_total.load(Ordering::Relaxed),
            provider_failures = m.provider_failures_total.load(Ordering::Relaxed),
            breaker_trips = m.breaker_trips_total.load(Ordering::Relaxed),
            dedup_hits = m.dedup_hits_total.load(Ordering::Relaxed),
            queue_length = m.queue_length.load(Ordering::Relaxed),
            breaker_lines = breaker_lines,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Lets the metrics registry hook directly into a provider's breaker
/// (§4.1 Observability: "emits a gauge... a trips counter... invoked on
/// every state transition"), registered alongside the manager's own
/// transition logger via `ProviderManager::add_provider_with_observer`.
impl hapax_provider::BreakerObserver for Metrics {
    fn on_transition(&self, name: &str, _from: hapax_provider::BreakerState, to: hapax_provider::BreakerState) {
        self.set_breaker_state(name, to);
    }

    fn on_failure(&self, _name: &str) {
        self.inc_provider_failures();
    }

    fn on_trip(&self, _name: &str) {
        self.inc_breaker_trips();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment_and_render() {
        let m = Metrics::new();
        m.inc_http_requests();
        m.inc_http_requests();
        m.inc_rate_limit_rejections();
        let output = m.render_prometheus();
        assert!(output.contains("hapax_http_requests_total 2"));
        assert!(output.contains("hapax_rate_limit_rejections_total 1"));
    }

    #[test]
    fn breaker_state_gauge_is_labelled_by_provider() {
        let m = Metrics::new();
        m.set_breaker_state("openai", hapax_provider::BreakerState::Open);
        let output = m.render_prometheus();
        assert!(output.contains("hapax_circuit_breaker_state{provider=\"openai\"} 1"));
    }

    #[test]
    fn prometheus_format_has_help_and_type_lines() {
        let m = Metrics::new();
        let output = m.render_prometheus();
        assert!(output.contains("# HELP hapax_uptime_seconds"));
        assert!(output.contains("# TYPE hapax_uptime_seconds gauge"));
    }
}
