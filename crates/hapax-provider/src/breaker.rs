//! Circuit breaker: a three-state automaton guarding one upstream provider
//! (§4.1). Grounded on the router's hand-rolled breaker in this codebase's
//! LLM layer, generalized to the admission/result contract spec.md
//! prescribes (`execute`/`state`, half-open single-probe admission, a
//! registered state-transition callback).

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use hapax_core::HapaxError;

/// The breaker's current state (§3 BreakerState).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub name: String,
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub half_open_max_requests: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".into(),
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_requests: 1,
        }
    }
}

/// Invoked on every breaker state transition (§4.1 Observability). The
/// provider manager registers one of these per breaker to restore a
/// provider's `HealthStatus.healthy` flag when the breaker leaves `Open`.
pub trait BreakerObserver: Send + Sync {
    fn on_transition(&self, name: &str, from: BreakerState, to: BreakerState);
    fn on_failure(&self, name: &str);
    fn on_trip(&self, name: &str);
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure_time: Option<Instant>,
    half_open_probes_outstanding: u32,
}

/// A circuit breaker guarding a single upstream provider.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
    observer: Option<Arc<dyn BreakerObserver>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self::with_observer(config, None)
    }

    pub fn with_observer(config: BreakerConfig, observer: Option<Arc<dyn BreakerObserver>>) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_failure_time: None,
                half_open_probes_outstanding: 0,
            }),
            observer,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// True while the breaker is `Open` and still within `reset_timeout` —
    /// i.e. it would refuse admission right now without transitioning.
    /// Distinct from `state() == Open`, which is also true the instant
    /// after `reset_timeout` elapses even though the *next* admission check
    /// would actually transition to `HalfOpen` and admit a probe. The
    /// provider manager's step 4a pre-filter (§4.2) uses this rather than a
    /// raw state read so a cooled-down breaker still gets a chance to probe
    /// instead of being skipped forever before `execute` is ever called
    /// again.
    pub fn is_refusing(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure_time
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                elapsed <= self.config.reset_timeout
            }
            BreakerState::Closed => false,
            BreakerState::HalfOpen => inner.half_open_probes_outstanding >= self.config.half_open_max_requests,
        }
    }

    /// Evaluate admission, then — if admitted — invoke `op`, observe its
    /// result, update state, and return `op`'s error (or `HapaxError::CircuitOpen`
    /// if not admitted). §4.1 Contract.
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T, HapaxError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, HapaxError>>,
    {
        if !self.admit() {
            return Err(HapaxError::CircuitOpen);
        }
        let result = op().await;
        self.observe(&result);
        result
    }

    /// Admission rules (§4.1): closed always admits; open admits only after
    /// `reset_timeout` elapses, transitioning to half-open as the probe;
    /// half-open admits iff fewer than `half_open_max_requests` probes are
    /// currently outstanding.
    fn admit(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure_time
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed > self.config.reset_timeout {
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    inner.half_open_probes_outstanding = 1;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_probes_outstanding < self.config.half_open_max_requests {
                    inner.half_open_probes_outstanding += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn observe<T>(&self, result: &Result<T, HapaxError>) {
        match result {
            Ok(_) => self.record_success(),
            Err(e) if e.is_cancellation() => {
                // Client cancellation is not a provider failure (§5, §9 Open
                // Question 1) — release the half-open probe slot without
                // counting toward consecutive_failures.
                let mut inner = self.inner.lock();
                inner.half_open_probes_outstanding = inner.half_open_probes_outstanding.saturating_sub(1);
            }
            Err(_) => self.record_failure(),
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        let from = inner.state;
        match inner.state {
            BreakerState::HalfOpen => {
                self.transition(&mut inner, BreakerState::Closed);
            }
            BreakerState::Closed | BreakerState::Open => {}
        }
        inner.consecutive_failures = 0;
        inner.half_open_probes_outstanding = 0;
        let _ = from;
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if let Some(observer) = &self.observer {
                    observer.on_failure(&self.config.name);
                }
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.last_failure_time = Some(Instant::now());
                    self.transition(&mut inner, BreakerState::Open);
                    if let Some(observer) = &self.observer {
                        observer.on_trip(&self.config.name);
                    }
                    warn!(breaker = %self.config.name, "circuit breaker tripped open");
                }
            }
            BreakerState::HalfOpen => {
                inner.half_open_probes_outstanding = 0;
                inner.last_failure_time = Some(Instant::now());
                self.transition(&mut inner, BreakerState::Open);
                if let Some(observer) = &self.observer {
                    observer.on_failure(&self.config.name);
                    observer.on_trip(&self.config.name);
                }
            }
            BreakerState::Open => {
                inner.last_failure_time = Some(Instant::now());
            }
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState) {
        let from = inner.state;
        inner.state = to;
        if from != to {
            if let Some(observer) = &self.observer {
                observer.on_transition(&self.config.name, from, to);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(threshold: u32, reset: Duration) -> BreakerConfig {
        BreakerConfig {
            name: "test".into(),
            failure_threshold: threshold,
            reset_timeout: reset,
            half_open_max_requests: 1,
        }
    }

    #[tokio::test]
    async fn trips_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(cfg(2, Duration::from_millis(100)));

        for _ in 0..2 {
            let result: Result<(), HapaxError> = breaker
                .execute(|| async { Err(HapaxError::Provider("boom".into())) })
                .await;
            assert!(result.is_err());
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        let result: Result<(), HapaxError> = breaker.execute(|| async { Ok(()) }).await;
        assert!(matches!(result, Err(HapaxError::CircuitOpen)));
    }

    #[tokio::test]
    async fn half_open_success_closes_and_resets_counters() {
        let breaker = CircuitBreaker::new(cfg(1, Duration::from_millis(20)));

        let _: Result<(), HapaxError> = breaker
            .execute(|| async { Err(HapaxError::Provider("boom".into())) })
            .await;
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;

        let result: Result<(), HapaxError> = breaker.execute(|| async { Ok(()) }).await;
        assert!(result.is_ok());
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_admits_only_one_probe_at_a_time() {
        let breaker = CircuitBreaker::new(cfg(1, Duration::from_millis(10)));
        let _: Result<(), HapaxError> = breaker
            .execute(|| async { Err(HapaxError::Provider("boom".into())) })
            .await;
        tokio::time::sleep(Duration::from_millis(15)).await;

        assert!(breaker.admit());
        // A second admission attempt while the first probe is outstanding
        // must be refused.
        assert!(!breaker.admit());
    }

    #[tokio::test]
    async fn cancellation_does_not_count_as_a_failure() {
        let breaker = CircuitBreaker::new(cfg(1, Duration::from_millis(100)));
        let result: Result<(), HapaxError> =
            breaker.execute(|| async { Err(HapaxError::Cancelled) }).await;
        assert!(result.is_err());
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
