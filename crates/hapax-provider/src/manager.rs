//! The provider manager (§4.2): selects a provider by preference order,
//! guards each upstream through its own circuit breaker, deduplicates
//! concurrent identical requests via a single-flight group, and runs a
//! background health checker that probes providers independently of
//! breaker admission.
//!
//! Grounded on the router/failover logic in this codebase's LLM crate
//! (primary + fallback walk, retryable-error classification), restructured
//! around the breaker and single-flight primitives spec.md requires —
//! including its deliberately narrow tie-break: a request fails over to
//! the next provider only when this attempt's failure just tripped the
//! breaker open, not on every failure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use dashmap::DashMap;
use futures::future::Shared;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use hapax_core::{HapaxError, HealthStatus, Prompt};

use crate::breaker::{BreakerConfig, BreakerObserver, BreakerState, CircuitBreaker};
use crate::provider::{GenerateResponse, Provider};

/// A shared, cloneable in-flight completion future for single-flight
/// deduplication (§4.2 Single-flight). `Result<T, E>` isn't `Clone` when
/// `E` isn't, so the sharable unit wraps the fallible result in an `Arc`.
type SharedGenerate = Shared<std::pin::Pin<Box<dyn std::future::Future<Output = Arc<Result<GenerateResponse, HapaxError>>> + Send>>>;

/// Default ceiling on provider attempts per request (§4.2 Retry bound),
/// guarding against pathological cycling if the preference list mutates
/// concurrently with the loop.
const DEFAULT_MAX_PROVIDER_RETRIES: usize = 3;

struct Entry {
    provider: Arc<dyn Provider>,
    breaker: Arc<CircuitBreaker>,
}

/// Logs breaker transitions. `HealthStatus` bookkeeping on success/failure
/// is owned directly by the manager (§4.2 step d/e), not by this observer —
/// the breaker only needs to announce transitions for logging/metrics.
struct TransitionLogger;

impl BreakerObserver for TransitionLogger {
    fn on_transition(&self, name: &str, from: BreakerState, to: BreakerState) {
        debug!(provider = name, ?from, ?to, "circuit breaker transition");
    }

    fn on_failure(&self, _name: &str) {}

    fn on_trip(&self, name: &str) {
        warn!(provider = name, "circuit breaker tripped open");
    }
}

/// Restores a provider's `HealthStatus.healthy` flag whenever its breaker
/// leaves `Open` (§4.2 Failover semantics: "When the circuit breaker
/// transitions to closed or half-open, a registered callback restores
/// healthy = true so the provider re-enters rotation").
struct HealthRestorer(Arc<DashMap<String, HealthStatus>>);

impl BreakerObserver for HealthRestorer {
    fn on_transition(&self, name: &str, _from: BreakerState, to: BreakerState) {
        if matches!(to, BreakerState::Closed | BreakerState::HalfOpen) {
            if let Some(mut status) = self.0.get_mut(name) {
                status.healthy = true;
            }
        }
    }

    fn on_failure(&self, _name: &str) {}

    fn on_trip(&self, _name: &str) {}
}

/// Fans a single breaker callback slot (§4.1) out to multiple observers, so
/// the manager's own `TransitionLogger` and a caller-supplied observer (e.g.
/// a metrics registry) can both watch the same breaker.
struct CompositeObserver(Vec<Arc<dyn BreakerObserver>>);

impl BreakerObserver for CompositeObserver {
    fn on_transition(&self, name: &str, from: BreakerState, to: BreakerState) {
        for observer in &self.0 {
            observer.on_transition(name, from, to);
        }
    }

    fn on_failure(&self, name: &str) {
        for observer in &self.0 {
            observer.on_failure(name);
        }
    }

    fn on_trip(&self, name: &str) {
        for observer in &self.0 {
            observer.on_trip(name);
        }
    }
}

/// Selects among configured providers, guards each one with a circuit
/// breaker, and deduplicates identical concurrent requests.
pub struct ProviderManager {
    entries: RwLock<HashMap<String, Entry>>,
    preference: RwLock<Vec<String>>,
    health: Arc<DashMap<String, HealthStatus>>,
    in_flight: Mutex<HashMap<String, SharedGenerate>>,
    max_provider_retries: usize,
    deduplicated_total: AtomicU64,
}

impl ProviderManager {
    pub fn new() -> Arc<Self> {
        Self::with_max_retries(DEFAULT_MAX_PROVIDER_RETRIES)
    }

    pub fn with_max_retries(max_provider_retries: usize) -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            preference: RwLock::new(Vec::new()),
            health: Arc::new(DashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            max_provider_retries,
            deduplicated_total: AtomicU64::new(0),
        })
    }

    /// Register a provider under `name`, appending it to the failover
    /// preference order. The manager takes ownership of its breaker.
    pub fn add_provider(self: &Arc<Self>, name: impl Into<String>, provider: Arc<dyn Provider>, breaker_config: BreakerConfig) {
        self.add_provider_with_observer(name, provider, breaker_config, None);
    }

    /// Same as [`Self::add_provider`], but also registers `extra_observer`
    /// alongside the manager's own transition logger (§4.1 Observability —
    /// callers outside this crate, like the metrics registry, hook in here
    /// rather than replacing the manager's own logging observer).
    pub fn add_provider_with_observer(
        self: &Arc<Self>,
        name: impl Into<String>,
        provider: Arc<dyn Provider>,
        breaker_config: BreakerConfig,
        extra_observer: Option<Arc<dyn BreakerObserver>>,
    ) {
        let name = name.into();
        let mut observers: Vec<Arc<dyn BreakerObserver>> =
            vec![Arc::new(TransitionLogger), Arc::new(HealthRestorer(Arc::clone(&self.health)))];
        if let Some(extra) = extra_observer {
            observers.push(extra);
        }
        let breaker = Arc::new(CircuitBreaker::with_observer(
            breaker_config,
            Some(Arc::new(CompositeObserver(observers))),
        ));
        self.health.entry(name.clone()).or_insert_with(HealthStatus::default);
        self.entries.write().insert(name.clone(), Entry { provider, breaker });
        self.preference.write().push(name);
    }

    pub fn health_snapshot(&self) -> HashMap<String, HealthStatus> {
        self.health
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn preference_order(&self) -> Vec<String> {
        self.preference.read().clone()
    }

    /// Count of requests that joined an already in-flight single-flight
    /// group rather than issuing their own upstream attempt (§4.2 step 2,
    /// §8 "deduplicated-count = callers − 1").
    pub fn deduplicated_total(&self) -> u64 {
        self.deduplicated_total.load(Ordering::Relaxed)
    }

    /// Run a completion, deduplicating against any identical in-flight
    /// request (§4.2 Single-flight), then walking the preference order
    /// per the selection algorithm.
    ///
    /// Per §9 Open Question 5 (option a), a caller's own cancellation tears
    /// down only its observation of the shared future; the underlying
    /// upstream call and its breaker accounting continue for the other
    /// waiters.
    pub async fn generate(self: &Arc<Self>, prompt: Prompt) -> Result<GenerateResponse, HapaxError> {
        let key = prompt.dedup_key();
        let (shared, joined) = {
            let mut in_flight = self.in_flight.lock();
            if let Some(existing) = in_flight.get(&key) {
                (existing.clone(), true)
            } else {
                let manager = Arc::clone(self);
                let prompt = prompt.clone();
                let fut: std::pin::Pin<Box<dyn std::future::Future<Output = Arc<Result<GenerateResponse, HapaxError>>> + Send>> =
                    Box::pin(async move { Arc::new(manager.run_selection(prompt).await) });
                let shared = fut.shared();
                in_flight.insert(key.clone(), shared.clone());
                (shared, false)
            }
        };
        if joined {
            self.deduplicated_total.fetch_add(1, Ordering::Relaxed);
        }

        let result = shared.await;
        self.in_flight.lock().remove(&key);
        match &*result {
            Ok(r) => Ok(r.clone()),
            Err(e) => Err(clone_error(e)),
        }
    }

    /// The §4.2 selection algorithm, steps 3–5, run once per single-flight
    /// group.
    async fn run_selection(self: Arc<Self>, prompt: Prompt) -> Result<GenerateResponse, HapaxError> {
        let preference = self.preference.read().clone();
        if preference.is_empty() {
            return Err(HapaxError::Provider("no healthy provider available".into()));
        }

        let last_index = preference.len() - 1;
        let mut attempts = 0usize;

        for (idx, name) in preference.iter().enumerate() {
            let entry = {
                let entries = self.entries.read();
                entries.get(name).map(|e| (Arc::clone(&e.provider), Arc::clone(&e.breaker)))
            };
            let Some((provider, breaker)) = entry else {
                continue;
            };

            // Step 4a: skip unhealthy or currently-refusing-breaker
            // providers without counting them as an attempt. `is_refusing`
            // (not a raw `state() == Open` read) so a breaker whose
            // `reset_timeout` has already elapsed still reaches `execute`
            // below and gets its half-open probe instead of being skipped
            // forever.
            let healthy = self.health.get(name).map(|h| h.healthy).unwrap_or(true);
            if !healthy || breaker.is_refusing() {
                continue;
            }

            if attempts >= self.max_provider_retries {
                break;
            }
            attempts += 1;

            let start = Instant::now();
            let outcome = breaker.execute(|| async { provider.generate(&prompt).await }).await;
            let latency = start.elapsed();

            match outcome {
                Ok(response) => {
                    self.mark_healthy(name, latency);
                    return Ok(response);
                }
                Err(e) => {
                    if e.is_cancellation() {
                        return Err(e);
                    }
                    self.mark_unhealthy(name, latency);

                    // Step 4e tie-break: only continue to the next provider
                    // when this failure just tripped the breaker open and
                    // more providers remain. Otherwise fail fast — the
                    // caller sees this provider's real error, and failover
                    // happens on a later request once the breaker records
                    // open (§9 Open Question rationale).
                    let is_last = idx == last_index;
                    if breaker.state() == BreakerState::Open && !is_last {
                        debug!(provider = %name, "breaker tripped on this attempt, failing over");
                        continue;
                    }
                    return Err(e);
                }
            }
        }
        Err(HapaxError::Provider("no healthy provider available".into()))
    }

    fn mark_healthy(&self, name: &str, latency: Duration) {
        if let Some(mut status) = self.health.get_mut(name) {
            status.healthy = true;
            status.error_count = 0;
            status.consecutive_fails = 0;
            status.latency = latency;
            status.last_check = SystemTime::now();
            status.request_count += 1;
        }
    }

    fn mark_unhealthy(&self, name: &str, latency: Duration) {
        if let Some(mut status) = self.health.get_mut(name) {
            status.error_count += 1;
            status.consecutive_fails += 1;
            status.healthy = false;
            status.latency = latency;
            status.last_check = SystemTime::now();
            status.request_count += 1;
        }
    }

    /// Spawn the background health checker (§4.2): periodically probes
    /// every provider with a trivial prompt, bypassing the breaker entirely,
    /// so a recovered provider is cleared even while its breaker is still
    /// within `reset_timeout`.
    pub fn spawn_health_checker(self: &Arc<Self>, interval: Duration) -> HealthCheckerHandle {
        let manager = Arc::clone(self);
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.run_health_probe().await,
                    _ = &mut stop_rx => break,
                }
            }
        });
        HealthCheckerHandle {
            stop: Some(stop_tx),
            task: Some(handle),
        }
    }

    async fn run_health_probe(self: &Arc<Self>) {
        let names: Vec<String> = self.preference.read().clone();
        for name in names {
            let provider = {
                let entries = self.entries.read();
                entries.get(&name).map(|e| Arc::clone(&e.provider))
            };
            let Some(provider) = provider else { continue };
            let probe = Prompt::new(vec![hapax_core::PromptMessage::new(
                hapax_core::Role::User,
                "health check",
            )]);
            let start = Instant::now();
            let result = tokio::time::timeout(Duration::from_secs(5), provider.generate(&probe)).await;
            let latency = start.elapsed();
            if let Some(mut status) = self.health.get_mut(&name) {
                status.latency = latency;
                status.last_check = SystemTime::now();
                match result {
                    Ok(Ok(_)) => {
                        status.consecutive_fails = 0;
                        status.healthy = true;
                    }
                    Ok(Err(e)) => {
                        status.error_count += 1;
                        status.consecutive_fails += 1;
                        debug!(provider = %name, error = %e, "background health probe failed");
                    }
                    Err(_) => {
                        status.error_count += 1;
                        status.consecutive_fails += 1;
                        debug!(provider = %name, "background health probe timed out");
                    }
                }
            }
        }
        info!("background health probe cycle complete");
    }
}

/// Handle to the spawned health-check task. Dropping it without calling
/// `stop` leaks the task; callers keep it alongside the manager for the
/// server's lifetime.
pub struct HealthCheckerHandle {
    stop: Option<oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl HealthCheckerHandle {
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

fn clone_error(e: &HapaxError) -> HapaxError {
    match e {
        HapaxError::Validation(s) => HapaxError::Validation(s.clone()),
        HapaxError::Authentication(s) => HapaxError::Authentication(s.clone()),
        HapaxError::RateLimit { limit, window } => HapaxError::RateLimit {
            limit: *limit,
            window: window.clone(),
        },
        HapaxError::Provider(s) => HapaxError::Provider(s.clone()),
        HapaxError::CircuitOpen => HapaxError::CircuitOpen,
        HapaxError::QueueFull => HapaxError::QueueFull,
        HapaxError::Timeout => HapaxError::Timeout,
        HapaxError::Cancelled => HapaxError::Cancelled,
        HapaxError::Replay => HapaxError::Replay,
        HapaxError::Internal(s) => HapaxError::Internal(s.clone()),
        HapaxError::Config(s) => HapaxError::Internal(s.clone()),
        HapaxError::Io(e) => HapaxError::Internal(e.to_string()),
        HapaxError::Serialization(e) => HapaxError::Internal(e.to_string()),
        HapaxError::Other(e) => HapaxError::Internal(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockProvider;

    fn breaker_config(name: &str, failure_threshold: u32) -> BreakerConfig {
        BreakerConfig {
            name: name.to_string(),
            failure_threshold,
            reset_timeout: Duration::from_millis(50),
            half_open_max_requests: 1,
        }
    }

    #[tokio::test]
    async fn fails_over_within_one_request_when_the_breaker_trips_on_first_failure() {
        let manager = ProviderManager::new();

        // threshold=1: a single failure trips the breaker open on this
        // attempt, so the §4.2 tie-break continues to the backup.
        let primary = Arc::new(MockProvider::new("primary", "m1"));
        primary.push_err(HapaxError::Provider("down".into()));
        manager.add_provider("primary", primary.clone(), breaker_config("primary", 1));

        let backup = Arc::new(MockProvider::new("backup", "m1"));
        backup.push_ok("from backup");
        manager.add_provider("backup", backup.clone(), breaker_config("backup", 1));

        let prompt = Prompt::new(vec![hapax_core::PromptMessage::new(hapax_core::Role::User, "hi")]);
        let response = manager.generate(prompt).await.unwrap();
        assert_eq!(response.content, "from backup");
        assert_eq!(primary.call_count(), 1);
        assert_eq!(backup.call_count(), 1);
    }

    #[tokio::test]
    async fn fails_fast_within_one_request_when_the_breaker_stays_closed() {
        let manager = ProviderManager::new();

        // threshold=5: one failure does not trip the breaker, so the
        // tie-break does not fail over within this request.
        let primary = Arc::new(MockProvider::new("primary", "m1"));
        primary.push_err(HapaxError::Provider("down".into()));
        manager.add_provider("primary", primary.clone(), breaker_config("primary", 5));

        let backup = Arc::new(MockProvider::new("backup", "m1"));
        backup.push_ok("from backup");
        manager.add_provider("backup", backup.clone(), breaker_config("backup", 5));

        let prompt = Prompt::new(vec![hapax_core::PromptMessage::new(hapax_core::Role::User, "hi")]);
        let result = manager.generate(prompt).await;
        assert!(matches!(result, Err(HapaxError::Provider(_))));
        assert_eq!(primary.call_count(), 1);
        assert_eq!(backup.call_count(), 0);
    }

    #[tokio::test]
    async fn subsequent_request_fails_over_once_primary_is_marked_unhealthy() {
        let manager = ProviderManager::new();
        let primary = Arc::new(MockProvider::new("primary", "m1"));
        primary.push_err(HapaxError::Provider("down".into()));
        manager.add_provider("primary", primary.clone(), breaker_config("primary", 1));

        let backup = Arc::new(MockProvider::new("backup", "m1"));
        backup.push_ok("from backup");
        manager.add_provider("backup", backup.clone(), breaker_config("backup", 1));

        // First request: primary fails, breaker trips, §4.2 tie-break
        // already fails over to backup within the same request.
        let first = Prompt::new(vec![hapax_core::PromptMessage::new(hapax_core::Role::User, "first")]);
        assert!(manager.generate(first).await.is_ok());
        assert!(!manager.health_snapshot()["primary"].healthy);

        // Second request, distinct key: primary is now skipped outright
        // (unhealthy), never invoked again.
        let second = Prompt::new(vec![hapax_core::PromptMessage::new(hapax_core::Role::User, "second")]);
        let response = manager.generate(second).await.unwrap();
        assert_eq!(response.content, "from backup");
        assert_eq!(primary.call_count(), 1);
        assert_eq!(backup.call_count(), 2);
    }

    #[tokio::test]
    async fn concurrent_identical_requests_single_flight_to_one_upstream_call() {
        let manager = ProviderManager::new();
        let provider = Arc::new(MockProvider::new("only", "m1"));
        provider.push_ok("shared");
        manager.add_provider("only", provider.clone(), breaker_config("only", 5));

        let prompt = Prompt::new(vec![hapax_core::PromptMessage::new(hapax_core::Role::User, "dup")]);
        let (a, b) = tokio::join!(
            manager.generate(prompt.clone()),
            manager.generate(prompt.clone())
        );
        assert_eq!(a.unwrap().content, "shared");
        assert_eq!(b.unwrap().content, "shared");
        assert_eq!(provider.call_count(), 1);
        assert_eq!(manager.deduplicated_total(), 1);
    }

    #[tokio::test]
    async fn full_recovery_needs_both_a_health_probe_and_an_elapsed_reset_timeout() {
        let manager = ProviderManager::new();
        let provider = Arc::new(MockProvider::new("flaky", "m1"));
        provider.push_err(HapaxError::Provider("boom".into()));
        manager.add_provider("flaky", provider.clone(), breaker_config("flaky", 1));

        let prompt = Prompt::new(vec![hapax_core::PromptMessage::new(hapax_core::Role::User, "hi")]);
        assert!(manager.generate(prompt.clone()).await.is_err());
        assert!(!manager.health_snapshot()["flaky"].healthy);

        // Step 4a skips a provider whose `HealthStatus.healthy` is false
        // *before* ever reaching the breaker (§4.2 step 4a), so `generate`
        // alone cannot retry it — only the background health checker marks
        // it healthy again (bypassing the breaker entirely).
        tokio::time::sleep(Duration::from_millis(60)).await;
        provider.push_ok("recovered");
        manager.run_health_probe().await;
        assert!(manager.health_snapshot()["flaky"].healthy);

        // `healthy` is restored and `reset_timeout` has already elapsed, so
        // this call reaches `breaker.execute`, which admits a half-open
        // probe; it succeeds and closes the breaker.
        let result = manager.generate(prompt).await.unwrap();
        assert_eq!(result.content, "recovered");
        assert!(manager.health_snapshot()["flaky"].healthy);
    }

    #[tokio::test]
    async fn health_checker_alone_cannot_bypass_a_still_cooling_breaker() {
        let manager = ProviderManager::new();
        let provider = Arc::new(MockProvider::new("flaky", "m1"));
        provider.push_err(HapaxError::Provider("boom".into()));
        let cfg = BreakerConfig {
            reset_timeout: Duration::from_secs(10),
            ..breaker_config("flaky", 1)
        };
        manager.add_provider("flaky", provider.clone(), cfg);

        let prompt = Prompt::new(vec![hapax_core::PromptMessage::new(hapax_core::Role::User, "hi")]);
        assert!(manager.generate(prompt.clone()).await.is_err());
        assert!(!manager.health_snapshot()["flaky"].healthy);

        // The background health checker bypasses the breaker entirely
        // (§4.2) and restores `healthy`, but the breaker is still within
        // its (long) `reset_timeout` and keeps refusing — `generate` still
        // fails until the breaker's own cooldown elapses too.
        provider.push_ok("recovered");
        manager.run_health_probe().await;
        assert!(manager.health_snapshot()["flaky"].healthy);

        let result = manager.generate(prompt).await;
        assert!(result.is_err());
    }
}
