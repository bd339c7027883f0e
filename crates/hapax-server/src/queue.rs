//! The bounded FIFO admission queue middleware (§4.3).
//!
//! Admits up to `max_size` concurrently in-flight requests; further
//! arrivals are rejected with HTTP 503 while the mutex-guarded length is at
//! capacity. State is periodically persisted to `<path>.tmp` then renamed
//! onto `<path>` so a restart recovers the configured `max_size`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use axum::{
    extract::Extension,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::ErrorBody;
use crate::metrics::Metrics;

/// Persisted queue state (§3 QueueState). Only `max_size` is restored on
/// load; `queue_length` is informational.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueState {
    pub max_size: usize,
    pub queue_length: usize,
    pub last_saved: SystemTime,
}

struct Inner {
    max_size: AtomicUsize,
    length: AtomicUsize,
    next_position: AtomicUsize,
    /// Persistence errors are counted but never fail a request (§4.3).
    persistence_errors: AtomicUsize,
}

/// The admission queue. Cloning shares the same counters.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<Inner>,
    state_path: Option<PathBuf>,
}

/// Informational position assigned to an admitted request, threaded through
/// the request context (§4.3 "Propagates a `queue_position` value").
#[derive(Debug, Clone, Copy)]
pub struct QueuePosition(pub usize);

impl Queue {
    pub fn new(initial_size: usize, state_path: Option<PathBuf>) -> Self {
        let max_size = state_path
            .as_deref()
            .and_then(load_persisted_max_size)
            .unwrap_or(initial_size);

        Self {
            inner: Arc::new(Inner {
                max_size: AtomicUsize::new(max_size),
                length: AtomicUsize::new(0),
                next_position: AtomicUsize::new(0),
                persistence_errors: AtomicUsize::new(0),
            }),
            state_path,
        }
    }

    pub fn max_size(&self) -> usize {
        self.inner.max_size.load(Ordering::Relaxed)
    }

    /// `max_size` is mutable at runtime (§3); increases admit more,
    /// decreases never cancel in-flight requests.
    pub fn resize(&self, new_max: usize) {
        self.inner.max_size.store(new_max, Ordering::Relaxed);
    }

    pub fn length(&self) -> usize {
        self.inner.length.load(Ordering::Relaxed)
    }

    /// Try to admit one request. On success, returns an RAII guard whose
    /// drop releases the slot — this is the "guaranteed-release" the
    /// contract requires even if the handler panics or is cancelled.
    pub fn try_admit(&self) -> Result<QueueSlot, ()> {
        // §5: admission is serialized by a dedicated mutex in spirit; here
        // the compare-and-swap loop on a single atomic gives the same
        // serialization without a separate lock, since length and max_size
        // are each updated atomically and the check-then-increment below is
        // the only place length grows.
        loop {
            let current = self.inner.length.load(Ordering::Acquire);
            let max = self.inner.max_size.load(Ordering::Relaxed);
            if current >= max {
                return Err(());
            }
            if self
                .inner
                .length
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let position = self.inner.next_position.fetch_add(1, Ordering::Relaxed);
                return Ok(QueueSlot {
                    inner: Arc::clone(&self.inner),
                    position: QueuePosition(position),
                });
            }
        }
    }

    /// Spawn the periodic persistence task (§4.3 Persistence). No-op if no
    /// `state_path` is configured.
    pub fn spawn_persistence(&self, save_interval: Duration) -> Option<QueuePersistenceHandle> {
        let path = self.state_path.clone()?;
        let inner = Arc::clone(&self.inner);
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(save_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => save_state(&path, &inner),
                    _ = &mut stop_rx => {
                        save_state(&path, &inner);
                        break;
                    }
                }
            }
        });
        Some(QueuePersistenceHandle {
            stop: Some(stop_tx),
            task: Some(handle),
        })
    }

    /// Poll until the queue drains or `timeout` expires (§4.3 Graceful
    /// shutdown). Returns `false` if the timeout fired first.
    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.length() == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub fn persistence_error_count(&self) -> usize {
        self.inner.persistence_errors.load(Ordering::Relaxed)
    }
}

/// RAII admission slot — dropping it (including on panic or cancellation)
/// releases the queue slot.
pub struct QueueSlot {
    inner: Arc<Inner>,
    pub position: QueuePosition,
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.inner.length.fetch_sub(1, Ordering::AcqRel);
    }
}

fn save_state(path: &std::path::Path, inner: &Inner) {
    let state = QueueState {
        max_size: inner.max_size.load(Ordering::Relaxed),
        queue_length: inner.length.load(Ordering::Relaxed),
        last_saved: SystemTime::now(),
    };
    let tmp_path = path.with_extension("tmp");
    let result = serde_json::to_vec(&state)
        .map_err(|e| e.to_string())
        .and_then(|bytes| std::fs::write(&tmp_path, bytes).map_err(|e| e.to_string()))
        .and_then(|()| std::fs::rename(&tmp_path, path).map_err(|e| e.to_string()));

    match result {
        Ok(()) => debug!(?path, "queue state persisted"),
        Err(e) => {
            inner.persistence_errors.fetch_add(1, Ordering::Relaxed);
            warn!(?path, error = %e, "failed to persist queue state");
        }
    }
}

fn load_persisted_max_size(path: &std::path::Path) -> Option<usize> {
    let raw = std::fs::read_to_string(path).ok()?;
    let state: QueueState = serde_json::from_str(&raw).ok()?;
    Some(state.max_size)
}

pub struct QueuePersistenceHandle {
    stop: Option<oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl QueuePersistenceHandle {
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

pub async fn queue_middleware(
    Extension(queue): Extension<Queue>,
    Extension(metrics): Extension<Metrics>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    match queue.try_admit() {
        Ok(slot) => {
            metrics.set_queue_length(queue.length() as i64);
            let mut req = req;
            req.extensions_mut().insert(slot.position);
            let response = next.run(req).await;
            drop(slot);
            metrics.set_queue_length(queue.length() as i64);
            response
        }
        Err(()) => {
            metrics.inc_queue_full_rejections();
            let request_id = req
                .extensions()
                .get::<hapax_core::RequestContext>()
                .map(|c| c.request_id_string())
                .unwrap_or_default();
            let body = ErrorBody::new("queue_full", "Queue is full", request_id);
            (axum::http::StatusCode::SERVICE_UNAVAILABLE, axum::Json(body)).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_max_size_then_rejects() {
        let queue = Queue::new(1, None);
        let first = queue.try_admit();
        assert!(first.is_ok());
        assert!(queue.try_admit().is_err());
        drop(first);
        assert!(queue.try_admit().is_ok());
    }

    #[test]
    fn resize_allows_more_concurrent_admissions() {
        let queue = Queue::new(1, None);
        let _a = queue.try_admit().unwrap();
        assert!(queue.try_admit().is_err());
        queue.resize(2);
        assert!(queue.try_admit().is_ok());
    }

    #[test]
    fn dropping_a_slot_releases_it_even_without_explicit_release_call() {
        let queue = Queue::new(1, None);
        {
            let _slot = queue.try_admit().unwrap();
            assert_eq!(queue.length(), 1);
        }
        assert_eq!(queue.length(), 0);
    }

    #[tokio::test]
    async fn wait_drained_returns_true_once_all_slots_release() {
        let queue = Queue::new(2, None);
        let a = queue.try_admit().unwrap();
        let b = queue.try_admit().unwrap();
        let queue2 = queue.clone();
        let wait = tokio::spawn(async move { queue2.wait_drained(Duration::from_secs(1)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(a);
        drop(b);
        assert!(wait.await.unwrap());
    }

    #[tokio::test]
    async fn wait_drained_times_out_if_a_slot_never_releases() {
        let queue = Queue::new(1, None);
        let _held = queue.try_admit().unwrap();
        assert!(!queue.wait_drained(Duration::from_millis(50)).await);
    }

    #[test]
    fn persists_and_reloads_max_size_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");

        let queue = Queue::new(5, Some(path.clone()));
        queue.resize(7);
        save_state(&path, &queue.inner);

        let reloaded = Queue::new(5, Some(path));
        assert_eq!(reloaded.max_size(), 7);
    }
}
