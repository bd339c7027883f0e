//! # hapax-server
//!
//! HTTP/1, HTTP/2, and HTTP/3 gateway surface for Hapax: the admission
//! queue, rate limiter, timeout guard, replay protection, and the
//! `/v1/completions`, `/health`, and `/metrics` routes, wired together in
//! the order the request flow requires (§2).
//!
//! Grounded on this codebase's own `build_router`/`start_server` shape
//! (`claw-server/src/lib.rs`), generalized from a single-service chat API
//! onto the gateway's middleware stack and provider manager.

pub mod error;
pub mod h3server;
pub mod metrics;
pub mod processor;
pub mod queue;
pub mod ratelimit;
pub mod replay;
pub mod timeout;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{Extension, Query, State},
    http::{HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use hapax_config::{ConfigWatcher, HapaxConfig};
use hapax_core::{CompletionRequest, HapaxError, RequestContext, RequestKind};
use hapax_provider::{BreakerConfig, HealthCheckerHandle, HttpProvider, Provider, ProviderManager};
use serde::Deserialize;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::metrics::Metrics;
use crate::processor::{FormattingOptions, Processor};
use crate::queue::Queue;
use crate::ratelimit::RateLimiter;
use crate::replay::ReplayGuard;
use crate::timeout::TimeoutConfig;

/// Shared application state reachable from every handler.
pub struct AppState {
    pub manager: Arc<ProviderManager>,
    pub processor: Processor,
    pub metrics: Metrics,
    pub routes: Vec<hapax_config::schema::RouteConfig>,
}

#[derive(Debug, Deserialize)]
pub struct CompletionQuery {
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// Build the provider manager from the config document (§4.2, §6). Prefers
/// the explicit `providers` map + `provider_preference`; falls back to
/// `llm.provider`/`llm.backup_providers` when the map is empty, so a
/// minimal single-provider config doesn't need the more verbose form.
pub fn build_provider_manager(config: &HapaxConfig, metrics: &Metrics) -> Arc<ProviderManager> {
    let manager = ProviderManager::new();
    let breaker_cfg = |name: &str| BreakerConfig {
        name: name.to_string(),
        failure_threshold: config.circuit_breaker.failure_threshold,
        reset_timeout: config.circuit_breaker.reset_timeout.as_duration(),
        half_open_max_requests: config.circuit_breaker.max_requests,
    };
    let metrics_observer: Arc<dyn hapax_provider::BreakerObserver> = Arc::new(metrics.clone());

    if !config.providers.is_empty() {
        let order: Vec<String> = if config.provider_preference.is_empty() {
            config.providers.keys().cloned().collect()
        } else {
            config.provider_preference.clone()
        };
        for name in order {
            let Some(entry) = config.providers.get(&name) else {
                warn!(provider = %name, "provider listed in preference order is not configured, skipping");
                continue;
            };
            let provider: Arc<dyn Provider> = Arc::new(HttpProvider::new(
                name.clone(),
                entry.model.clone(),
                entry.endpoint.clone().unwrap_or_default(),
                entry.api_key.clone(),
            ));
            manager.add_provider_with_observer(
                name.clone(),
                provider,
                breaker_cfg(&name),
                Some(Arc::clone(&metrics_observer)),
            );
        }
        return manager;
    }

    let primary: Arc<dyn Provider> = Arc::new(HttpProvider::new(
        config.llm.provider.clone(),
        config.llm.model.clone(),
        config.llm.endpoint.clone().unwrap_or_default(),
        config.llm.api_key.clone(),
    ));
    manager.add_provider_with_observer(
        config.llm.provider.clone(),
        primary,
        breaker_cfg(&config.llm.provider),
        Some(Arc::clone(&metrics_observer)),
    );

    for (idx, backup) in config.llm.backup_providers.iter().enumerate() {
        let name = format!("{}-backup-{idx}", backup.provider);
        let provider: Arc<dyn Provider> = Arc::new(HttpProvider::new(
            name.clone(),
            backup.model.clone(),
            String::new(),
            backup.api_key.clone(),
        ));
        manager.add_provider_with_observer(
            name.clone(),
            provider,
            breaker_cfg(&name),
            Some(Arc::clone(&metrics_observer)),
        );
    }

    manager
}

/// Build the request processor from the config document (§4.9).
pub fn build_processor(config: &HapaxConfig) -> Processor {
    Processor::new(
        config.llm.system_prompt.clone(),
        FormattingOptions {
            trim_whitespace: true,
            clean_json: true,
            max_length: None,
        },
    )
}

/// Assemble the full router (§2 middleware chain): queue admission, request
/// timer, panic recovery, CORS, rate limiting, and the per-request timeout
/// guard, wrapping the completion/health/metrics routes.
pub fn build_router(
    state: Arc<AppState>,
    queue: Queue,
    rate_limiter: RateLimiter,
    replay_guard: ReplayGuard,
    timeout_config: TimeoutConfig,
) -> Router {
    let mut router = Router::new()
        .route("/v1/completions", post(completions_handler))
        .route("/health", get(aggregate_health_handler))
        .route("/ready", get(readiness_handler))
        .route("/metrics", get(metrics_handler));

    for route in &state.routes {
        if route.health_check {
            let path = format!("{}/health", route.path.trim_end_matches('/'));
            router = router.route(&path, get(route_health_handler));
        }
    }

    // `.layer` wraps the current service, so the last call made here is the
    // outermost layer and the first to see an incoming request. Building
    // from the route outward reproduces §2's request order (replay-protect
    // → request-id → queue → panic-recover → CORS → rate-limit → timeout
    // → route dispatch) by adding layers in the reverse of that sequence.
    // `Extension(metrics)` sits outermost of all of them since every stage
    // below reads it.
    router
        .layer(middleware::from_fn(timeout::timeout_middleware))
        .layer(Extension(timeout_config))
        .layer(middleware::from_fn(ratelimit::rate_limit_middleware))
        .layer(Extension(rate_limiter))
        .layer(CorsLayer::permissive())
        .layer(CatchPanicLayer::new())
        .layer(middleware::from_fn(queue::queue_middleware))
        .layer(Extension(queue))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(middleware::from_fn(replay::replay_protect_middleware))
        .layer(Extension(replay_guard))
        .layer(Extension(state.metrics.clone()))
        .with_state(state)
}

/// Stamps every request with a [`RequestContext`] and every response with
/// `X-Request-ID` (§6 "every response carries header X-Request-ID").
async fn request_id_middleware(mut req: Request<axum::body::Body>, next: Next) -> Response {
    let ctx = RequestContext::new();
    let request_id = ctx.request_id_string();
    req.extensions_mut().insert(ctx);

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

async fn completions_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CompletionQuery>,
    req: Request<axum::body::Body>,
) -> Response {
    state.metrics.inc_http_requests();

    let request_id = req
        .extensions()
        .get::<RequestContext>()
        .map(|c| c.request_id_string())
        .unwrap_or_default();

    let kind: RequestKind = query.kind.parse().unwrap_or_default();

    let bytes = match axum::body::to_bytes(req.into_body(), hapax_core::MAX_INPUT_BYTES * 2).await {
        Ok(b) => b,
        Err(e) => {
            state.metrics.inc_http_errors();
            return ApiError { error: HapaxError::Validation(e.to_string()), request_id }.into_response();
        }
    };

    let completion_request: CompletionRequest = match serde_json::from_slice(&bytes) {
        Ok(r) => r,
        Err(e) => {
            state.metrics.inc_http_errors();
            return ApiError { error: HapaxError::Validation(e.to_string()), request_id }.into_response();
        }
    };

    // Structured request/response logging (SPEC_FULL.md §4 supplement):
    // dedup is observed as "did this call's completion join an already
    // in-flight single-flight group" by comparing the cumulative counter
    // before and after the call, since the manager reports that count
    // process-wide rather than per-call.
    let dedup_before = state.manager.deduplicated_total();
    let started = std::time::Instant::now();

    match state.processor.process(&state.manager, kind, completion_request).await {
        Ok(response) => {
            let shared = state.manager.deduplicated_total() > dedup_before;
            if shared {
                state.metrics.inc_dedup_hits();
            }
            info!(
                request_id = %request_id,
                latency_ms = started.elapsed().as_millis() as u64,
                shared,
                content_len = response.content.len(),
                "completion request served"
            );
            axum::Json(response).into_response()
        }
        Err(e) => {
            state.metrics.inc_http_errors();
            // `Provider` failures are already counted once via the breaker's
            // own `on_failure` callback (wired in `build_provider_manager`);
            // `CircuitOpen` never reaches that callback since the breaker
            // refused admission before invoking the op, so it's counted here.
            if matches!(e, HapaxError::CircuitOpen) {
                state.metrics.inc_provider_failures();
            }
            warn!(
                request_id = %request_id,
                latency_ms = started.elapsed().as_millis() as u64,
                error = %e,
                "completion request failed"
            );
            ApiError { error: e, request_id }.into_response()
        }
    }
}

#[derive(serde::Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// `GET /health` — always 200, aggregate liveness (§6).
async fn aggregate_health_handler(State(state): State<Arc<AppState>>) -> axum::Json<HealthResponse> {
    state.metrics.inc_http_requests();
    axum::Json(HealthResponse { status: "ok" })
}

/// `GET /ready` — readiness probe for a load balancer (SPEC_FULL.md §4
/// supplement): 200 once the provider manager has at least one healthy
/// provider, 503 otherwise. The config is always already loaded by the time
/// `AppState` exists (§4.7 `ConfigWatcher::start` loads synchronously), so
/// the only remaining condition worth checking here is provider health.
async fn readiness_handler(State(state): State<Arc<AppState>>) -> StatusCode {
    state.metrics.inc_http_requests();
    let any_healthy = state
        .manager
        .health_snapshot()
        .values()
        .any(|status| status.healthy);
    if any_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// `GET /<path>/health` for a route opted into health tracking — 503 if any
/// registered provider is currently unhealthy (§6 per-route health state).
async fn route_health_handler(State(state): State<Arc<AppState>>) -> StatusCode {
    state.metrics.inc_http_requests();
    let all_healthy = state
        .manager
        .health_snapshot()
        .values()
        .all(|status| status.healthy);
    if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.render_prometheus(),
    )
}

/// Handle to a running HTTP/1+2 listener, used to drive graceful shutdown
/// on config reload (§4.8 Server Lifecycle).
pub struct ServerHandle {
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl ServerHandle {
    /// Signal shutdown and wait for the listener task to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}

/// Bind and serve the HTTP/1+2 listener on `addr`. Returns immediately with
/// a handle; the server itself runs on a spawned task until `shutdown` is
/// called or the listener errors.
pub async fn spawn_http(addr: SocketAddr, router: Router) -> std::io::Result<ServerHandle> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "http listener bound");
    let (tx, rx) = tokio::sync::oneshot::channel();
    let task = tokio::spawn(async move {
        axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async {
                let _ = rx.await;
            })
            .await
    });
    Ok(ServerHandle {
        shutdown: Some(tx),
        task,
    })
}

/// Poll `addr` until a TCP connection succeeds or `timeout` elapses (§4.8
/// "poll new ports until TCP connect succeeds").
pub async fn wait_until_listening(addr: SocketAddr, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// The identity of the configured provider set — name/model/endpoint
/// triples, in preference order — used to decide whether a hot reload needs
/// a fresh provider manager (§4.8 "If the upstream provider identity
/// changed, instantiate a new upstream client").
fn provider_identity(config: &HapaxConfig) -> Vec<(String, String, String)> {
    if !config.providers.is_empty() {
        let mut order: Vec<String> = if config.provider_preference.is_empty() {
            config.providers.keys().cloned().collect()
        } else {
            config.provider_preference.clone()
        };
        order.sort();
        return order
            .into_iter()
            .filter_map(|name| {
                config
                    .providers
                    .get(&name)
                    .map(|e| (name, e.model.clone(), e.endpoint.clone().unwrap_or_default()))
            })
            .collect();
    }

    let mut identity = vec![(
        config.llm.provider.clone(),
        config.llm.model.clone(),
        config.llm.endpoint.clone().unwrap_or_default(),
    )];
    for backup in &config.llm.backup_providers {
        identity.push((backup.provider.clone(), backup.model.clone(), String::new()));
    }
    identity
}

/// Everything one running generation of the server owns: both listeners
/// plus their background tasks (§4.8 Server Lifecycle).
struct ServerBundle {
    http: ServerHandle,
    h3: Option<h3server::H3ServerHandle>,
    queue_persistence: Option<queue::QueuePersistenceHandle>,
    health_checker: Option<HealthCheckerHandle>,
    manager: Arc<ProviderManager>,
    metrics: Metrics,
    identity: Vec<(String, String, String)>,
}

impl ServerBundle {
    async fn shutdown(self) {
        self.http.shutdown().await;
        if let Some(h3) = self.h3 {
            h3.shutdown().await;
        }
        if let Some(qp) = self.queue_persistence {
            qp.stop().await;
        }
        if let Some(hc) = self.health_checker {
            hc.stop().await;
        }
    }
}

/// Start one generation of listeners from `config`, reusing
/// `existing` (the provider manager and its metrics registry) when the
/// provider identity hasn't changed across a reload (§4.8 Hot reload).
///
/// The manager's breakers hold an `Arc<dyn BreakerObserver>` pointing at
/// whichever `Metrics` was current when `build_provider_manager` registered
/// it; that registration happens once, at construction, and can't be
/// swapped after the fact. So when the manager is reused, its metrics must
/// be reused too — building a fresh `Metrics` here and handing the old
/// manager its unrelated registry would leave the breakers updating a
/// registry nothing serves, while `/metrics` renders one nothing updates.
async fn start_bundle(
    config: &HapaxConfig,
    existing: Option<(Arc<ProviderManager>, Metrics)>,
) -> anyhow::Result<ServerBundle> {
    let identity = provider_identity(config);
    let (manager, metrics) = match existing {
        Some((manager, metrics)) => (manager, metrics),
        None => {
            let metrics = Metrics::new();
            let manager = build_provider_manager(config, &metrics);
            (manager, metrics)
        }
    };
    let processor = build_processor(config);

    let queue_initial = if config.queue.enabled {
        config.queue.initial_size
    } else {
        usize::MAX
    };
    let state_path = config.queue.state_path.as_ref().map(std::path::PathBuf::from);
    let queue = Queue::new(queue_initial, state_path);
    let queue_persistence = queue.spawn_persistence(config.queue.save_interval.as_duration());

    let health_checker = config
        .llm
        .health_check
        .enabled
        .then(|| manager.spawn_health_checker(config.llm.health_check.interval.as_duration()));

    let state = Arc::new(AppState {
        manager: Arc::clone(&manager),
        processor,
        metrics: metrics.clone(),
        routes: config.routes.clone(),
    });

    let replay_guard = ReplayGuard::new();

    let router = build_router(
        Arc::clone(&state),
        queue,
        RateLimiter::new(),
        replay_guard.clone(),
        TimeoutConfig(config.server.write_timeout.as_duration()),
    );

    let http_addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let http = spawn_http(http_addr, router).await?;
    wait_until_listening(http_addr, Duration::from_secs(5)).await;

    let h3 = if config.server.http3.enabled {
        match (
            &config.server.http3.tls_cert_file,
            &config.server.http3.tls_key_file,
        ) {
            (Some(cert), Some(key)) => {
                let tls =
                    h3server::load_tls_config(cert, key, config.server.http3.enable_0rtt)?;
                let h3_addr = SocketAddr::from(([0, 0, 0, 0], config.server.http3.port));
                let endpoint = h3server::build_endpoint(h3_addr, &config.server.http3, tls)?;
                let handle = h3server::spawn_h3(
                    endpoint,
                    state,
                    replay_guard,
                    config.server.http3.allow_0rtt_replay,
                );
                wait_until_listening(h3_addr, Duration::from_secs(5)).await;
                Some(handle)
            }
            _ => {
                warn!("http3 enabled without both tls_cert_file and tls_key_file configured, skipping");
                None
            }
        }
    } else {
        None
    };

    Ok(ServerBundle {
        http,
        h3,
        queue_persistence,
        health_checker,
        manager,
        metrics,
        identity,
    })
}

/// Run the gateway end-to-end (§4.8 Server Lifecycle): start the listeners
/// from the current config, hot-reload whenever the watcher broadcasts a new
/// one, and shut down gracefully on Ctrl-C.
pub async fn run(config_path: std::path::PathBuf) -> anyhow::Result<()> {
    let watcher = ConfigWatcher::start(config_path)?;
    let mut config_rx = watcher.subscribe();

    let mut bundle = start_bundle(&watcher.current(), None).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal");
                break;
            }
            new_config = config_rx.recv() => {
                let Some(new_config) = new_config else { break };
                info!("reloading server for new configuration");
                let shutdown_timeout = new_config.server.shutdown_timeout.as_duration();
                let reuse_manager = provider_identity(&new_config) == bundle.identity;
                let existing = reuse_manager
                    .then(|| (Arc::clone(&bundle.manager), bundle.metrics.clone()));
                match start_bundle(&new_config, existing).await {
                    Ok(new_bundle) => {
                        let old = std::mem::replace(&mut bundle, new_bundle);
                        let _ = tokio::time::timeout(shutdown_timeout, old.shutdown()).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to start listeners for reloaded configuration, keeping previous generation");
                    }
                }
            }
        }
    }

    bundle.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hapax_provider::MockProvider;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state_with_mock(content: &str) -> Arc<AppState> {
        let mock = Arc::new(MockProvider::new("primary", "mock-model"));
        mock.push_ok(content.to_string());
        let manager = ProviderManager::new();
        manager.add_provider("primary", mock, BreakerConfig::default());
        Arc::new(AppState {
            manager,
            processor: Processor::new(None, FormattingOptions::default()),
            metrics: Metrics::new(),
            routes: Vec::new(),
        })
    }

    fn test_router(state: Arc<AppState>) -> Router {
        build_router(
            state,
            Queue::new(10, None),
            RateLimiter::new(),
            ReplayGuard::new(),
            TimeoutConfig(Duration::from_secs(2)),
        )
    }

    /// `ConnectInfo` is normally injected by `into_make_service_with_connect_info`
    /// at the TCP-accept layer; `oneshot` bypasses that, so tests that exercise
    /// the rate limiter must stamp it on the request directly.
    fn with_connect_info(builder: axum::http::request::Builder) -> axum::http::request::Builder {
        builder.extension(axum::extract::ConnectInfo(SocketAddr::from((
            [127, 0, 0, 1],
            12345,
        ))))
    }

    #[tokio::test]
    async fn health_always_returns_200() {
        let router = test_router(test_state_with_mock("unused"));
        let response = router
            .oneshot(
                with_connect_info(Request::builder().uri("/health"))
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ready_returns_200_when_a_provider_is_healthy() {
        let router = test_router(test_state_with_mock("unused"));
        let response = router
            .oneshot(
                with_connect_info(Request::builder().uri("/ready"))
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ready_returns_503_when_no_provider_is_registered() {
        let state = Arc::new(AppState {
            manager: ProviderManager::new(),
            processor: Processor::new(None, FormattingOptions::default()),
            metrics: Metrics::new(),
            routes: Vec::new(),
        });
        let router = test_router(state);
        let response = router
            .oneshot(
                with_connect_info(Request::builder().uri("/ready"))
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn completions_happy_path_returns_200_with_content() {
        // §8 Scenario 1.
        let router = test_router(test_state_with_mock("World"));
        let response = router
            .oneshot(
                with_connect_info(
                    Request::builder()
                        .method("POST")
                        .uri("/v1/completions")
                        .header("content-type", "application/json"),
                )
                .body(axum::body::Body::from(r#"{"input":"Hello"}"#))
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["content"], "World");
    }

    #[tokio::test]
    async fn completions_rejects_an_empty_body_with_400() {
        let router = test_router(test_state_with_mock("unused"));
        let response = router
            .oneshot(
                with_connect_info(
                    Request::builder()
                        .method("POST")
                        .uri("/v1/completions")
                        .header("content-type", "application/json"),
                )
                .body(axum::body::Body::from("{}"))
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_prometheus_text() {
        let router = test_router(test_state_with_mock("unused"));
        let response = router
            .oneshot(
                with_connect_info(Request::builder().uri("/metrics"))
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&bytes).contains("hapax_uptime_seconds"));
    }
}
