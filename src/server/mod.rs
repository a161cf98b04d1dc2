//! # Server — HTTP API and Data-Plane Supervisor
//!
//! Runs the Axum HTTP server for sensor heartbeats and the operator API,
//! and supervises the data-plane tasks: the liveness monitor, the job-lease
//! reclaimer, and the notifier worker pool. Everything shares one
//! [`AppState`] and one shutdown signal; tasks wind down within a bounded
//! grace period once the server stops accepting connections.

mod routes_freeze;
mod routes_health;
mod routes_heartbeat;
mod routes_jobs;
mod routes_sensors;
pub mod webapp_auth;

use crate::canonical::CanonicalMap;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::db::Store;
use crate::messenger::{Messenger, NullMessenger, TelegramMessenger};
use crate::monitor::Monitor;
use crate::notifier::{Notifier, NotifierSettings};
use crate::prom_metrics::Metrics;
use crate::ratelimit::TokenBucket;
use anyhow::Result;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::{error, info, warn};

/// Per-sensor heartbeat budget: 10 requests/second, burst of 10.
const HEARTBEAT_RATE_PER_SEC: f64 = 10.0;
/// Reclaimer cadence.
const RECLAIM_INTERVAL: Duration = Duration::from_secs(30);
/// How long background tasks get to wind down after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct AppState {
    pub store: Store,
    pub config: Config,
    pub canonical: CanonicalMap,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<Metrics>,
    pub started: Instant,
    /// Completion instant of the latest monitor sweep.
    pub last_tick: Mutex<Option<Instant>>,
    /// Per-sensor ingress buckets, pruned lazily.
    heartbeat_buckets: Mutex<HashMap<String, TokenBucket>>,
    /// Lossy "re-evaluate now" signal from ingress to the monitor loop.
    pub poke: tokio::sync::Notify,
}

impl AppState {
    pub fn new(
        store: Store,
        config: Config,
        canonical: CanonicalMap,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(AppState {
            store,
            config,
            canonical,
            clock,
            metrics: Arc::new(Metrics::new()),
            started: Instant::now(),
            last_tick: Mutex::new(None),
            heartbeat_buckets: Mutex::new(HashMap::new()),
            poke: tokio::sync::Notify::new(),
        })
    }

    /// Charge one heartbeat against the sensor's ingress budget. False
    /// means the sensor is over 10/s and gets a 429.
    pub(super) fn heartbeat_allowed(&self, sensor_uuid: &str) -> bool {
        let now = self.clock.monotonic();
        let mut buckets = self.heartbeat_buckets.lock().unwrap();
        if buckets.len() > 4096 {
            buckets.retain(|_, b| b.idle_for(now) < Duration::from_secs(600));
        }
        buckets
            .entry(sensor_uuid.to_string())
            .or_insert_with(|| TokenBucket::new(HEARTBEAT_RATE_PER_SEC, HEARTBEAT_RATE_PER_SEC, now))
            .try_acquire(now)
    }
}

/// Constant-time byte comparison for shared-secret checks.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Gate an operator endpoint on the `X-API-Key` header.
pub(super) fn require_api_key(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let presented = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if constant_time_eq(
        presented.as_bytes(),
        state.config.sensor_api_key.as_bytes(),
    ) {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "invalid or missing API key"})),
        )
            .into_response())
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/api/v1/heartbeat",
            post(routes_heartbeat::handler_heartbeat),
        )
        .route("/api/v1/health", get(routes_health::handler_health))
        .route("/metrics", get(routes_health::handler_metrics))
        .route("/api/v1/sensors", get(routes_sensors::handler_sensors))
        .route("/api/v1/status", get(routes_sensors::handler_status))
        .route("/api/v1/events", get(routes_sensors::handler_events))
        .route("/api/v1/freeze", post(routes_freeze::handler_freeze))
        .route("/api/v1/unfreeze", post(routes_freeze::handler_unfreeze))
        .route("/api/v1/freeze_all", post(routes_freeze::handler_freeze_all))
        .route(
            "/api/v1/unfreeze_stamped",
            post(routes_freeze::handler_unfreeze_stamped),
        )
        .route("/api/v1/broadcast", post(routes_jobs::handler_broadcast))
        .route("/api/v1/jobs/{id}", get(routes_jobs::handler_job_get))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(CatchPanicLayer::new())
        .layer(RequestBodyLimitLayer::new(64 * 1024))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(15),
        ))
        .with_state(state)
}

/// Production entry point: open the store, wire the real clock and
/// messenger, serve until SIGINT/SIGTERM.
pub async fn run(config: Config) -> Result<()> {
    let canonical = match &config.canonical_map_path {
        Some(path) => CanonicalMap::load(path)?,
        None => CanonicalMap::empty(),
    };
    let store = Store::open(&config.db_path, canonical.buildings()).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let messenger: Arc<dyn Messenger> = match &config.bot_token {
        Some(token) => Arc::new(TelegramMessenger::new(token)),
        None => {
            warn!("BOT_TOKEN not set, notifications will be logged and dropped");
            Arc::new(NullMessenger)
        }
    };
    run_with(store, canonical, clock, messenger, config).await
}

/// Serve with injected collaborators. Tests use this with a manual clock
/// and a mock messenger.
pub async fn run_with(
    store: Store,
    canonical: CanonicalMap,
    clock: Arc<dyn Clock>,
    messenger: Arc<dyn Messenger>,
    config: Config,
) -> Result<()> {
    let port = config.api_port;
    let state = AppState::new(store, config, canonical, clock);
    let app = build_router(state.clone());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = spawn_background(&state, messenger, shutdown_rx);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "gridwatch listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Server stopped: signal the data plane and give it the grace period.
    let _ = shutdown_tx.send(true);
    for handle in tasks.drain(..) {
        if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
            warn!("background task did not stop within the grace period");
        }
    }
    info!("gridwatch shut down");
    Ok(())
}

/// Spawn the monitor loop, the queue reclaimer, and the notifier pool.
pub fn spawn_background(
    state: &Arc<AppState>,
    messenger: Arc<dyn Messenger>,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut tasks = Vec::new();

    // Liveness monitor: fixed tick plus the ingress poke.
    let monitor_state = Arc::clone(state);
    let mut monitor_shutdown = shutdown.clone();
    tasks.push(tokio::spawn(async move {
        let monitor = Monitor::new(
            monitor_state.store.clone(),
            Arc::clone(&monitor_state.clock),
            monitor_state.config.sensor_timeout,
        );
        let mut interval = tokio::time::interval(monitor_state.config.check_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = monitor_state.poke.notified() => {}
                _ = monitor_shutdown.changed() => {}
            }
            if *monitor_shutdown.borrow() {
                return;
            }
            match monitor.sweep().await {
                Ok(summary) => {
                    *monitor_state.last_tick.lock().unwrap() = Some(Instant::now());
                    monitor_state.metrics.sections_up.set(summary.sections_up);
                    monitor_state
                        .metrics
                        .sections_down
                        .set(summary.sections_down);
                    for t in &summary.transitions {
                        monitor_state
                            .metrics
                            .transitions
                            .get_or_create(&crate::prom_metrics::EventLabel {
                                event_type: t.event_type.as_str().to_string(),
                            })
                            .inc();
                    }
                }
                Err(e) => error!(error = %e, "monitor sweep failed"),
            }
        }
    }));

    // Queue reclaimer: expired leases back to pending, depth gauges.
    let reclaim_state = Arc::clone(state);
    let mut reclaim_shutdown = shutdown.clone();
    tasks.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(RECLAIM_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = reclaim_shutdown.changed() => {}
            }
            if *reclaim_shutdown.borrow() {
                return;
            }
            let now = reclaim_state.clock.now_utc();
            match reclaim_state
                .store
                .reclaim_expired_jobs(
                    reclaim_state.config.lease_ttl,
                    reclaim_state.config.job_max_attempts,
                    now,
                )
                .await
            {
                Ok((requeued, failed)) => {
                    if requeued > 0 || failed > 0 {
                        warn!(requeued, failed, "reclaimed expired job leases");
                    }
                }
                Err(e) => warn!(error = %e, "lease reclaim failed"),
            }
            if let Ok((pending, running)) = reclaim_state.store.count_jobs().await {
                reclaim_state.metrics.jobs_pending.set(pending);
                reclaim_state.metrics.jobs_running.set(running);
            }
        }
    }));

    // Notifier pool.
    let notifier = Notifier::new(
        state.store.clone(),
        Arc::clone(&state.clock),
        messenger,
        Arc::clone(&state.metrics),
        NotifierSettings {
            rate_per_sec: state.config.broadcast_rate_per_sec,
            max_retries: state.config.broadcast_max_retries,
            admin_ids: state.config.admin_ids.clone(),
            local_utc_offset_hours: state.config.local_utc_offset_hours,
        },
    );
    for worker in 0..state.config.broadcast_concurrency.max(1) {
        let notifier = Arc::clone(&notifier);
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(notifier.run_worker(worker, shutdown)));
    }

    tasks
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received SIGINT, shutting down");
    }
}
