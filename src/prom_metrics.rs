//! # Prometheus Metrics — Pipeline Observability
//!
//! Exposes gridwatch operational metrics in the Prometheus text exposition
//! format at `GET /metrics`.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `gridwatch_heartbeats_total` | Counter | `result` | Heartbeat requests by outcome |
//! | `gridwatch_transitions_total` | Counter | `event_type` | Committed power transitions |
//! | `gridwatch_sections_up` | Gauge | — | Sections currently UP |
//! | `gridwatch_sections_down` | Gauge | — | Sections currently DOWN |
//! | `gridwatch_notifications_sent_total` | Counter | — | Messages delivered |
//! | `gridwatch_notifications_failed_total` | Counter | — | Deliveries given up on |
//! | `gridwatch_subscribers_retired_total` | Counter | — | Subscribers retired on permanent errors |
//! | `gridwatch_jobs_pending` | Gauge | — | Admin jobs waiting |
//! | `gridwatch_jobs_running` | Gauge | — | Admin jobs in flight |
//!
//! Counters update inline on the hot paths; gauges refresh from the monitor
//! and reclaimer loops.

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Label set for heartbeat outcomes (`accepted`, `unauthorized`, `invalid`,
/// `unknown_building`, `rate_limited`, `busy`).
#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct ResultLabel {
    pub result: String,
}

/// Label set for transition direction.
#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct EventLabel {
    pub event_type: String,
}

/// Thread-safe metrics registry. All fields are atomic and safe to update
/// from any task.
pub struct Metrics {
    pub registry: Registry,
    pub heartbeats: Family<ResultLabel, Counter>,
    pub transitions: Family<EventLabel, Counter>,
    pub sections_up: Gauge,
    pub sections_down: Gauge,
    pub notifications_sent: Counter,
    pub notifications_failed: Counter,
    pub subscribers_retired: Counter,
    pub jobs_pending: Gauge,
    pub jobs_running: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let heartbeats = Family::<ResultLabel, Counter>::default();
        registry.register(
            "gridwatch_heartbeats",
            "Heartbeat requests by outcome",
            heartbeats.clone(),
        );

        let transitions = Family::<EventLabel, Counter>::default();
        registry.register(
            "gridwatch_transitions",
            "Committed power transitions by direction",
            transitions.clone(),
        );

        let sections_up = Gauge::default();
        registry.register(
            "gridwatch_sections_up",
            "Sections currently considered UP",
            sections_up.clone(),
        );

        let sections_down = Gauge::default();
        registry.register(
            "gridwatch_sections_down",
            "Sections currently considered DOWN",
            sections_down.clone(),
        );

        let notifications_sent = Counter::default();
        registry.register(
            "gridwatch_notifications_sent",
            "Messages delivered to subscribers",
            notifications_sent.clone(),
        );

        let notifications_failed = Counter::default();
        registry.register(
            "gridwatch_notifications_failed",
            "Deliveries abandoned after retries",
            notifications_failed.clone(),
        );

        let subscribers_retired = Counter::default();
        registry.register(
            "gridwatch_subscribers_retired",
            "Subscribers retired on permanent messenger errors",
            subscribers_retired.clone(),
        );

        let jobs_pending = Gauge::default();
        registry.register(
            "gridwatch_jobs_pending",
            "Admin jobs waiting in the queue",
            jobs_pending.clone(),
        );

        let jobs_running = Gauge::default();
        registry.register(
            "gridwatch_jobs_running",
            "Admin jobs currently leased",
            jobs_running.clone(),
        );

        Self {
            registry,
            heartbeats,
            transitions,
            sections_up,
            sections_down,
            notifications_sent,
            notifications_failed,
            subscribers_retired,
            jobs_pending,
            jobs_running,
        }
    }

    pub fn count_heartbeat(&self, result: &str) {
        self.heartbeats
            .get_or_create(&ResultLabel {
                result: result.to_string(),
            })
            .inc();
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let mut buf = String::new();
        encode(&mut buf, &self.registry).expect("encoding metrics should not fail");
        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
