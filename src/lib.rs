//! # Gridwatch — Core Library
//!
//! Power-outage monitoring for a residential complex. ESP32 sensors at each
//! building section POST heartbeats; the service derives per-section power
//! state from sensor liveness, logs UP/DOWN transitions, and fans
//! notifications out to subscribed chats through a durable job queue.
//!
//! ## Module Organization
//!
//! **Data plane**:
//! - [`monitor`] — liveness sweep and section aggregation with hysteresis
//! - [`notifier`] — queue consumer: rate-limited, deduplicated fan-out
//! - [`messenger`] — outbound chat delivery with transient/permanent
//!   error classification
//!
//! **Storage**:
//! - [`db`] — SQLite store: sensors, section state, event log, subscribers,
//!   admin job queue, KV switches
//!
//! **Edges**:
//! - [`server`] — Axum HTTP API (heartbeat ingest, health, operator
//!   surface) and background task supervision
//! - [`operator_client`] — CLI-side HTTP client for deploy scripts
//!
//! **Shared**:
//! - [`canonical`] — startup-loaded UUID → placement pinning
//! - [`clock`] — injectable time source
//! - [`config`] — environment-driven configuration
//! - [`ratelimit`] — token buckets for ingress and dispatch
//! - [`prom_metrics`] — Prometheus registry
//!
//! ## Dataflow
//!
//! ```text
//! heartbeat → server → db ─┐
//!                          ├→ monitor → power_events → admin_jobs → notifier → messenger
//! tick ─────────────────────┘
//! ```
//!
//! The monitor never performs network I/O; a slow messenger backs up the
//! queue without delaying outage detection.

pub mod canonical;
pub mod clock;
pub mod config;
pub mod db;
pub mod messenger;
pub mod monitor;
pub mod notifier;
pub mod operator_client;
pub mod prom_metrics;
pub mod ratelimit;
pub mod server;
