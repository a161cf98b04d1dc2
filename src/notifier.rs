//! # Notifier — Queue Consumer and Message Fan-Out
//!
//! A pool of workers claims admin jobs and turns them into messenger
//! deliveries. State detection never waits on this: the aggregator only
//! writes queue rows, so a slow messenger backs up the queue, not the
//! monitor.
//!
//! ## Dispatch Rules
//!
//! - One global token bucket caps deliveries at `BROADCAST_RATE_PER_SEC`
//!   across all workers; the pool size is the in-flight cap.
//! - Quiet hours: a subscriber whose local hour falls in
//!   `[quiet_start, quiet_end)` (wrap-around allowed) is skipped for
//!   transition notifications. Admin chat ids ignore quiet hours and the
//!   global `light_notifications_global` switch; operator broadcasts also
//!   bypass quiet hours.
//! - Duplicate `{subscriber, event_id}` pairs are suppressed within a
//!   10-second window.
//! - Transient messenger errors retry up to `BROADCAST_MAX_RETRIES` with
//!   jittered backoff; permanent errors retire the subscriber in a separate
//!   transaction and the fan-out continues.
//!
//! Progress counters are written at least every 2 s or 50 messages; each
//! progress write doubles as the job's lease heartbeat.

use crate::clock::Clock;
use crate::db::{
    AdminJobRow, BroadcastPayload, EventType, JobOutcome, LightNotifyPayload, Store,
    KIND_BROADCAST, KIND_LIGHT_NOTIFY,
};
use crate::messenger::{Messenger, MessengerError};
use crate::prom_metrics::Metrics;
use crate::ratelimit::TokenBucket;
use anyhow::Result;
use chrono::Timelike;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

/// How long a `{subscriber, event_id}` pair suppresses repeats.
const DEDUP_WINDOW: Duration = Duration::from_secs(10);
/// Progress/lease write cadence.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);
const PROGRESS_EVERY_N: i64 = 50;
/// Poll interval when the queue is empty.
const IDLE_POLL: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct NotifierSettings {
    pub rate_per_sec: f64,
    pub max_retries: u32,
    pub admin_ids: HashSet<i64>,
    pub local_utc_offset_hours: i32,
}

pub struct Notifier {
    store: Store,
    clock: Arc<dyn Clock>,
    messenger: Arc<dyn Messenger>,
    metrics: Arc<Metrics>,
    settings: NotifierSettings,
    bucket: Mutex<TokenBucket>,
    dedup: Mutex<HashMap<(i64, i64), Instant>>,
    /// Process instance id, part of every worker's claim identity.
    instance: String,
}

enum Dispatch {
    Sent,
    GaveUp,
    Retired,
}

impl Notifier {
    pub fn new(
        store: Store,
        clock: Arc<dyn Clock>,
        messenger: Arc<dyn Messenger>,
        metrics: Arc<Metrics>,
        settings: NotifierSettings,
    ) -> Arc<Self> {
        let bucket = TokenBucket::new(
            settings.rate_per_sec,
            settings.rate_per_sec,
            clock.monotonic(),
        );
        Arc::new(Notifier {
            store,
            clock,
            messenger,
            metrics,
            settings,
            bucket: Mutex::new(bucket),
            dedup: Mutex::new(HashMap::new()),
            instance: uuid::Uuid::new_v4().to_string(),
        })
    }

    /// Worker loop: claim, process, repeat. Exits when the shutdown signal
    /// fires; an in-flight job is left leased and the reclaimer returns it
    /// to `pending` after the TTL.
    pub async fn run_worker(self: Arc<Self>, worker: usize, mut shutdown: watch::Receiver<bool>) {
        let worker_id = format!("notifier-{}@{}", worker, self.instance);
        loop {
            if *shutdown.borrow() {
                return;
            }
            let claimed = self.store.claim_job(&worker_id, self.clock.now_utc()).await;
            match claimed {
                Ok(Some(job)) => {
                    let job_id = job.id;
                    if let Err(e) = self.process_job(&job, &shutdown).await {
                        warn!(worker, job_id, error = %e, "job processing failed");
                        let _ = self
                            .store
                            .finish_job(
                                job_id,
                                JobOutcome::Failed,
                                Some(&e.to_string()),
                                self.clock.now_utc(),
                            )
                            .await;
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(IDLE_POLL) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    warn!(worker, error = %e, "claim failed");
                    tokio::time::sleep(IDLE_POLL).await;
                }
            }
        }
    }

    /// Route a claimed job by kind.
    pub async fn process_job(
        &self,
        job: &AdminJobRow,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<()> {
        match job.kind.as_str() {
            KIND_LIGHT_NOTIFY => self.process_light_notify(job, shutdown).await,
            KIND_BROADCAST => self.process_broadcast(job, shutdown).await,
            other => {
                self.store
                    .finish_job(
                        job.id,
                        JobOutcome::Failed,
                        Some(&format!("unknown job kind: {}", other)),
                        self.clock.now_utc(),
                    )
                    .await
            }
        }
    }

    async fn process_light_notify(
        &self,
        job: &AdminJobRow,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<()> {
        let payload: LightNotifyPayload = match serde_json::from_str(&job.payload) {
            Ok(p) => p,
            Err(e) => {
                return self
                    .store
                    .finish_job(
                        job.id,
                        JobOutcome::Failed,
                        Some(&format!("bad payload: {}", e)),
                        self.clock.now_utc(),
                    )
                    .await;
            }
        };

        let building_name = self
            .store
            .get_building(payload.building_id)
            .await?
            .map(|b| b.name)
            .unwrap_or_else(|| format!("building {}", payload.building_id));
        let text = render_transition(payload.event_type, &building_name, payload.section_id);

        let global_off = self.store.light_notifications_disabled().await?;
        let subscribers = self
            .store
            .get_light_subscribers(payload.building_id, payload.section_id)
            .await?;
        let local_hour = self.local_hour();

        let mut audience = Vec::new();
        for sub in subscribers {
            let admin = self.settings.admin_ids.contains(&sub.chat_id);
            if global_off && !admin {
                continue;
            }
            if !admin {
                if let (Some(start), Some(end)) = (sub.quiet_start, sub.quiet_end) {
                    if in_quiet_window(local_hour, start, end) {
                        continue;
                    }
                }
            }
            if self.dedup_hit(sub.chat_id, payload.event_id) {
                continue;
            }
            audience.push(sub.chat_id);
        }

        self.fan_out(job.id, &audience, &text, None, shutdown).await
    }

    async fn process_broadcast(
        &self,
        job: &AdminJobRow,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<()> {
        let payload: BroadcastPayload = match serde_json::from_str(&job.payload) {
            Ok(p) => p,
            Err(e) => {
                return self
                    .store
                    .finish_job(
                        job.id,
                        JobOutcome::Failed,
                        Some(&format!("bad payload: {}", e)),
                        self.clock.now_utc(),
                    )
                    .await;
            }
        };
        let audience: Vec<i64> = self
            .store
            .get_active_subscribers()
            .await?
            .into_iter()
            .map(|s| s.chat_id)
            .collect();
        self.fan_out(
            job.id,
            &audience,
            &payload.text,
            payload.parse_mode.as_deref(),
            shutdown,
        )
        .await
    }

    /// Deliver to every chat in `audience`, updating progress/lease as we
    /// go. Stops early on shutdown, leaving the job leased for reclaim.
    async fn fan_out(
        &self,
        job_id: i64,
        audience: &[i64],
        text: &str,
        parse_mode: Option<&str>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<()> {
        let total = audience.len() as i64;
        self.store
            .job_heartbeat(job_id, 0, total, self.clock.now_utc())
            .await?;

        let mut processed: i64 = 0;
        let mut failed: i64 = 0;
        let mut last_progress = self.clock.monotonic();
        for &chat_id in audience {
            if *shutdown.borrow() {
                info!(job_id, processed, total, "shutdown during fan-out, leaving job leased");
                return Ok(());
            }
            match self.dispatch_one(chat_id, text, parse_mode).await {
                Dispatch::Sent => {
                    self.metrics.notifications_sent.inc();
                }
                Dispatch::GaveUp => {
                    failed += 1;
                    self.metrics.notifications_failed.inc();
                }
                Dispatch::Retired => {
                    failed += 1;
                    self.metrics.subscribers_retired.inc();
                }
            }
            processed += 1;
            if processed % PROGRESS_EVERY_N == 0
                || self.clock.monotonic().duration_since(last_progress) >= PROGRESS_INTERVAL
            {
                self.store
                    .job_heartbeat(job_id, processed, total, self.clock.now_utc())
                    .await?;
                last_progress = self.clock.monotonic();
            }
        }

        self.store
            .job_heartbeat(job_id, processed, total, self.clock.now_utc())
            .await?;
        let error = (failed > 0).then(|| format!("{} of {} deliveries failed", failed, total));
        self.store
            .finish_job(job_id, JobOutcome::Done, error.as_deref(), self.clock.now_utc())
            .await
    }

    /// One delivery under the global rate limit, with bounded retries on
    /// transient errors. Permanent errors retire the subscriber.
    async fn dispatch_one(&self, chat_id: i64, text: &str, parse_mode: Option<&str>) -> Dispatch {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().unwrap();
                let now = self.clock.monotonic();
                if bucket.try_acquire(now) {
                    Duration::ZERO
                } else {
                    bucket.next_available(now).max(Duration::from_millis(5))
                }
            };
            if wait.is_zero() {
                break;
            }
            tokio::time::sleep(wait).await;
        }

        let mut attempt = 0;
        loop {
            match self.messenger.send_text(chat_id, text, parse_mode).await {
                Ok(()) => return Dispatch::Sent,
                Err(MessengerError::Permanent(reason)) => {
                    info!(chat_id, %reason, "permanent delivery failure, retiring subscriber");
                    if let Err(e) = self.store.set_subscriber_active(chat_id, false).await {
                        warn!(chat_id, error = %e, "failed to retire subscriber");
                    }
                    return Dispatch::Retired;
                }
                Err(MessengerError::Transient(reason)) => {
                    if attempt >= self.settings.max_retries {
                        warn!(chat_id, %reason, attempt, "delivery abandoned");
                        return Dispatch::GaveUp;
                    }
                    attempt += 1;
                    tokio::time::sleep(retry_backoff(attempt)).await;
                }
            }
        }
    }

    fn local_hour(&self) -> u32 {
        let local = self.clock.now_utc()
            + chrono::Duration::hours(i64::from(self.settings.local_utc_offset_hours));
        local.hour()
    }

    /// True when this `{subscriber, event}` pair was already dispatched
    /// within the dedup window. Records the pair otherwise.
    fn dedup_hit(&self, chat_id: i64, event_id: i64) -> bool {
        let now = self.clock.monotonic();
        let mut seen = self.dedup.lock().unwrap();
        seen.retain(|_, at| now.duration_since(*at) < DEDUP_WINDOW);
        match seen.get(&(chat_id, event_id)) {
            Some(_) => true,
            None => {
                seen.insert((chat_id, event_id), now);
                false
            }
        }
    }
}

/// Backoff with cheap jitter for transient messenger retries.
fn retry_backoff(attempt: u32) -> Duration {
    let base = 100u64.saturating_mul(1 << attempt.min(4));
    let jitter = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::from(d.subsec_millis()) % 100)
        .unwrap_or(0);
    Duration::from_millis(base + jitter)
}

/// Quiet-window membership: `[start, end)` on the hour dial, wrapping
/// through midnight when `start > end`. An equal pair is an empty window.
pub fn in_quiet_window(hour: u32, start: i64, end: i64) -> bool {
    let hour = i64::from(hour);
    if start == end {
        false
    } else if start < end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

/// Message template for a committed transition.
pub fn render_transition(event: EventType, building_name: &str, section_id: i64) -> String {
    match event {
        EventType::Up => format!(
            "⚡ Power restored — {}, section {}",
            building_name, section_id
        ),
        EventType::Down => format!(
            "🕯 Power outage — {}, section {}",
            building_name, section_id
        ),
    }
}
