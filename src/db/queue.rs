//! Admin job queue — durable control-plane work with lease semantics.
//!
//! A single table backs the queue. Producers (the aggregator's transition
//! emitter, the operator broadcast endpoint) insert `pending` rows; notifier
//! workers claim the oldest pending row, heartbeat `updated_at` while
//! running, and finish with a terminal status. A periodic reclaimer returns
//! leases that went silent for longer than the TTL to `pending`, or fails
//! the job once its attempts are spent.
//!
//! ## Lifecycle
//!
//! ```text
//! pending ──claim──> running ──finish──> done | failed | canceled
//!    ^                  │
//!    └────reclaim───────┘   (lease expired; attempts < max)
//! ```
//!
//! Claims are FIFO by `created_at`, ties broken by `id`. The claim is a
//! single `UPDATE … RETURNING` under the write gate, so no two workers can
//! observe the same job in `running`.

use super::{AdminJobRow, EventType, Store};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const KIND_LIGHT_NOTIFY: &str = "light_notify";
pub const KIND_BROADCAST: &str = "broadcast";

fn payload_v1() -> u32 {
    1
}

/// Payload of a `light_notify` job: one committed power transition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LightNotifyPayload {
    #[serde(default = "payload_v1")]
    pub v: u32,
    pub building_id: i64,
    pub section_id: i64,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub event_id: i64,
}

/// Payload of a `broadcast` job: an operator-composed message for all
/// active subscribers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BroadcastPayload {
    #[serde(default = "payload_v1")]
    pub v: u32,
    pub text: String,
    #[serde(default)]
    pub parse_mode: Option<String>,
}

/// Terminal states accepted by [`Store::finish_job`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Done,
    Failed,
    Canceled,
}

impl JobOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            JobOutcome::Done => "done",
            JobOutcome::Failed => "failed",
            JobOutcome::Canceled => "canceled",
        }
    }
}

const JOB_COLUMNS: &str = "id, kind, payload, status, created_by, created_at, started_at, \
     finished_at, updated_at, attempts, progress_current, progress_total, last_error, claimed_by";

impl Store {
    /// Insert a pending job. Returns its id.
    pub async fn enqueue_job(
        &self,
        kind: &str,
        payload: &str,
        created_by: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        self.write(|| async {
            sqlx::query_scalar(
                "INSERT INTO admin_jobs (kind, payload, status, created_by, created_at, attempts)
                 VALUES ($1, $2, 'pending', $3, $4, 0)
                 RETURNING id",
            )
            .bind(kind)
            .bind(payload)
            .bind(created_by)
            .bind(now)
            .fetch_one(self.pool())
            .await
        })
        .await
    }

    /// Atomically claim the oldest pending job for `worker_id`:
    /// `status <- running`, `started_at`/`updated_at <- now`,
    /// `attempts + 1`. `None` when the queue is empty.
    pub async fn claim_job(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AdminJobRow>> {
        let sql = format!(
            "UPDATE admin_jobs
             SET status = 'running', started_at = $1, updated_at = $1,
                 attempts = attempts + 1, claimed_by = $2
             WHERE id = (SELECT id FROM admin_jobs WHERE status = 'pending'
                         ORDER BY created_at, id LIMIT 1)
             RETURNING {JOB_COLUMNS}"
        );
        self.write(|| async {
            sqlx::query_as::<_, AdminJobRow>(&sql)
                .bind(now)
                .bind(worker_id)
                .fetch_optional(self.pool())
                .await
        })
        .await
    }

    /// Lease heartbeat: refresh `updated_at` and the progress counters.
    /// Must be called at least every lease TTL while the job runs.
    pub async fn job_heartbeat(
        &self,
        id: i64,
        progress_current: i64,
        progress_total: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.write(|| async {
            sqlx::query(
                "UPDATE admin_jobs
                 SET updated_at = $1, progress_current = $2, progress_total = $3
                 WHERE id = $4 AND status = 'running'",
            )
            .bind(now)
            .bind(progress_current)
            .bind(progress_total)
            .bind(id)
            .execute(self.pool())
            .await
        })
        .await?;
        Ok(())
    }

    /// Move a job to a terminal state. Repeating finish on an already
    /// terminal job is a no-op.
    pub async fn finish_job(
        &self,
        id: i64,
        outcome: JobOutcome,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.write(|| async {
            sqlx::query(
                "UPDATE admin_jobs
                 SET status = $1, finished_at = $2, updated_at = $2, last_error = $3
                 WHERE id = $4 AND status IN ('pending', 'running')",
            )
            .bind(outcome.as_str())
            .bind(now)
            .bind(error)
            .bind(id)
            .execute(self.pool())
            .await
        })
        .await?;
        Ok(())
    }

    /// Return expired leases to `pending`, or fail them once attempts are
    /// spent. Returns `(requeued, failed)`.
    pub async fn reclaim_expired_jobs(
        &self,
        lease_ttl: Duration,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<(u64, u64)> {
        let cutoff = now
            - chrono::Duration::from_std(lease_ttl).unwrap_or_else(|_| chrono::Duration::seconds(60));
        self.write(|| async {
            let mut tx = self.pool().begin().await?;
            let failed = sqlx::query(
                "UPDATE admin_jobs
                 SET status = 'failed', last_error = 'lease expired',
                     finished_at = $1, updated_at = $1
                 WHERE status = 'running' AND updated_at < $2 AND attempts >= $3",
            )
            .bind(now)
            .bind(cutoff)
            .bind(max_attempts as i64)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            let requeued = sqlx::query(
                "UPDATE admin_jobs SET status = 'pending'
                 WHERE status = 'running' AND updated_at < $1",
            )
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            tx.commit().await?;
            Ok((requeued, failed))
        })
        .await
    }

    pub async fn get_job(&self, id: i64) -> Result<Option<AdminJobRow>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM admin_jobs WHERE id = $1");
        let row = sqlx::query_as::<_, AdminJobRow>(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    /// Queue depth: `(pending, running)` counts for observability.
    pub async fn count_jobs(&self) -> Result<(i64, i64)> {
        let row: (i64, i64) = sqlx::query_as(
            "SELECT
                COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'running' THEN 1 ELSE 0 END), 0)
             FROM admin_jobs",
        )
        .fetch_one(self.pool())
        .await?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn light_notify_payload_round_trips() {
        let payload = LightNotifyPayload {
            v: 1,
            building_id: 1,
            section_id: 2,
            event_type: EventType::Down,
            timestamp: "2025-06-01T12:00:00Z".parse().unwrap(),
            event_id: 17,
        };
        let raw = serde_json::to_string(&payload).unwrap();
        assert!(raw.contains("\"event_type\":\"down\""));
        let back: LightNotifyPayload = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.event_id, 17);
        assert_eq!(back.event_type, EventType::Down);
    }

    #[test]
    fn unversioned_payload_defaults_to_v1() {
        let raw = r#"{"building_id":1,"section_id":2,"event_type":"up",
                      "timestamp":"2025-06-01T12:00:00Z","event_id":3}"#;
        let payload: LightNotifyPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(payload.v, 1);
    }

    #[test]
    fn outcome_strings_match_schema() {
        assert_eq!(JobOutcome::Done.as_str(), "done");
        assert_eq!(JobOutcome::Failed.as_str(), "failed");
        assert_eq!(JobOutcome::Canceled.as_str(), "canceled");
    }
}
