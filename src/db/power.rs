//! Section power state and the transition event log.
//!
//! `section_power_state` holds the current UP/DOWN verdict per (building,
//! section); `power_events` is the append-only edge log. A state flip and
//! its event row commit in one transaction, and the event append enforces
//! alternation: a transition equal to the latest logged edge for the same
//! section is dropped at write, so the log can never hold two consecutive
//! `up`s or `down`s.

use super::{EventType, PowerEventRow, SectionStateRow, Store};
use anyhow::Result;
use chrono::{DateTime, Utc};

impl Store {
    pub async fn get_section_state(
        &self,
        building_id: i64,
        section_id: i64,
    ) -> Result<Option<SectionStateRow>> {
        let row = sqlx::query_as::<_, SectionStateRow>(
            "SELECT building_id, section_id, is_up, last_change, updated_at
             FROM section_power_state WHERE building_id = $1 AND section_id = $2",
        )
        .bind(building_id)
        .bind(section_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// All section states in deterministic sweep order.
    pub async fn get_section_states(&self) -> Result<Vec<SectionStateRow>> {
        let rows = sqlx::query_as::<_, SectionStateRow>(
            "SELECT building_id, section_id, is_up, last_change, updated_at
             FROM section_power_state ORDER BY building_id, section_id",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Commit a state transition: upsert the section row and append the
    /// matching event, in one transaction. Returns the new event's id, or
    /// `None` when the edge duplicates the latest logged one (the event is
    /// dropped; the state row is still brought up to date).
    pub async fn commit_transition(
        &self,
        building_id: i64,
        section_id: i64,
        is_up: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        let event = EventType::from_is_up(is_up);
        self.write(|| async {
            let mut tx = self.pool().begin().await?;
            let last: Option<String> = sqlx::query_scalar(
                "SELECT event_type FROM power_events
                 WHERE building_id = $1 AND section_id = $2
                 ORDER BY id DESC LIMIT 1",
            )
            .bind(building_id)
            .bind(section_id)
            .fetch_optional(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO section_power_state (building_id, section_id, is_up, last_change, updated_at)
                 VALUES ($1, $2, $3, $4, $4)
                 ON CONFLICT (building_id, section_id) DO UPDATE SET
                   is_up = excluded.is_up,
                   last_change = excluded.last_change,
                   updated_at = excluded.updated_at",
            )
            .bind(building_id)
            .bind(section_id)
            .bind(is_up)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            let event_id = if last.as_deref() == Some(event.as_str()) {
                None
            } else {
                let id: i64 = sqlx::query_scalar(
                    "INSERT INTO power_events (event_type, building_id, section_id, timestamp)
                     VALUES ($1, $2, $3, $4)
                     RETURNING id",
                )
                .bind(event.as_str())
                .bind(building_id)
                .bind(section_id)
                .bind(now)
                .fetch_one(&mut *tx)
                .await?;
                Some(id)
            };

            tx.commit().await?;
            Ok(event_id)
        })
        .await
    }

    /// Refresh the `updated_at` marker on a section that was evaluated but
    /// did not change. Missing rows are left for lazy creation.
    pub async fn touch_section_state(
        &self,
        building_id: i64,
        section_id: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.write(|| async {
            sqlx::query(
                "UPDATE section_power_state SET updated_at = $1
                 WHERE building_id = $2 AND section_id = $3",
            )
            .bind(now)
            .bind(building_id)
            .bind(section_id)
            .execute(self.pool())
            .await
        })
        .await?;
        Ok(())
    }

    /// Newest-first slice of the event log.
    pub async fn get_recent_events(&self, limit: i64) -> Result<Vec<PowerEventRow>> {
        let rows = sqlx::query_as::<_, PowerEventRow>(
            "SELECT id, event_type, building_id, section_id, timestamp
             FROM power_events ORDER BY id DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Full event history for one section, oldest first. Used by tests and
    /// the reconciliation sweep.
    pub async fn get_section_events(
        &self,
        building_id: i64,
        section_id: i64,
    ) -> Result<Vec<PowerEventRow>> {
        let rows = sqlx::query_as::<_, PowerEventRow>(
            "SELECT id, event_type, building_id, section_id, timestamp
             FROM power_events
             WHERE building_id = $1 AND section_id = $2 ORDER BY id",
        )
        .bind(building_id)
        .bind(section_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}
