//! Sensor registry — heartbeat upsert, listing, retirement, freeze control.
//!
//! Sensors report in over HTTP heartbeats. Each heartbeat upserts a row in
//! the `sensors` table: created on first contact, `last_heartbeat` refreshed
//! on every one. While a maintenance freeze is in effect the heartbeat still
//! refreshes `last_heartbeat`, but placement (building, section, comment) is
//! left untouched so a sensor being reflashed cannot wander.

use super::{SensorRow, Store};
use anyhow::Result;
use chrono::{DateTime, Utc};

impl Store {
    /// Upsert a sensor from a heartbeat. Creates the row on first contact
    /// (active, `created_at = now`); afterwards always advances
    /// `last_heartbeat` and, unless frozen, refreshes placement.
    pub async fn record_heartbeat(
        &self,
        uuid: &str,
        building_id: i64,
        section_id: i64,
        comment: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.write(|| async {
            sqlx::query(
                "INSERT INTO sensors (uuid, building_id, section_id, comment, created_at, last_heartbeat, is_active)
                 VALUES ($1, $2, $3, $4, $5, $5, 1)
                 ON CONFLICT (uuid) DO UPDATE SET
                   last_heartbeat = excluded.last_heartbeat,
                   building_id = CASE
                     WHEN sensors.frozen_until IS NOT NULL AND sensors.frozen_until > excluded.last_heartbeat
                     THEN sensors.building_id ELSE excluded.building_id END,
                   section_id = CASE
                     WHEN sensors.frozen_until IS NOT NULL AND sensors.frozen_until > excluded.last_heartbeat
                     THEN sensors.section_id ELSE excluded.section_id END,
                   comment = CASE
                     WHEN sensors.frozen_until IS NOT NULL AND sensors.frozen_until > excluded.last_heartbeat
                     THEN sensors.comment ELSE COALESCE(excluded.comment, sensors.comment) END",
            )
            .bind(uuid)
            .bind(building_id)
            .bind(section_id)
            .bind(comment)
            .bind(now)
            .execute(self.pool())
            .await
        })
        .await?;
        Ok(())
    }

    pub async fn get_sensor(&self, uuid: &str) -> Result<Option<SensorRow>> {
        let row = sqlx::query_as::<_, SensorRow>(
            "SELECT uuid, building_id, section_id, comment, created_at, last_heartbeat,
                    is_active, frozen_until, frozen_is_up, frozen_at
             FROM sensors WHERE uuid = $1",
        )
        .bind(uuid)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// All sensors, ordered by placement then uuid.
    pub async fn get_sensors(&self) -> Result<Vec<SensorRow>> {
        let rows = sqlx::query_as::<_, SensorRow>(
            "SELECT uuid, building_id, section_id, comment, created_at, last_heartbeat,
                    is_active, frozen_until, frozen_is_up, frozen_at
             FROM sensors ORDER BY building_id, section_id, uuid",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Active sensors only — the aggregator's working set. Ordering matches
    /// the deterministic sweep order.
    pub async fn get_active_sensors(&self) -> Result<Vec<SensorRow>> {
        let rows = sqlx::query_as::<_, SensorRow>(
            "SELECT uuid, building_id, section_id, comment, created_at, last_heartbeat,
                    is_active, frozen_until, frozen_is_up, frozen_at
             FROM sensors WHERE is_active = 1
             ORDER BY building_id, section_id, uuid",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Retire (or reinstate) a sensor. Retired sensors keep their history
    /// but stop contributing to section state.
    pub async fn set_sensor_active(&self, uuid: &str, active: bool) -> Result<bool> {
        let affected = self
            .write(|| async {
                sqlx::query("UPDATE sensors SET is_active = $1 WHERE uuid = $2")
                    .bind(active)
                    .bind(uuid)
                    .execute(self.pool())
                    .await
                    .map(|r| r.rows_affected())
            })
            .await?;
        Ok(affected > 0)
    }

    // ── Freeze control ──────────────────────────────────────────

    /// Pin a sensor to `assumed_is_up` until `until`. Returns false if the
    /// uuid is unknown.
    pub async fn freeze_sensor(
        &self,
        uuid: &str,
        until: DateTime<Utc>,
        assumed_is_up: bool,
        frozen_at: DateTime<Utc>,
    ) -> Result<bool> {
        let affected = self
            .write(|| async {
                sqlx::query(
                    "UPDATE sensors SET frozen_until = $1, frozen_is_up = $2, frozen_at = $3
                     WHERE uuid = $4",
                )
                .bind(until)
                .bind(assumed_is_up)
                .bind(frozen_at)
                .bind(uuid)
                .execute(self.pool())
                .await
                .map(|r| r.rows_affected())
            })
            .await?;
        Ok(affected > 0)
    }

    /// Clear a sensor's freeze, returning it to pure-liveness rules.
    pub async fn unfreeze_sensor(&self, uuid: &str) -> Result<bool> {
        let affected = self
            .write(|| async {
                sqlx::query(
                    "UPDATE sensors SET frozen_until = NULL, frozen_is_up = NULL, frozen_at = NULL
                     WHERE uuid = $1",
                )
                .bind(uuid)
                .execute(self.pool())
                .await
                .map(|r| r.rows_affected())
            })
            .await?;
        Ok(affected > 0)
    }

    /// Freeze every active sensor, stamping all rows with one shared
    /// `frozen_at` so the deploy that created the freeze can later lift
    /// exactly the rows it stamped. Returns the number of sensors frozen.
    pub async fn freeze_all(
        &self,
        until: DateTime<Utc>,
        assumed_is_up: bool,
        frozen_at: DateTime<Utc>,
    ) -> Result<u64> {
        let affected = self
            .write(|| async {
                sqlx::query(
                    "UPDATE sensors SET frozen_until = $1, frozen_is_up = $2, frozen_at = $3
                     WHERE is_active = 1",
                )
                .bind(until)
                .bind(assumed_is_up)
                .bind(frozen_at)
                .execute(self.pool())
                .await
                .map(|r| r.rows_affected())
            })
            .await?;
        Ok(affected)
    }

    /// Lift only the freezes stamped at `frozen_at`. Sensors frozen by a
    /// different operation (manual per-sensor freeze during the deploy
    /// window) are left alone.
    pub async fn unfreeze_stamped(&self, frozen_at: DateTime<Utc>) -> Result<u64> {
        let affected = self
            .write(|| async {
                sqlx::query(
                    "UPDATE sensors SET frozen_until = NULL, frozen_is_up = NULL, frozen_at = NULL
                     WHERE frozen_at = $1",
                )
                .bind(frozen_at)
                .execute(self.pool())
                .await
                .map(|r| r.rows_affected())
            })
            .await?;
        Ok(affected)
    }
}
