//! Subscriber rows — chat subscriptions, toggles, quiet hours.
//!
//! The chat bot owns subscriber onboarding; the core maintains the rows it
//! needs for fan-out: placement filter, per-kind toggles, quiet window, and
//! the active flag the notifier clears when the messenger reports a
//! permanent delivery failure.

use super::{Store, SubscriberRow};
use anyhow::Result;
use chrono::{DateTime, Utc};

const SUBSCRIBER_COLUMNS: &str = "chat_id, building_id, section_id, light_notifications, \
     alert_notifications, schedule_notifications, quiet_start, quiet_end, is_active, created_at";

impl Store {
    /// Create or update a subscription. Toggles default to ON and the quiet
    /// window to off for new rows; an existing row only has its placement
    /// updated.
    pub async fn upsert_subscriber(
        &self,
        chat_id: i64,
        building_id: Option<i64>,
        section_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.write(|| async {
            sqlx::query(
                "INSERT INTO subscribers (chat_id, building_id, section_id, created_at)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (chat_id) DO UPDATE SET
                   building_id = excluded.building_id,
                   section_id = excluded.section_id,
                   is_active = 1",
            )
            .bind(chat_id)
            .bind(building_id)
            .bind(section_id)
            .bind(now)
            .execute(self.pool())
            .await
        })
        .await?;
        Ok(())
    }

    pub async fn get_subscriber(&self, chat_id: i64) -> Result<Option<SubscriberRow>> {
        let sql = format!("SELECT {SUBSCRIBER_COLUMNS} FROM subscribers WHERE chat_id = $1");
        let row = sqlx::query_as::<_, SubscriberRow>(&sql)
            .bind(chat_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    pub async fn set_quiet_hours(
        &self,
        chat_id: i64,
        quiet_start: Option<i64>,
        quiet_end: Option<i64>,
    ) -> Result<()> {
        self.write(|| async {
            sqlx::query("UPDATE subscribers SET quiet_start = $1, quiet_end = $2 WHERE chat_id = $3")
                .bind(quiet_start)
                .bind(quiet_end)
                .bind(chat_id)
                .execute(self.pool())
                .await
        })
        .await?;
        Ok(())
    }

    pub async fn set_light_notifications(&self, chat_id: i64, enabled: bool) -> Result<()> {
        self.write(|| async {
            sqlx::query("UPDATE subscribers SET light_notifications = $1 WHERE chat_id = $2")
                .bind(enabled)
                .bind(chat_id)
                .execute(self.pool())
                .await
        })
        .await?;
        Ok(())
    }

    /// Activate or retire a subscriber. The notifier retires on permanent
    /// messenger errors (user blocked the bot, chat gone).
    pub async fn set_subscriber_active(&self, chat_id: i64, active: bool) -> Result<()> {
        self.write(|| async {
            sqlx::query("UPDATE subscribers SET is_active = $1 WHERE chat_id = $2")
                .bind(active)
                .bind(chat_id)
                .execute(self.pool())
                .await
        })
        .await?;
        Ok(())
    }

    /// The fan-out audience for a section transition: active subscribers of
    /// the building with the light toggle on, either section-agnostic or
    /// matching the payload's section.
    pub async fn get_light_subscribers(
        &self,
        building_id: i64,
        section_id: i64,
    ) -> Result<Vec<SubscriberRow>> {
        let sql = format!(
            "SELECT {SUBSCRIBER_COLUMNS} FROM subscribers
             WHERE is_active = 1 AND light_notifications = 1
               AND building_id = $1
               AND (section_id IS NULL OR section_id = $2)
             ORDER BY chat_id"
        );
        let rows = sqlx::query_as::<_, SubscriberRow>(&sql)
            .bind(building_id)
            .bind(section_id)
            .fetch_all(self.pool())
            .await?;
        Ok(rows)
    }

    /// Everyone reachable — the broadcast audience.
    pub async fn get_active_subscribers(&self) -> Result<Vec<SubscriberRow>> {
        let sql =
            format!("SELECT {SUBSCRIBER_COLUMNS} FROM subscribers WHERE is_active = 1 ORDER BY chat_id");
        let rows = sqlx::query_as::<_, SubscriberRow>(&sql)
            .fetch_all(self.pool())
            .await?;
        Ok(rows)
    }
}
