//! Process-wide switches, persisted in the `kv` table.
//!
//! The only runtime-mutable flags live here, behind a narrow accessor. The
//! notifier consults `light_notifications_global`; deploy tooling must use
//! per-sensor freezes instead of this switch.

use super::Store;
use anyhow::Result;

/// Operator kill-switch for light notifications (`on`/`off`; absent = on).
pub const KEY_LIGHT_NOTIFICATIONS_GLOBAL: &str = "light_notifications_global";

impl Store {
    pub async fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT v FROM kv WHERE k = $1")
            .bind(key)
            .fetch_optional(self.pool())
            .await?;
        Ok(value)
    }

    pub async fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        self.write(|| async {
            sqlx::query(
                "INSERT INTO kv (k, v) VALUES ($1, $2)
                 ON CONFLICT (k) DO UPDATE SET v = excluded.v",
            )
            .bind(key)
            .bind(value)
            .execute(self.pool())
            .await
        })
        .await?;
        Ok(())
    }

    /// Whether the global light-notification switch is off.
    pub async fn light_notifications_disabled(&self) -> Result<bool> {
        Ok(self
            .kv_get(KEY_LIGHT_NOTIFICATIONS_GLOBAL)
            .await?
            .as_deref()
            == Some("off"))
    }
}
