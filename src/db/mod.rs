//! # Database — Embedded SQLite Storage Layer
//!
//! Provides async database operations for the power-state engine via
//! `sqlx::SqlitePool` on a single embedded file at `DB_PATH`.
//!
//! ## Schema
//!
//! - `buildings`: static residential catalog, seeded idempotently at init
//! - `sensors`: heartbeat registry with freeze overrides
//! - `section_power_state`: one row per (building, section), current state
//! - `power_events`: append-only UP/DOWN transition log
//! - `subscribers`: chat subscriptions, toggles, quiet hours
//! - `admin_jobs`: leased FIFO control-plane queue
//! - `kv`: process-wide switches
//!
//! ## Module Structure
//!
//! Operations are split into submodules by domain:
//!
//! - [`sensors`] — heartbeat upsert, listing, retirement, freeze control
//! - [`power`] — section state and the transition event log
//! - [`subscribers`] — subscription rows and fan-out filtering
//! - [`queue`] — admin job enqueue/claim/heartbeat/finish/reclaim
//! - [`kv`] — global switch accessor
//!
//! ## Write Discipline
//!
//! SQLite allows one writer at a time. Every mutating statement goes through
//! [`Store::write`], which serializes writers behind a process-wide async
//! mutex and retries transient busy/locked errors with truncated exponential
//! backoff (10..320 ms, giving up after ~640 ms). Readers go straight to the
//! pool and never wait on the gate.

mod kv;
mod power;
mod queue;
mod sensors;
mod subscribers;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::canonical::BuildingSeed;

pub use queue::{
    BroadcastPayload, JobOutcome, LightNotifyPayload, KIND_BROADCAST, KIND_LIGHT_NOTIFY,
};

// ── Catalog types ───────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct BuildingRow {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub sections_count: i64,
}

// ── Sensor types ────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct SensorRow {
    pub uuid: String,
    pub building_id: i64,
    pub section_id: i64,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub frozen_until: Option<DateTime<Utc>>,
    pub frozen_is_up: Option<bool>,
    pub frozen_at: Option<DateTime<Utc>>,
}

impl SensorRow {
    /// Whether the maintenance freeze is in effect at `now`.
    pub fn frozen(&self, now: DateTime<Utc>) -> bool {
        self.frozen_until.map(|until| until > now).unwrap_or(false)
    }
}

// ── Power state types ───────────────────────────────────────────

/// UP/DOWN edge direction, serialized lowercase in payloads and the DB.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Up,
    Down,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Up => "up",
            EventType::Down => "down",
        }
    }

    pub fn from_is_up(is_up: bool) -> Self {
        if is_up {
            EventType::Up
        } else {
            EventType::Down
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct SectionStateRow {
    pub building_id: i64,
    pub section_id: i64,
    pub is_up: bool,
    pub last_change: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct PowerEventRow {
    pub id: i64,
    pub event_type: String,
    pub building_id: i64,
    pub section_id: i64,
    pub timestamp: DateTime<Utc>,
}

// ── Subscriber types ────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct SubscriberRow {
    pub chat_id: i64,
    pub building_id: Option<i64>,
    pub section_id: Option<i64>,
    pub light_notifications: bool,
    pub alert_notifications: bool,
    pub schedule_notifications: bool,
    pub quiet_start: Option<i64>,
    pub quiet_end: Option<i64>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

// ── Admin job types ─────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct AdminJobRow {
    pub id: i64,
    pub kind: String,
    pub payload: String,
    pub status: String,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub attempts: i64,
    pub progress_current: i64,
    pub progress_total: i64,
    pub last_error: Option<String>,
    pub claimed_by: Option<String>,
}

// ── Store and connection ────────────────────────────────────────

/// Backoff schedule for transient busy/locked errors (ms).
const BUSY_BACKOFF_MS: [u64; 6] = [10, 20, 40, 80, 160, 320];

/// Buildings seeded when the catalog is empty and no map file provides one.
const DEFAULT_CATALOG: [(i64, &str, &str, i64); 3] = [
    (1, "Newcastle House", "1 Newcastle Quay", 2),
    (2, "Alder Court", "3 Newcastle Quay", 3),
    (3, "Harbour Block", "5 Newcastle Quay", 1),
];

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    write_gate: Arc<tokio::sync::Mutex<()>>,
}

impl Store {
    /// Open (creating if missing) the database file, apply additive
    /// migrations, and seed the buildings catalog idempotently.
    pub async fn open(path: &Path, catalog: &[BuildingSeed]) -> Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await
            .with_context(|| format!("opening database {}", path.display()))?;
        let store = Store {
            pool,
            write_gate: Arc::new(tokio::sync::Mutex::new(())),
        };
        store.migrate().await.context("schema initialization")?;
        store.seed_buildings(catalog).await.context("catalog seed")?;
        Ok(store)
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Health check: execute `SELECT 1` to verify the database responds.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    /// Run a mutating operation under the single-writer gate, retrying
    /// transient busy/locked errors per the backoff schedule.
    pub(crate) async fn write<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let _gate = self.write_gate.lock().await;
        for delay_ms in BUSY_BACKOFF_MS {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if is_busy(&e) => {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        op().await.map_err(|e| anyhow::anyhow!(e))
    }

    // ── Migrations ──────────────────────────────────────────────

    /// Additive-only schema setup. Base tables via `CREATE TABLE IF NOT
    /// EXISTS`; columns introduced after the first release via
    /// `ALTER TABLE … ADD COLUMN` guarded by a pragma existence check.
    /// Destructive migrations are out-of-process.
    async fn migrate(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS buildings (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                address TEXT NOT NULL DEFAULT '',
                sections_count INTEGER NOT NULL DEFAULT 1
            )",
            "CREATE TABLE IF NOT EXISTS sensors (
                uuid TEXT PRIMARY KEY,
                building_id INTEGER NOT NULL REFERENCES buildings(id),
                section_id INTEGER NOT NULL DEFAULT 1,
                comment TEXT,
                created_at TEXT NOT NULL,
                last_heartbeat TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                frozen_until TEXT,
                frozen_is_up INTEGER
            )",
            "CREATE TABLE IF NOT EXISTS section_power_state (
                building_id INTEGER NOT NULL,
                section_id INTEGER NOT NULL,
                is_up INTEGER NOT NULL,
                last_change TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (building_id, section_id)
            )",
            "CREATE TABLE IF NOT EXISTS power_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_type TEXT NOT NULL CHECK (event_type IN ('up', 'down')),
                building_id INTEGER NOT NULL,
                section_id INTEGER NOT NULL,
                timestamp TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_power_events_section
                 ON power_events (building_id, section_id, id)",
            "CREATE TABLE IF NOT EXISTS subscribers (
                chat_id INTEGER PRIMARY KEY,
                building_id INTEGER,
                section_id INTEGER,
                light_notifications INTEGER NOT NULL DEFAULT 1,
                alert_notifications INTEGER NOT NULL DEFAULT 1,
                schedule_notifications INTEGER NOT NULL DEFAULT 1,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS admin_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_by TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_admin_jobs_status
                 ON admin_jobs (status, created_at)",
            "CREATE TABLE IF NOT EXISTS kv (
                k TEXT PRIMARY KEY,
                v TEXT NOT NULL
            )",
        ];
        for stmt in statements {
            sqlx::query(stmt).execute(&self.pool).await?;
        }

        // Columns added after the initial schema shipped.
        self.add_column_if_missing("sensors", "frozen_at", "frozen_at TEXT")
            .await?;
        self.add_column_if_missing("subscribers", "quiet_start", "quiet_start INTEGER")
            .await?;
        self.add_column_if_missing("subscribers", "quiet_end", "quiet_end INTEGER")
            .await?;
        self.add_column_if_missing("admin_jobs", "updated_at", "updated_at TEXT")
            .await?;
        self.add_column_if_missing(
            "admin_jobs",
            "progress_current",
            "progress_current INTEGER NOT NULL DEFAULT 0",
        )
        .await?;
        self.add_column_if_missing(
            "admin_jobs",
            "progress_total",
            "progress_total INTEGER NOT NULL DEFAULT 0",
        )
        .await?;
        self.add_column_if_missing("admin_jobs", "claimed_by", "claimed_by TEXT")
            .await?;
        Ok(())
    }

    async fn add_column_if_missing(&self, table: &str, column: &str, ddl: &str) -> Result<()> {
        let present: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM pragma_table_info($1) WHERE name = $2")
                .bind(table)
                .bind(column)
                .fetch_one(&self.pool)
                .await?;
        if present == 0 {
            sqlx::query(&format!("ALTER TABLE {} ADD COLUMN {}", table, ddl))
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    // ── Catalog ─────────────────────────────────────────────────

    /// Upsert the buildings catalog. When no seeds are supplied and the
    /// table is empty, the built-in default catalog is installed so a fresh
    /// instance accepts heartbeats out of the box.
    async fn seed_buildings(&self, catalog: &[BuildingSeed]) -> Result<()> {
        for b in catalog {
            self.write(|| async {
                sqlx::query(
                    "INSERT INTO buildings (id, name, address, sections_count)
                     VALUES ($1, $2, $3, $4)
                     ON CONFLICT (id) DO UPDATE SET
                       name = excluded.name, address = excluded.address,
                       sections_count = excluded.sections_count",
                )
                .bind(b.id)
                .bind(&b.name)
                .bind(&b.address)
                .bind(b.sections)
                .execute(&self.pool)
                .await
            })
            .await?;
        }
        if catalog.is_empty() {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM buildings")
                .fetch_one(&self.pool)
                .await?;
            if count == 0 {
                for (id, name, address, sections) in DEFAULT_CATALOG {
                    self.write(|| async {
                        sqlx::query(
                            "INSERT OR IGNORE INTO buildings (id, name, address, sections_count)
                             VALUES ($1, $2, $3, $4)",
                        )
                        .bind(id)
                        .bind(name)
                        .bind(address)
                        .bind(sections)
                        .execute(&self.pool)
                        .await
                    })
                    .await?;
                }
            }
        }
        Ok(())
    }

    /// Look up a building by id. `None` means the id is unknown.
    pub async fn get_building(&self, id: i64) -> Result<Option<BuildingRow>> {
        let row = sqlx::query_as::<_, BuildingRow>(
            "SELECT id, name, address, sections_count FROM buildings WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_buildings(&self) -> Result<Vec<BuildingRow>> {
        let rows = sqlx::query_as::<_, BuildingRow>(
            "SELECT id, name, address, sections_count FROM buildings ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

/// Transient SQLite contention: the database or a table is locked by
/// another writer. Anything else is a real error.
fn is_busy(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => {
            let msg = db.message();
            msg.contains("database is locked") || msg.contains("database table is locked")
        }
        _ => false,
    }
}
