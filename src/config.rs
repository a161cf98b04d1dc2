//! # Config — Environment-Driven Service Configuration
//!
//! All tunables come from the environment (`.env` honored via dotenvy in
//! `main`). Missing `SENSOR_API_KEY` or `DB_PATH` is fatal at startup; every
//! other key has the documented default. The parsed [`Config`] is injected
//! at construction — no module reads the environment after startup, and the
//! only runtime-mutable switch lives in the `kv` table.

use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    /// Shared secret for heartbeat auth and the operator API (`X-API-Key`).
    pub sensor_api_key: String,
    pub api_port: u16,
    /// Path of the embedded SQLite database file.
    pub db_path: PathBuf,
    /// Staleness threshold: a sensor is stale once `now - last_heartbeat`
    /// reaches this value.
    pub sensor_timeout: Duration,
    /// Liveness monitor tick interval.
    pub check_interval: Duration,
    pub broadcast_rate_per_sec: f64,
    pub broadcast_concurrency: usize,
    pub broadcast_max_retries: u32,
    /// Chat ids exempt from quiet hours and the global notification switch.
    pub admin_ids: HashSet<i64>,
    /// Default freeze window for deploy scripts.
    pub deploy_freeze_minutes: i64,
    /// Optional TOML file pinning rollout sensor UUIDs to placements.
    pub canonical_map_path: Option<PathBuf>,
    /// Messenger bot token. When unset the notifier logs instead of sending.
    pub bot_token: Option<String>,
    /// Offset applied to UTC when evaluating subscriber quiet hours.
    pub local_utc_offset_hours: i32,
    /// Admin job lease: a running job must heartbeat within this interval.
    pub lease_ttl: Duration,
    /// Reclaims after this many attempts mark the job failed instead.
    pub job_max_attempts: u32,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {}={:?}: {}", key, raw, e)),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Read and validate the full configuration from the environment.
    pub fn from_env() -> Result<Self> {
        let sensor_api_key =
            std::env::var("SENSOR_API_KEY").context("SENSOR_API_KEY is required")?;
        if sensor_api_key.is_empty() {
            bail!("SENSOR_API_KEY must not be empty");
        }
        let db_path: PathBuf = std::env::var("DB_PATH")
            .context("DB_PATH is required")?
            .into();

        let sensor_timeout_sec: u64 = env_parse("SENSOR_TIMEOUT_SEC", 150)?;
        let check_interval_sec: u64 = env_parse("CHECK_INTERVAL_SEC", 15)?;
        if sensor_timeout_sec == 0 || check_interval_sec == 0 {
            bail!("SENSOR_TIMEOUT_SEC and CHECK_INTERVAL_SEC must be positive");
        }

        let admin_ids = match std::env::var("ADMIN_IDS") {
            Ok(raw) => parse_admin_ids(&raw)?,
            Err(_) => HashSet::new(),
        };

        let broadcast_rate_per_sec: f64 = env_parse("BROADCAST_RATE_PER_SEC", 20.0)?;
        if broadcast_rate_per_sec <= 0.0 {
            bail!("BROADCAST_RATE_PER_SEC must be positive");
        }

        Ok(Config {
            sensor_api_key,
            api_port: env_parse("API_PORT", 8081)?,
            db_path,
            sensor_timeout: Duration::from_secs(sensor_timeout_sec),
            check_interval: Duration::from_secs(check_interval_sec),
            broadcast_rate_per_sec,
            broadcast_concurrency: env_parse("BROADCAST_CONCURRENCY", 8)?,
            broadcast_max_retries: env_parse("BROADCAST_MAX_RETRIES", 1)?,
            admin_ids,
            deploy_freeze_minutes: env_parse("DEPLOY_FREEZE_MINUTES", 20)?,
            canonical_map_path: std::env::var("CANONICAL_MAP_PATH").ok().map(PathBuf::from),
            bot_token: std::env::var("BOT_TOKEN").ok().filter(|t| !t.is_empty()),
            local_utc_offset_hours: env_parse("LOCAL_UTC_OFFSET_HOURS", 0)?,
            lease_ttl: Duration::from_secs(env_parse("JOB_LEASE_TTL_SEC", 60u64)?),
            job_max_attempts: env_parse("JOB_MAX_ATTEMPTS", 3)?,
        })
    }
}

fn parse_admin_ids(raw: &str) -> Result<HashSet<i64>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>()
                .map_err(|e| anyhow::anyhow!("invalid ADMIN_IDS entry {:?}: {}", s, e))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_admin_id_list() {
        let ids = parse_admin_ids("42, 7,  -3").unwrap();
        assert!(ids.contains(&42) && ids.contains(&7) && ids.contains(&-3));
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn empty_admin_id_list_is_empty() {
        assert!(parse_admin_ids("").unwrap().is_empty());
        assert!(parse_admin_ids(" , ,").unwrap().is_empty());
    }

    #[test]
    fn rejects_garbage_admin_ids() {
        assert!(parse_admin_ids("42,abc").is_err());
    }
}
