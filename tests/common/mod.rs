//! Shared test helpers for integration tests.
//!
//! Every test gets its own SQLite file in a tempdir, a manual clock pinned
//! to a known instant, and (where needed) an Axum router over that state.
//! No external services are required.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use gridwatch::canonical::CanonicalMap;
use gridwatch::clock::ManualClock;
use gridwatch::config::Config;
use gridwatch::db::Store;
use gridwatch::server::AppState;

pub const API_KEY: &str = "test-sensor-key";

/// Wall-clock origin for manual clocks: a Sunday noon UTC.
pub const T0: &str = "2025-06-01T12:00:00Z";

pub struct TestContext {
    pub store: Store,
    pub clock: Arc<ManualClock>,
    pub config: Config,
    // Holds the database file alive for the duration of the test.
    _dir: tempfile::TempDir,
}

pub fn test_config(db_path: PathBuf) -> Config {
    Config {
        sensor_api_key: API_KEY.to_string(),
        api_port: 0,
        db_path,
        sensor_timeout: Duration::from_secs(150),
        check_interval: Duration::from_secs(15),
        broadcast_rate_per_sec: 200.0,
        broadcast_concurrency: 2,
        broadcast_max_retries: 1,
        admin_ids: HashSet::new(),
        deploy_freeze_minutes: 20,
        canonical_map_path: None,
        bot_token: None,
        local_utc_offset_hours: 0,
        lease_ttl: Duration::from_secs(60),
        job_max_attempts: 3,
    }
}

/// Fresh store + manual clock on a tempfile database. The default buildings
/// catalog is seeded (building 1 has 2 sections).
pub async fn setup() -> TestContext {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("gridwatch-test.db");
    let store = Store::open(&db_path, &[]).await.expect("open test store");
    let clock = Arc::new(ManualClock::new(T0.parse().unwrap()));
    TestContext {
        store,
        clock,
        config: test_config(db_path),
        _dir: dir,
    }
}

/// Router + state over a fresh store, for `tower::ServiceExt::oneshot`
/// request tests.
pub async fn build_test_app() -> (axum::Router, Arc<AppState>, TestContext) {
    let ctx = setup().await;
    let state = AppState::new(
        ctx.store.clone(),
        ctx.config.clone(),
        CanonicalMap::empty(),
        ctx.clock.clone(),
    );
    (gridwatch::server::build_router(state.clone()), state, ctx)
}
