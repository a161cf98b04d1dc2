//! # Monitor — Liveness Sweep and Section Aggregation
//!
//! The periodic sweep that turns raw heartbeat timestamps into per-section
//! power state. Every `CHECK_INTERVAL_SEC` (and opportunistically after a
//! heartbeat) the monitor:
//!
//! 1. classifies each active sensor as alive or stale — frozen sensors are
//!    pinned to their declared `frozen_is_up` instead;
//! 2. aggregates each `(building, section)` with a hysteresis policy;
//! 3. commits any state flip (state row + event row in one transaction)
//!    and enqueues a `light_notify` job for the notifier.
//!
//! ## Hysteresis
//!
//! A section is UP when at least one sensor is alive and the alive ratio
//! reaches [`THRESHOLD_UP`]; DOWN when nothing is alive or the ratio falls
//! to [`THRESHOLD_DOWN`]. In the band between, the previous verdict holds,
//! so a section bouncing around the boundary cannot flap notifications.
//!
//! The sweep is serialized (one caller at a time) and processes sections in
//! ascending `(building_id, section_id)` order for determinism. Losing the
//! in-memory poke from ingress is harmless: the next tick converges.

use crate::clock::Clock;
use crate::db::{self, EventType, SensorRow, Store};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Alive ratio at or above which a section is UP.
pub const THRESHOLD_UP: f64 = 0.5;
/// Alive ratio at or below which a section is DOWN.
pub const THRESHOLD_DOWN: f64 = 0.4;

/// A committed state flip, ready for metrics and logging.
#[derive(Clone, Debug)]
pub struct Transition {
    pub building_id: i64,
    pub section_id: i64,
    pub event_type: EventType,
    pub event_id: i64,
}

/// What one sweep did.
#[derive(Debug, Default)]
pub struct SweepSummary {
    pub transitions: Vec<Transition>,
    pub sections_up: i64,
    pub sections_down: i64,
}

pub struct Monitor {
    store: Store,
    clock: Arc<dyn Clock>,
    stale_after: chrono::Duration,
}

impl Monitor {
    pub fn new(store: Store, clock: Arc<dyn Clock>, stale_after: Duration) -> Self {
        Monitor {
            store,
            clock,
            stale_after: chrono::Duration::from_std(stale_after)
                .unwrap_or_else(|_| chrono::Duration::seconds(150)),
        }
    }

    /// One full sweep. Safe to call from the ticker and from the ingress
    /// poke; callers serialize through the store's write gate anyway.
    pub async fn sweep(&self) -> Result<SweepSummary> {
        let now = self.clock.now_utc();
        let sensors = self.store.get_active_sensors().await?;

        // Ascending (building, section) for deterministic processing.
        let mut sections: BTreeMap<(i64, i64), Vec<&SensorRow>> = BTreeMap::new();
        for sensor in &sensors {
            sections
                .entry((sensor.building_id, sensor.section_id))
                .or_default()
                .push(sensor);
        }

        let mut persisted: HashMap<(i64, i64), bool> = HashMap::new();
        for row in self.store.get_section_states().await? {
            persisted.insert((row.building_id, row.section_id), row.is_up);
        }

        let mut summary = SweepSummary::default();
        for (&(building_id, section_id), members) in &sections {
            let online = members
                .iter()
                .filter(|s| sensor_contributes_up(s, now, self.stale_after))
                .count();
            let total = members.len();
            let prev = persisted.get(&(building_id, section_id)).copied();
            let is_up = section_verdict(online, total, prev);

            if is_up {
                summary.sections_up += 1;
            } else {
                summary.sections_down += 1;
            }

            if prev == Some(is_up) {
                self.store
                    .touch_section_state(building_id, section_id, now)
                    .await?;
                continue;
            }

            match self
                .store
                .commit_transition(building_id, section_id, is_up, now)
                .await?
            {
                Some(event_id) => {
                    let event_type = EventType::from_is_up(is_up);
                    info!(
                        building_id,
                        section_id,
                        event = %event_type,
                        online,
                        total,
                        "section power transition"
                    );
                    let payload = db::LightNotifyPayload {
                        v: 1,
                        building_id,
                        section_id,
                        event_type,
                        timestamp: now,
                        event_id,
                    };
                    self.store
                        .enqueue_job(
                            db::KIND_LIGHT_NOTIFY,
                            &serde_json::to_string(&payload)?,
                            Some("aggregator"),
                            now,
                        )
                        .await?;
                    summary.transitions.push(Transition {
                        building_id,
                        section_id,
                        event_type,
                        event_id,
                    });
                }
                None => {
                    // State row disagreed with the event log tail; the
                    // duplicate edge was dropped at write and the row is now
                    // reconciled.
                    warn!(
                        building_id,
                        section_id, is_up, "duplicate transition dropped at write"
                    );
                }
            }
        }

        // Reconciliation: a persisted section with no active sensors cannot
        // be re-evaluated. Flag it and leave the row for the next tick.
        for (&(building_id, section_id), _) in persisted.iter() {
            if !sections.contains_key(&(building_id, section_id)) {
                error!(
                    building_id,
                    section_id, "section state exists but no active sensors are attached"
                );
            }
        }

        Ok(summary)
    }
}

/// What this sensor contributes to its section right now: pinned state while
/// frozen, otherwise heartbeat liveness. Stale begins exactly at the
/// threshold (half-open interval).
pub fn sensor_contributes_up(
    sensor: &SensorRow,
    now: DateTime<Utc>,
    stale_after: chrono::Duration,
) -> bool {
    if sensor.frozen(now) {
        match sensor.frozen_is_up {
            Some(pinned) => return pinned,
            None => {
                error!(uuid = %sensor.uuid, "frozen sensor without a declared state");
            }
        }
    }
    match sensor.last_heartbeat {
        Some(last) => now - last < stale_after,
        None => false,
    }
}

/// The aggregation policy. The thresholds are exclusive: a ratio exactly on
/// either bound sits in the hysteresis band (1/2 alive holds the prior
/// state, 2/5 alive holds the prior state). `prev` is the persisted
/// verdict, if any; inside the band with no history, any-alive leans UP.
pub fn section_verdict(online: usize, total: usize, prev: Option<bool>) -> bool {
    if online == 0 || total == 0 {
        return false;
    }
    let ratio = online as f64 / total as f64;
    if ratio > THRESHOLD_UP {
        true
    } else if ratio < THRESHOLD_DOWN {
        false
    } else {
        prev.unwrap_or(true)
    }
}
