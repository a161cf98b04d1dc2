//! # Canonical Map — Rollout Sensor Placement
//!
//! Sensors installed during the rollout carry a known UUID, and their
//! physical placement (building, section) is fixed at install time. The
//! canonical map pins those UUIDs to their placement so a misflashed or
//! misconfigured sensor cannot move itself to another section by sending a
//! different `building_id` in its heartbeat. UUIDs absent from the map are
//! accepted with the placement the request claims.
//!
//! The map is loaded once at startup from a TOML file and is immutable for
//! the life of the process. The same file may carry the buildings catalog
//! used to seed the database.
//!
//! ```toml
//! [[buildings]]
//! id = 1
//! name = "Newcastle House"
//! address = "1 Newcastle Quay"
//! sections = 2
//!
//! [sensors]
//! "esp32-newcastle-001" = { building = 1, section = 2 }
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// A building catalog entry from the map file.
#[derive(Clone, Debug, Deserialize)]
pub struct BuildingSeed {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_sections")]
    pub sections: i64,
}

fn default_sections() -> i64 {
    1
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct Placement {
    pub building: i64,
    pub section: i64,
}

#[derive(Deserialize)]
struct MapFile {
    #[serde(default)]
    buildings: Vec<BuildingSeed>,
    #[serde(default)]
    sensors: HashMap<String, Placement>,
}

/// Immutable UUID → placement map plus the optional buildings catalog.
#[derive(Default)]
pub struct CanonicalMap {
    sensors: HashMap<String, Placement>,
    buildings: Vec<BuildingSeed>,
}

impl CanonicalMap {
    /// An empty map: every heartbeat's claimed placement is accepted.
    pub fn empty() -> Self {
        CanonicalMap::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading canonical map {}", path.display()))?;
        let parsed: MapFile = toml::from_str(&raw)
            .with_context(|| format!("parsing canonical map {}", path.display()))?;
        Ok(CanonicalMap {
            sensors: parsed.sensors,
            buildings: parsed.buildings,
        })
    }

    /// The pinned placement for a rollout sensor, if the UUID is known.
    pub fn placement(&self, sensor_uuid: &str) -> Option<Placement> {
        self.sensors.get(sensor_uuid).copied()
    }

    pub fn buildings(&self) -> &[BuildingSeed] {
        &self.buildings
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }
}
