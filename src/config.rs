use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::warn;

use crate::limits::*;
use crate::model::{PoolLayout, ZoneId};

/// Per-facility engine settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Zone names; also the cross-zone fallback order.
    pub zones: Vec<ZoneId>,
    pub areas_per_zone: u16,
    pub slots_per_area: u16,
    /// Upper bound of `undo_last(k)`.
    pub max_undo: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            zones: ["A", "B", "C", "D"].into_iter().map(ZoneId::new).collect(),
            areas_per_zone: 3,
            slots_per_area: 5,
            max_undo: DEFAULT_MAX_UNDO,
        }
    }
}

impl EngineConfig {
    pub fn layout(&self) -> PoolLayout {
        PoolLayout {
            zones: self.zones.clone(),
            areas_per_zone: self.areas_per_zone,
            slots_per_area: self.slots_per_area,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.zones.is_empty() {
            return Err("at least one zone is required".into());
        }
        if self.zones.len() > MAX_ZONES {
            return Err(format!("at most {MAX_ZONES} zones are supported"));
        }
        let mut seen = HashSet::new();
        for zone in &self.zones {
            let name = zone.as_str();
            if name.is_empty() || name.len() > MAX_ZONE_NAME_LEN {
                return Err(format!("invalid zone name '{name}'"));
            }
            if !seen.insert(name) {
                return Err(format!("duplicate zone '{name}'"));
            }
        }
        if self.areas_per_zone == 0 || self.slots_per_area == 0 {
            return Err("areas per zone and slots per area must be positive".into());
        }
        if self.layout().capacity() > MAX_SLOTS_PER_FACILITY {
            return Err(format!("pool larger than {MAX_SLOTS_PER_FACILITY} slots"));
        }
        if self.max_undo == 0 || self.max_undo > MAX_UNDO_CEILING {
            return Err(format!("max undo must be between 1 and {MAX_UNDO_CEILING}"));
        }
        Ok(())
    }
}

/// Daemon settings, read from `SLOTWARD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub facilities: Vec<String>,
    pub engine: EngineConfig,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub audit_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let list = |key: &str| {
            lookup(key).map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
        };

        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            zones: list("SLOTWARD_ZONES")
                .map(|zones| zones.into_iter().map(ZoneId::new).collect())
                .unwrap_or(defaults.zones),
            areas_per_zone: parse_var(&lookup, "SLOTWARD_AREAS_PER_ZONE").unwrap_or(defaults.areas_per_zone),
            slots_per_area: parse_var(&lookup, "SLOTWARD_SLOTS_PER_AREA").unwrap_or(defaults.slots_per_area),
            max_undo: parse_var(&lookup, "SLOTWARD_MAX_UNDO").unwrap_or(defaults.max_undo),
        };
        engine.validate()?;

        let facilities = list("SLOTWARD_FACILITIES")
            .filter(|f| !f.is_empty())
            .unwrap_or_else(|| vec!["default".to_string()]);

        Ok(Self {
            data_dir: lookup("SLOTWARD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            facilities,
            engine,
            compact_threshold: parse_var(&lookup, "SLOTWARD_COMPACT_THRESHOLD").unwrap_or(1000),
            metrics_port: parse_var(&lookup, "SLOTWARD_METRICS_PORT"),
            audit_interval_secs: parse_var(&lookup, "SLOTWARD_AUDIT_INTERVAL_SECS").unwrap_or(30),
        })
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    let parsed = raw.trim().parse().ok();
    if parsed.is_none() {
        warn!("{key}: cannot parse '{raw}', using default");
    }
    parsed
}
