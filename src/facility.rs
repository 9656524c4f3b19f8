use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::limits::*;
use crate::maintenance;
use crate::notify::NotifyHub;

/// Manages per-facility engines. Each facility gets its own Engine + WAL + compactor.
pub struct FacilityManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    engine_config: EngineConfig,
    compact_threshold: u64,
}

impl FacilityManager {
    pub fn new(data_dir: PathBuf, engine_config: EngineConfig, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            engine_config,
            compact_threshold,
        }
    }

    /// Get or lazily open the engine for the given facility. Names that
    /// sanitize to the same file name share one engine.
    pub fn get_or_create(&self, facility: &str) -> std::io::Result<Arc<Engine>> {
        if facility.len() > MAX_FACILITY_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "facility name too long",
            ));
        }
        let safe_name = sanitize(facility);
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty facility name",
            ));
        }
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_FACILITIES {
            return Err(std::io::Error::other("too many facilities"));
        }

        let engine = self
            .engines
            .entry(safe_name.clone())
            .or_try_insert_with(|| {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let notify = Arc::new(NotifyHub::new());
                let engine = Arc::new(Engine::new(wal_path, self.engine_config.clone(), notify)?);

                let compactor_engine = engine.clone();
                let threshold = self.compact_threshold;
                tokio::spawn(async move {
                    maintenance::run_compactor(compactor_engine, threshold).await;
                });
                info!("opened facility {safe_name}");
                Ok::<_, std::io::Error>(engine)
            })?
            .value()
            .clone();

        metrics::gauge!(crate::observability::FACILITIES_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }

    pub fn get(&self, facility: &str) -> Option<Arc<Engine>> {
        self.engines.get(&sanitize(facility)).map(|e| e.value().clone())
    }

    /// Open facilities, sorted by name.
    pub fn facilities(&self) -> Vec<(String, Arc<Engine>)> {
        let mut all: Vec<_> = self
            .engines
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}

/// Keep only characters that are safe in a file name, preventing path traversal.
fn sanitize(facility: &str) -> String {
    facility
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}
