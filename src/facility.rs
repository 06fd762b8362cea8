use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::info;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;

/// Manages per-facility engines. Each facility gets its own Engine + WAL +
/// compactor. Facility = database name from the pgwire connection.
pub struct FacilityManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    compact_interval: Duration,
}

impl FacilityManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, compact_interval: Duration) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            compact_interval,
        }
    }

    /// Get or lazily open the engine for the given facility.
    pub fn get_or_create(&self, facility: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(facility) {
            return Ok(engine.value().clone());
        }
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

        if self.engines.len() >= MAX_FACILITIES {
            return Err(std::io::Error::other("too many facilities"));
        }
        // Two first connections to one facility must not open its WAL twice.
        let entry = match self.engines.entry(facility.to_string()) {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(vacant) => vacant,
        };

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let engine = Arc::new(Engine::open(&wal_path)?);

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        let period = self.compact_interval;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold, period).await;
        });

        entry.insert(engine.clone());
        info!("opened facility {facility} at {}", wal_path.display());
        metrics::gauge!(crate::observability::FACILITIES_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}

/// Keeps only characters that are safe in a file name.
fn sanitize(facility: &str) -> String {
    facility
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}
