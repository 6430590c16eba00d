//! Storage units served by this process, by (cid, sid)

use crate::health::HealthThresholds;
use crate::unit::StorageUnit;
use chunkvault_common::{Cid, Error, MonitorConfig, Result, Sid, StorageUnitConfig};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Lookup table of storage units
#[derive(Default)]
pub struct StorageRegistry {
    units: BTreeMap<(Cid, Sid), Arc<StorageUnit>>,
}

impl StorageRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open every configured storage unit
    pub fn open(configs: &[StorageUnitConfig], monitor: &MonitorConfig) -> Result<Self> {
        let thresholds = HealthThresholds::from(monitor);
        let mut registry = Self::new();
        for config in configs {
            registry.insert(StorageUnit::open(config.clone(), thresholds)?)?;
        }
        info!("Opened {} storage units", registry.len());
        Ok(registry)
    }

    /// Add a unit; a (cid, sid) may only be registered once
    pub fn insert(&mut self, unit: StorageUnit) -> Result<Arc<StorageUnit>> {
        let key = (unit.cid(), unit.sid());
        if self.units.contains_key(&key) {
            return Err(Error::configuration(format!(
                "storage cid {} sid {} registered twice",
                key.0, key.1
            )));
        }
        let unit = Arc::new(unit);
        self.units.insert(key, Arc::clone(&unit));
        Ok(unit)
    }

    /// Find a unit
    pub fn get(&self, cid: Cid, sid: Sid) -> Result<&Arc<StorageUnit>> {
        self.units.get(&(cid, sid)).ok_or(Error::UnknownStorage {
            cid: cid.0,
            sid: sid.0,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<StorageUnit>> {
        self.units.values()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}
