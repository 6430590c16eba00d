//! Configuration types for chunkvault
//!
//! The node binary reads these from a TOML file; every field has a default so
//! a partial file is enough.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Maximum number of devices of a storage unit
pub const MAX_DEVICES: u32 = 64;

/// Maximum number of disk worker threads
pub const MAX_DISK_THREADS: usize = 64;

/// Root configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node identity
    pub node: NodeConfig,
    /// Storage units served by this node
    pub storages: Vec<StorageUnitConfig>,
    /// Disk dispatcher and worker pool
    pub dispatcher: DispatcherConfig,
    /// Device health monitor
    pub monitor: MonitorConfig,
    /// Logging
    pub logging: LoggingConfig,
}

impl Config {
    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for storage in &self.storages {
            storage.validate()?;
            if !seen.insert((storage.cid, storage.sid)) {
                return Err(Error::configuration(format!(
                    "storage cid {} sid {} declared twice",
                    storage.cid, storage.sid
                )));
            }
        }
        self.dispatcher.validate()?;
        self.monitor.validate()
    }
}

/// Node identity
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Host name used in thread and log naming
    pub hostname: String,
    /// Instance number when several nodes share a host
    pub instance: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            instance: 0,
        }
    }
}

/// Device selection policy for new chunks
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPolicy {
    /// Strict round robin over admissible devices
    #[default]
    RoundRobin,
    /// Device with the most free blocks
    LeastUsed,
}

/// One (cid, sid) storage unit
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageUnitConfig {
    /// Cluster identifier
    pub cid: u16,
    /// Storage identifier within the cluster
    pub sid: u8,
    /// Absolute root path; devices are mounted on `<root>/<device>`
    pub root: PathBuf,
    /// Number of devices receiving data
    pub device_number: u32,
    /// Number of devices holding header (mapper) files
    pub mapper_modulo: u32,
    /// Number of header copies per file
    pub mapper_redundancy: u32,
    /// Content expected in the spare mark file, if any
    pub spare_mark: Option<String>,
    /// Number of slice subdirectories per header/bins directory
    pub slice_count: u32,
    /// Bytes of file data covered by one chunk
    pub chunk_data_bytes: u64,
    /// Device selection policy for new chunks
    pub allocation: AllocationPolicy,
    /// Free filesystem blocks a device needs to receive a new chunk
    pub min_free_blocks: u64,
    /// Require each device directory to be a mount point
    pub check_mountpoint: bool,
}

impl Default for StorageUnitConfig {
    fn default() -> Self {
        Self {
            cid: 1,
            sid: 1,
            root: PathBuf::from("/srv/chunkvault/storage_1_1"),
            device_number: 6,
            mapper_modulo: 4,
            mapper_redundancy: 2,
            spare_mark: None,
            slice_count: 8,
            chunk_data_bytes: 1024 * 1024 * 1024, // 1 GB
            allocation: AllocationPolicy::RoundRobin,
            min_free_blocks: 1024,
            check_mountpoint: true,
        }
    }
}

impl StorageUnitConfig {
    /// Check the device and mapper geometry
    pub fn validate(&self) -> Result<()> {
        let name = format!("storage cid {} sid {}", self.cid, self.sid);
        if self.device_number == 0 || self.device_number > MAX_DEVICES {
            return Err(Error::configuration(format!(
                "{name}: device_number {} not in 1..={MAX_DEVICES}",
                self.device_number
            )));
        }
        if self.mapper_modulo == 0 || self.mapper_modulo > self.device_number {
            return Err(Error::configuration(format!(
                "{name}: mapper_modulo {} not in 1..={}",
                self.mapper_modulo, self.device_number
            )));
        }
        if self.mapper_redundancy == 0 || self.mapper_redundancy > self.mapper_modulo {
            return Err(Error::configuration(format!(
                "{name}: mapper_redundancy {} not in 1..={}",
                self.mapper_redundancy, self.mapper_modulo
            )));
        }
        if self.slice_count == 0 {
            return Err(Error::configuration(format!("{name}: slice_count is 0")));
        }
        if self.chunk_data_bytes < 32 * 1024 {
            return Err(Error::configuration(format!(
                "{name}: chunk_data_bytes {} is below one 32K block",
                self.chunk_data_bytes
            )));
        }
        if !self.root.is_absolute() {
            return Err(Error::configuration(format!(
                "{name}: root {} is not absolute",
                self.root.display()
            )));
        }
        Ok(())
    }
}

/// Disk dispatcher configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Number of disk worker threads
    pub threads: usize,
    /// Capacity of each direction of the internal channel
    pub channel_capacity: usize,
    /// Idle time before an unused FID context is evicted (seconds)
    pub context_idle_secs: u64,
    /// Soft limit on cached FID contexts
    pub max_contexts: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            channel_capacity: 1024,
            context_idle_secs: 60,
            max_contexts: 64 * 1024,
        }
    }
}

impl DispatcherConfig {
    fn validate(&self) -> Result<()> {
        if self.threads == 0 || self.threads > MAX_DISK_THREADS {
            return Err(Error::configuration(format!(
                "dispatcher.threads {} not in 1..={MAX_DISK_THREADS}",
                self.threads
            )));
        }
        if self.channel_capacity == 0 {
            return Err(Error::configuration("dispatcher.channel_capacity is 0"));
        }
        Ok(())
    }
}

/// Device monitor configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Monitoring period (seconds)
    pub period_secs: u64,
    /// I/O errors within one period that degrade a device
    pub degrade_error_threshold: u32,
    /// I/O errors within one period that fail a device
    pub fail_error_threshold: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            period_secs: 10,
            degrade_error_threshold: 1,
            fail_error_threshold: 32,
        }
    }
}

impl MonitorConfig {
    fn validate(&self) -> Result<()> {
        if self.period_secs == 0 {
            return Err(Error::configuration("monitor.period_secs is 0"));
        }
        if self.degrade_error_threshold == 0
            || self.degrade_error_threshold > self.fail_error_threshold
        {
            return Err(Error::configuration(format!(
                "monitor thresholds must satisfy 0 < degrade ({}) <= fail ({})",
                self.degrade_error_threshold, self.fail_error_threshold
            )));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is not set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
