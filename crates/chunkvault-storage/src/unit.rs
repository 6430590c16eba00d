//! Storage unit: one (cid, sid) slot spread over a set of devices
//!
//! The unit owns the per-device health records, the allocator and its
//! counters, and the path builder. Chunk and header operations borrow it.

use crate::allocator::{DeviceAllocator, IoKind};
use crate::health::{
    DeviceHealth, DeviceStatus, Diagnostic, HealthEvent, HealthThresholds, ProbeReport,
    probe_device,
};
use crate::marker::{OwnerMark, write_owner_mark};
use crate::path::{PathBuilder, bins_dir_name, hdr_dir_name};
use chunkvault_common::{BlockSizeClass, Cid, Error, Result, Sid, StorageUnitConfig};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Read/write activity of a device
#[derive(Default)]
pub struct DeviceActivity {
    reads: AtomicU64,
    read_us: AtomicU64,
    writes: AtomicU64,
    write_us: AtomicU64,
    last_activity: AtomicU64,
}

/// Activity averaged over one monitoring window
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ActivityWindow {
    pub reads: u64,
    pub avg_read_us: u64,
    pub writes: u64,
    pub avg_write_us: u64,
}

impl DeviceActivity {
    pub fn record_read(&self, elapsed: Duration) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.read_us.fetch_add(micros(elapsed), Ordering::Relaxed);
        self.touch();
    }

    pub fn record_write(&self, elapsed: Duration) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.write_us.fetch_add(micros(elapsed), Ordering::Relaxed);
        self.touch();
    }

    fn touch(&self) {
        self.last_activity
            .store(crate::health::unix_now(), Ordering::Relaxed);
    }

    /// Unix time of the last read or write
    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Drain the counters into averages
    pub fn take_window(&self) -> ActivityWindow {
        let reads = self.reads.swap(0, Ordering::Relaxed);
        let read_us = self.read_us.swap(0, Ordering::Relaxed);
        let writes = self.writes.swap(0, Ordering::Relaxed);
        let write_us = self.write_us.swap(0, Ordering::Relaxed);
        ActivityWindow {
            reads,
            avg_read_us: read_us.checked_div(reads).unwrap_or(0),
            writes,
            avg_write_us: write_us.checked_div(writes).unwrap_or(0),
        }
    }
}

fn micros(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX)
}

/// One device of a storage unit
pub struct Device {
    index: u8,
    health: RwLock<DeviceHealth>,
    report: RwLock<ProbeReport>,
    activity: DeviceActivity,
    last_window: Mutex<ActivityWindow>,
}

impl Device {
    fn new(index: u8) -> Self {
        Self {
            index,
            health: RwLock::new(DeviceHealth::new(index)),
            report: RwLock::new(ProbeReport::default()),
            activity: DeviceActivity::default(),
            last_window: Mutex::new(ActivityWindow::default()),
        }
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn status(&self) -> DeviceStatus {
        self.health.read().status()
    }

    pub fn diagnostic(&self) -> Diagnostic {
        self.health.read().diagnostic()
    }

    pub fn activity(&self) -> &DeviceActivity {
        &self.activity
    }

    /// Figures of the last probe
    pub fn last_probe(&self) -> ProbeReport {
        *self.report.read()
    }
}

/// Snapshot of a device for status output
#[derive(Clone, Debug, Serialize)]
pub struct DeviceInfo {
    pub device: u8,
    pub status: DeviceStatus,
    pub diagnostic: Diagnostic,
    pub status_since: u64,
    pub size_bytes: u64,
    pub free_bytes: u64,
    pub free_blocks_estimate: u64,
    pub errors_total: u64,
    pub last_activity: u64,
    pub activity: ActivityWindow,
}

/// Capacity of a storage unit
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StorageStat {
    pub size_bytes: u64,
    pub free_bytes: u64,
}

/// A (cid, sid) storage slot and its devices
pub struct StorageUnit {
    config: StorageUnitConfig,
    paths: PathBuilder,
    thresholds: HealthThresholds,
    devices: Vec<Device>,
    allocator: DeviceAllocator,
    crc_errors: AtomicU64,
}

impl StorageUnit {
    /// Open a storage unit and run a first probe of every device
    pub fn open(config: StorageUnitConfig, thresholds: HealthThresholds) -> Result<Self> {
        config.validate()?;

        let paths = PathBuilder::new(&config.root, config.slice_count);
        let devices = (0..config.device_number)
            .map(|d| Device::new(u8::try_from(d).unwrap_or(u8::MAX)))
            .collect();
        let allocator = DeviceAllocator::new(
            config.allocation,
            config.device_number,
            config.min_free_blocks,
        );

        let unit = Self {
            config,
            paths,
            thresholds,
            devices,
            allocator,
            crc_errors: AtomicU64::new(0),
        };

        for device in &unit.devices {
            device
                .health
                .write()
                .apply(HealthEvent::Declare, thresholds)?;
        }
        unit.probe_all();

        info!(
            "Opened storage cid {} sid {} at {:?}: {} devices, {} active",
            unit.cid(),
            unit.sid(),
            unit.paths.root(),
            unit.devices.len(),
            unit.devices
                .iter()
                .filter(|d| d.status() == DeviceStatus::Active)
                .count()
        );
        Ok(unit)
    }

    /// Lay out the directory tree of a storage unit
    ///
    /// Device directories are created only when mount points are not
    /// required; otherwise they must already be mounted.
    pub fn format(config: &StorageUnitConfig) -> Result<()> {
        config.validate()?;
        let paths = PathBuilder::new(&config.root, config.slice_count);
        fs::create_dir_all(paths.root())?;

        for device in 0..config.device_number {
            let root = paths.device_root(device);
            if !root.is_dir() {
                if config.check_mountpoint {
                    warn!("Device directory {:?} is missing, not formatting it", root);
                    continue;
                }
                fs::create_dir_all(&root)?;
            }
            let owner = OwnerMark {
                cid: Cid(config.cid),
                sid: Sid(config.sid),
                device: u8::try_from(device).unwrap_or(u8::MAX),
            };
            write_owner_mark(&root, &owner)?;
            create_subdirectories(&paths, device)?;
        }

        info!(
            "Formatted storage cid {} sid {} at {:?}",
            config.cid,
            config.sid,
            paths.root()
        );
        Ok(())
    }

    /// Format then open
    pub fn create(config: StorageUnitConfig, thresholds: HealthThresholds) -> Result<Self> {
        Self::format(&config)?;
        Self::open(config, thresholds)
    }

    pub fn cid(&self) -> Cid {
        Cid(self.config.cid)
    }

    pub fn sid(&self) -> Sid {
        Sid(self.config.sid)
    }

    pub fn config(&self) -> &StorageUnitConfig {
        &self.config
    }

    pub fn paths(&self) -> &PathBuilder {
        &self.paths
    }

    pub fn allocator(&self) -> &DeviceAllocator {
        &self.allocator
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device(&self, device: u8) -> Option<&Device> {
        self.devices.get(usize::from(device))
    }

    /// Status of a device, `Undeclared` outside the configured range
    pub fn device_status(&self, device: u8) -> DeviceStatus {
        self.device(device)
            .map_or(DeviceStatus::Undeclared, Device::status)
    }

    /// Blocks of `bsize` covered by one chunk
    pub fn blocks_per_chunk(&self, bsize: BlockSizeClass) -> u64 {
        (self.config.chunk_data_bytes / bsize.bytes()).max(1)
    }

    /// Owner mark expected on a device
    pub fn owner_mark(&self, device: u8) -> OwnerMark {
        OwnerMark {
            cid: self.cid(),
            sid: self.sid(),
            device,
        }
    }

    /// Apply an event to a device and log the transition
    pub fn apply_event(&self, device: u8, event: HealthEvent) -> Result<Option<DeviceStatus>> {
        let Some(dev) = self.device(device) else {
            return Err(Error::InvalidArgument(format!(
                "device {device} is not configured"
            )));
        };
        let mut health = dev.health.write();
        let previous = health.status();
        let changed = health.apply(event, self.thresholds)?;
        if let Some(status) = changed {
            match status {
                DeviceStatus::Failed => error!(
                    "Storage {}/{} device {}: {} -> {} on {} ({})",
                    self.cid(),
                    self.sid(),
                    device,
                    previous,
                    status,
                    event,
                    health.diagnostic()
                ),
                _ => info!(
                    "Storage {}/{} device {}: {} -> {} on {}",
                    self.cid(),
                    self.sid(),
                    device,
                    previous,
                    status,
                    event
                ),
            }
        }
        Ok(changed)
    }

    /// Fail unless the device may serve reads and writes
    pub fn check_serves_io(&self, device: u8) -> Result<()> {
        let status = self.device_status(device);
        if status.serves_io() {
            Ok(())
        } else {
            Err(Error::DeviceUnavailable {
                device,
                status: status.to_string(),
            })
        }
    }

    /// Record an I/O error against a device
    pub fn record_error(&self, device: u8, kind: IoKind) {
        self.allocator.record_error(device, kind);
    }

    /// Count a header that failed its checksum
    pub fn record_crc_error(&self) {
        self.crc_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn crc_errors(&self) -> u64 {
        self.crc_errors.load(Ordering::Relaxed)
    }

    /// Pick the device of a new chunk
    pub fn allocate_device(&self) -> Result<u8> {
        self.allocate_device_excluding(None)
    }

    /// Pick the device of a new chunk other than `excluded`
    pub fn allocate_device_excluding(&self, excluded: Option<u8>) -> Result<u8> {
        self.allocator
            .allocate_excluding(|device| self.device_status(device), excluded)
    }

    /// Account bytes written to a device against its free-block estimate
    pub fn consume_space(&self, device: u8, bytes: u64) {
        let block_size = self
            .device(device)
            .map_or(4096, |d| d.last_probe().block_size)
            .max(1);
        self.allocator
            .free_blocks()
            .consume(device, bytes.div_ceil(block_size));
    }

    /// Create `dir` below the root of a device
    ///
    /// Never creates the device root itself: writing into an unmounted
    /// device directory would fill the parent filesystem.
    pub fn ensure_dir(&self, device: u8, dir: &Path) -> Result<()> {
        if dir.is_dir() {
            return Ok(());
        }
        if !self.paths.device_root(u32::from(device)).is_dir() {
            self.record_error(device, IoKind::Write);
            return Err(Error::DeviceUnavailable {
                device,
                status: "unmounted".to_string(),
            });
        }
        fs::create_dir_all(dir).inspect_err(|_| self.record_error(device, IoKind::Write))?;
        Ok(())
    }

    /// Recreate the header and bins directories of a device
    pub fn create_subdirectories(&self, device: u8) -> Result<()> {
        create_subdirectories(&self.paths, u32::from(device))
    }

    /// Probe every device, update health and publish free blocks
    pub fn probe_all(&self) -> Vec<ProbeReport> {
        let reports: Vec<ProbeReport> = self
            .devices
            .iter()
            .map(|device| {
                let root = self.paths.device_root(u32::from(device.index));
                let report = probe_device(
                    &root,
                    &self.owner_mark(device.index),
                    self.config.check_mountpoint,
                );
                *device.report.write() = report;
                if let Err(e) = self.apply_event(device.index, HealthEvent::Probe(report.diagnostic))
                {
                    debug!("Probe of device {} ignored: {}", device.index, e);
                }
                report
            })
            .collect();

        let free: Vec<u64> = reports
            .iter()
            .map(|r| {
                if r.diagnostic.is_severe() {
                    0
                } else {
                    r.free_blocks
                }
            })
            .collect();
        self.allocator.free_blocks().publish(&free);
        reports
    }

    /// One monitoring period: probe, close the error window, roll activity
    pub fn run_health_cycle(&self) {
        self.probe_all();
        let window = self.allocator.errors().rotate();
        for device in &self.devices {
            let errors = window[usize::from(device.index)];
            if let Err(e) = self.apply_event(device.index, HealthEvent::ErrorWindow(errors)) {
                debug!("Error window of device {} ignored: {}", device.index, e);
            }
            *device.last_window.lock() = device.activity.take_window();
        }
    }

    /// Snapshot of every device
    pub fn device_info(&self) -> Vec<DeviceInfo> {
        self.devices
            .iter()
            .map(|device| {
                let health = device.health.read();
                let report = device.last_probe();
                DeviceInfo {
                    device: device.index,
                    status: health.status(),
                    diagnostic: health.diagnostic(),
                    status_since: health.changed_at(),
                    size_bytes: report.size_bytes(),
                    free_bytes: report.free_bytes(),
                    free_blocks_estimate: self.allocator.free_blocks().get(device.index),
                    errors_total: self.allocator.errors().total(device.index),
                    last_activity: device.activity.last_activity(),
                    activity: *device.last_window.lock(),
                }
            })
            .collect()
    }

    /// Size and free space over the devices that serve I/O
    pub fn stat(&self) -> StorageStat {
        self.devices
            .iter()
            .filter(|d| d.status().serves_io())
            .map(Device::last_probe)
            .fold(StorageStat::default(), |acc, r| StorageStat {
                size_bytes: acc.size_bytes + r.size_bytes(),
                free_bytes: acc.free_bytes + r.free_bytes(),
            })
    }
}

fn create_subdirectories(paths: &PathBuilder, device: u32) -> Result<()> {
    let root = paths.device_root(device);
    for spare in [false, true] {
        for top in [hdr_dir_name(spare), bins_dir_name(spare)] {
            for slice in 0..paths.slice_count() {
                fs::create_dir_all(root.join(top).join(slice.to_string()))?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::path::Path;

    /// Formatted unit on plain directories
    pub fn unit(root: &Path, devices: u32, modulo: u32, redundancy: u32) -> StorageUnit {
        let config = StorageUnitConfig {
            root: root.to_path_buf(),
            device_number: devices,
            mapper_modulo: modulo,
            mapper_redundancy: redundancy,
            slice_count: 4,
            chunk_data_bytes: 8192 * 4096,
            min_free_blocks: 1,
            check_mountpoint: false,
            ..Default::default()
        };
        StorageUnit::create(config, HealthThresholds::default()).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::unit;
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_formats_devices() {
        let dir = tempdir().unwrap();
        let unit = unit(dir.path(), 3, 3, 2);

        for device in 0..3u8 {
            assert_eq!(unit.device_status(device), DeviceStatus::Active);
            let root = unit.paths().device_root(u32::from(device));
            assert!(root.join("hdr_0/3").is_dir());
            assert!(root.join("bins_1/0").is_dir());
            assert!(root.join(unit.owner_mark(device).file_name()).exists());
        }
        assert_eq!(unit.device_status(9), DeviceStatus::Undeclared);
        assert!(unit.allocator().free_blocks().get(0) > 0);
        assert_eq!(unit.blocks_per_chunk(BlockSizeClass::B4K), 8192);
    }

    #[test]
    fn test_missing_device_fails() {
        let dir = tempdir().unwrap();
        let unit = unit(dir.path(), 2, 2, 1);
        fs::remove_dir_all(unit.paths().device_root(1)).unwrap();

        unit.run_health_cycle();
        assert_eq!(unit.device_status(1), DeviceStatus::Failed);
        assert!(matches!(
            unit.check_serves_io(1),
            Err(Error::DeviceUnavailable { device: 1, .. })
        ));
        let info = unit.device_info();
        assert_eq!(info[1].diagnostic, Diagnostic::Unmounted);

        // Only device 0 left for new chunks
        for _ in 0..3 {
            assert_eq!(unit.allocate_device().unwrap(), 0);
        }
    }

    #[test]
    fn test_ensure_dir_refuses_missing_device_root() {
        let dir = tempdir().unwrap();
        let unit = unit(dir.path(), 2, 2, 1);
        let root = unit.paths().device_root(1);
        fs::remove_dir_all(&root).unwrap();

        let result = unit.ensure_dir(1, &root.join("bins_0/2"));
        assert!(matches!(result, Err(Error::DeviceUnavailable { .. })));
        assert!(!root.exists());
        assert_eq!(unit.allocator().errors().total(1), 1);
    }

    #[test]
    fn test_error_window_degrades_device() {
        let dir = tempdir().unwrap();
        let unit = unit(dir.path(), 2, 2, 1);
        unit.record_error(0, IoKind::Read);
        unit.run_health_cycle();
        assert_eq!(unit.device_status(0), DeviceStatus::Degraded);
        unit.run_health_cycle();
        assert_eq!(unit.device_status(0), DeviceStatus::Active);
    }

    #[test]
    fn test_operator_events() {
        let dir = tempdir().unwrap();
        let unit = unit(dir.path(), 2, 2, 1);
        unit.apply_event(1, HealthEvent::TakeOutOfService).unwrap();
        assert_eq!(unit.device_status(1), DeviceStatus::OutOfService);
        assert!(unit.apply_event(1, HealthEvent::RebuildStart).is_err());
        unit.apply_event(1, HealthEvent::Reinstate).unwrap();
        unit.run_health_cycle();
        assert_eq!(unit.device_status(1), DeviceStatus::Active);
        assert!(unit.apply_event(7, HealthEvent::Reinstate).is_err());
    }

    #[test]
    fn test_stat_and_activity() {
        let dir = tempdir().unwrap();
        let unit = unit(dir.path(), 2, 2, 1);
        let stat = unit.stat();
        assert!(stat.size_bytes >= stat.free_bytes);
        assert!(stat.free_bytes > 0);

        let device = unit.device(0).unwrap();
        device.activity().record_read(Duration::from_micros(10));
        device.activity().record_read(Duration::from_micros(30));
        unit.run_health_cycle();
        let info = unit.device_info();
        assert_eq!(info[0].activity.reads, 2);
        assert_eq!(info[0].activity.avg_read_us, 20);
        assert!(info[0].last_activity > 0);
    }
}
