//! Device health state machine
//!
//! Every device of a storage unit carries a [`DeviceStatus`] driven by:
//! - periodic probes of the filesystem ([`probe_device`])
//! - the count of I/O errors recorded during the last monitoring window
//! - operator commands (rebuild, relocation, out of service)
//!
//! Only [`DeviceStatus::Active`] and [`DeviceStatus::Degraded`] devices
//! receive new chunks.

use crate::marker::{DeviceMarks, OwnerMark};
use chunkvault_common::{Error, MonitorConfig, Result};
use nix::sys::statvfs::{FsFlags, statvfs};
use serde::Serialize;
use std::fmt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Lifecycle state of a device
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    /// Slot exists in the configuration but was never declared
    Undeclared,
    /// Declared, waiting for its first probe
    Init,
    /// Healthy
    Active,
    /// Usable, with errors or low resources
    Degraded,
    /// Its chunks are being moved to other devices
    Relocating,
    /// Being repopulated after a replacement
    Rebuilding,
    /// Not usable
    Failed,
    /// Removed from service by an operator
    OutOfService,
}

impl DeviceStatus {
    /// Whether the allocator may place new chunks on the device
    #[must_use]
    pub const fn admits_allocation(self) -> bool {
        matches!(self, Self::Active | Self::Degraded)
    }

    /// Whether reads and writes of existing chunks may be attempted
    #[must_use]
    pub const fn serves_io(self) -> bool {
        !matches!(self, Self::Undeclared | Self::Failed | Self::OutOfService)
    }

    /// Short name used in logs and status output
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Undeclared => "undeclared",
            Self::Init => "init",
            Self::Active => "active",
            Self::Degraded => "degraded",
            Self::Relocating => "relocating",
            Self::Rebuilding => "rebuilding",
            Self::Failed => "failed",
            Self::OutOfService => "out_of_service",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the last probe of a device
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Diagnostic {
    #[default]
    Ok,
    /// statvfs failed
    FailedFs,
    /// Filesystem mounted read-only
    ReadonlyFs,
    /// Directory missing or not a mount point
    Unmounted,
    /// No inode left
    InodeDepletion,
    /// No block left
    BlockDepletion,
    /// Disk belongs to another storage slot
    InvertedDisk,
    /// Disk carries the rebuild-required mark
    RebuildRequired,
}

impl Diagnostic {
    /// Diagnostics that make a device unusable
    #[must_use]
    pub const fn is_severe(self) -> bool {
        matches!(
            self,
            Self::FailedFs
                | Self::ReadonlyFs
                | Self::Unmounted
                | Self::InvertedDisk
                | Self::RebuildRequired
        )
    }

    /// Diagnostics that only degrade a device
    #[must_use]
    pub const fn is_depletion(self) -> bool {
        matches!(self, Self::InodeDepletion | Self::BlockDepletion)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "ok",
            Self::FailedFs => "failed_fs",
            Self::ReadonlyFs => "readonly_fs",
            Self::Unmounted => "unmounted",
            Self::InodeDepletion => "inode_depletion",
            Self::BlockDepletion => "block_depletion",
            Self::InvertedDisk => "inverted_disk",
            Self::RebuildRequired => "rebuild_required",
        };
        f.write_str(name)
    }
}

/// Input of the state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthEvent {
    /// Device slot configured
    Declare,
    /// Periodic filesystem probe
    Probe(Diagnostic),
    /// I/O errors counted during the last monitoring window
    ErrorWindow(u32),
    /// Operator starts repopulating the device
    RebuildStart,
    /// Rebuild finished
    RebuildStop { success: bool },
    /// Operator starts moving chunks off the device
    RelocateStart,
    /// Relocation finished
    RelocateStop { success: bool },
    /// Operator removes the device from service
    TakeOutOfService,
    /// Operator puts a failed or removed device back through init
    Reinstate,
}

impl fmt::Display for HealthEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Declare => f.write_str("declare"),
            Self::Probe(diag) => write!(f, "probe({diag})"),
            Self::ErrorWindow(count) => write!(f, "error_window({count})"),
            Self::RebuildStart => f.write_str("rebuild_start"),
            Self::RebuildStop { success } => write!(f, "rebuild_stop({success})"),
            Self::RelocateStart => f.write_str("relocate_start"),
            Self::RelocateStop { success } => write!(f, "relocate_stop({success})"),
            Self::TakeOutOfService => f.write_str("out_of_service"),
            Self::Reinstate => f.write_str("reinstate"),
        }
    }
}

/// Error counts that move a device down
#[derive(Clone, Copy, Debug)]
pub struct HealthThresholds {
    pub degrade: u32,
    pub fail: u32,
}

impl From<&MonitorConfig> for HealthThresholds {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            degrade: config.degrade_error_threshold,
            fail: config.fail_error_threshold,
        }
    }
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self::from(&MonitorConfig::default())
    }
}

/// Health record of one device
#[derive(Clone, Debug)]
pub struct DeviceHealth {
    device: u8,
    status: DeviceStatus,
    diagnostic: Diagnostic,
    /// Status to return to when a relocation is aborted
    resume_status: DeviceStatus,
    /// Unix time of the last status change
    changed_at: u64,
}

impl DeviceHealth {
    /// New undeclared device
    #[must_use]
    pub fn new(device: u8) -> Self {
        Self {
            device,
            status: DeviceStatus::Undeclared,
            diagnostic: Diagnostic::Ok,
            resume_status: DeviceStatus::Active,
            changed_at: unix_now(),
        }
    }

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    pub fn diagnostic(&self) -> Diagnostic {
        self.diagnostic
    }

    /// Unix time of the last status change
    pub fn changed_at(&self) -> u64 {
        self.changed_at
    }

    /// Apply an event
    ///
    /// Returns the new status when it changed. Events that are not
    /// meaningful in the current state are rejected with
    /// [`Error::InvalidTransition`]; probes and error windows are always
    /// accepted once declared and only move the states they concern.
    pub fn apply(
        &mut self,
        event: HealthEvent,
        thresholds: HealthThresholds,
    ) -> Result<Option<DeviceStatus>> {
        use DeviceStatus as S;

        let next = match (self.status, event) {
            (S::Undeclared, HealthEvent::Declare) => S::Init,
            (S::Undeclared, _) | (_, HealthEvent::Declare) => {
                return Err(self.invalid(event));
            }

            (status, HealthEvent::Probe(diag)) => {
                self.diagnostic = diag;
                match status {
                    S::Init | S::Active => {
                        if diag.is_severe() {
                            S::Failed
                        } else if diag.is_depletion() {
                            S::Degraded
                        } else {
                            S::Active
                        }
                    }
                    S::Degraded if diag.is_severe() => S::Failed,
                    other => other,
                }
            }

            (S::Active, HealthEvent::ErrorWindow(n)) if n >= thresholds.fail => S::Failed,
            (S::Active, HealthEvent::ErrorWindow(n)) if n >= thresholds.degrade => S::Degraded,
            (S::Degraded, HealthEvent::ErrorWindow(n)) if n >= thresholds.fail => S::Failed,
            (S::Degraded, HealthEvent::ErrorWindow(0)) if self.diagnostic == Diagnostic::Ok => {
                S::Active
            }
            (status, HealthEvent::ErrorWindow(_)) => status,

            (S::Active | S::Degraded | S::Failed, HealthEvent::RebuildStart) => S::Rebuilding,
            (S::Rebuilding, HealthEvent::RebuildStop { success }) => {
                if success {
                    S::Active
                } else {
                    S::Failed
                }
            }

            (status @ (S::Active | S::Degraded | S::Failed), HealthEvent::RelocateStart) => {
                self.resume_status = status;
                S::Relocating
            }
            (S::Relocating, HealthEvent::RelocateStop { success }) => {
                if success {
                    S::Failed
                } else {
                    self.resume_status
                }
            }

            (S::Active | S::Degraded, HealthEvent::TakeOutOfService) => S::OutOfService,
            (S::Failed | S::OutOfService, HealthEvent::Reinstate) => S::Init,

            _ => return Err(self.invalid(event)),
        };

        if next == self.status {
            return Ok(None);
        }
        self.status = next;
        self.changed_at = unix_now();
        Ok(Some(next))
    }

    fn invalid(&self, event: HealthEvent) -> Error {
        Error::InvalidTransition {
            device: self.device,
            from: self.status.to_string(),
            event: event.to_string(),
        }
    }
}

/// Filesystem figures gathered by a probe
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProbeReport {
    pub diagnostic: Diagnostic,
    /// Filesystem fragment size
    pub block_size: u64,
    /// Blocks available to unprivileged users
    pub free_blocks: u64,
    /// Total blocks
    pub total_blocks: u64,
}

impl ProbeReport {
    fn failed(diagnostic: Diagnostic) -> Self {
        Self {
            diagnostic,
            ..Self::default()
        }
    }

    pub fn free_bytes(&self) -> u64 {
        self.free_blocks.saturating_mul(self.block_size)
    }

    pub fn size_bytes(&self) -> u64 {
        self.total_blocks.saturating_mul(self.block_size)
    }
}

/// Probe the filesystem behind a device directory
///
/// Checks, in order: presence, mount point, rebuild mark, owner mark, then
/// statvfs flags and free inode/block counts.
pub fn probe_device(
    device_root: &Path,
    owner: &OwnerMark,
    check_mountpoint: bool,
) -> ProbeReport {
    let Ok(meta) = std::fs::metadata(device_root) else {
        return ProbeReport::failed(Diagnostic::Unmounted);
    };
    if !meta.is_dir() {
        return ProbeReport::failed(Diagnostic::Unmounted);
    }
    if check_mountpoint && !is_mount_point(device_root, meta.dev()) {
        return ProbeReport::failed(Diagnostic::Unmounted);
    }

    match DeviceMarks::scan(device_root) {
        Ok(marks) if marks.rebuild_required => {
            return ProbeReport::failed(Diagnostic::RebuildRequired);
        }
        Ok(marks) if marks.owned_by_other(owner) => {
            return ProbeReport::failed(Diagnostic::InvertedDisk);
        }
        Ok(_) => {}
        Err(_) => return ProbeReport::failed(Diagnostic::FailedFs),
    }

    let Ok(stats) = statvfs(device_root) else {
        return ProbeReport::failed(Diagnostic::FailedFs);
    };
    #[allow(clippy::unnecessary_cast)]
    let mut report = ProbeReport {
        diagnostic: Diagnostic::Ok,
        block_size: stats.fragment_size() as u64,
        free_blocks: stats.blocks_available() as u64,
        total_blocks: stats.blocks() as u64,
    };
    if stats.flags().contains(FsFlags::ST_RDONLY) {
        report.diagnostic = Diagnostic::ReadonlyFs;
    } else if stats.files() > 0 && stats.files_available() == 0 {
        report.diagnostic = Diagnostic::InodeDepletion;
    } else if report.free_blocks == 0 {
        report.diagnostic = Diagnostic::BlockDepletion;
    }
    report
}

fn is_mount_point(path: &Path, dev: u64) -> bool {
    let Some(parent) = path.parent() else {
        return true;
    };
    std::fs::metadata(parent).is_ok_and(|parent_meta| parent_meta.dev() != dev)
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkvault_common::{Cid, Sid};
    use std::fs;
    use tempfile::tempdir;

    const T: HealthThresholds = HealthThresholds {
        degrade: 2,
        fail: 5,
    };

    fn active() -> DeviceHealth {
        let mut health = DeviceHealth::new(0);
        health.apply(HealthEvent::Declare, T).unwrap();
        health.apply(HealthEvent::Probe(Diagnostic::Ok), T).unwrap();
        assert_eq!(health.status(), DeviceStatus::Active);
        health
    }

    fn owner(device: u8) -> OwnerMark {
        OwnerMark {
            cid: Cid(1),
            sid: Sid(1),
            device,
        }
    }

    #[test]
    fn test_declare_and_init() {
        let mut health = DeviceHealth::new(3);
        assert!(health.apply(HealthEvent::RebuildStart, T).is_err());
        assert_eq!(
            health.apply(HealthEvent::Declare, T).unwrap(),
            Some(DeviceStatus::Init)
        );
        assert!(health.apply(HealthEvent::Declare, T).is_err());
        assert_eq!(
            health
                .apply(HealthEvent::Probe(Diagnostic::Unmounted), T)
                .unwrap(),
            Some(DeviceStatus::Failed)
        );
    }

    #[test]
    fn test_error_window_degrades_then_recovers() {
        let mut health = active();
        assert_eq!(health.apply(HealthEvent::ErrorWindow(1), T).unwrap(), None);
        assert_eq!(
            health.apply(HealthEvent::ErrorWindow(2), T).unwrap(),
            Some(DeviceStatus::Degraded)
        );
        assert!(health.status().admits_allocation());
        assert_eq!(health.apply(HealthEvent::ErrorWindow(1), T).unwrap(), None);
        assert_eq!(
            health.apply(HealthEvent::ErrorWindow(0), T).unwrap(),
            Some(DeviceStatus::Active)
        );
    }

    #[test]
    fn test_error_window_fails() {
        let mut health = active();
        health.apply(HealthEvent::ErrorWindow(9), T).unwrap();
        assert_eq!(health.status(), DeviceStatus::Failed);
        assert!(!health.status().admits_allocation());
        assert!(!health.status().serves_io());
        // No automatic way back from failed
        health.apply(HealthEvent::ErrorWindow(0), T).unwrap();
        health.apply(HealthEvent::Probe(Diagnostic::Ok), T).unwrap();
        assert_eq!(health.status(), DeviceStatus::Failed);
        health.apply(HealthEvent::Reinstate, T).unwrap();
        assert_eq!(health.status(), DeviceStatus::Init);
    }

    #[test]
    fn test_depletion_degrades_without_failing() {
        let mut health = active();
        health
            .apply(HealthEvent::Probe(Diagnostic::BlockDepletion), T)
            .unwrap();
        assert_eq!(health.status(), DeviceStatus::Degraded);
        // Still depleted: a clean window is not enough
        health.apply(HealthEvent::ErrorWindow(0), T).unwrap();
        assert_eq!(health.status(), DeviceStatus::Degraded);
        health.apply(HealthEvent::Probe(Diagnostic::Ok), T).unwrap();
        health.apply(HealthEvent::ErrorWindow(0), T).unwrap();
        assert_eq!(health.status(), DeviceStatus::Active);
    }

    #[test]
    fn test_rebuild_cycle() {
        let mut health = active();
        health.apply(HealthEvent::ErrorWindow(10), T).unwrap();
        health.apply(HealthEvent::RebuildStart, T).unwrap();
        assert_eq!(health.status(), DeviceStatus::Rebuilding);
        assert!(health.status().serves_io());
        assert!(!health.status().admits_allocation());
        // Probes do not interrupt a rebuild
        health
            .apply(HealthEvent::Probe(Diagnostic::BlockDepletion), T)
            .unwrap();
        assert_eq!(health.status(), DeviceStatus::Rebuilding);
        health
            .apply(HealthEvent::RebuildStop { success: true }, T)
            .unwrap();
        assert_eq!(health.status(), DeviceStatus::Active);

        health.apply(HealthEvent::RebuildStart, T).unwrap();
        health
            .apply(HealthEvent::RebuildStop { success: false }, T)
            .unwrap();
        assert_eq!(health.status(), DeviceStatus::Failed);
    }

    #[test]
    fn test_relocation_cycle() {
        let mut health = active();
        health.apply(HealthEvent::ErrorWindow(3), T).unwrap();
        health.apply(HealthEvent::RelocateStart, T).unwrap();
        assert_eq!(health.status(), DeviceStatus::Relocating);
        health
            .apply(HealthEvent::RelocateStop { success: false }, T)
            .unwrap();
        assert_eq!(health.status(), DeviceStatus::Degraded);

        health.apply(HealthEvent::RelocateStart, T).unwrap();
        health
            .apply(HealthEvent::RelocateStop { success: true }, T)
            .unwrap();
        assert_eq!(health.status(), DeviceStatus::Failed);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut health = active();
        assert!(matches!(
            health.apply(HealthEvent::RebuildStop { success: true }, T),
            Err(Error::InvalidTransition { .. })
        ));
        assert!(health.apply(HealthEvent::Reinstate, T).is_err());
        health.apply(HealthEvent::TakeOutOfService, T).unwrap();
        assert!(health.apply(HealthEvent::RelocateStart, T).is_err());
        assert!(health.apply(HealthEvent::TakeOutOfService, T).is_err());
        assert_eq!(health.status(), DeviceStatus::OutOfService);
    }

    #[test]
    fn test_probe_missing_directory() {
        let dir = tempdir().unwrap();
        let report = probe_device(&dir.path().join("0"), &owner(0), false);
        assert_eq!(report.diagnostic, Diagnostic::Unmounted);
    }

    #[test]
    fn test_probe_plain_directory() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("0");
        fs::create_dir(&root).unwrap();

        let report = probe_device(&root, &owner(0), false);
        assert_eq!(report.diagnostic, Diagnostic::Ok);
        assert!(report.block_size > 0);
        assert!(report.size_bytes() >= report.free_bytes());

        // A plain subdirectory is not a mount point
        let report = probe_device(&root, &owner(0), true);
        assert_eq!(report.diagnostic, Diagnostic::Unmounted);
    }

    #[test]
    fn test_probe_marks() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("1");
        fs::create_dir(&root).unwrap();

        fs::write(root.join(owner(2).file_name()), b"").unwrap();
        let report = probe_device(&root, &owner(1), false);
        assert_eq!(report.diagnostic, Diagnostic::InvertedDisk);

        fs::write(root.join(crate::marker::REBUILD_REQUIRED_MARK), b"").unwrap();
        let report = probe_device(&root, &owner(1), false);
        assert_eq!(report.diagnostic, Diagnostic::RebuildRequired);
    }
}
