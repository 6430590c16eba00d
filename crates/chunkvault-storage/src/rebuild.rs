//! Rebuild bookkeeping
//!
//! A chunk rebuild rewrites one chunk of a FID from the other storages of
//! its distribution. When the chunk moves to another device the old slot is
//! saved by [`ChunkStore::relocate_chunk`] so a failed attempt can be rolled
//! back; the old data file is only removed once the rebuild succeeded.
//!
//! Device rebuilds drive the health state of a whole device through
//! rebuilding and back to active.

use crate::chunk::{ChunkStore, FileRef};
use crate::header::{ChunkSlot, MAX_CHUNKS_PER_FILE};
use crate::health::{DeviceStatus, HealthEvent};
use crate::mapping::DeviceMapping;
use crate::marker::{clear_rebuild_required, write_owner_mark};
use crate::unit::StorageUnit;
use chunkvault_common::{Error, Result};
use parking_lot::RwLock;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Rebuilds that may run at once on one FID
pub const MAX_REBUILDS_PER_FILE: usize = 4;

/// Time after which a rebuild that never stopped is considered abandoned
pub const MIN_DELAY_BETWEEN_ATTEMPTS: Duration = Duration::from_secs(60);

/// A running chunk rebuild
#[derive(Clone, Debug)]
pub struct RebuildEntry {
    pub reference: u32,
    pub chunk: usize,
    pub spare: bool,
    /// Slot saved when the chunk was relocated
    pub previous: Option<ChunkSlot>,
    pub started: Instant,
}

/// Handle returned to the rebuilder
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RebuildTicket {
    pub reference: u32,
    /// Slot of the chunk before the rebuild started
    pub previous: Option<ChunkSlot>,
}

/// Starts and stops chunk rebuilds of a storage unit
pub struct RebuildCoordinator<'a> {
    chunks: ChunkStore<'a>,
}

impl<'a> RebuildCoordinator<'a> {
    pub fn new(unit: &'a StorageUnit) -> Self {
        Self {
            chunks: ChunkStore::new(unit),
        }
    }

    /// Register a rebuild of `chunk`
    ///
    /// With `relocate` the chunk is detached from its device so that the
    /// rebuilt data lands on a newly allocated one.
    pub fn start(
        &self,
        mapping: &RwLock<DeviceMapping>,
        file: &FileRef,
        chunk: usize,
        relocate: bool,
    ) -> Result<RebuildTicket> {
        if chunk >= MAX_CHUNKS_PER_FILE {
            return Err(Error::FileTooBig { chunk });
        }
        let mut guard = mapping.write();

        if let Some(pos) = guard
            .rebuilds
            .iter()
            .position(|e| e.chunk == chunk && e.spare == file.spare)
        {
            if guard.rebuilds[pos].started.elapsed() < MIN_DELAY_BETWEEN_ATTEMPTS {
                return Err(Error::RebuildInProgress { chunk });
            }
            let stale = guard.rebuilds.remove(pos);
            warn!(
                "Rebuild {} of chunk {} of {} abandoned, starting over",
                stale.reference, chunk, file.fid
            );
            if let Some(previous) = stale.previous {
                self.chunks
                    .restore_chunk(&mut guard, file, chunk, previous)?;
            }
        }
        if guard.rebuilds.len() >= MAX_REBUILDS_PER_FILE {
            return Err(Error::TooManyRebuilds);
        }

        let previous = if relocate {
            Some(self.chunks.relocate_chunk(&mut guard, file, chunk)?)
        } else {
            None
        };
        let reference = guard.next_rebuild_ref;
        guard.next_rebuild_ref = guard.next_rebuild_ref.wrapping_add(1).max(1);
        guard.rebuilds.push(RebuildEntry {
            reference,
            chunk,
            spare: file.spare,
            previous,
            started: Instant::now(),
        });

        info!(
            "Rebuild {} of chunk {} of {} started (relocate: {})",
            reference, chunk, file.fid, relocate
        );
        Ok(RebuildTicket {
            reference,
            previous,
        })
    }

    /// Close a rebuild
    ///
    /// On success the data of a relocated chunk's old device is removed; on
    /// failure the old slot is put back.
    pub fn stop(
        &self,
        mapping: &RwLock<DeviceMapping>,
        file: &FileRef,
        reference: u32,
        success: bool,
    ) -> Result<()> {
        let mut guard = mapping.write();
        let Some(pos) = guard
            .rebuilds
            .iter()
            .position(|e| e.reference == reference)
        else {
            return Err(Error::NoSuchRebuild(reference));
        };
        let entry = guard.rebuilds.remove(pos);

        if let Some(previous) = entry.previous {
            if success {
                if let ChunkSlot::Device(old) = previous {
                    if guard.slot(entry.chunk) != previous {
                        self.chunks
                            .remove_data_chunk(old, &file.fid, file.spare, entry.chunk)?;
                    }
                }
            } else {
                self.chunks
                    .restore_chunk(&mut guard, file, entry.chunk, previous)?;
            }
        }

        info!(
            "Rebuild {} of chunk {} of {} stopped ({})",
            reference,
            entry.chunk,
            file.fid,
            if success { "success" } else { "failure" }
        );
        Ok(())
    }
}

/// Put a device in rebuilding state
pub fn start_device_rebuild(unit: &StorageUnit, device: u8) -> Result<()> {
    unit.apply_event(device, HealthEvent::RebuildStart)?;
    Ok(())
}

/// Close a device rebuild
///
/// On success the device gets its directory tree and owner mark back and
/// loses its rebuild-required mark.
pub fn finish_device_rebuild(unit: &StorageUnit, device: u8, success: bool) -> Result<DeviceStatus> {
    if unit.device_status(device) != DeviceStatus::Rebuilding {
        return Err(Error::InvalidTransition {
            device,
            from: unit.device_status(device).to_string(),
            event: HealthEvent::RebuildStop { success }.to_string(),
        });
    }
    let mut success = success;
    if success {
        let root = unit.paths().device_root(u32::from(device));
        let prepared = unit
            .create_subdirectories(device)
            .and_then(|()| write_owner_mark(&root, &unit.owner_mark(device)).map_err(Error::from))
            .and_then(|()| clear_rebuild_required(&root).map_err(Error::from));
        if let Err(e) = prepared {
            warn!("Device {} could not be prepared after rebuild: {}", device, e);
            success = false;
        }
    }
    unit.apply_event(device, HealthEvent::RebuildStop { success })?;
    Ok(unit.device_status(device))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::FileRef;
    use crate::marker::REBUILD_REQUIRED_MARK;
    use crate::unit::testutil::unit;
    use chunkvault_common::{BlockSizeClass, Distribution, Fid, Layout, Sid};
    use std::fs;
    use tempfile::tempdir;

    fn file() -> FileRef {
        FileRef {
            fid: Fid::random(),
            spare: false,
            layout: Layout::L2_3_4,
            bsize: BlockSizeClass::B4K,
            distribution: Distribution::new(vec![Sid(1), Sid(2), Sid(3), Sid(4)]).unwrap(),
        }
    }

    fn block(f: &FileRef, value: u8) -> Vec<u8> {
        vec![value; f.projection_bytes() as usize]
    }

    #[test]
    fn test_relocated_rebuild_success() {
        let dir = tempdir().unwrap();
        let unit = unit(dir.path(), 4, 4, 2);
        let chunks = ChunkStore::new(&unit);
        let rebuilds = RebuildCoordinator::new(&unit);
        let mapping = DeviceMapping::shared();
        let f = file();
        chunks.write(&mapping, &f, 0, 1, &block(&f, 1)).unwrap();
        let ChunkSlot::Device(old) = mapping.read().slot(0) else {
            panic!("chunk 0 not allocated");
        };
        let old_path = unit.paths().chunk_file(u32::from(old), false, &f.fid, 0);

        let ticket = rebuilds.start(&mapping, &f, 0, true).unwrap();
        assert_eq!(ticket.previous, Some(ChunkSlot::Device(old)));
        assert_eq!(mapping.read().slot(0), ChunkSlot::Empty);
        // The old copy is still there while the rebuild runs
        assert!(old_path.exists());

        // Round robin moves the rebuilt chunk to another device
        chunks.write(&mapping, &f, 0, 1, &block(&f, 2)).unwrap();
        let new_slot = mapping.read().slot(0);
        assert_ne!(new_slot, ChunkSlot::Device(old));

        rebuilds.stop(&mapping, &f, ticket.reference, true).unwrap();
        assert!(!old_path.exists());
        assert_eq!(mapping.read().running_rebuilds(), 0);
        assert_eq!(chunks.read(&mapping, &f, 0, 1).unwrap().data, block(&f, 2));
    }

    #[test]
    fn test_relocated_rebuild_failure_restores() {
        let dir = tempdir().unwrap();
        let unit = unit(dir.path(), 4, 4, 2);
        let chunks = ChunkStore::new(&unit);
        let rebuilds = RebuildCoordinator::new(&unit);
        let mapping = DeviceMapping::shared();
        let f = file();
        chunks.write(&mapping, &f, 0, 1, &block(&f, 1)).unwrap();
        let before = mapping.read().slot(0);

        let ticket = rebuilds.start(&mapping, &f, 0, true).unwrap();
        chunks.write(&mapping, &f, 0, 1, &block(&f, 2)).unwrap();
        let ChunkSlot::Device(partial) = mapping.read().slot(0) else {
            panic!("rebuilt chunk not allocated");
        };

        rebuilds.stop(&mapping, &f, ticket.reference, false).unwrap();
        assert_eq!(mapping.read().slot(0), before);
        assert!(
            !unit
                .paths()
                .chunk_file(u32::from(partial), false, &f.fid, 0)
                .exists()
        );
        assert_eq!(chunks.read(&mapping, &f, 0, 1).unwrap().data, block(&f, 1));

        // The header on disk agrees
        let fresh = DeviceMapping::shared();
        assert_eq!(chunks.read(&fresh, &f, 0, 1).unwrap().data, block(&f, 1));
    }

    #[test]
    fn test_relocated_chunk_never_returns_to_its_old_device() {
        let dir = tempdir().unwrap();
        let unit = unit(dir.path(), 4, 4, 2);
        let chunks = ChunkStore::new(&unit);
        let rebuilds = RebuildCoordinator::new(&unit);
        let mapping = DeviceMapping::shared();
        let f = file();
        let bpc = unit.blocks_per_chunk(f.bsize);
        // One chunk per device brings the round robin cursor back to chunk 0's
        for chunk in 0..4u8 {
            chunks
                .write(&mapping, &f, u64::from(chunk) * bpc, 1, &block(&f, chunk + 1))
                .unwrap();
        }
        let old = mapping.read().slot(0);

        let ticket = rebuilds.start(&mapping, &f, 0, true).unwrap();
        chunks.write(&mapping, &f, 0, 1, &block(&f, 0x20)).unwrap();
        assert_ne!(mapping.read().slot(0), old);

        rebuilds.stop(&mapping, &f, ticket.reference, false).unwrap();
        assert_eq!(mapping.read().slot(0), old);
        assert_eq!(chunks.read(&mapping, &f, 0, 1).unwrap().data, block(&f, 1));
    }

    #[test]
    fn test_relocation_without_other_device() {
        let dir = tempdir().unwrap();
        let unit = unit(dir.path(), 2, 2, 1);
        let chunks = ChunkStore::new(&unit);
        let rebuilds = RebuildCoordinator::new(&unit);
        let mapping = DeviceMapping::shared();
        let f = file();
        chunks.write(&mapping, &f, 0, 1, &block(&f, 1)).unwrap();
        let ChunkSlot::Device(old) = mapping.read().slot(0) else {
            panic!("chunk 0 not allocated");
        };
        unit.apply_event(1 - old, HealthEvent::RelocateStart).unwrap();

        rebuilds.start(&mapping, &f, 0, true).unwrap();
        assert!(matches!(
            chunks.write(&mapping, &f, 0, 1, &block(&f, 2)),
            Err(Error::NoDeviceAvailable)
        ));
        let old_path = unit.paths().chunk_file(u32::from(old), false, &f.fid, 0);
        assert_eq!(fs::read(&old_path).unwrap(), block(&f, 1));
    }

    #[test]
    fn test_rebuild_limits() {
        let dir = tempdir().unwrap();
        let unit = unit(dir.path(), 4, 4, 2);
        let rebuilds = RebuildCoordinator::new(&unit);
        let mapping = DeviceMapping::shared();
        let f = file();

        let first = rebuilds.start(&mapping, &f, 0, false).unwrap();
        assert!(matches!(
            rebuilds.start(&mapping, &f, 0, false),
            Err(Error::RebuildInProgress { chunk: 0 })
        ));
        for chunk in 1..MAX_REBUILDS_PER_FILE {
            rebuilds.start(&mapping, &f, chunk, false).unwrap();
        }
        assert!(matches!(
            rebuilds.start(&mapping, &f, 100, false),
            Err(Error::TooManyRebuilds)
        ));

        rebuilds.stop(&mapping, &f, first.reference, true).unwrap();
        assert!(matches!(
            rebuilds.stop(&mapping, &f, first.reference, true),
            Err(Error::NoSuchRebuild(_))
        ));
        rebuilds.start(&mapping, &f, 100, false).unwrap();
    }

    #[test]
    fn test_abandoned_rebuild_is_replaced() {
        let dir = tempdir().unwrap();
        let unit = unit(dir.path(), 4, 4, 2);
        let chunks = ChunkStore::new(&unit);
        let rebuilds = RebuildCoordinator::new(&unit);
        let mapping = DeviceMapping::shared();
        let f = file();
        chunks.write(&mapping, &f, 0, 1, &block(&f, 1)).unwrap();
        let before = mapping.read().slot(0);

        let stale = rebuilds.start(&mapping, &f, 0, true).unwrap();
        // Age the entry past the retry delay
        if let Some(start) = Instant::now().checked_sub(MIN_DELAY_BETWEEN_ATTEMPTS * 2) {
            mapping.write().rebuilds[0].started = start;
        } else {
            return;
        }

        let fresh = rebuilds.start(&mapping, &f, 0, false).unwrap();
        assert_ne!(fresh.reference, stale.reference);
        // The abandoned relocation was rolled back
        assert_eq!(mapping.read().slot(0), before);
        assert_eq!(mapping.read().running_rebuilds(), 1);
    }

    #[test]
    fn test_device_rebuild() {
        let dir = tempdir().unwrap();
        let unit = unit(dir.path(), 2, 2, 1);
        let root = unit.paths().device_root(1);
        fs::remove_dir_all(root.join("hdr_0")).unwrap();
        fs::write(root.join(REBUILD_REQUIRED_MARK), b"").unwrap();
        unit.run_health_cycle();
        assert_eq!(unit.device_status(1), DeviceStatus::Failed);

        assert!(finish_device_rebuild(&unit, 1, true).is_err());
        start_device_rebuild(&unit, 1).unwrap();
        assert_eq!(unit.device_status(1), DeviceStatus::Rebuilding);
        assert_eq!(
            finish_device_rebuild(&unit, 1, true).unwrap(),
            DeviceStatus::Active
        );
        assert!(root.join("hdr_0/0").is_dir());
        assert!(!root.join(REBUILD_REQUIRED_MARK).exists());

        unit.run_health_cycle();
        assert_eq!(unit.device_status(1), DeviceStatus::Active);
    }
}
