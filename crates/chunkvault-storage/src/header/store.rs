//! Redundant header copies
//!
//! Copy `rank` of a FID's header lives on device
//! `mapper_device(fid, rank, mapper_modulo)` for `rank` in
//! `0..mapper_redundancy`. A write succeeds when at least one copy lands;
//! a read returns the first valid copy and rewrites the copies found
//! missing or damaged along the way.

use super::types::HeaderRecord;
use crate::allocator::{IoKind, mapper_device};
use crate::unit::StorageUnit;
use chunkvault_common::{Error, Fid, Result};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;
use tracing::{debug, info, warn};

/// Header operations of a storage unit
pub struct HeaderStore<'a> {
    unit: &'a StorageUnit,
}

/// Why a copy could not be used
enum CopyState {
    Missing,
    Damaged,
    /// The device serves no I/O and may still hold a copy
    Unavailable,
}

impl<'a> HeaderStore<'a> {
    pub fn new(unit: &'a StorageUnit) -> Self {
        Self { unit }
    }

    /// Devices holding the header copies of a FID, by rank
    pub fn copy_devices(&self, fid: &Fid) -> Vec<u8> {
        let config = self.unit.config();
        (0..config.mapper_redundancy)
            .map(|rank| mapper_device(fid, rank, config.mapper_modulo))
            .map(|device| u8::try_from(device).unwrap_or(u8::MAX))
            .collect()
    }

    /// Write every copy of a header; returns the number of copies written
    pub fn write(&self, spare: bool, header: &HeaderRecord) -> usize {
        let bytes = header.to_bytes();
        let mut written = 0;
        for device in self.copy_devices(&header.fid) {
            match self.write_copy(device, spare, &header.fid, &bytes) {
                Ok(()) => written += 1,
                Err(e) => warn!(
                    "Failed to write header of {} on device {}: {}",
                    header.fid, device, e
                ),
            }
        }
        debug!(
            "Wrote {} header copies of {} {}",
            written,
            header.fid,
            header.chunks.trace()
        );
        written
    }

    fn write_copy(&self, device: u8, spare: bool, fid: &Fid, bytes: &[u8]) -> Result<()> {
        self.unit.check_serves_io(device)?;
        let path = self
            .unit
            .paths()
            .hdr_file(u32::from(device), spare, fid);
        if let Some(dir) = path.parent() {
            self.unit.ensure_dir(device, dir)?;
        }
        write_atomically(&path, bytes).map_err(|e| {
            self.unit.record_error(device, IoKind::Header);
            Error::Io(e)
        })
    }

    /// Read the header of a FID
    ///
    /// - [`Error::HeaderNotFound`] when every rank is known to hold no copy
    /// - [`Error::HeaderReadErrors`] when no copy is usable and at least one
    ///   rank holds a damaged copy or sits on a device serving no I/O
    /// - [`Error::OtherRecyclingCounter`] when the header belongs to another
    ///   generation of the FID; with `update_recycle` the stale generation
    ///   is purged instead and [`Error::HeaderNotFound`] is returned
    pub fn read(&self, fid: &Fid, spare: bool, update_recycle: bool) -> Result<HeaderRecord> {
        let mut bad_copies: Vec<(u8, CopyState)> = Vec::new();

        for device in self.copy_devices(fid) {
            if self.unit.check_serves_io(device).is_err() {
                bad_copies.push((device, CopyState::Unavailable));
                continue;
            }
            let path = self
                .unit
                .paths()
                .hdr_file(u32::from(device), spare, fid);
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    bad_copies.push((device, CopyState::Missing));
                    continue;
                }
                Err(e) => {
                    warn!("Failed to read header {:?}: {}", path, e);
                    self.unit.record_error(device, IoKind::Header);
                    bad_copies.push((device, CopyState::Damaged));
                    continue;
                }
            };
            let header = match HeaderRecord::from_bytes(&bytes) {
                Ok(header) => header,
                Err(e) => {
                    warn!("Discarding header {:?}: {}", path, e);
                    self.unit.record_crc_error();
                    bad_copies.push((device, CopyState::Damaged));
                    continue;
                }
            };

            if header.fid.recycle_counter() != fid.recycle_counter() {
                if update_recycle {
                    self.purge_generation(&header, spare);
                    return Err(Error::HeaderNotFound);
                }
                return Err(Error::OtherRecyclingCounter {
                    found: header.fid.recycle_counter(),
                    requested: fid.recycle_counter(),
                });
            }

            self.repair_copies(&header, spare, &bad_copies);
            return Ok(header);
        }

        let all_missing = bad_copies
            .iter()
            .all(|(_, state)| matches!(state, CopyState::Missing));
        if all_missing {
            Err(Error::HeaderNotFound)
        } else {
            Err(Error::HeaderReadErrors)
        }
    }

    fn repair_copies(&self, header: &HeaderRecord, spare: bool, bad_copies: &[(u8, CopyState)]) {
        if bad_copies.is_empty() {
            return;
        }
        let bytes = header.to_bytes();
        for (device, _) in bad_copies {
            if self.unit.check_serves_io(*device).is_err() {
                continue;
            }
            match self.write_copy(*device, spare, &header.fid, &bytes) {
                Ok(()) => info!("Repaired header copy of {} on device {}", header.fid, device),
                Err(e) => warn!(
                    "Failed to repair header copy of {} on device {}: {}",
                    header.fid, device, e
                ),
            }
        }
    }

    /// Remove every chunk and header of a stale generation
    fn purge_generation(&self, header: &HeaderRecord, spare: bool) {
        info!(
            "Purging recycle generation {} of {} {}",
            header.fid.recycle_counter(),
            header.fid,
            header.chunks.trace()
        );
        for (chunk, device) in header.chunks.stored_chunks() {
            let path = self
                .unit
                .paths()
                .chunk_file(u32::from(device), spare, &header.fid, chunk);
            if let Err(e) = remove_if_exists(&path) {
                warn!("Failed to purge {:?}: {}", path, e);
                self.unit.record_error(device, IoKind::Remove);
            }
        }
        self.remove(&header.fid, spare);
    }

    /// Remove every header copy; returns the number of copies removed
    pub fn remove(&self, fid: &Fid, spare: bool) -> usize {
        let mut removed = 0;
        for device in self.copy_devices(fid) {
            let path = self
                .unit
                .paths()
                .hdr_file(u32::from(device), spare, fid);
            match remove_if_exists(&path) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to remove header {:?}: {}", path, e);
                    self.unit.record_error(device, IoKind::Remove);
                }
            }
        }
        removed
    }
}

/// Write through a temporary file and rename over the target
fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = Path::new(&tmp_name);

    let mut file = File::create(tmp_path)?;
    file.write_all(bytes)?;
    file.sync_data()?;
    fs::rename(tmp_path, path)
}

/// Unlink a file; `Ok(false)` if it did not exist
pub(crate) fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
