//! Chunk data operations
//!
//! A file is cut into chunks of `blocks_per_chunk` blocks. Each chunk is an
//! ordinary file on one device holding the projections of its blocks at
//! offset `block_in_chunk * projection_bytes`. A request may cross one chunk
//! boundary; it is then split into two ordered sub-requests.
//!
//! Every operation takes the FID's [`DeviceMapping`] lock: shared for reads,
//! exclusive for anything that can change the chunk table.

use crate::allocator::IoKind;
use crate::bitmap::RepairBitmap;
use crate::header::{
    ChunkSlot, ChunkTable, HeaderRecord, HeaderStore, MAX_CHUNKS_PER_FILE, remove_if_exists,
};
use crate::mapping::DeviceMapping;
use crate::unit::StorageUnit;
use chunkvault_common::{BlockSizeClass, Distribution, Error, Fid, Layout, Result};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

/// File a request applies to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileRef {
    pub fid: Fid,
    /// Stored on its spare distribution
    pub spare: bool,
    pub layout: Layout,
    pub bsize: BlockSizeClass,
    pub distribution: Distribution,
}

impl FileRef {
    /// Bytes stored per block
    pub fn projection_bytes(&self) -> u64 {
        self.layout.projection_bytes(self.bsize)
    }

    fn header(&self, unit: &StorageUnit, chunks: ChunkTable) -> HeaderRecord {
        HeaderRecord {
            layout: self.layout,
            bsize: self.bsize,
            fid: self.fid,
            distribution: self.distribution.clone(),
            chunks,
            cid: unit.cid(),
            sid: unit.sid(),
        }
    }
}

/// Result of a write
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Projection bytes written
    pub written: u64,
    /// Size of the file's projections on this storage after the write
    pub file_size: u64,
}

/// Result of a read
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Projection bytes, zero filled over holes
    pub data: Vec<u8>,
    /// Size of the file's projections on this storage as seen by the read
    pub file_size: u64,
}

/// Result of a resize query
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResizeOutcome {
    /// Number of blocks stored, last one possibly partial
    pub nb_blocks: u64,
    /// Bytes of the last stored block
    pub last_block: Vec<u8>,
}

/// Chunk operations of a storage unit
pub struct ChunkStore<'a> {
    unit: &'a StorageUnit,
    headers: HeaderStore<'a>,
}

impl<'a> ChunkStore<'a> {
    pub fn new(unit: &'a StorageUnit) -> Self {
        Self {
            unit,
            headers: HeaderStore::new(unit),
        }
    }

    pub fn unit(&self) -> &StorageUnit {
        self.unit
    }

    /// Write `block_count` blocks starting at `first_block`
    pub fn write(
        &self,
        mapping: &RwLock<DeviceMapping>,
        file: &FileRef,
        first_block: u64,
        block_count: u32,
        bins: &[u8],
    ) -> Result<WriteOutcome> {
        let (bpc, proj) = self.geometry(file);
        let count = u64::from(block_count);
        if count == 0 || bins.len() as u64 != count * proj {
            return Err(Error::InvalidArgument(format!(
                "{} bytes for {block_count} blocks of {proj} bytes",
                bins.len()
            )));
        }
        let chunk = chunk_index(first_block, bpc)?;
        let bid = first_block % bpc;

        let mut guard = mapping.write();
        self.resolve(&mut guard, file, true)?;

        if bid + count <= bpc {
            let file_size = self.write_chunk(&mut guard, file, chunk, &[(bid, bins)])?;
            return Ok(WriteOutcome {
                written: bins.len() as u64,
                file_size,
            });
        }

        if chunk + 1 >= MAX_CHUNKS_PER_FILE {
            return Err(Error::FileTooBig { chunk: chunk + 1 });
        }
        let first_count = bpc - bid;
        if count - first_count > bpc {
            return Err(Error::InvalidArgument(format!(
                "write of {block_count} blocks spans more than two chunks"
            )));
        }
        let (head, tail) = bins.split_at(to_usize(first_count * proj)?);
        self.write_chunk(&mut guard, file, chunk, &[(bid, head)])?;
        let file_size = self.write_chunk(&mut guard, file, chunk + 1, &[(0, tail)])?;
        Ok(WriteOutcome {
            written: bins.len() as u64,
            file_size,
        })
    }

    /// Read `block_count` blocks starting at `first_block`
    ///
    /// A chunk file shorter than the request is a hole and reads as zeros,
    /// unless the next chunk is the end of the file: then the short read is
    /// returned as is.
    pub fn read(
        &self,
        mapping: &RwLock<DeviceMapping>,
        file: &FileRef,
        first_block: u64,
        block_count: u32,
    ) -> Result<ReadOutcome> {
        let (bpc, proj) = self.geometry(file);
        self.resolve_shared(mapping, file)?;
        let guard = mapping.read();

        let chunk = usize::try_from(first_block / bpc).unwrap_or(usize::MAX);
        if chunk >= MAX_CHUNKS_PER_FILE {
            return Ok(ReadOutcome {
                data: Vec::new(),
                file_size: 0,
            });
        }
        let bid = first_block % bpc;
        let count = u64::from(block_count);
        let mut data = vec![0u8; to_usize(count * proj)?];
        let mut file_size = 0;

        let len = if bid + count <= bpc {
            let requested = data.len();
            let read = self.read_chunk(&guard, file, chunk, bid, &mut data, &mut file_size)?;
            if read < requested && !is_end(&guard, chunk + 1) {
                requested
            } else {
                read
            }
        } else {
            let first_len = to_usize((bpc - bid) * proj)?;
            let (head, tail) = data.split_at_mut(first_len);
            let read = self.read_chunk(&guard, file, chunk, bid, head, &mut file_size)?;
            if is_end(&guard, chunk + 1) {
                read
            } else {
                let requested = tail.len();
                let read = self.read_chunk(&guard, file, chunk + 1, 0, tail, &mut file_size)?;
                if read < requested && !is_end(&guard, chunk + 2) {
                    first_len + requested
                } else {
                    first_len + read
                }
            }
        };
        data.truncate(len);
        Ok(ReadOutcome { data, file_size })
    }

    /// Write the blocks selected by `bitmap`
    ///
    /// Bit `i` set means block `first_block + i` is carried by the request;
    /// `bins` holds the selected blocks back to back.
    pub fn write_repair(
        &self,
        mapping: &RwLock<DeviceMapping>,
        file: &FileRef,
        first_block: u64,
        block_count: u32,
        bitmap: &RepairBitmap,
        bins: &[u8],
    ) -> Result<WriteOutcome> {
        let (bpc, proj) = self.geometry(file);
        if block_count == 0 || bitmap.count_ones() != block_count {
            return Err(Error::inconsistent(format!(
                "repair bitmap has {} blocks, request declares {block_count}",
                bitmap.count_ones()
            )));
        }
        if bins.len() as u64 != u64::from(block_count) * proj {
            return Err(Error::inconsistent(format!(
                "{} bytes for {block_count} repaired blocks of {proj} bytes",
                bins.len()
            )));
        }
        let chunk = chunk_index(first_block, bpc)?;
        let bid = first_block % bpc;
        let last = bitmap.last_set().map_or(0, |pos| pos as u64);

        if bid + last < bpc {
            let mut guard = mapping.write();
            self.resolve(&mut guard, file, true)?;
            let segments = repair_segments(bitmap, bid, proj, bins)?;
            let file_size = self.write_chunk(&mut guard, file, chunk, &segments)?;
            return Ok(WriteOutcome {
                written: bins.len() as u64,
                file_size,
            });
        }

        if chunk + 1 >= MAX_CHUNKS_PER_FILE {
            return Err(Error::FileTooBig { chunk: chunk + 1 });
        }
        let (low, high) = bitmap.split_at(to_usize(bpc - bid)?);
        if high.last_set().is_some_and(|pos| pos as u64 >= bpc) {
            return Err(Error::inconsistent("repair spans more than two chunks"));
        }
        let (head, tail) = bins.split_at(to_usize(u64::from(low.count_ones()) * proj)?);

        let mut guard = mapping.write();
        self.resolve(&mut guard, file, true)?;
        if !low.is_empty() {
            let segments = repair_segments(&low, bid, proj, head)?;
            self.write_chunk(&mut guard, file, chunk, &segments)?;
        }
        let segments = repair_segments(&high, 0, proj, tail)?;
        let file_size = self.write_chunk(&mut guard, file, chunk + 1, &segments)?;
        Ok(WriteOutcome {
            written: bins.len() as u64,
            file_size,
        })
    }

    /// Cut the file after `block` full blocks, then append `last_block`
    ///
    /// Returns the new projection size of the file on this storage.
    pub fn truncate(
        &self,
        mapping: &RwLock<DeviceMapping>,
        file: &FileRef,
        block: u64,
        last_block: Option<&[u8]>,
    ) -> Result<u64> {
        let (bpc, proj) = self.geometry(file);
        let last_len = last_block.map_or(0, <[u8]>::len) as u64;
        if last_len > proj {
            return Err(Error::InvalidArgument(format!(
                "last block of {last_len} bytes exceeds {proj}"
            )));
        }
        let chunk = chunk_index(block, bpc)?;
        let bid = block % bpc;
        let keep = bid > 0 || last_block.is_some();

        let mut guard = mapping.write();
        self.resolve(&mut guard, file, true)?;
        let previous = guard.table;

        for later in chunk + 1..MAX_CHUNKS_PER_FILE {
            if let ChunkSlot::Device(device) = guard.table.get(later) {
                self.remove_data_chunk(device, &file.fid, file.spare, later)?;
            }
            guard.table.set(later, ChunkSlot::Eof);
        }

        match (guard.table.get(chunk), keep) {
            (ChunkSlot::Device(device), true) => {
                self.cut_chunk(device, file, chunk, bid * proj, last_block)?;
            }
            (ChunkSlot::Device(device), false) => {
                self.remove_data_chunk(device, &file.fid, file.spare, chunk)?;
                guard.table.set(chunk, ChunkSlot::Eof);
            }
            (_, true) => {
                let device = self
                    .unit
                    .allocate_device_excluding(guard.relocated_from(chunk, file.spare))?;
                self.cut_chunk(device, file, chunk, bid * proj, last_block)?;
                guard.table.mark_allocated(chunk, device);
            }
            (_, false) => guard.table.set(chunk, ChunkSlot::Eof),
        }
        guard.table.trim_tail();

        if guard.table != previous {
            self.persist_table(&mut guard, file, previous)?;
        }
        debug!("Truncated {} to block {} {}", file.fid, block, guard.table.trace());
        Ok(block * proj + last_len)
    }

    /// Number of blocks stored and content of the last one
    pub fn resize(&self, mapping: &RwLock<DeviceMapping>, file: &FileRef) -> Result<ResizeOutcome> {
        let (bpc, proj) = self.geometry(file);
        self.resolve_shared(mapping, file)?;
        let guard = mapping.read();

        let Some((chunk, device)) = guard.table.last_stored_chunk() else {
            return Ok(ResizeOutcome::default());
        };
        self.unit.check_serves_io(device)?;
        let path = self.chunk_path(device, file, chunk);
        let handle = match File::open(&path) {
            Ok(handle) => handle,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(ResizeOutcome {
                    nb_blocks: chunk as u64 * bpc,
                    last_block: Vec::new(),
                });
            }
            Err(e) => return Err(self.io_error(device, IoKind::Read, e)),
        };
        let len = handle
            .metadata()
            .map_err(|e| self.io_error(device, IoKind::Read, e))?
            .len();
        let blocks = len.div_ceil(proj);
        let mut last_block = Vec::new();
        if blocks > 0 {
            let offset = (blocks - 1) * proj;
            last_block = vec![0u8; to_usize(len - offset)?];
            let read = read_full_at(&handle, &mut last_block, offset)
                .map_err(|e| self.io_error(device, IoKind::Read, e))?;
            last_block.truncate(read);
        }
        Ok(ResizeOutcome {
            nb_blocks: chunk as u64 * bpc + blocks,
            last_block,
        })
    }

    /// Mark a chunk as no longer stored, keeping its data file
    ///
    /// Returns the previous slot so that [`Self::restore_chunk`] can undo it.
    pub fn relocate_chunk(
        &self,
        mapping: &mut DeviceMapping,
        file: &FileRef,
        chunk: usize,
    ) -> Result<ChunkSlot> {
        check_chunk(chunk)?;
        self.resolve(mapping, file, true)?;
        let old = mapping.table.get(chunk);
        if let ChunkSlot::Device(device) = old {
            let previous = mapping.table;
            mapping.table.set(chunk, ChunkSlot::Empty);
            self.persist_table(mapping, file, previous)?;
            info!(
                "Relocating chunk {} of {} away from device {}",
                chunk, file.fid, device
            );
        }
        Ok(old)
    }

    /// Put back the slot saved by [`Self::relocate_chunk`]
    ///
    /// Data written by the failed attempt on another device is removed.
    pub fn restore_chunk(
        &self,
        mapping: &mut DeviceMapping,
        file: &FileRef,
        chunk: usize,
        old: ChunkSlot,
    ) -> Result<()> {
        check_chunk(chunk)?;
        self.resolve(mapping, file, true)?;
        let current = mapping.table.get(chunk);
        if current == old {
            return Ok(());
        }
        if let ChunkSlot::Device(device) = current {
            self.remove_data_chunk(device, &file.fid, file.spare, chunk)?;
        }
        let previous = mapping.table;
        match old {
            ChunkSlot::Device(device) => mapping.table.mark_allocated(chunk, device),
            other => {
                mapping.table.set(chunk, other);
                mapping.table.trim_tail();
            }
        }
        self.persist_table(mapping, file, previous)?;
        info!("Restored chunk {} of {} {}", chunk, file.fid, mapping.table.trace());
        Ok(())
    }

    /// Remove one chunk and record it as a hole
    pub fn remove_chunk(
        &self,
        mapping: &RwLock<DeviceMapping>,
        file: &FileRef,
        chunk: usize,
    ) -> Result<()> {
        check_chunk(chunk)?;
        let mut guard = mapping.write();
        self.resolve(&mut guard, file, false)?;
        let ChunkSlot::Device(device) = guard.table.get(chunk) else {
            return Ok(());
        };
        self.remove_data_chunk(device, &file.fid, file.spare, chunk)?;
        let previous = guard.table;
        guard.table.set(chunk, ChunkSlot::Empty);
        guard.table.trim_tail();
        self.persist_table(&mut guard, file, previous)
    }

    /// Unlink the data file of a chunk; a missing file is not an error
    pub fn remove_data_chunk(&self, device: u8, fid: &Fid, spare: bool, chunk: usize) -> Result<()> {
        let path = self
            .unit
            .paths()
            .chunk_file(u32::from(device), spare, fid, chunk);
        remove_if_exists(&path)
            .map(|_| ())
            .map_err(|e| self.io_error(device, IoKind::Remove, e))
    }

    /// Remove every chunk and header copy of a FID, normal and spare
    ///
    /// Another generation of the FID is left alone.
    pub fn remove_file(&self, mapping: &RwLock<DeviceMapping>, fid: &Fid) -> Result<()> {
        let mut guard = mapping.write();
        let mut first_error = None;

        for spare in [false, true] {
            match self.headers.read(fid, spare, false) {
                Ok(header) => {
                    for (chunk, device) in header.chunks.stored_chunks() {
                        if let Err(e) = self.remove_data_chunk(device, fid, spare, chunk) {
                            first_error.get_or_insert(e);
                        }
                    }
                }
                Err(Error::HeaderNotFound) => continue,
                Err(Error::OtherRecyclingCounter { found, .. }) => {
                    debug!("Not removing {} generation {}", fid, found);
                    continue;
                }
                Err(e) => {
                    warn!("Header of {} unreadable ({}), sweeping every device", fid, e);
                    self.sweep_chunks(fid, spare);
                }
            }
            self.headers.remove(fid, spare);
        }

        guard.invalidate();
        guard.rebuilds.clear();
        first_error.map_or(Ok(()), Err)
    }

    fn sweep_chunks(&self, fid: &Fid, spare: bool) {
        for device in self.unit.devices() {
            if !device.status().serves_io() {
                continue;
            }
            for chunk in 0..MAX_CHUNKS_PER_FILE {
                let _ = self.remove_data_chunk(device.index(), fid, spare, chunk);
            }
        }
    }

    // Internals shared with the rebuild coordinator

    /// Load the chunk table if the mapping does not hold it yet
    pub(crate) fn resolve(
        &self,
        mapping: &mut DeviceMapping,
        file: &FileRef,
        update_recycle: bool,
    ) -> Result<()> {
        if mapping.is_resolved_for(file.spare) {
            return Ok(());
        }
        let table = match self.headers.read(&file.fid, file.spare, update_recycle) {
            Ok(header) => header.chunks,
            Err(Error::HeaderNotFound) => ChunkTable::empty_file(),
            Err(e) => return Err(e),
        };
        mapping.resolve(table, file.spare);
        Ok(())
    }

    fn resolve_shared(&self, mapping: &RwLock<DeviceMapping>, file: &FileRef) -> Result<()> {
        if mapping.read().is_resolved_for(file.spare) {
            return Ok(());
        }
        self.resolve(&mut mapping.write(), file, false)
    }

    /// Write the chunk table to every header copy, undoing it on failure
    pub(crate) fn persist_table(
        &self,
        mapping: &mut DeviceMapping,
        file: &FileRef,
        previous: ChunkTable,
    ) -> Result<()> {
        let header = file.header(self.unit, mapping.table);
        if self.headers.write(file.spare, &header) == 0 {
            mapping.table = previous;
            return Err(Error::HeaderWriteFailed);
        }
        Ok(())
    }

    fn geometry(&self, file: &FileRef) -> (u64, u64) {
        (
            self.unit.blocks_per_chunk(file.bsize),
            file.projection_bytes(),
        )
    }

    fn chunk_path(&self, device: u8, file: &FileRef, chunk: usize) -> std::path::PathBuf {
        self.unit
            .paths()
            .chunk_file(u32::from(device), file.spare, &file.fid, chunk)
    }

    /// Write segments `(block_in_chunk, bytes)` into one chunk
    ///
    /// Allocates a device when the chunk is not stored yet and persists the
    /// new table. Returns the file size implied by the chunk's length.
    fn write_chunk(
        &self,
        mapping: &mut DeviceMapping,
        file: &FileRef,
        chunk: usize,
        segments: &[(u64, &[u8])],
    ) -> Result<u64> {
        let (bpc, proj) = self.geometry(file);
        let (device, allocated) = match mapping.table.get(chunk) {
            ChunkSlot::Device(device) => (device, false),
            _ => {
                let excluded = mapping.relocated_from(chunk, file.spare);
                (self.unit.allocate_device_excluding(excluded)?, true)
            }
        };
        self.unit.check_serves_io(device)?;
        let path = self.chunk_path(device, file, chunk);
        if let Some(dir) = path.parent() {
            self.unit.ensure_dir(device, dir)?;
        }

        let start = Instant::now();
        let len = self.pwrite_segments(device, &path, proj, segments)?;
        if let Some(dev) = self.unit.device(device) {
            dev.activity().record_write(start.elapsed());
        }

        if allocated {
            let previous = mapping.table;
            mapping.table.mark_allocated(chunk, device);
            if let Err(e) = self.persist_table(mapping, file, previous) {
                let _ = remove_if_exists(&path);
                return Err(e);
            }
            debug!(
                "Chunk {} of {} allocated on device {} {}",
                chunk,
                file.fid,
                device,
                mapping.table.trace()
            );
        }

        let bytes: usize = segments.iter().map(|(_, data)| data.len()).sum();
        self.unit.consume_space(device, bytes as u64);
        Ok(chunk as u64 * bpc * proj + len)
    }

    fn pwrite_segments(
        &self,
        device: u8,
        path: &Path,
        proj: u64,
        segments: &[(u64, &[u8])],
    ) -> Result<u64> {
        let handle = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| self.io_error(device, IoKind::Write, e))?;
        for (block, data) in segments {
            handle
                .write_all_at(data, block * proj)
                .map_err(|e| self.io_error(device, IoKind::Write, e))?;
        }
        Ok(handle
            .metadata()
            .map_err(|e| self.io_error(device, IoKind::Write, e))?
            .len())
    }

    /// Set a chunk file's length, then append the optional last block
    fn cut_chunk(
        &self,
        device: u8,
        file: &FileRef,
        chunk: usize,
        len: u64,
        last_block: Option<&[u8]>,
    ) -> Result<()> {
        self.unit.check_serves_io(device)?;
        let path = self.chunk_path(device, file, chunk);
        if let Some(dir) = path.parent() {
            self.unit.ensure_dir(device, dir)?;
        }
        let handle = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| self.io_error(device, IoKind::Write, e))?;
        handle
            .set_len(len)
            .map_err(|e| self.io_error(device, IoKind::Write, e))?;
        if let Some(data) = last_block {
            handle
                .write_all_at(data, len)
                .map_err(|e| self.io_error(device, IoKind::Write, e))?;
        }
        Ok(())
    }

    /// Read into `buf` from one chunk; returns the bytes actually present
    fn read_chunk(
        &self,
        mapping: &DeviceMapping,
        file: &FileRef,
        chunk: usize,
        bid: u64,
        buf: &mut [u8],
        file_size: &mut u64,
    ) -> Result<usize> {
        let ChunkSlot::Device(device) = mapping.table.get(chunk) else {
            return Ok(0);
        };
        self.unit.check_serves_io(device)?;
        let (bpc, proj) = self.geometry(file);
        let path = self.chunk_path(device, file, chunk);
        let handle = match File::open(&path) {
            Ok(handle) => handle,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if !self.unit.paths().device_root(u32::from(device)).is_dir() {
                    self.unit.record_error(device, IoKind::Read);
                    return Err(Error::DeviceUnavailable {
                        device,
                        status: "unmounted".to_string(),
                    });
                }
                return Ok(0);
            }
            Err(e) => return Err(self.io_error(device, IoKind::Read, e)),
        };

        let start = Instant::now();
        let read = read_full_at(&handle, buf, bid * proj)
            .map_err(|e| self.io_error(device, IoKind::Read, e))?;
        if let Some(dev) = self.unit.device(device) {
            dev.activity().record_read(start.elapsed());
        }
        if let Ok(meta) = handle.metadata() {
            *file_size = (*file_size).max(chunk as u64 * bpc * proj + meta.len());
        }
        Ok(read)
    }

    /// Map an I/O error, recording it against the device unless it is a
    /// capacity error
    fn io_error(&self, device: u8, kind: IoKind, e: io::Error) -> Error {
        if e.raw_os_error() == Some(libc::ENOSPC) {
            return Error::NoSpaceLeft;
        }
        self.unit.record_error(device, kind);
        Error::Io(e)
    }
}

/// Whether a chunk slot marks the end of the file
fn is_end(mapping: &DeviceMapping, chunk: usize) -> bool {
    chunk >= MAX_CHUNKS_PER_FILE || mapping.table.get(chunk) == ChunkSlot::Eof
}

fn chunk_index(block: u64, blocks_per_chunk: u64) -> Result<usize> {
    let chunk = usize::try_from(block / blocks_per_chunk).unwrap_or(usize::MAX);
    check_chunk(chunk)?;
    Ok(chunk)
}

fn check_chunk(chunk: usize) -> Result<()> {
    if chunk >= MAX_CHUNKS_PER_FILE {
        return Err(Error::FileTooBig { chunk });
    }
    Ok(())
}

fn to_usize(value: u64) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::InvalidArgument(format!("{value} overflows usize")))
}

/// Turn the runs of a bitmap into `(block_in_chunk, bytes)` segments
fn repair_segments<'b>(
    bitmap: &RepairBitmap,
    bid: u64,
    proj: u64,
    bins: &'b [u8],
) -> Result<Vec<(u64, &'b [u8])>> {
    let proj = to_usize(proj)?;
    let mut cursor = 0;
    let mut out = Vec::new();
    for (start, len) in bitmap.runs() {
        let end = cursor + len * proj;
        out.push((bid + start as u64, &bins[cursor..end]));
        cursor = end;
    }
    Ok(out)
}

/// `pread` until `buf` is full or end of file
fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}
