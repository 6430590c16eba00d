//! Disk threads
//!
//! Each thread takes a request from the shared request channel, performs the
//! blocking operation against its storage unit and sends exactly one response
//! back. A thread exits when the request channel is closed.

use crate::message::{DiskRequest, DiskResponse, Operation, Reply};
use crate::stats::DispatchStats;
use chunkvault_common::{Error, Result};
use chunkvault_storage::{ChunkStore, RebuildCoordinator, StorageRegistry};
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, error, info};

/// Fixed set of disk threads
pub struct WorkerPool {
    handles: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `threads` disk threads named `disk-th-<index>`
    pub fn start(
        threads: usize,
        registry: Arc<StorageRegistry>,
        requests: Receiver<DiskRequest>,
        responses: Sender<DiskResponse>,
        stats: Arc<DispatchStats>,
    ) -> Result<Self> {
        let mut handles = Vec::with_capacity(threads);
        for index in 0..threads {
            let worker = Worker {
                index,
                registry: registry.clone(),
                requests: requests.clone(),
                responses: responses.clone(),
                stats: stats.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("disk-th-{index}"))
                .spawn(move || worker.run())
                .map_err(|e| Error::internal(format!("cannot spawn disk thread {index}: {e}")))?;
            handles.push(handle);
        }
        info!("Started {} disk threads", threads);
        Ok(Self { handles })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every thread; the request channel must be closed first
    pub fn join(self) {
        for handle in self.handles {
            let name = handle.thread().name().unwrap_or("disk-th").to_string();
            if handle.join().is_err() {
                error!("Disk thread {} panicked", name);
            }
        }
    }
}

struct Worker {
    index: usize,
    registry: Arc<StorageRegistry>,
    requests: Receiver<DiskRequest>,
    responses: Sender<DiskResponse>,
    stats: Arc<DispatchStats>,
}

impl Worker {
    fn run(self) {
        debug!("Disk thread {} running", self.index);
        while let Ok(request) = self.requests.recv() {
            let start = Instant::now();
            let queue_time = start.saturating_duration_since(request.queued_at);
            let opcode = request.op.opcode();

            self.stats.enter();
            let status = execute(&self.registry, &request);
            self.stats.leave();

            let service_time = start.elapsed();
            self.stats.record(self.index, opcode, &status, service_time);
            if let Err(e) = &status {
                debug!(
                    "{} on {} failed on disk thread {}: {}",
                    opcode,
                    request.op.fid(),
                    self.index,
                    e
                );
            }

            let response = DiskResponse {
                txn: request.txn,
                handle: request.handle,
                thread: self.index,
                status,
                queue_time,
                service_time,
            };
            if self.responses.send(response).is_err() {
                crate::dispatcher::fatal("disk response channel closed");
            }
        }
        debug!("Disk thread {} exiting", self.index);
    }
}

/// Perform one operation
pub(crate) fn execute(registry: &StorageRegistry, request: &DiskRequest) -> Result<Reply> {
    let unit = registry.get(request.cid, request.sid)?;
    let chunks = ChunkStore::new(unit);
    let mapping = &*request.mapping;

    match &request.op {
        Operation::Read {
            file,
            first_block,
            block_count,
        } => chunks
            .read(mapping, file, *first_block, *block_count)
            .map(Reply::Read),
        Operation::Write {
            file,
            first_block,
            block_count,
            bins,
        } => chunks
            .write(mapping, file, *first_block, *block_count, bins)
            .map(Reply::Written),
        Operation::WriteRepair {
            file,
            first_block,
            block_count,
            bitmap,
            bins,
        } => chunks
            .write_repair(mapping, file, *first_block, *block_count, bitmap, bins)
            .map(Reply::Written),
        Operation::Truncate {
            file,
            block,
            last_block,
        } => chunks
            .truncate(mapping, file, *block, last_block.as_deref())
            .map(|file_size| Reply::Truncated { file_size }),
        Operation::Remove { fid } => chunks.remove_file(mapping, fid).map(|()| Reply::Removed),
        Operation::RemoveChunk { file, chunk } => chunks
            .remove_chunk(mapping, file, *chunk)
            .map(|()| Reply::Removed),
        Operation::RebuildStart {
            file,
            chunk,
            relocate,
        } => RebuildCoordinator::new(unit)
            .start(mapping, file, *chunk, *relocate)
            .map(Reply::RebuildStarted),
        Operation::RebuildStop {
            file,
            reference,
            success,
        } => RebuildCoordinator::new(unit)
            .stop(mapping, file, *reference, *success)
            .map(|()| Reply::RebuildStopped),
        Operation::Resize { file } => chunks.resize(mapping, file).map(Reply::Resized),
    }
}
