//! Disk dispatcher
//!
//! The dispatcher runs on the event loop thread and never blocks on disk.
//! It owns the FID contexts, hands at most one request per FID to the disk
//! threads and releases the next one when the response comes back:
//!
//! ```text
//!  submit ──► context idle? ──yes──► request channel ──► disk-th-N
//!                 │ no                                       │
//!                 ▼                                          ▼
//!           pending FIFO ◄──── release next ◄──── poll ◄── response channel
//! ```
//!
//! A failure of the internal channels means a disk thread or the event loop
//! is gone; the process cannot keep serving consistent replies and exits.

use crate::context::{ContextHandle, ContextTable, InFlight, PendingOp};
use crate::diag::DiagCommand;
use crate::message::{Completion, DiskRequest, DiskResponse, Operation};
use crate::stats::DispatchStats;
use crate::worker::WorkerPool;
use chunkvault_common::{Cid, DispatcherConfig, Result, Sid};
use chunkvault_storage::StorageRegistry;
use crossbeam_channel::{
    Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError, bounded,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Interval between two idle-context sweeps
const EVICTION_PERIOD: Duration = Duration::from_secs(1);

/// Log the broken channel and terminate the process
pub(crate) fn fatal(what: &str) -> ! {
    error!("Fatal disk dispatch error: {}", what);
    std::process::exit(1)
}

/// Event-loop side of the disk thread pool
///
/// `R` is the caller's opaque reply handle, returned untouched with the
/// [`Completion`] of its operation.
pub struct DiskDispatcher<R> {
    registry: Arc<StorageRegistry>,
    contexts: ContextTable<R>,
    requests: Option<Sender<DiskRequest>>,
    responses: Receiver<DiskResponse>,
    /// Requests that found the request channel full
    backlog: VecDeque<DiskRequest>,
    pool: Option<WorkerPool>,
    stats: Arc<DispatchStats>,
    next_txn: u64,
    outstanding: usize,
    context_idle: Duration,
    max_contexts: usize,
    last_eviction: Instant,
}

impl<R> DiskDispatcher<R> {
    /// Create the channels and start the disk threads
    pub fn start(registry: Arc<StorageRegistry>, config: &DispatcherConfig) -> Result<Self> {
        let (request_tx, request_rx) = bounded(config.channel_capacity);
        let (response_tx, response_rx) = bounded(config.channel_capacity);
        let stats = Arc::new(DispatchStats::new(config.threads));
        let pool = WorkerPool::start(
            config.threads,
            registry.clone(),
            request_rx,
            response_tx,
            stats.clone(),
        )?;
        info!(
            "Disk dispatcher started: {} threads, channel capacity {}",
            config.threads, config.channel_capacity
        );

        Ok(Self {
            registry,
            contexts: ContextTable::new(),
            requests: Some(request_tx),
            responses: response_rx,
            backlog: VecDeque::new(),
            pool: Some(pool),
            stats,
            next_txn: 1,
            outstanding: 0,
            context_idle: Duration::from_secs(config.context_idle_secs),
            max_contexts: config.max_contexts,
            last_eviction: Instant::now(),
        })
    }

    pub fn registry(&self) -> &Arc<StorageRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }

    /// Submitted operations not completed yet
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Cached FID contexts
    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    /// Queue an operation
    ///
    /// The operation goes to a disk thread at once when its FID is idle,
    /// otherwise it waits behind the FID's in-flight operation.
    pub fn submit(&mut self, cid: Cid, sid: Sid, op: Operation, reply: R) {
        let now = Instant::now();
        self.stats.record_pending(self.outstanding);
        self.outstanding += 1;

        let handle = self.contexts.lookup_or_insert(cid, sid, op.fid(), now);
        let Some(context) = self.contexts.get_mut(handle) else {
            fatal("FID context vanished on submit");
        };
        context.last_access = now;
        if context.in_flight.is_some() {
            context.pending.push_back(PendingOp {
                op,
                reply,
                submitted: now,
            });
            return;
        }
        self.launch(handle, op, reply, now);
    }

    /// Hand an operation of an idle context to the disk threads
    fn launch(&mut self, handle: ContextHandle, op: Operation, reply: R, submitted: Instant) {
        let txn = self.next_txn;
        self.next_txn = self.next_txn.wrapping_add(1);

        let Some(context) = self.contexts.get_mut(handle) else {
            fatal("FID context vanished on launch");
        };
        context.prepare_for(op.fid());
        context.in_flight = Some(InFlight {
            txn,
            opcode: op.opcode(),
            fid: *op.fid(),
            reply,
            submitted,
        });
        let (cid, sid, _) = context.key;
        let request = DiskRequest {
            txn,
            handle,
            cid,
            sid,
            op,
            mapping: context.mapping.clone(),
            queued_at: Instant::now(),
        };
        if self.backlog.is_empty() {
            self.send(request);
        } else {
            self.backlog.push_back(request);
        }
    }

    fn send(&mut self, request: DiskRequest) {
        let Some(requests) = &self.requests else {
            fatal("disk request channel used after shutdown");
        };
        match requests.try_send(request) {
            Ok(()) => {}
            Err(TrySendError::Full(request)) => {
                debug!("Disk request channel full, {} backlogged", self.backlog.len() + 1);
                self.backlog.push_back(request);
            }
            Err(TrySendError::Disconnected(_)) => fatal("disk request channel closed"),
        }
    }

    /// Move backlogged requests into the channel while it has room
    fn flush_backlog(&mut self) {
        let Some(requests) = &self.requests else {
            return;
        };
        while let Some(request) = self.backlog.pop_front() {
            match requests.try_send(request) {
                Ok(()) => {}
                Err(TrySendError::Full(request)) => {
                    self.backlog.push_front(request);
                    break;
                }
                Err(TrySendError::Disconnected(_)) => fatal("disk request channel closed"),
            }
        }
    }

    /// Process every response already available, without blocking
    ///
    /// `on_complete` runs once per completed operation, in completion order.
    /// Returns the number of completions.
    pub fn poll(&mut self, mut on_complete: impl FnMut(R, Completion)) -> usize {
        self.flush_backlog();
        let mut completed = 0;
        loop {
            match self.responses.try_recv() {
                Ok(response) => {
                    self.complete(response, &mut on_complete);
                    completed += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => fatal("disk response channel closed"),
            }
        }
        self.housekeeping();
        completed
    }

    /// Wait up to `timeout` for a response, then process all available ones
    pub fn poll_timeout(
        &mut self,
        timeout: Duration,
        mut on_complete: impl FnMut(R, Completion),
    ) -> usize {
        self.flush_backlog();
        if self.outstanding == 0 {
            self.housekeeping();
            return 0;
        }
        match self.responses.recv_timeout(timeout) {
            Ok(response) => {
                self.complete(response, &mut on_complete);
                1 + self.poll(on_complete)
            }
            Err(RecvTimeoutError::Timeout) => {
                self.housekeeping();
                0
            }
            Err(RecvTimeoutError::Disconnected) => fatal("disk response channel closed"),
        }
    }

    /// Block until every submitted operation has completed
    pub fn drain(&mut self, mut on_complete: impl FnMut(R, Completion)) {
        while self.outstanding > 0 {
            self.poll_timeout(Duration::from_millis(100), &mut on_complete);
        }
    }

    fn complete(&mut self, response: DiskResponse, on_complete: &mut impl FnMut(R, Completion)) {
        let now = Instant::now();
        let Some((in_flight, context)) = self.contexts.take_in_flight(response.handle, response.txn)
        else {
            fatal(&format!(
                "disk response {} matches no operation in flight",
                response.txn
            ));
        };
        context.last_access = now;
        let (cid, sid, _) = context.key;
        let next = context.pending.pop_front();
        self.outstanding = self.outstanding.saturating_sub(1);

        on_complete(
            in_flight.reply,
            Completion {
                cid,
                sid,
                fid: in_flight.fid,
                opcode: in_flight.opcode,
                status: response.status,
                thread: response.thread,
                latency: now.saturating_duration_since(in_flight.submitted),
                service_time: response.service_time,
            },
        );
        if response.queue_time > Duration::from_secs(1) {
            debug!(
                "{} on {} waited {:?} for a disk thread",
                in_flight.opcode, in_flight.fid, response.queue_time
            );
        }

        if let Some(pending) = next {
            self.launch(response.handle, pending.op, pending.reply, pending.submitted);
        }
    }

    fn housekeeping(&mut self) {
        let now = Instant::now();
        if now.saturating_duration_since(self.last_eviction) < EVICTION_PERIOD {
            return;
        }
        self.last_eviction = now;
        let evicted = self
            .contexts
            .evict_idle(self.context_idle, self.max_contexts, now);
        if evicted > 0 {
            debug!(
                "Evicted {} idle FID contexts, {} left",
                evicted,
                self.contexts.len()
            );
        }
    }

    /// Run a text diagnostic command
    pub fn diag(&self, line: &str) -> String {
        let command = match line.parse::<DiagCommand>() {
            Ok(command) => command,
            Err(e) => return format!("{e}\n"),
        };
        let mut out = match command.execute(&self.stats) {
            Ok(out) => out,
            Err(e) => return format!("{e}\n"),
        };
        if command == DiagCommand::Pending {
            out.push_str(&format!(
                "outstanding: {}, backlog: {}, contexts: {}, queued contexts: {}, busy threads: {}\n",
                self.outstanding,
                self.backlog.len(),
                self.contexts.len(),
                self.contexts.queued(),
                self.stats.active()
            ));
        }
        out
    }

    /// Close the request channel and wait for the disk threads
    ///
    /// Responses still arriving are dropped.
    pub fn shutdown(&mut self) {
        let Some(pool) = self.pool.take() else {
            return;
        };
        self.backlog.clear();
        self.requests = None;
        let mut dropped = 0;
        for _ in self.responses.iter() {
            dropped += 1;
        }
        pool.join();
        info!(
            "Disk dispatcher stopped ({} responses dropped, {} operations abandoned)",
            dropped, self.outstanding
        );
    }
}

impl<R> Drop for DiskDispatcher<R> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Opcode, Reply};
    use chunkvault_common::{
        BlockSizeClass, Distribution, Error, Fid, Layout, StorageUnitConfig,
    };
    use chunkvault_storage::{FileRef, HealthThresholds, RepairBitmap, StorageUnit};
    use rand::RngCore;
    use std::path::Path;
    use tempfile::tempdir;

    fn registry(root: &Path) -> Arc<StorageRegistry> {
        let config = StorageUnitConfig {
            cid: 1,
            sid: 1,
            root: root.to_path_buf(),
            device_number: 4,
            mapper_modulo: 4,
            mapper_redundancy: 2,
            slice_count: 4,
            chunk_data_bytes: 8192 * 4096,
            min_free_blocks: 1,
            check_mountpoint: false,
            ..Default::default()
        };
        let unit = StorageUnit::create(config, HealthThresholds::default()).unwrap();
        let mut registry = StorageRegistry::new();
        registry.insert(unit).unwrap();
        Arc::new(registry)
    }

    fn dispatcher(registry: Arc<StorageRegistry>, threads: usize, capacity: usize) -> DiskDispatcher<u32> {
        let config = DispatcherConfig {
            threads,
            channel_capacity: capacity,
            ..Default::default()
        };
        DiskDispatcher::start(registry, &config).unwrap()
    }

    fn file(fid: Fid) -> FileRef {
        FileRef {
            fid,
            spare: false,
            layout: Layout::L2_3_4,
            bsize: BlockSizeClass::B4K,
            distribution: Distribution::new(vec![Sid(1), Sid(2), Sid(3), Sid(4)]).unwrap(),
        }
    }

    fn payload(file: &FileRef, blocks: u32) -> Vec<u8> {
        let mut data = vec![0u8; (file.projection_bytes() * u64::from(blocks)) as usize];
        rand::thread_rng().fill_bytes(&mut data);
        data
    }

    fn run(dispatcher: &mut DiskDispatcher<u32>) -> Vec<(u32, Completion)> {
        let mut done = Vec::new();
        dispatcher.drain(|reply, completion| done.push((reply, completion)));
        done
    }

    #[test]
    fn test_write_then_read_same_fid() {
        let dir = tempdir().unwrap();
        let mut dispatcher = dispatcher(registry(dir.path()), 4, 16);
        let file = file(Fid::random());
        let data = payload(&file, 3);

        dispatcher.submit(
            Cid(1),
            Sid(1),
            Operation::Write {
                file: file.clone(),
                first_block: 0,
                block_count: 3,
                bins: data.clone(),
            },
            1,
        );
        dispatcher.submit(
            Cid(1),
            Sid(1),
            Operation::Read {
                file: file.clone(),
                first_block: 0,
                block_count: 3,
            },
            2,
        );
        assert_eq!(dispatcher.outstanding(), 2);

        let done = run(&mut dispatcher);
        assert_eq!(done.len(), 2);
        assert_eq!(done[0].0, 1);
        assert_eq!(done[1].0, 2);
        match &done[1].1.status {
            Ok(Reply::Read(outcome)) => assert_eq!(outcome.data, data),
            other => panic!("unexpected read status: {other:?}"),
        }
        assert_eq!(dispatcher.outstanding(), 0);
    }

    #[test]
    fn test_same_fid_operations_complete_in_submission_order() {
        let dir = tempdir().unwrap();
        let mut dispatcher = dispatcher(registry(dir.path()), 8, 4);
        let files: Vec<FileRef> = (0..3).map(|_| file(Fid::random())).collect();

        let mut reply = 0u32;
        for round in 0..10u64 {
            for f in &files {
                let bins = payload(f, 1);
                dispatcher.submit(
                    Cid(1),
                    Sid(1),
                    Operation::Write {
                        file: f.clone(),
                        first_block: round,
                        block_count: 1,
                        bins,
                    },
                    reply,
                );
                reply += 1;
            }
        }

        let done = run(&mut dispatcher);
        assert_eq!(done.len(), 30);
        for f in &files {
            let order: Vec<u32> = done
                .iter()
                .filter(|(_, c)| c.fid == f.fid)
                .map(|(r, _)| *r)
                .collect();
            assert_eq!(order.len(), 10);
            assert!(order.windows(2).all(|w| w[0] < w[1]), "{order:?}");
        }
        for (_, completion) in &done {
            assert!(completion.status.is_ok(), "{:?}", completion.status);
        }
        // Last write of every file extends it to 10 blocks
        for f in &files {
            let last = done.iter().rev().find(|(_, c)| c.fid == f.fid).unwrap();
            match &last.1.status {
                Ok(Reply::Written(outcome)) => {
                    assert_eq!(outcome.file_size, 10 * f.projection_bytes());
                }
                other => panic!("unexpected status: {other:?}"),
            }
        }
    }

    #[test]
    fn test_unknown_storage_is_counted() {
        let dir = tempdir().unwrap();
        let mut dispatcher = dispatcher(registry(dir.path()), 2, 8);
        let file = file(Fid::random());

        dispatcher.submit(Cid(7), Sid(7), Operation::Resize { file }, 1);
        let done = run(&mut dispatcher);
        assert!(matches!(
            done[0].1.status,
            Err(Error::UnknownStorage { cid: 7, sid: 7 })
        ));

        let totals = dispatcher.stats().snapshot().totals;
        assert_eq!(totals[Opcode::Resize.index()].bad_cid_sid, 1);
    }

    #[test]
    fn test_inconsistent_repair_is_reported() {
        let dir = tempdir().unwrap();
        let mut dispatcher = dispatcher(registry(dir.path()), 2, 8);
        let file = file(Fid::random());
        let bins = payload(&file, 1);

        dispatcher.submit(
            Cid(1),
            Sid(1),
            Operation::WriteRepair {
                file,
                first_block: 0,
                block_count: 1,
                bitmap: RepairBitmap::from_positions([0, 1]),
                bins,
            },
            1,
        );
        let done = run(&mut dispatcher);
        let status = &done[0].1.status;
        assert!(matches!(status, Err(e) if e.is_consistency()), "{status:?}");
    }

    #[test]
    fn test_rebuild_start_stop_through_dispatcher() {
        let dir = tempdir().unwrap();
        let mut dispatcher = dispatcher(registry(dir.path()), 2, 8);
        let file = file(Fid::random());
        let bins = payload(&file, 2);

        dispatcher.submit(
            Cid(1),
            Sid(1),
            Operation::Write {
                file: file.clone(),
                first_block: 0,
                block_count: 2,
                bins,
            },
            1,
        );
        dispatcher.submit(
            Cid(1),
            Sid(1),
            Operation::RebuildStart {
                file: file.clone(),
                chunk: 0,
                relocate: false,
            },
            2,
        );
        let done = run(&mut dispatcher);
        let ticket = match &done[1].1.status {
            Ok(Reply::RebuildStarted(ticket)) => *ticket,
            other => panic!("unexpected status: {other:?}"),
        };

        // The context holds a rebuild reference and must survive eviction
        dispatcher.contexts.evict_idle(Duration::ZERO, 0, Instant::now());
        assert_eq!(dispatcher.context_count(), 1);

        dispatcher.submit(
            Cid(1),
            Sid(1),
            Operation::RebuildStop {
                file: file.clone(),
                reference: ticket.reference,
                success: true,
            },
            3,
        );
        let done = run(&mut dispatcher);
        assert!(matches!(done[0].1.status, Ok(Reply::RebuildStopped)));

        dispatcher.contexts.evict_idle(Duration::ZERO, 0, Instant::now());
        assert_eq!(dispatcher.context_count(), 0);
    }

    #[test]
    fn test_truncate_resize_and_remove() {
        let dir = tempdir().unwrap();
        let mut dispatcher = dispatcher(registry(dir.path()), 3, 8);
        let file = file(Fid::random());
        let bins = payload(&file, 4);
        let proj = file.projection_bytes();

        dispatcher.submit(
            Cid(1),
            Sid(1),
            Operation::Write {
                file: file.clone(),
                first_block: 0,
                block_count: 4,
                bins,
            },
            1,
        );
        dispatcher.submit(
            Cid(1),
            Sid(1),
            Operation::Truncate {
                file: file.clone(),
                block: 2,
                last_block: None,
            },
            2,
        );
        dispatcher.submit(Cid(1), Sid(1), Operation::Resize { file: file.clone() }, 3);
        dispatcher.submit(Cid(1), Sid(1), Operation::Remove { fid: file.fid }, 4);
        dispatcher.submit(
            Cid(1),
            Sid(1),
            Operation::Read {
                file: file.clone(),
                first_block: 0,
                block_count: 1,
            },
            5,
        );

        let done = run(&mut dispatcher);
        let replies: Vec<u32> = done.iter().map(|(r, _)| *r).collect();
        assert_eq!(replies, vec![1, 2, 3, 4, 5]);
        assert!(matches!(
            done[1].1.status,
            Ok(Reply::Truncated { file_size }) if file_size == 2 * proj
        ));
        match &done[2].1.status {
            Ok(Reply::Resized(outcome)) => assert_eq!(outcome.nb_blocks, 2),
            other => panic!("unexpected status: {other:?}"),
        }
        assert!(matches!(done[3].1.status, Ok(Reply::Removed)));
        match &done[4].1.status {
            Ok(Reply::Read(outcome)) => {
                assert!(outcome.data.is_empty());
                assert_eq!(outcome.file_size, 0);
            }
            other => panic!("unexpected status: {other:?}"),
        }
    }

    #[test]
    fn test_backlog_when_channel_is_full() {
        let dir = tempdir().unwrap();
        let mut dispatcher = dispatcher(registry(dir.path()), 1, 1);
        let files: Vec<FileRef> = (0..16).map(|_| file(Fid::random())).collect();

        for (i, f) in files.iter().enumerate() {
            dispatcher.submit(Cid(1), Sid(1), Operation::Resize { file: f.clone() }, i as u32);
        }
        assert_eq!(dispatcher.outstanding(), 16);

        let done = run(&mut dispatcher);
        assert_eq!(done.len(), 16);
        assert!(done.iter().all(|(_, c)| c.status.is_ok()));
        assert!(dispatcher.backlog.is_empty());

        let pending = dispatcher.stats().snapshot().pending;
        assert_eq!(pending.iter().sum::<u64>(), 16);
    }

    #[test]
    fn test_diag_commands() {
        let dir = tempdir().unwrap();
        let mut dispatcher = dispatcher(registry(dir.path()), 2, 8);
        assert!(dispatcher.diag("throughput on").contains("enabled"));

        let file = file(Fid::random());
        let bins = payload(&file, 1);
        dispatcher.submit(
            Cid(1),
            Sid(1),
            Operation::Write {
                file,
                first_block: 0,
                block_count: 1,
                bins,
            },
            1,
        );
        run(&mut dispatcher);

        assert!(dispatcher.diag("stats").contains("write"));
        assert!(dispatcher.diag("pending").contains("outstanding: 0"));
        assert!(dispatcher.diag("bogus").contains("unknown diagnostic command"));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut dispatcher = dispatcher(registry(dir.path()), 2, 8);
        dispatcher.shutdown();
        dispatcher.shutdown();
    }
}
