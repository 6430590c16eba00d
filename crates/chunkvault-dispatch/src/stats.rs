//! Disk thread statistics
//!
//! Counters are plain relaxed atomics updated by the disk threads and read by
//! the diagnostic commands; a snapshot may mix values from two operations.

use crate::message::{Opcode, Reply};
use chunkvault_common::{Error, MAX_DISK_THREADS, Result};
use serde::Serialize;
use std::fmt::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Size of the outstanding-request histogram
pub const MAX_PENDING_REQUEST: usize = 64;

/// Seconds of history kept by the throughput counters
pub const THROUGHPUT_SECONDS: usize = 60;

/// Counters of one opcode on one disk thread
#[derive(Debug, Default)]
struct OpcodeCounters {
    count: AtomicU64,
    nosuchfile: AtomicU64,
    bad_cid_sid: AtomicU64,
    error: AtomicU64,
    nospace: AtomicU64,
    bytes: AtomicU64,
    time_us: AtomicU64,
}

impl OpcodeCounters {
    fn record(&self, status: &Result<Reply>, elapsed: Duration) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        match status {
            Ok(reply) => {
                self.bytes.fetch_add(reply.bytes(), Ordering::Relaxed);
            }
            Err(Error::UnknownStorage { .. }) => {
                self.bad_cid_sid.fetch_add(1, Ordering::Relaxed);
            }
            Err(Error::NoSpaceLeft) => {
                self.nospace.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.is_not_found() => {
                self.nosuchfile.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.error.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self, opcode: Opcode) -> OpcodeSnapshot {
        OpcodeSnapshot {
            opcode,
            count: self.count.load(Ordering::Relaxed),
            nosuchfile: self.nosuchfile.load(Ordering::Relaxed),
            bad_cid_sid: self.bad_cid_sid.load(Ordering::Relaxed),
            error: self.error.load(Ordering::Relaxed),
            nospace: self.nospace.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            time_us: self.time_us.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for counter in [
            &self.count,
            &self.nosuchfile,
            &self.bad_cid_sid,
            &self.error,
            &self.nospace,
            &self.bytes,
            &self.time_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Point-in-time view of one opcode's counters
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct OpcodeSnapshot {
    pub opcode: Opcode,
    pub count: u64,
    pub nosuchfile: u64,
    pub bad_cid_sid: u64,
    pub error: u64,
    pub nospace: u64,
    pub bytes: u64,
    pub time_us: u64,
}

impl OpcodeSnapshot {
    /// Average service time in microseconds
    #[must_use]
    pub fn avg_us(&self) -> u64 {
        if self.count == 0 {
            return 0;
        }
        self.time_us / self.count
    }

    fn add(&mut self, other: &Self) {
        self.count += other.count;
        self.nosuchfile += other.nosuchfile;
        self.bad_cid_sid += other.bad_cid_sid;
        self.error += other.error;
        self.nospace += other.nospace;
        self.bytes += other.bytes;
        self.time_us += other.time_us;
    }
}

/// Counters of one disk thread
#[derive(Debug, Default)]
pub struct ThreadStats {
    ops: [OpcodeCounters; Opcode::COUNT],
}

impl ThreadStats {
    /// Account for one completed operation
    pub fn record(&self, opcode: Opcode, status: &Result<Reply>, elapsed: Duration) {
        self.ops[opcode.index()].record(status, elapsed);
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<OpcodeSnapshot> {
        Opcode::ALL
            .iter()
            .map(|&opcode| self.ops[opcode.index()].snapshot(opcode))
            .collect()
    }

    pub fn reset(&self) {
        self.ops.iter().for_each(OpcodeCounters::reset);
    }
}

/// Per-second read and write byte counters over the last minute
#[derive(Debug)]
pub struct Throughput {
    enabled: AtomicBool,
    stamps: [AtomicU64; THROUGHPUT_SECONDS],
    read: [AtomicU64; THROUGHPUT_SECONDS],
    write: [AtomicU64; THROUGHPUT_SECONDS],
}

/// Bytes moved during one second
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ThroughputSample {
    /// Unix second
    pub second: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
}

impl Default for Throughput {
    fn default() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            stamps: std::array::from_fn(|_| AtomicU64::new(0)),
            read: std::array::from_fn(|_| AtomicU64::new(0)),
            write: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

impl Throughput {
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn record_read(&self, bytes: u64) {
        self.record_at(unix_second(), bytes, 0);
    }

    pub fn record_write(&self, bytes: u64) {
        self.record_at(unix_second(), 0, bytes);
    }

    fn record_at(&self, second: u64, read: u64, write: u64) {
        if !self.is_enabled() || (read == 0 && write == 0) {
            return;
        }
        let slot = (second % THROUGHPUT_SECONDS as u64) as usize;
        if self.stamps[slot].swap(second, Ordering::Relaxed) != second {
            self.read[slot].store(0, Ordering::Relaxed);
            self.write[slot].store(0, Ordering::Relaxed);
        }
        self.read[slot].fetch_add(read, Ordering::Relaxed);
        self.write[slot].fetch_add(write, Ordering::Relaxed);
    }

    /// Samples of the last minute ending at `now`, oldest first
    #[must_use]
    pub fn samples(&self, now: u64) -> Vec<ThroughputSample> {
        let first = now.saturating_sub(THROUGHPUT_SECONDS as u64 - 1);
        (first..=now)
            .map(|second| {
                let slot = (second % THROUGHPUT_SECONDS as u64) as usize;
                let current = self.stamps[slot].load(Ordering::Relaxed) == second;
                ThroughputSample {
                    second,
                    read_bytes: if current {
                        self.read[slot].load(Ordering::Relaxed)
                    } else {
                        0
                    },
                    write_bytes: if current {
                        self.write[slot].load(Ordering::Relaxed)
                    } else {
                        0
                    },
                }
            })
            .collect()
    }

    pub fn reset(&self) {
        for slot in 0..THROUGHPUT_SECONDS {
            self.stamps[slot].store(0, Ordering::Relaxed);
            self.read[slot].store(0, Ordering::Relaxed);
            self.write[slot].store(0, Ordering::Relaxed);
        }
    }
}

/// Statistics shared by the dispatcher and its disk threads
#[derive(Debug)]
pub struct DispatchStats {
    threads: Vec<ThreadStats>,
    /// Outstanding requests seen at each submission
    pending: [AtomicU64; MAX_PENDING_REQUEST],
    /// Disk threads busy at once, sampled when a thread picks a request
    parallel: [AtomicU64; MAX_DISK_THREADS],
    active: AtomicUsize,
    throughput: Throughput,
}

/// Serializable view of every counter
#[derive(Clone, Debug, Serialize)]
pub struct StatsSnapshot {
    pub threads: Vec<Vec<OpcodeSnapshot>>,
    pub totals: Vec<OpcodeSnapshot>,
    pub pending: Vec<u64>,
    pub parallel: Vec<u64>,
}

impl DispatchStats {
    #[must_use]
    pub fn new(threads: usize) -> Self {
        Self {
            threads: (0..threads).map(|_| ThreadStats::default()).collect(),
            pending: std::array::from_fn(|_| AtomicU64::new(0)),
            parallel: std::array::from_fn(|_| AtomicU64::new(0)),
            active: AtomicUsize::new(0),
            throughput: Throughput::default(),
        }
    }

    /// Counters of disk thread `index`
    ///
    /// # Panics
    ///
    /// If `index` is not a thread of the pool.
    #[must_use]
    pub fn thread(&self, index: usize) -> &ThreadStats {
        &self.threads[index]
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn throughput(&self) -> &Throughput {
        &self.throughput
    }

    /// Record the number of requests outstanding when a new one is submitted
    pub fn record_pending(&self, outstanding: usize) {
        let bucket = outstanding.min(MAX_PENDING_REQUEST - 1);
        self.pending[bucket].fetch_add(1, Ordering::Relaxed);
    }

    /// A disk thread starts an operation
    pub fn enter(&self) {
        let busy = self.active.fetch_add(1, Ordering::Relaxed) + 1;
        let bucket = busy.clamp(1, MAX_DISK_THREADS) - 1;
        self.parallel[bucket].fetch_add(1, Ordering::Relaxed);
    }

    /// A disk thread is done with its operation
    pub fn leave(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Disk threads currently busy
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Account for a completed operation and feed the throughput counters
    pub fn record(&self, thread: usize, opcode: Opcode, status: &Result<Reply>, elapsed: Duration) {
        if let Some(stats) = self.threads.get(thread) {
            stats.record(opcode, status, elapsed);
        }
        if let Ok(reply) = status {
            match opcode {
                Opcode::Read => self.throughput.record_read(reply.bytes()),
                Opcode::Write | Opcode::WriteRepair => {
                    self.throughput.record_write(reply.bytes());
                }
                _ => {}
            }
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let threads: Vec<Vec<OpcodeSnapshot>> =
            self.threads.iter().map(ThreadStats::snapshot).collect();
        let mut totals: Vec<OpcodeSnapshot> = Opcode::ALL
            .iter()
            .map(|&opcode| OpcodeSnapshot {
                opcode,
                ..Default::default()
            })
            .collect();
        for thread in &threads {
            for (total, op) in totals.iter_mut().zip(thread) {
                total.add(op);
            }
        }
        StatsSnapshot {
            threads,
            totals,
            pending: self
                .pending
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect(),
            parallel: self.parallel[..self.threads.len().clamp(1, MAX_DISK_THREADS)]
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect(),
        }
    }

    /// Zero every counter; throughput history included
    pub fn reset(&self) {
        self.threads.iter().for_each(ThreadStats::reset);
        for counter in self.pending.iter().chain(self.parallel.iter()) {
            counter.store(0, Ordering::Relaxed);
        }
        self.throughput.reset();
    }

    /// Text table of the per-opcode counters
    #[must_use]
    pub fn render(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<14} {:>10} {:>10} {:>10} {:>10} {:>10} {:>14} {:>10}",
            "opcode", "count", "nosuchfile", "badCidSid", "error", "nospace", "bytes", "avg_us"
        );
        for (index, thread) in snapshot.threads.iter().enumerate() {
            if thread.iter().all(|op| op.count == 0) {
                continue;
            }
            let _ = writeln!(out, "disk-th-{index}");
            render_rows(&mut out, thread);
        }
        let _ = writeln!(out, "total");
        render_rows(&mut out, &snapshot.totals);
        out
    }

    /// Text rendering of the pending and parallel histograms
    #[must_use]
    pub fn render_histograms(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = String::new();
        let _ = writeln!(out, "outstanding requests at submission:");
        for (outstanding, count) in snapshot.pending.iter().enumerate() {
            if *count > 0 {
                let _ = writeln!(out, "  {outstanding:>3}: {count}");
            }
        }
        let _ = writeln!(out, "busy disk threads:");
        for (busy, count) in snapshot.parallel.iter().enumerate() {
            if *count > 0 {
                let _ = writeln!(out, "  {:>3}: {count}", busy + 1);
            }
        }
        out
    }
}

fn render_rows(out: &mut String, ops: &[OpcodeSnapshot]) {
    for op in ops.iter().filter(|op| op.count > 0) {
        let _ = writeln!(
            out,
            "  {:<12} {:>10} {:>10} {:>10} {:>10} {:>10} {:>14} {:>10}",
            op.opcode.as_str(),
            op.count,
            op.nosuchfile,
            op.bad_cid_sid,
            op.error,
            op.nospace,
            op.bytes,
            op.avg_us()
        );
    }
}

pub(crate) fn unix_second() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
