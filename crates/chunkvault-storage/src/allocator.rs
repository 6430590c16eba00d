//! Device selection
//!
//! Two decisions are made here:
//! - which devices hold the header copies of a file: a pure hash of the
//!   FID ([`mapper_device`]), stable across restarts and generations
//! - which device receives a newly allocated chunk: round robin or least
//!   used over the devices whose status admits allocation
//!
//! Free-block and error counters are double buffered. The monitor thread
//! fills the inactive generation and flips an index; disk threads only ever
//! read or bump the active one, so neither side takes a lock.

use crate::health::DeviceStatus;
use chunkvault_common::config::MAX_DEVICES;
use chunkvault_common::{AllocationPolicy, Error, Fid, Result};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, warn};

const DEVICES: usize = MAX_DEVICES as usize;

const FNV_OFFSET: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// Device holding the header copy of rank `rank`
///
/// Ranks `0..redundancy` of one FID land on distinct devices as long as
/// `redundancy <= modulo`.
#[must_use]
pub fn mapper_device(fid: &Fid, rank: u32, modulo: u32) -> u32 {
    let hash = fid
        .without_recycle()
        .as_bytes()
        .iter()
        .fold(FNV_OFFSET, |h, &b| h.wrapping_mul(FNV_PRIME) ^ u32::from(b));
    hash.wrapping_add(rank) % modulo.max(1)
}

/// Kind of operation that hit an I/O error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoKind {
    Read,
    Write,
    Header,
    Remove,
}

impl IoKind {
    pub const COUNT: usize = 4;

    const fn index(self) -> usize {
        self as usize
    }
}

/// Double-buffered estimate of free blocks per device
pub struct FreeBlockCounters {
    active: AtomicUsize,
    blocks: [[AtomicU64; DEVICES]; 2],
}

impl FreeBlockCounters {
    #[must_use]
    pub fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            blocks: std::array::from_fn(|_| std::array::from_fn(|_| AtomicU64::new(0))),
        }
    }

    /// Current estimate for a device
    pub fn get(&self, device: u8) -> u64 {
        let generation = self.active.load(Ordering::Acquire);
        self.blocks[generation][usize::from(device)].load(Ordering::Relaxed)
    }

    /// Publish fresh figures: fill the inactive generation, then flip
    ///
    /// Only the monitor calls this.
    pub fn publish(&self, free: &[u64]) {
        let next = 1 - self.active.load(Ordering::Acquire);
        for (slot, value) in self.blocks[next].iter().zip(free) {
            slot.store(*value, Ordering::Relaxed);
        }
        for slot in self.blocks[next].iter().skip(free.len()) {
            slot.store(0, Ordering::Relaxed);
        }
        self.active.store(next, Ordering::Release);
    }

    /// Lower the estimate after data was written
    pub fn consume(&self, device: u8, blocks: u64) {
        let generation = self.active.load(Ordering::Acquire);
        let _ = self.blocks[generation][usize::from(device)].fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |free| Some(free.saturating_sub(blocks)),
        );
    }
}

impl Default for FreeBlockCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Double-buffered I/O error counters per device
pub struct ErrorCounters {
    active: AtomicUsize,
    window: [[AtomicU64; DEVICES]; 2],
    totals: [AtomicU64; DEVICES],
    by_kind: [AtomicU64; IoKind::COUNT],
}

impl ErrorCounters {
    #[must_use]
    pub fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            window: std::array::from_fn(|_| std::array::from_fn(|_| AtomicU64::new(0))),
            totals: std::array::from_fn(|_| AtomicU64::new(0)),
            by_kind: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Count one error against a device
    pub fn record(&self, device: u8, kind: IoKind) {
        let generation = self.active.load(Ordering::Acquire);
        self.window[generation][usize::from(device)].fetch_add(1, Ordering::Relaxed);
        self.totals[usize::from(device)].fetch_add(1, Ordering::Relaxed);
        self.by_kind[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Close the current window and return its per-device counts
    ///
    /// Only the monitor calls this.
    pub fn rotate(&self) -> [u32; DEVICES] {
        let previous = self.active.load(Ordering::Acquire);
        self.active.store(1 - previous, Ordering::Release);
        let mut counts = [0u32; DEVICES];
        for (count, slot) in counts.iter_mut().zip(&self.window[previous]) {
            *count = u32::try_from(slot.swap(0, Ordering::Relaxed)).unwrap_or(u32::MAX);
        }
        counts
    }

    /// Errors recorded against a device since startup
    pub fn total(&self, device: u8) -> u64 {
        self.totals[usize::from(device)].load(Ordering::Relaxed)
    }

    /// Errors recorded for a kind of operation since startup
    pub fn total_for(&self, kind: IoKind) -> u64 {
        self.by_kind[kind.index()].load(Ordering::Relaxed)
    }
}

impl Default for ErrorCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Chooses the device of new chunks
pub struct DeviceAllocator {
    policy: AllocationPolicy,
    device_count: u32,
    min_free_blocks: u64,
    next_device: AtomicU32,
    free: FreeBlockCounters,
    errors: ErrorCounters,
}

impl DeviceAllocator {
    #[must_use]
    pub fn new(policy: AllocationPolicy, device_count: u32, min_free_blocks: u64) -> Self {
        Self {
            policy,
            device_count: device_count.min(MAX_DEVICES),
            min_free_blocks,
            next_device: AtomicU32::new(0),
            free: FreeBlockCounters::new(),
            errors: ErrorCounters::new(),
        }
    }

    pub fn free_blocks(&self) -> &FreeBlockCounters {
        &self.free
    }

    pub fn errors(&self) -> &ErrorCounters {
        &self.errors
    }

    /// Record an I/O error against a device
    pub fn record_error(&self, device: u8, kind: IoKind) {
        warn!("I/O error on device {} during {:?}", device, kind);
        self.errors.record(device, kind);
    }

    /// Pick the device of a new chunk
    ///
    /// `status_of` gives the current status of each device. Fails with
    /// [`Error::NoDeviceAvailable`] when no device admits allocation and
    /// with [`Error::NoSpaceLeft`] when every admissible device is full.
    pub fn allocate(&self, status_of: impl Fn(u8) -> DeviceStatus) -> Result<u8> {
        self.allocate_excluding(status_of, None)
    }

    /// Same as [`Self::allocate`], never choosing `excluded`
    pub fn allocate_excluding(
        &self,
        status_of: impl Fn(u8) -> DeviceStatus,
        excluded: Option<u8>,
    ) -> Result<u8> {
        let admits = |device: u8| Some(device) != excluded && status_of(device).admits_allocation();
        let mut admissible = false;
        let has_room = |device: u8| self.free.get(device) >= self.min_free_blocks.max(1);

        let chosen = match self.policy {
            AllocationPolicy::RoundRobin => {
                let start = self.next_device.load(Ordering::Relaxed);
                let mut chosen = None;
                for step in 0..self.device_count {
                    let device = device_index((start + step) % self.device_count);
                    if !admits(device) {
                        continue;
                    }
                    admissible = true;
                    if has_room(device) {
                        self.next_device
                            .store((u32::from(device) + 1) % self.device_count, Ordering::Relaxed);
                        chosen = Some(device);
                        break;
                    }
                }
                chosen
            }
            AllocationPolicy::LeastUsed => {
                let mut best: Option<(u8, u64)> = None;
                for device in (0..self.device_count).map(device_index) {
                    if !admits(device) {
                        continue;
                    }
                    admissible = true;
                    let free = self.free.get(device);
                    if has_room(device) && best.is_none_or(|(_, most)| free > most) {
                        best = Some((device, free));
                    }
                }
                best.map(|(device, _)| device)
            }
        };

        match chosen {
            Some(device) => {
                debug!("Allocated device {} for a new chunk", device);
                Ok(device)
            }
            None if admissible => Err(Error::NoSpaceLeft),
            None => Err(Error::NoDeviceAvailable),
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn device_index(device: u32) -> u8 {
    device as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn all_active(_: u8) -> DeviceStatus {
        DeviceStatus::Active
    }

    #[test]
    fn test_mapper_device_is_stable() {
        let fid = Fid::from_bytes([7; 16]);
        let first = mapper_device(&fid, 0, 4);
        assert_eq!(first, mapper_device(&fid, 0, 4));
        assert_eq!(first, mapper_device(&fid.with_recycle_counter(3), 0, 4));
        assert!(first < 4);
    }

    #[test]
    fn test_mapper_ranks_are_distinct() {
        for _ in 0..100 {
            let fid = Fid::random();
            let devices: HashSet<u32> = (0..3).map(|rank| mapper_device(&fid, rank, 4)).collect();
            assert_eq!(devices.len(), 3);
        }
    }

    #[test]
    fn test_mapper_known_value() {
        // FNV-style fold over sixteen zero bytes
        let fid = Fid::from_bytes([0; 16]);
        let mut h = FNV_OFFSET;
        for _ in 0..16 {
            h = h.wrapping_mul(FNV_PRIME);
        }
        assert_eq!(mapper_device(&fid, 1, 7), h.wrapping_add(1) % 7);
    }

    #[test]
    fn test_free_block_generations() {
        let free = FreeBlockCounters::new();
        assert_eq!(free.get(0), 0);
        free.publish(&[100, 200]);
        assert_eq!(free.get(1), 200);
        free.consume(1, 50);
        assert_eq!(free.get(1), 150);
        free.consume(1, 500);
        assert_eq!(free.get(1), 0);
        free.publish(&[10]);
        assert_eq!(free.get(0), 10);
        assert_eq!(free.get(1), 0);
    }

    #[test]
    fn test_error_window_rotation() {
        let errors = ErrorCounters::new();
        errors.record(2, IoKind::Read);
        errors.record(2, IoKind::Write);
        errors.record(5, IoKind::Write);

        let window = errors.rotate();
        assert_eq!(window[2], 2);
        assert_eq!(window[5], 1);
        assert_eq!(errors.rotate()[2], 0);
        assert_eq!(errors.total(2), 2);
        assert_eq!(errors.total_for(IoKind::Write), 2);
    }

    #[test]
    fn test_round_robin() {
        let allocator = DeviceAllocator::new(AllocationPolicy::RoundRobin, 3, 1);
        allocator.free_blocks().publish(&[10, 10, 10]);
        let picks: Vec<u8> = (0..6).map(|_| allocator.allocate(all_active).unwrap()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_round_robin_skips_failed_and_full() {
        let allocator = DeviceAllocator::new(AllocationPolicy::RoundRobin, 4, 5);
        allocator.free_blocks().publish(&[10, 10, 1, 10]);
        let status = |d: u8| {
            if d == 1 {
                DeviceStatus::Failed
            } else {
                DeviceStatus::Degraded
            }
        };
        let picks: Vec<u8> = (0..4).map(|_| allocator.allocate(status).unwrap()).collect();
        assert_eq!(picks, vec![0, 3, 0, 3]);
    }

    #[test]
    fn test_least_used() {
        let allocator = DeviceAllocator::new(AllocationPolicy::LeastUsed, 3, 1);
        allocator.free_blocks().publish(&[10, 30, 20]);
        assert_eq!(allocator.allocate(all_active).unwrap(), 1);
        allocator.free_blocks().consume(1, 25);
        assert_eq!(allocator.allocate(all_active).unwrap(), 2);
    }

    #[test]
    fn test_allocation_failures() {
        let allocator = DeviceAllocator::new(AllocationPolicy::RoundRobin, 2, 1);
        allocator.free_blocks().publish(&[0, 0]);
        assert!(matches!(
            allocator.allocate(all_active),
            Err(Error::NoSpaceLeft)
        ));
        assert!(matches!(
            allocator.allocate(|_| DeviceStatus::Rebuilding),
            Err(Error::NoDeviceAvailable)
        ));
    }

    #[test]
    fn test_allocate_excluding() {
        let allocator = DeviceAllocator::new(AllocationPolicy::RoundRobin, 3, 1);
        allocator.free_blocks().publish(&[10, 10, 10]);
        let picks: Vec<u8> = (0..4)
            .map(|_| allocator.allocate_excluding(all_active, Some(1)).unwrap())
            .collect();
        assert_eq!(picks, vec![0, 2, 0, 2]);

        let least = DeviceAllocator::new(AllocationPolicy::LeastUsed, 3, 1);
        least.free_blocks().publish(&[10, 30, 20]);
        assert_eq!(least.allocate_excluding(all_active, Some(1)).unwrap(), 2);

        // The excluded device alone is not enough
        let only_one = |d: u8| {
            if d == 2 {
                DeviceStatus::Active
            } else {
                DeviceStatus::Failed
            }
        };
        assert!(matches!(
            allocator.allocate_excluding(only_one, Some(2)),
            Err(Error::NoDeviceAvailable)
        ));
    }
}
