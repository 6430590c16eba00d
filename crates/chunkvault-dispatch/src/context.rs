//! FID contexts
//!
//! Every FID with work in the dispatcher owns one context: the cached chunk
//! table shared with the disk threads, the operation currently handed to a
//! disk thread, and the operations waiting behind it. At most one operation
//! per FID is in flight; the others are released in arrival order once its
//! response has been processed.
//!
//! Contexts live in an arena and are addressed by a stable [`ContextHandle`]
//! that travels with the request through the disk thread and back.

use crate::message::{Opcode, Operation};
use chunkvault_common::{Cid, Fid, Sid};
use chunkvault_storage::{DeviceMapping, SharedMapping};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Index of a context in the arena
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContextHandle(u32);

/// Contexts are keyed by storage unit and generation-free FID
pub type ContextKey = (Cid, Sid, Fid);

/// Operation waiting for the FID to become idle
#[derive(Debug)]
pub(crate) struct PendingOp<R> {
    pub op: Operation,
    pub reply: R,
    pub submitted: Instant,
}

/// Operation handed to a disk thread
#[derive(Debug)]
pub(crate) struct InFlight<R> {
    pub txn: u64,
    pub opcode: Opcode,
    pub fid: Fid,
    pub reply: R,
    pub submitted: Instant,
}

#[derive(Debug)]
pub(crate) struct FidContext<R> {
    pub key: ContextKey,
    /// Recycle counter the cached mapping was loaded for
    pub generation: u8,
    pub mapping: SharedMapping,
    pub in_flight: Option<InFlight<R>>,
    pub pending: VecDeque<PendingOp<R>>,
    pub last_access: Instant,
}

impl<R> FidContext<R> {
    fn new(key: ContextKey, now: Instant) -> Self {
        Self {
            key,
            generation: 0,
            mapping: DeviceMapping::shared(),
            in_flight: None,
            pending: VecDeque::new(),
            last_access: now,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.pending.is_empty()
    }

    /// Idle and holding no rebuild reference
    fn is_evictable(&self) -> bool {
        self.is_idle() && self.mapping.read().running_rebuilds() == 0
    }

    /// Switch the cached mapping to the generation of `fid`
    pub fn prepare_for(&mut self, fid: &Fid) {
        let generation = fid.recycle_counter();
        if generation != self.generation {
            self.mapping = DeviceMapping::shared();
            self.generation = generation;
        }
    }
}

/// Arena of FID contexts with a free list
#[derive(Debug)]
pub(crate) struct ContextTable<R> {
    slots: Vec<Option<FidContext<R>>>,
    free: Vec<u32>,
    index: HashMap<ContextKey, u32>,
}

impl<R> ContextTable<R> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Context of a FID, created on first use
    pub fn lookup_or_insert(&mut self, cid: Cid, sid: Sid, fid: &Fid, now: Instant) -> ContextHandle {
        let key = (cid, sid, fid.without_recycle());
        if let Some(&slot) = self.index.get(&key) {
            return ContextHandle(slot);
        }
        let context = FidContext::new(key, now);
        let slot = if let Some(slot) = self.free.pop() {
            self.slots[slot as usize] = Some(context);
            slot
        } else {
            self.slots.push(Some(context));
            (self.slots.len() - 1) as u32
        };
        self.index.insert(key, slot);
        ContextHandle(slot)
    }

    pub fn get_mut(&mut self, handle: ContextHandle) -> Option<&mut FidContext<R>> {
        self.slots.get_mut(handle.0 as usize)?.as_mut()
    }

    /// Take the operation a response answers, with its context
    ///
    /// `None` when `handle` names no context or `txn` is not the operation
    /// in flight there; the in-flight operation is then left untouched.
    pub fn take_in_flight(
        &mut self,
        handle: ContextHandle,
        txn: u64,
    ) -> Option<(InFlight<R>, &mut FidContext<R>)> {
        let context = self.get_mut(handle)?;
        match context.in_flight.take() {
            Some(in_flight) if in_flight.txn == txn => Some((in_flight, context)),
            other => {
                context.in_flight = other;
                None
            }
        }
    }

    #[cfg(test)]
    pub fn get(&self, handle: ContextHandle) -> Option<&FidContext<R>> {
        self.slots.get(handle.0 as usize)?.as_ref()
    }

    fn release(&mut self, slot: u32) {
        if let Some(context) = self.slots[slot as usize].take() {
            self.index.remove(&context.key);
            self.free.push(slot);
        }
    }

    /// Drop idle contexts
    ///
    /// Contexts unused for `max_idle` go first; if more than `max_contexts`
    /// remain, the least recently used idle ones follow. Returns the number
    /// of contexts dropped.
    pub fn evict_idle(&mut self, max_idle: Duration, max_contexts: usize, now: Instant) -> usize {
        let mut candidates: Vec<(Instant, u32)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, context)| {
                let context = context.as_ref()?;
                context
                    .is_evictable()
                    .then_some((context.last_access, slot as u32))
            })
            .collect();
        candidates.sort_unstable();

        let mut evicted = 0;
        for (last_access, slot) in candidates {
            let expired = now.saturating_duration_since(last_access) >= max_idle;
            if !expired && self.len() <= max_contexts {
                break;
            }
            self.release(slot);
            evicted += 1;
        }
        evicted
    }

    /// Number of contexts with work queued behind an in-flight operation
    pub fn queued(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|context| !context.pending.is_empty())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remove_op(fid: Fid) -> PendingOp<u32> {
        PendingOp {
            op: Operation::Remove { fid },
            reply: 0,
            submitted: Instant::now(),
        }
    }

    #[test]
    fn test_lookup_is_stable_across_generations() {
        let mut table = ContextTable::<u32>::new();
        let now = Instant::now();
        let fid = Fid::random();

        let a = table.lookup_or_insert(Cid(1), Sid(1), &fid, now);
        let b = table.lookup_or_insert(Cid(1), Sid(1), &fid.with_recycle_counter(3), now);
        let c = table.lookup_or_insert(Cid(1), Sid(2), &fid, now);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_generation_switch_resets_mapping() {
        let mut table = ContextTable::<u32>::new();
        let fid = Fid::random();
        let handle = table.lookup_or_insert(Cid(1), Sid(1), &fid, Instant::now());
        let context = table.get_mut(handle).unwrap();

        let first = context.mapping.clone();
        context.prepare_for(&fid);
        assert!(std::sync::Arc::ptr_eq(&first, &context.mapping));

        context.prepare_for(&fid.with_recycle_counter(1));
        assert!(!std::sync::Arc::ptr_eq(&first, &context.mapping));
        assert_eq!(context.generation, 1);
    }

    #[test]
    fn test_take_in_flight_matches_transaction() {
        let mut table = ContextTable::<u32>::new();
        let fid = Fid::random();
        let handle = table.lookup_or_insert(Cid(1), Sid(1), &fid, Instant::now());
        table.get_mut(handle).unwrap().in_flight = Some(InFlight {
            txn: 7,
            opcode: Opcode::Remove,
            fid,
            reply: 42,
            submitted: Instant::now(),
        });

        assert!(table.take_in_flight(handle, 8).is_none());
        assert!(table.get(handle).unwrap().in_flight.is_some());
        assert!(table.take_in_flight(ContextHandle(99), 7).is_none());

        let (in_flight, context) = table.take_in_flight(handle, 7).unwrap();
        assert_eq!(in_flight.reply, 42);
        assert!(context.in_flight.is_none());
        assert!(table.take_in_flight(handle, 7).is_none());
    }

    #[test]
    fn test_evict_idle_spares_busy_contexts() {
        let mut table = ContextTable::<u32>::new();
        let start = Instant::now();
        let idle = Fid::random();
        let busy = Fid::random();

        let idle_handle = table.lookup_or_insert(Cid(1), Sid(1), &idle, start);
        let busy_handle = table.lookup_or_insert(Cid(1), Sid(1), &busy, start);
        table
            .get_mut(busy_handle)
            .unwrap()
            .pending
            .push_back(remove_op(busy));

        let later = start + Duration::from_secs(120);
        assert_eq!(table.evict_idle(Duration::from_secs(60), 1000, later), 1);
        assert!(table.get(idle_handle).is_none());
        assert!(table.get(busy_handle).is_some());
        assert_eq!(table.queued(), 1);
    }

    #[test]
    fn test_evict_over_limit_uses_lru_order() {
        let mut table = ContextTable::<u32>::new();
        let start = Instant::now();
        let fids: Vec<Fid> = (0..4).map(|_| Fid::random()).collect();
        let handles: Vec<_> = fids
            .iter()
            .enumerate()
            .map(|(i, fid)| {
                table.lookup_or_insert(Cid(1), Sid(1), fid, start + Duration::from_secs(i as u64))
            })
            .collect();

        let now = start + Duration::from_secs(10);
        assert_eq!(table.evict_idle(Duration::from_secs(3600), 2, now), 2);
        assert!(table.get(handles[0]).is_none());
        assert!(table.get(handles[1]).is_none());
        assert!(table.get(handles[2]).is_some());
        assert!(table.get(handles[3]).is_some());
    }

    #[test]
    fn test_released_slots_are_reused() {
        let mut table = ContextTable::<u32>::new();
        let start = Instant::now();
        let first = table.lookup_or_insert(Cid(1), Sid(1), &Fid::random(), start);
        table.evict_idle(Duration::ZERO, 0, start);
        let second = table.lookup_or_insert(Cid(1), Sid(1), &Fid::random(), start);
        assert_eq!(first, second);
        assert_eq!(table.len(), 1);
    }
}
