//! Cached chunk table of one FID
//!
//! The dispatcher keeps one [`DeviceMapping`] per FID it has in flight and
//! hands it to the disk threads behind a lock. The mapping starts
//! unresolved; the first operation that needs it loads the header.

use crate::header::{ChunkSlot, ChunkTable};
use crate::rebuild::RebuildEntry;
use parking_lot::RwLock;
use std::sync::Arc;

/// Chunk table of one FID plus its running rebuilds
#[derive(Clone, Debug)]
pub struct DeviceMapping {
    pub(crate) table: ChunkTable,
    pub(crate) resolved: bool,
    /// Whether the table is the spare file's
    pub(crate) spare: bool,
    pub(crate) rebuilds: Vec<RebuildEntry>,
    pub(crate) next_rebuild_ref: u32,
}

/// Mapping shared between the dispatcher and the disk threads
pub type SharedMapping = Arc<RwLock<DeviceMapping>>;

impl DeviceMapping {
    /// Unresolved mapping
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: ChunkTable::unknown(),
            resolved: false,
            spare: false,
            rebuilds: Vec::new(),
            next_rebuild_ref: 1,
        }
    }

    /// New unresolved mapping behind a shared lock
    #[must_use]
    pub fn shared() -> SharedMapping {
        Arc::new(RwLock::new(Self::new()))
    }

    pub fn table(&self) -> &ChunkTable {
        &self.table
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    /// Whether the table is resolved for the normal or the spare file
    pub fn is_resolved_for(&self, spare: bool) -> bool {
        self.resolved && self.spare == spare
    }

    /// Slot of a chunk
    pub fn slot(&self, chunk: usize) -> ChunkSlot {
        self.table.get(chunk)
    }

    /// Install a table loaded from disk
    pub(crate) fn resolve(&mut self, table: ChunkTable, spare: bool) {
        self.table = table;
        self.resolved = true;
        self.spare = spare;
    }

    /// Forget the cached table, for instance after the file was removed
    pub fn invalidate(&mut self) {
        self.table = ChunkTable::unknown();
        self.resolved = false;
    }

    /// Device a chunk under relocation is moving away from
    ///
    /// Its old data file stays there until the rebuild is confirmed, so new
    /// data of the chunk must land elsewhere.
    pub fn relocated_from(&self, chunk: usize, spare: bool) -> Option<u8> {
        self.rebuilds
            .iter()
            .filter(|e| e.chunk == chunk && e.spare == spare)
            .find_map(|e| match e.previous {
                Some(ChunkSlot::Device(device)) => Some(device),
                _ => None,
            })
    }

    /// Number of rebuilds running on this FID
    pub fn running_rebuilds(&self) -> usize {
        self.rebuilds.len()
    }
}

impl Default for DeviceMapping {
    fn default() -> Self {
        Self::new()
    }
}
