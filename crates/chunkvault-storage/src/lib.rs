//! ChunkVault storage engine
//!
//! Device-level storage of file projections:
//! - Chunk files spread over the devices of a storage unit
//! - Redundant per-file headers mapping chunks to devices
//! - Device allocation with double-buffered free-block and error counters
//! - Device health state machine fed by probes and I/O errors
//! - Chunk rebuild and relocation bookkeeping
//! - Background device monitoring

pub mod allocator;
pub mod bitmap;
pub mod chunk;
pub mod header;
pub mod health;
pub mod mapping;
pub mod marker;
pub mod monitor;
pub mod path;
pub mod rebuild;
pub mod registry;
pub mod unit;

pub use allocator::{DeviceAllocator, IoKind, mapper_device};
pub use bitmap::{REPAIR_BITMAP_BITS, RepairBitmap};
pub use chunk::{ChunkStore, FileRef, ReadOutcome, ResizeOutcome, WriteOutcome};
pub use header::{ChunkSlot, ChunkTable, HeaderRecord, HeaderStore, MAX_CHUNKS_PER_FILE};
pub use health::{DeviceStatus, Diagnostic, HealthEvent, HealthThresholds};
pub use mapping::{DeviceMapping, SharedMapping};
pub use monitor::DeviceMonitor;
pub use path::PathBuilder;
pub use rebuild::{RebuildCoordinator, RebuildTicket, finish_device_rebuild, start_device_rebuild};
pub use registry::StorageRegistry;
pub use unit::{DeviceInfo, StorageStat, StorageUnit};
