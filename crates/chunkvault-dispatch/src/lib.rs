//! ChunkVault disk dispatch
//!
//! Moves decoded storage operations from a non-blocking event loop to a
//! fixed pool of blocking disk threads and back:
//! - One context per FID serializes its operations in submission order
//! - Bounded request and response channels between the loop and the threads
//! - Per-thread, per-opcode statistics and per-second throughput counters
//! - Text diagnostic commands

pub mod context;
pub mod diag;
pub mod dispatcher;
pub mod message;
pub mod stats;
pub mod worker;

pub use context::ContextHandle;
pub use diag::DiagCommand;
pub use dispatcher::DiskDispatcher;
pub use message::{Completion, Opcode, Operation, Reply};
pub use stats::{DispatchStats, MAX_PENDING_REQUEST, OpcodeSnapshot, StatsSnapshot};
pub use worker::WorkerPool;
