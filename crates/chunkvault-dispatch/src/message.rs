//! Messages exchanged between the dispatcher and the disk threads
//!
//! Requests and responses are owned values moved through the internal
//! channels; the disk thread never shares anything with the event loop but
//! the FID's [`SharedMapping`].

use crate::context::ContextHandle;
use chunkvault_common::{Cid, Fid, Result, Sid};
use chunkvault_storage::{
    FileRef, ReadOutcome, RebuildTicket, RepairBitmap, ResizeOutcome, SharedMapping,
    WriteOutcome,
};
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

/// Operation code of a disk request
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Opcode {
    #[default]
    Read,
    Write,
    WriteRepair,
    Truncate,
    Remove,
    RemoveChunk,
    RebuildStart,
    RebuildStop,
    Resize,
}

impl Opcode {
    pub const COUNT: usize = 9;

    pub const ALL: [Self; Self::COUNT] = [
        Self::Read,
        Self::Write,
        Self::WriteRepair,
        Self::Truncate,
        Self::Remove,
        Self::RemoveChunk,
        Self::RebuildStart,
        Self::RebuildStop,
        Self::Resize,
    ];

    /// Position in per-opcode tables
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::WriteRepair => "write_repair",
            Self::Truncate => "truncate",
            Self::Remove => "remove",
            Self::RemoveChunk => "remove_chunk",
            Self::RebuildStart => "rebuild_start",
            Self::RebuildStop => "rebuild_stop",
            Self::Resize => "resize",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded disk operation
#[derive(Clone, Debug)]
pub enum Operation {
    Read {
        file: FileRef,
        first_block: u64,
        block_count: u32,
    },
    Write {
        file: FileRef,
        first_block: u64,
        block_count: u32,
        bins: Vec<u8>,
    },
    WriteRepair {
        file: FileRef,
        first_block: u64,
        block_count: u32,
        bitmap: RepairBitmap,
        bins: Vec<u8>,
    },
    Truncate {
        file: FileRef,
        /// Full blocks kept
        block: u64,
        /// Partial block appended after them
        last_block: Option<Vec<u8>>,
    },
    /// Remove every chunk and header copy of a FID
    Remove { fid: Fid },
    RemoveChunk { file: FileRef, chunk: usize },
    RebuildStart {
        file: FileRef,
        chunk: usize,
        relocate: bool,
    },
    RebuildStop {
        file: FileRef,
        reference: u32,
        success: bool,
    },
    Resize { file: FileRef },
}

impl Operation {
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::Read { .. } => Opcode::Read,
            Self::Write { .. } => Opcode::Write,
            Self::WriteRepair { .. } => Opcode::WriteRepair,
            Self::Truncate { .. } => Opcode::Truncate,
            Self::Remove { .. } => Opcode::Remove,
            Self::RemoveChunk { .. } => Opcode::RemoveChunk,
            Self::RebuildStart { .. } => Opcode::RebuildStart,
            Self::RebuildStop { .. } => Opcode::RebuildStop,
            Self::Resize { .. } => Opcode::Resize,
        }
    }

    /// FID the operation applies to
    #[must_use]
    pub const fn fid(&self) -> &Fid {
        match self {
            Self::Remove { fid } => fid,
            Self::Read { file, .. }
            | Self::Write { file, .. }
            | Self::WriteRepair { file, .. }
            | Self::Truncate { file, .. }
            | Self::RemoveChunk { file, .. }
            | Self::RebuildStart { file, .. }
            | Self::RebuildStop { file, .. }
            | Self::Resize { file, .. } => &file.fid,
        }
    }
}

/// Successful result of an operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Read(ReadOutcome),
    Written(WriteOutcome),
    Truncated { file_size: u64 },
    Removed,
    RebuildStarted(RebuildTicket),
    RebuildStopped,
    Resized(ResizeOutcome),
}

impl Reply {
    /// Payload bytes moved by the operation
    #[must_use]
    pub fn bytes(&self) -> u64 {
        match self {
            Self::Read(outcome) => outcome.data.len() as u64,
            Self::Written(outcome) => outcome.written,
            _ => 0,
        }
    }
}

/// Request sent to a disk thread
#[derive(Debug)]
pub struct DiskRequest {
    pub(crate) txn: u64,
    pub(crate) handle: ContextHandle,
    pub(crate) cid: Cid,
    pub(crate) sid: Sid,
    pub(crate) op: Operation,
    pub(crate) mapping: SharedMapping,
    pub(crate) queued_at: Instant,
}

/// Response returned by a disk thread, exactly one per request
#[derive(Debug)]
pub struct DiskResponse {
    pub(crate) txn: u64,
    pub(crate) handle: ContextHandle,
    pub(crate) thread: usize,
    pub(crate) status: Result<Reply>,
    /// Time spent waiting for a disk thread
    pub(crate) queue_time: Duration,
    /// Time spent by the disk thread on the operation
    pub(crate) service_time: Duration,
}

/// Completed operation handed back to the caller with its reply handle
#[derive(Debug)]
pub struct Completion {
    pub cid: Cid,
    pub sid: Sid,
    pub fid: Fid,
    pub opcode: Opcode,
    pub status: Result<Reply>,
    /// Disk thread that served the request
    pub thread: usize,
    /// From submission to response, including time queued behind the FID
    pub latency: Duration,
    pub service_time: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_indexes_are_dense() {
        for (i, opcode) in Opcode::ALL.iter().enumerate() {
            assert_eq!(opcode.index(), i);
        }
    }

    #[test]
    fn test_operation_fid() {
        let fid = Fid::random();
        let op = Operation::Remove { fid };
        assert_eq!(op.opcode(), Opcode::Remove);
        assert_eq!(op.fid(), &fid);
    }

    #[test]
    fn test_reply_bytes() {
        let reply = Reply::Written(WriteOutcome {
            written: 100,
            file_size: 200,
        });
        assert_eq!(reply.bytes(), 100);
        assert_eq!(Reply::Removed.bytes(), 0);
    }
}
