//! Header record and chunk table

use bytes::{Buf, BufMut, BytesMut};
use chunkvault_common::config::MAX_DEVICES;
use chunkvault_common::{
    BlockSizeClass, Cid, Distribution, Error, Fid, Layout, Result, SAFE_MAX, Sid,
};
use std::fmt::Write;

/// Maximum number of chunks of one file
pub const MAX_CHUNKS_PER_FILE: usize = 128;

/// Current header format version
pub const HEADER_VERSION: u8 = 1;

/// Encoded size of a header record
pub const HEADER_RECORD_SIZE: usize = 3 + 16 + SAFE_MAX + MAX_CHUNKS_PER_FILE + 2 + 1 + 4;

const SLOT_UNKNOWN: u8 = 253;
const SLOT_EMPTY: u8 = 254;
const SLOT_EOF: u8 = 255;

/// Where a chunk of a file lives
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChunkSlot {
    /// Stored on this device
    Device(u8),
    /// Hole before the last chunk: reads as zeros
    Empty,
    /// Not known yet (table not loaded)
    Unknown,
    /// Beyond the end of the file
    Eof,
}

impl ChunkSlot {
    const fn encode(self) -> u8 {
        match self {
            Self::Device(device) => device,
            Self::Unknown => SLOT_UNKNOWN,
            Self::Empty => SLOT_EMPTY,
            Self::Eof => SLOT_EOF,
        }
    }

    fn decode(value: u8) -> Result<Self> {
        match value {
            SLOT_UNKNOWN => Ok(Self::Unknown),
            SLOT_EMPTY => Ok(Self::Empty),
            SLOT_EOF => Ok(Self::Eof),
            device if u32::from(device) < MAX_DEVICES => Ok(Self::Device(device)),
            other => Err(Error::CorruptHeader(format!("invalid chunk slot {other}"))),
        }
    }

    /// Device holding the chunk, if any
    #[must_use]
    pub const fn device(self) -> Option<u8> {
        match self {
            Self::Device(device) => Some(device),
            _ => None,
        }
    }
}

/// Chunk-to-device table of a file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkTable([ChunkSlot; MAX_CHUNKS_PER_FILE]);

impl ChunkTable {
    /// Table of a file with no data
    #[must_use]
    pub const fn empty_file() -> Self {
        Self([ChunkSlot::Eof; MAX_CHUNKS_PER_FILE])
    }

    /// Table whose content is not known yet
    #[must_use]
    pub const fn unknown() -> Self {
        Self([ChunkSlot::Unknown; MAX_CHUNKS_PER_FILE])
    }

    /// Slot of a chunk; chunks past the limit read as end of file
    #[must_use]
    pub fn get(&self, chunk: usize) -> ChunkSlot {
        self.0.get(chunk).copied().unwrap_or(ChunkSlot::Eof)
    }

    pub fn set(&mut self, chunk: usize, slot: ChunkSlot) {
        self.0[chunk] = slot;
    }

    /// Record a newly allocated chunk
    ///
    /// Every end-of-file slot before it becomes a hole.
    pub fn mark_allocated(&mut self, chunk: usize, device: u8) {
        for slot in &mut self.0[..chunk] {
            if *slot == ChunkSlot::Eof {
                *slot = ChunkSlot::Empty;
            }
        }
        self.0[chunk] = ChunkSlot::Device(device);
    }

    /// Turn trailing holes into end of file
    pub fn trim_tail(&mut self) {
        for slot in self.0.iter_mut().rev() {
            match slot {
                ChunkSlot::Device(_) => break,
                _ => *slot = ChunkSlot::Eof,
            }
        }
    }

    /// Last chunk stored on a device
    #[must_use]
    pub fn last_stored_chunk(&self) -> Option<(usize, u8)> {
        self.stored_chunks().last()
    }

    /// `(chunk, device)` of every stored chunk
    pub fn stored_chunks(&self) -> impl Iterator<Item = (usize, u8)> + '_ {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(chunk, slot)| slot.device().map(|device| (chunk, device)))
    }

    /// Compact rendering for logs and diagnostics: `/0/E/3/`
    ///
    /// Stops at the first end-of-file slot.
    #[must_use]
    pub fn trace(&self) -> String {
        let mut out = String::from("/");
        for slot in self.0.iter().take_while(|s| **s != ChunkSlot::Eof) {
            match slot {
                ChunkSlot::Device(device) => {
                    let _ = write!(out, "{device}/");
                }
                ChunkSlot::Empty => out.push_str("E/"),
                ChunkSlot::Unknown => out.push_str("?/"),
                ChunkSlot::Eof => {}
            }
        }
        out
    }
}

/// Header record of a file, written on `mapper_redundancy` devices
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderRecord {
    pub layout: Layout,
    pub bsize: BlockSizeClass,
    /// Full FID, recycle counter included
    pub fid: Fid,
    pub distribution: Distribution,
    pub chunks: ChunkTable,
    pub cid: Cid,
    pub sid: Sid,
}

impl HeaderRecord {
    /// Serialize the record, CRC32C last
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HEADER_RECORD_SIZE);
        buf.put_u8(HEADER_VERSION);
        buf.put_u8(self.layout.id());
        buf.put_u8(self.bsize as u8);
        buf.put_slice(self.fid.as_bytes());
        buf.put_slice(&self.distribution.to_raw());
        for slot in &self.chunks.0 {
            buf.put_u8(slot.encode());
        }
        buf.put_u16_le(self.cid.0);
        buf.put_u8(self.sid.0);
        let crc = crc32c::crc32c(&buf);
        buf.put_u32_le(crc);
        buf.to_vec()
    }

    /// Parse and verify a record
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != HEADER_RECORD_SIZE {
            return Err(Error::CorruptHeader(format!(
                "header is {} bytes, expected {HEADER_RECORD_SIZE}",
                data.len()
            )));
        }
        let (body, mut trailer) = data.split_at(HEADER_RECORD_SIZE - 4);
        let stored_crc = trailer.get_u32_le();
        let computed_crc = crc32c::crc32c(body);
        if stored_crc != computed_crc {
            return Err(Error::CorruptHeader(format!(
                "checksum mismatch: stored {stored_crc:08x}, computed {computed_crc:08x}"
            )));
        }

        let mut buf = body;
        let version = buf.get_u8();
        if version != HEADER_VERSION {
            return Err(Error::CorruptHeader(format!(
                "unsupported header version {version}"
            )));
        }
        let layout = Layout::new(buf.get_u8()).map_err(|e| Error::CorruptHeader(e.to_string()))?;
        let bsize =
            BlockSizeClass::from_u8(buf.get_u8()).map_err(|e| Error::CorruptHeader(e.to_string()))?;

        let mut fid = [0u8; 16];
        buf.copy_to_slice(&mut fid);

        let mut dist = [0u8; SAFE_MAX];
        buf.copy_to_slice(&mut dist);

        let mut chunks = ChunkTable::unknown();
        for slot in &mut chunks.0 {
            *slot = ChunkSlot::decode(buf.get_u8())?;
        }

        let cid = Cid(buf.get_u16_le());
        let sid = Sid(buf.get_u8());

        Ok(Self {
            layout,
            bsize,
            fid: Fid::from_bytes(fid),
            distribution: Distribution::from_raw(&dist),
            chunks,
            cid,
            sid,
        })
    }
}
