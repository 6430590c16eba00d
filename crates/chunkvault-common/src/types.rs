//! Core type definitions for chunkvault
//!
//! This module defines the identifiers shared by every component: file
//! identifiers, cluster and storage ids, layouts, block size classes and
//! distribution sets.

use crate::error::{Error, Result};
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Byte of the FID that carries the recycle counter
pub const FID_RECYCLE_BYTE: usize = 7;

/// Maximum number of storage nodes in a distribution set
pub const SAFE_MAX: usize = 36;

/// Size of the per-block projection header written by the transform layer
pub const PROJECTION_HEADER_BYTES: u64 = 16;

/// 128-bit file identifier
///
/// One byte of the identifier is a recycle counter: when an inode number is
/// reused by the export, the counter is bumped so that the new file can be
/// told apart from stale data of the previous generation. Anything that must
/// be stable across generations (hashing, paths) uses the masked value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct Fid([u8; 16]);

impl Fid {
    /// Create from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Generate a random FID (recycle counter zero)
    #[must_use]
    pub fn random() -> Self {
        Self(*Uuid::new_v4().as_bytes()).without_recycle()
    }

    /// Get as bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Get the recycle counter
    #[must_use]
    pub const fn recycle_counter(&self) -> u8 {
        self.0[FID_RECYCLE_BYTE]
    }

    /// Same FID with another recycle counter
    #[must_use]
    pub const fn with_recycle_counter(self, counter: u8) -> Self {
        let mut bytes = self.0;
        bytes[FID_RECYCLE_BYTE] = counter;
        Self(bytes)
    }

    /// Same FID with the recycle counter masked to zero
    #[must_use]
    pub const fn without_recycle(self) -> Self {
        self.with_recycle_counter(0)
    }

    /// Whether two FIDs designate the same file slot, whatever the generation
    #[must_use]
    pub fn same_slot(&self, other: &Self) -> bool {
        self.without_recycle() == other.without_recycle()
    }

    /// Directory slice of this FID
    ///
    /// XOR of the four 32-bit words of the masked FID, reduced modulo the
    /// slice count. Never depends on the recycle counter.
    #[must_use]
    pub fn slice(&self, slice_count: u32) -> u32 {
        let masked = self.without_recycle().0;
        let folded = masked
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .fold(0u32, |acc, w| acc ^ w);
        folded % slice_count.max(1)
    }

    /// Hyphenated hex rendering of the masked FID, used in file names
    #[must_use]
    pub fn path_name(&self) -> String {
        Uuid::from_bytes(self.without_recycle().0)
            .hyphenated()
            .to_string()
    }
}

impl fmt::Debug for Fid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fid({})", Uuid::from_bytes(self.0))
    }
}

impl fmt::Display for Fid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0))
    }
}

/// Cluster identifier
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct Cid(pub u16);

/// Storage identifier within a cluster
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct Sid(pub u8);

/// Erasure-coding layout of a file
///
/// The storage engine never runs the transform; it only needs the layout to
/// size the projections it stores and to bound the distribution set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Layout(u8);

/// (inverse, forward, safe) per layout id
const LAYOUT_GEOMETRY: [(u8, u8, u8); 3] = [(2, 3, 4), (4, 6, 8), (8, 12, 16)];

impl Layout {
    /// 2 data projections out of 3, 4 storages
    pub const L2_3_4: Self = Self(0);
    /// 4 data projections out of 6, 8 storages
    pub const L4_6_8: Self = Self(1);
    /// 8 data projections out of 12, 16 storages
    pub const L8_12_16: Self = Self(2);

    /// Validate a raw layout id
    pub fn new(id: u8) -> Result<Self> {
        if usize::from(id) < LAYOUT_GEOMETRY.len() {
            Ok(Self(id))
        } else {
            Err(Error::InvalidArgument(format!("unknown layout {id}")))
        }
    }

    /// Raw layout id as stored on disk
    #[must_use]
    pub const fn id(&self) -> u8 {
        self.0
    }

    /// Number of projections needed to rebuild a block
    #[must_use]
    pub const fn inverse(&self) -> u8 {
        LAYOUT_GEOMETRY[self.0 as usize].0
    }

    /// Number of projections written for each block
    #[must_use]
    pub const fn forward(&self) -> u8 {
        LAYOUT_GEOMETRY[self.0 as usize].1
    }

    /// Number of storages in the distribution set
    #[must_use]
    pub const fn safe(&self) -> u8 {
        LAYOUT_GEOMETRY[self.0 as usize].2
    }

    /// Bytes stored on one storage for one block of the file
    #[must_use]
    pub fn projection_bytes(&self, bsize: BlockSizeClass) -> u64 {
        PROJECTION_HEADER_BYTES + bsize.bytes().div_ceil(u64::from(self.inverse()))
    }
}

/// Block size class of a file
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BlockSizeClass {
    B4K = 0,
    B8K = 1,
    B16K = 2,
    B32K = 3,
}

impl BlockSizeClass {
    /// Decode the on-disk class
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::B4K),
            1 => Ok(Self::B8K),
            2 => Ok(Self::B16K),
            3 => Ok(Self::B32K),
            other => Err(Error::InvalidArgument(format!(
                "unknown block size class {other}"
            ))),
        }
    }

    /// Block size in bytes
    #[must_use]
    pub const fn bytes(&self) -> u64 {
        4096 << (*self as u8)
    }
}

/// Ordered list of storage nodes holding the projections of a file
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Distribution(Vec<Sid>);

impl Distribution {
    /// Create a distribution set (at most `SAFE_MAX` entries)
    pub fn new(sids: Vec<Sid>) -> Result<Self> {
        if sids.len() > SAFE_MAX {
            return Err(Error::InvalidArgument(format!(
                "distribution has {} members, max is {SAFE_MAX}",
                sids.len()
            )));
        }
        Ok(Self(sids))
    }

    /// Build from raw sids, dropping the zero padding used on disk
    #[must_use]
    pub fn from_raw(raw: &[u8]) -> Self {
        Self(
            raw.iter()
                .take(SAFE_MAX)
                .take_while(|&&s| s != 0)
                .map(|&s| Sid(s))
                .collect(),
        )
    }

    /// Fixed-size on-disk form, zero padded
    #[must_use]
    pub fn to_raw(&self) -> [u8; SAFE_MAX] {
        let mut raw = [0u8; SAFE_MAX];
        for (slot, sid) in raw.iter_mut().zip(&self.0) {
            *slot = sid.0;
        }
        raw
    }

    /// Members of the set
    #[must_use]
    pub fn as_slice(&self) -> &[Sid] {
        &self.0
    }

    /// Number of members
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether a storage belongs to the set
    #[must_use]
    pub fn contains(&self, sid: Sid) -> bool {
        self.0.contains(&sid)
    }
}
