//! File headers
//!
//! A header records, for one FID, its layout, block size class,
//! distribution set and the device of each of its chunks:
//!
//! ```text
//! +---------+--------+-------+-----+--------------+-------------+-----+-----+--------+
//! | version | layout | bsize | fid | distribution | chunk table | cid | sid | crc32c |
//! |   u8    |   u8   |  u8   | 16  |      36      |     128     | u16 | u8  |  u32   |
//! +---------+--------+-------+-----+--------------+-------------+-----+-----+--------+
//! ```
//!
//! Several copies are kept on the devices chosen by the mapper hash.

mod store;
mod types;

pub(crate) use store::remove_if_exists;
pub use store::HeaderStore;
pub use types::{
    ChunkSlot, ChunkTable, HEADER_RECORD_SIZE, HEADER_VERSION, HeaderRecord, MAX_CHUNKS_PER_FILE,
};
