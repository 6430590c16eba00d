//! On-disk path construction
//!
//! Layout under the storage root:
//! ```text
//! <root>/<device>/hdr_0/<slice>/<fid>              header of a normal file
//! <root>/<device>/hdr_1/<slice>/<fid>              header of a spare file
//! <root>/<device>/bins_0/<slice>/<fid>-<chunk>     chunk of a normal file
//! <root>/<device>/bins_1/<slice>/<fid>-<chunk>     chunk of a spare file
//! ```
//! `<fid>` is the hyphenated hex FID with its recycle counter masked, and
//! `<chunk>` is zero padded to three digits.

use chunkvault_common::Fid;
use std::path::{Path, PathBuf};

/// Builds every path of a storage unit from its root
#[derive(Clone, Debug)]
pub struct PathBuilder {
    root: PathBuf,
    slice_count: u32,
}

impl PathBuilder {
    /// Create a path builder
    pub fn new(root: impl AsRef<Path>, slice_count: u32) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            slice_count: slice_count.max(1),
        }
    }

    /// Storage root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of slices per directory
    pub fn slice_count(&self) -> u32 {
        self.slice_count
    }

    /// Slice of a FID for this storage
    pub fn slice_of(&self, fid: &Fid) -> u32 {
        fid.slice(self.slice_count)
    }

    /// Mount point of a device
    pub fn device_root(&self, device: u32) -> PathBuf {
        self.root.join(device.to_string())
    }

    /// Header directory of a slice
    pub fn hdr_dir(&self, device: u32, spare: bool, slice: u32) -> PathBuf {
        self.device_root(device)
            .join(hdr_dir_name(spare))
            .join(slice.to_string())
    }

    /// Header file of a FID
    pub fn hdr_file(&self, device: u32, spare: bool, fid: &Fid) -> PathBuf {
        self.hdr_dir(device, spare, self.slice_of(fid))
            .join(fid.path_name())
    }

    /// Bins directory of a slice
    pub fn bins_dir(&self, device: u32, spare: bool, slice: u32) -> PathBuf {
        self.device_root(device)
            .join(bins_dir_name(spare))
            .join(slice.to_string())
    }

    /// Chunk data file of a FID
    pub fn chunk_file(&self, device: u32, spare: bool, fid: &Fid, chunk: usize) -> PathBuf {
        self.bins_dir(device, spare, self.slice_of(fid))
            .join(chunk_file_name(fid, chunk))
    }
}

/// `hdr_0` for normal files, `hdr_1` for spare files
pub const fn hdr_dir_name(spare: bool) -> &'static str {
    if spare { "hdr_1" } else { "hdr_0" }
}

/// `bins_0` for normal files, `bins_1` for spare files
pub const fn bins_dir_name(spare: bool) -> &'static str {
    if spare { "bins_1" } else { "bins_0" }
}

/// Name of a chunk file: `<fid>-<chunk:03>`
pub fn chunk_file_name(fid: &Fid, chunk: usize) -> String {
    format!("{}-{chunk:03}", fid.path_name())
}
