//! Marker files at the root of a device
//!
//! - `PREPARING_DISK`: the device is being prepared and must be rebuilt
//!   before it serves data
//! - `rozofs_spare`: the device is a spare; its content, if any, names the
//!   spare pool it belongs to
//! - `storage_c<cid>_s<sid>_<device>`: the device belongs to that storage
//!   slot; a mark for another slot means the disk was plugged in the wrong
//!   place

use chunkvault_common::{Cid, Sid};
use std::fs;
use std::io;
use std::path::Path;

/// Marker of a device waiting for a rebuild
pub const REBUILD_REQUIRED_MARK: &str = "PREPARING_DISK";

/// Marker of a spare device
pub const SPARE_MARK: &str = "rozofs_spare";

const OWNER_MARK_PREFIX: &str = "storage_c";

/// Owner slot recorded on a device
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OwnerMark {
    pub cid: Cid,
    pub sid: Sid,
    pub device: u8,
}

impl OwnerMark {
    /// File name of this mark
    pub fn file_name(&self) -> String {
        format!(
            "{OWNER_MARK_PREFIX}{}_s{}_{}",
            self.cid, self.sid, self.device
        )
    }

    /// Parse a file name, `None` if it is not an owner mark
    pub fn parse(name: &str) -> Option<Self> {
        let rest = name.strip_prefix(OWNER_MARK_PREFIX)?;
        let (cid, rest) = rest.split_once("_s")?;
        let (sid, device) = rest.split_once('_')?;
        Some(Self {
            cid: Cid(cid.parse().ok()?),
            sid: Sid(sid.parse().ok()?),
            device: device.parse().ok()?,
        })
    }
}

/// Markers found at the root of a device
#[derive(Clone, Debug, Default)]
pub struct DeviceMarks {
    /// `PREPARING_DISK` is present
    pub rebuild_required: bool,
    /// Content of the spare mark, if present
    pub spare: Option<String>,
    /// Owner marks, normally zero or one
    pub owners: Vec<OwnerMark>,
}

impl DeviceMarks {
    /// Scan the root directory of a device
    pub fn scan(device_root: &Path) -> io::Result<Self> {
        let mut marks = Self::default();
        for entry in fs::read_dir(device_root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name == REBUILD_REQUIRED_MARK {
                marks.rebuild_required = true;
            } else if name == SPARE_MARK {
                let content = fs::read_to_string(entry.path()).unwrap_or_default();
                marks.spare = Some(content.trim().to_string());
            } else if let Some(owner) = OwnerMark::parse(name) {
                marks.owners.push(owner);
            }
        }
        Ok(marks)
    }

    /// Whether the device carries a mark for another storage slot
    pub fn owned_by_other(&self, expected: &OwnerMark) -> bool {
        self.owners.iter().any(|owner| owner != expected)
    }

    /// Whether the device is a spare of the given pool
    ///
    /// With no pool configured only unlabeled spares match.
    pub fn is_spare_for(&self, pool: Option<&str>) -> bool {
        match (&self.spare, pool) {
            (None, _) => false,
            (Some(content), None) => content.is_empty(),
            (Some(content), Some(pool)) => content == pool,
        }
    }
}

/// Write the owner mark of a device, replacing any previous one
pub fn write_owner_mark(device_root: &Path, owner: &OwnerMark) -> io::Result<()> {
    let marks = DeviceMarks::scan(device_root)?;
    for stale in marks.owners.iter().filter(|o| *o != owner) {
        fs::remove_file(device_root.join(stale.file_name()))?;
    }
    fs::write(device_root.join(owner.file_name()), b"")
}

/// Remove the rebuild-required mark once the device has been rebuilt
pub fn clear_rebuild_required(device_root: &Path) -> io::Result<()> {
    match fs::remove_file(device_root.join(REBUILD_REQUIRED_MARK)) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn owner(cid: u16, sid: u8, device: u8) -> OwnerMark {
        OwnerMark {
            cid: Cid(cid),
            sid: Sid(sid),
            device,
        }
    }

    #[test]
    fn test_owner_mark_name() {
        let mark = owner(3, 12, 5);
        assert_eq!(mark.file_name(), "storage_c3_s12_5");
        assert_eq!(OwnerMark::parse("storage_c3_s12_5"), Some(mark));
        assert_eq!(OwnerMark::parse("storage_cx_s12_5"), None);
        assert_eq!(OwnerMark::parse("hdr_0"), None);
    }

    #[test]
    fn test_scan_marks() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(REBUILD_REQUIRED_MARK), b"").unwrap();
        fs::write(dir.path().join(SPARE_MARK), b"pool-a\n").unwrap();
        fs::write(dir.path().join("storage_c1_s2_0"), b"").unwrap();
        fs::create_dir(dir.path().join("hdr_0")).unwrap();

        let marks = DeviceMarks::scan(dir.path()).unwrap();
        assert!(marks.rebuild_required);
        assert!(marks.is_spare_for(Some("pool-a")));
        assert!(!marks.is_spare_for(Some("pool-b")));
        assert!(!marks.is_spare_for(None));
        assert_eq!(marks.owners, vec![owner(1, 2, 0)]);
        assert!(!marks.owned_by_other(&owner(1, 2, 0)));
        assert!(marks.owned_by_other(&owner(1, 2, 1)));
    }

    #[test]
    fn test_write_owner_mark_replaces_stale() {
        let dir = tempdir().unwrap();
        write_owner_mark(dir.path(), &owner(1, 1, 4)).unwrap();
        write_owner_mark(dir.path(), &owner(1, 1, 2)).unwrap();

        let marks = DeviceMarks::scan(dir.path()).unwrap();
        assert_eq!(marks.owners, vec![owner(1, 1, 2)]);
    }

    #[test]
    fn test_clear_rebuild_required() {
        let dir = tempdir().unwrap();
        clear_rebuild_required(dir.path()).unwrap();
        fs::write(dir.path().join(REBUILD_REQUIRED_MARK), b"").unwrap();
        clear_rebuild_required(dir.path()).unwrap();
        assert!(!DeviceMarks::scan(dir.path()).unwrap().rebuild_required);
    }
}
