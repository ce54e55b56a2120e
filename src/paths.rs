//! Centralized pool layout paths and name handling.
//!
//! All on-disk locations are derived here so the lifecycle, migration and
//! backup engines agree on where volumes live. The layout mirrors the pool
//! directory scheme:
//!
//! ```text
//! <data>/pools/<pool>/<type-dir>/<volume>
//! <data>/pools/<pool>/<type-dir>-snapshots/<volume>/<snapshot>
//! ```

use crate::error::{CowvolError, Result};
use crate::types::VolumeType;
use std::path::{Path, PathBuf};

/// Suffix appended to a live root renamed aside during restore.
pub const TMP_VOL_SUFFIX: &str = ".cowtmp";

/// Suffix appended to the on-disk name of custom ISO volumes.
pub const ISO_VOL_SUFFIX: &str = ".iso";

/// Well-known name of the raw block backing file inside a block volume.
pub const ROOT_DISK_FILE: &str = "root.img";

/// Sentinel the path encoder substitutes for `/`.
const PATH_SENTINEL: &str = "---";

/// Get the cowvol data directory.
///
/// Resolution order:
/// 1. `COWVOL_DATA_DIR` environment variable
/// 2. `/var/lib/cowvol`
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("COWVOL_DATA_DIR") {
        return PathBuf::from(dir);
    }

    PathBuf::from("/var/lib/cowvol")
}

/// Get the mount path of a storage pool.
pub fn pool_mount_path(pool: &str) -> PathBuf {
    data_dir().join("pools").join(pool)
}

/// Get the mount path of a volume within a pool.
///
/// Snapshot names (`parent/snapshot`) resolve into the typed snapshots
/// directory. An empty name returns the type directory itself.
pub fn volume_mount_path(pool_mount: &Path, vol_type: VolumeType, name: &str) -> PathBuf {
    if let (parent, Some(snap)) = parent_and_snapshot(name) {
        return pool_mount.join(vol_type.snapshots_dir()).join(parent).join(snap);
    }

    pool_mount.join(vol_type.as_dir()).join(name)
}

/// Get the parent snapshots directory for a volume (`<type>-snapshots/<volume>`).
pub fn snapshots_dir_path(pool_mount: &Path, vol_type: VolumeType, vol_name: &str) -> PathBuf {
    pool_mount.join(vol_type.snapshots_dir()).join(vol_name)
}

/// Split a volume name into parent and optional snapshot part.
pub fn parent_and_snapshot(name: &str) -> (&str, Option<&str>) {
    match name.split_once('/') {
        Some((parent, snap)) => (parent, Some(snap)),
        None => (name, None),
    }
}

/// Join a parent volume name and a snapshot name into a full snapshot volume name.
pub fn snapshot_volume_name(parent: &str, snapshot: &str) -> String {
    format!("{}/{}", parent, snapshot)
}

/// Encode a filesystem path for use as a single file name component.
///
/// The leading `/` is stripped before encoding; remaining separators map to
/// the sentinel so the encoding can be reversed on restore.
pub fn path_name_encode(path: &str) -> String {
    path.trim_start_matches('/').replace('/', PATH_SENTINEL)
}

/// Reverse [`path_name_encode`].
pub fn path_name_decode(encoded: &str) -> String {
    encoded.replace(PATH_SENTINEL, "/")
}

/// Validate a snapshot name against path traversal.
pub fn validate_snapshot_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| CowvolError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("empty name"));
    }

    if name == "." || name == ".." {
        return Err(invalid("reserved name"));
    }

    if name.contains('/') {
        return Err(invalid("name contains path separator"));
    }

    Ok(())
}
