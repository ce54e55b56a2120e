//! Optimized backup container layout.
//!
//! An optimized backup is a tar container holding a YAML manifest plus one
//! binary send stream per subvolume:
//!
//! ```text
//! backup/optimized_header.yaml
//! backup/<prefix>[_<encoded-subpath>].bin
//! ```
//!
//! The `<prefix>` depends on volume type and content type; snapshots live
//! under a typed snapshots directory inside the archive. Non-root
//! subvolumes append their path-encoded location before `.bin`.

use crate::paths;
use crate::types::{ContentType, VolumeType};

/// Archive member holding the optimized manifest.
pub const BACKUP_HEADER_NAME: &str = "backup/optimized_header.yaml";

/// Describes a backup being restored.
#[derive(Debug, Clone)]
pub struct BackupInfo {
    /// Whether the backup was produced by the optimized engine.
    pub optimized: bool,
    /// Whether the archive contains `backup/optimized_header.yaml`.
    /// Legacy optimized backups predate the manifest and are limited to
    /// root-only volumes.
    pub optimized_header: bool,
    /// Snapshot short names contained in the backup, oldest first.
    pub snapshots: Vec<String>,
}

/// Archive file prefix for a main volume.
#[must_use]
pub fn volume_prefix(vol_type: VolumeType, content_type: ContentType) -> String {
    match vol_type {
        VolumeType::VirtualMachine => {
            if content_type == ContentType::Filesystem {
                "virtual-machine-config".to_string()
            } else {
                "virtual-machine".to_string()
            }
        }
        VolumeType::Custom => "volume".to_string(),
        _ => "container".to_string(),
    }
}

/// Archive file prefix for a snapshot (`<snap-dir>/<name>[-config]`).
#[must_use]
pub fn snapshot_prefix(vol_type: VolumeType, content_type: ContentType, snapshot: &str) -> String {
    let (dir, file) = match vol_type {
        VolumeType::VirtualMachine => {
            let file = if content_type == ContentType::Filesystem {
                format!("{}-config", snapshot)
            } else {
                snapshot.to_string()
            };
            ("virtual-machine-snapshots", file)
        }
        VolumeType::Custom => ("volume-snapshots", snapshot.to_string()),
        _ => ("snapshots", snapshot.to_string()),
    };

    format!("{}/{}", dir, file)
}

/// Full archive member name for one subvolume's send stream.
///
/// `subvol_path` is the path relative to the volume root (`"/"` selects the
/// root subvolume, which keeps the bare prefix for compatibility with
/// manifest-less archives).
#[must_use]
pub fn member_name(prefix: &str, subvol_path: &str) -> String {
    if subvol_path == "/" {
        format!("backup/{}.bin", prefix)
    } else {
        format!("backup/{}_{}.bin", prefix, paths::path_name_encode(subvol_path))
    }
}
