//! Raw block backing files.
//!
//! Block-content volumes keep a single sparse raw file inside their root
//! subvolume. The containing subvolume gets the no-CoW attribute before the
//! file is created so the file inherits it, unless the pool is mounted with
//! compression (no-CoW would defeat it). Resizes only ever grow the file;
//! shrinking is rejected unless the caller opts into unsafe resize.

use crate::error::{CowvolError, Result};
use crate::subvol::BtrfsBackend;
use crate::types::{Volume, VolumeType};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Block files are sized in whole 512-byte sectors.
const SECTOR_SIZE: u64 = 512;

/// Round a byte count up to the next sector boundary.
#[must_use]
pub fn round_block_size(size_bytes: u64) -> u64 {
    size_bytes.div_ceil(SECTOR_SIZE) * SECTOR_SIZE
}

/// Apply the no-CoW attribute to `vol_path` unless the pool's mount options
/// force CoW or enable compression.
pub async fn apply_nocow_policy(backend: &Arc<dyn BtrfsBackend>, vol_path: &Path) -> Result<()> {
    let options = backend.mount_options(vol_path).await?;

    let datacow = options.iter().any(|o| o == "datacow");
    let compressed = options.iter().any(|o| o.starts_with("compress"));

    if datacow || compressed {
        debug!(path = %vol_path.display(), "Leaving CoW enabled on block volume");
        return Ok(());
    }

    backend.set_nocow(vol_path).await
}

/// Ensure the block file at `path` is at least `size_bytes` long, creating
/// it sparse if missing. Returns whether a resize took place.
///
/// Shrinking fails with [`CowvolError::CannotBeShrunk`] unless
/// `allow_unsafe_resize` is set. Volumes whose type appears in
/// `unsupported_types` reject any size change with `NotSupported` so the
/// caller can regenerate instead (read-only image sources cannot be resized
/// in place).
pub async fn ensure_block_file(
    vol: &Volume,
    path: &Path,
    size_bytes: u64,
    allow_unsafe_resize: bool,
    unsupported_types: &[VolumeType],
) -> Result<bool> {
    let size_bytes = round_block_size(size_bytes);

    let current = match tokio::fs::metadata(path).await {
        Ok(meta) => Some(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(CowvolError::io(path, e)),
    };

    match current {
        None => {
            // Fresh sparse file.
            let file = tokio::fs::File::create(path)
                .await
                .map_err(|e| CowvolError::io(path, e))?;
            file.set_len(size_bytes).await.map_err(|e| CowvolError::io(path, e))?;

            debug!(path = %path.display(), size_bytes, "Created sparse block file");
            Ok(true)
        }
        Some(current) if current == size_bytes => Ok(false),
        Some(current) => {
            if !allow_unsafe_resize && unsupported_types.contains(&vol.vol_type()) {
                return Err(CowvolError::NotSupported {
                    reason: format!(
                        "Block volumes of type {} cannot be resized in place",
                        vol.vol_type()
                    ),
                });
            }

            if size_bytes < current && !allow_unsafe_resize {
                return Err(CowvolError::CannotBeShrunk { path: path.to_path_buf() });
            }

            let file = tokio::fs::OpenOptions::new()
                .write(true)
                .open(path)
                .await
                .map_err(|e| CowvolError::io(path, e))?;
            file.set_len(size_bytes).await.map_err(|e| CowvolError::io(path, e))?;

            debug!(path = %path.display(), from = current, to = size_bytes, "Resized block file");
            Ok(true)
        }
    }
}

/// On-disk size of a block file in bytes.
pub async fn disk_size_bytes(path: &Path) -> Result<u64> {
    let meta = tokio::fs::metadata(path).await.map_err(|e| CowvolError::io(path, e))?;
    Ok(meta.len())
}
