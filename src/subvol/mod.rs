//! Subvolume primitives and graph introspection.
//!
//! [`SubvolumeManager`] layers the recursive operations (delete, snapshot,
//! graph enumeration) on top of the single-subvolume [`BtrfsBackend`]
//! primitives. Graph enumeration orders children after their parents so a
//! reverse traversal restores read-only flags leaves-first.

pub mod backend;

pub use backend::{BtrfsBackend, BtrfsCli, SubvolumeInfo};

use crate::error::Result;
use crate::types::Subvolume;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Recursive subvolume operations over a backend.
#[derive(Clone)]
pub struct SubvolumeManager {
    backend: Arc<dyn BtrfsBackend>,
}

impl SubvolumeManager {
    pub fn new(backend: Arc<dyn BtrfsBackend>) -> Self {
        Self { backend }
    }

    /// The underlying backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn BtrfsBackend> {
        &self.backend
    }

    /// Delete a subvolume, optionally including everything nested beneath it.
    ///
    /// Nested subvolumes are made writable parents-first, then deleted
    /// leaves-first.
    pub async fn delete(&self, path: &Path, recursive: bool) -> Result<()> {
        // Best-effort: a read-only root would block the deletions below.
        let _ = self.backend.set_readonly(path, false).await;

        if recursive {
            let mut nested = self.backend.subvolume_paths(path).await?;
            nested.sort();

            for sub in &nested {
                let _ = self.backend.set_readonly(&path.join(sub), false).await;
            }

            for sub in nested.iter().rev() {
                self.backend.delete_subvolume(&path.join(sub)).await?;
            }
        }

        self.backend.delete_subvolume(path).await
    }

    /// Snapshot `src` into `dst`, recursively descending into nested
    /// subvolumes when `recursion` is set.
    ///
    /// Snapshots are created writable; callers re-apply read-only flags
    /// afterwards according to the source graph.
    pub async fn snapshot(&self, src: &Path, dst: &Path, recursion: bool) -> Result<()> {
        self.backend.snapshot_subvolume(src, dst, false).await?;

        if recursion {
            let mut nested = self.backend.subvolume_paths(src).await?;
            nested.sort();

            for sub in nested {
                let sub_src = src.join(&sub);
                let sub_dst = dst.join(&sub);

                // The parent snapshot leaves an empty directory where the
                // nested subvolume was; clear it for the sub-snapshot.
                let _ = tokio::fs::remove_dir(&sub_dst).await;

                debug!(src = %sub_src.display(), dst = %sub_dst.display(), "Snapshotting nested subvolume");
                self.backend.snapshot_subvolume(&sub_src, &sub_dst, false).await?;
            }
        }

        Ok(())
    }

    /// Enumerate the subvolume graph of the volume at `vol_path`.
    ///
    /// The first record is always the root (`"/"`); nested records follow in
    /// lexicographic order, which places children after their parents.
    pub async fn graph(&self, vol_path: &Path, snapshot: &str) -> Result<Vec<Subvolume>> {
        let mut subvols = vec![Subvolume {
            snapshot: snapshot.to_string(),
            path: "/".to_string(),
            readonly: self.backend.is_readonly(vol_path).await?,
            ..Default::default()
        }];

        let mut nested = self.backend.subvolume_paths(vol_path).await?;
        nested.sort();

        for sub in nested {
            let readonly = self.backend.is_readonly(&vol_path.join(&sub)).await?;
            subvols.push(Subvolume {
                snapshot: snapshot.to_string(),
                path: format!("/{}", sub),
                readonly,
                ..Default::default()
            });
        }

        Ok(subvols)
    }

    /// Fill UUID and received-UUID fields for records enumerated from
    /// `vol_path`.
    pub async fn fill_uuids(&self, vol_path: &Path, subvols: &mut [Subvolume]) -> Result<()> {
        for sub in subvols {
            let path = vol_path.join(sub.path.trim_start_matches('/'));
            let info = self.backend.subvolume_info(&path).await?;
            sub.uuid = info.uuid;
            sub.received_uuid = info.received_uuid;
        }

        Ok(())
    }
}

/// Scoped read-only transitions for send operations.
///
/// [`force`](Self::force) marks a subvolume read-only only if it was
/// writable, recording it so [`release_all`](Self::release_all) can restore
/// the exact prior state. Release runs best-effort: one failed restore does
/// not prevent the rest.
pub struct ReadonlyGuards {
    backend: Arc<dyn BtrfsBackend>,
    forced: Vec<PathBuf>,
}

impl ReadonlyGuards {
    pub fn new(backend: Arc<dyn BtrfsBackend>) -> Self {
        Self { backend, forced: Vec::new() }
    }

    /// Ensure `path` is read-only, remembering whether we changed it.
    pub async fn force(&mut self, path: &Path) -> Result<()> {
        if self.backend.is_readonly(path).await? {
            return Ok(());
        }

        self.backend.set_readonly(path, true).await?;
        self.forced.push(path.to_path_buf());
        Ok(())
    }

    /// Restore every forced subvolume back to read-write, most recent first.
    pub async fn release_all(&mut self) {
        while let Some(path) = self.forced.pop() {
            if let Err(e) = self.backend.set_readonly(&path, false).await {
                warn!(path = %path.display(), error = %e, "Failed restoring subvolume to read-write");
            }
        }
    }
}
