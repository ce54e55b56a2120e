//! Volume lifecycle manager.
//!
//! [`BtrfsDriver`] mediates between the platform's abstract volume concept
//! and the pool's copy-on-write tooling. Every public operation is an
//! atomic composition of primitives whose partial failures are undone in
//! reverse order through a [`Reverter`].
//!
//! The platform serializes operations on a volume before invoking the
//! driver, so each call may assume exclusive access to that volume.

mod backup;
mod migration;

use crate::backup::BackupInfo;
use crate::block;
use crate::error::{CowvolError, Result};
use crate::migration::{MigrationConn, VolumeSourceArgs, VolumeTargetArgs};
use crate::paths;
use crate::qgroup::QuotaManager;
use crate::revert::{Reverter, RevertHook};
use crate::subvol::{BtrfsBackend, SubvolumeManager};
use crate::types::{
    ContentType, MetaDataHeader, Subvolume, Volume, VolumeCopy, VolumeFiller, VolumeType,
};
use crate::units;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument};

/// Default size for block volumes whose config carries none.
const DEFAULT_BLOCK_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Fallback transport for the non-optimized migration and backup modes.
///
/// The platform wires in its rsync/tar based implementation; a driver
/// without one rejects non-optimized modes as unsupported.
#[async_trait]
pub trait GenericTransport: Send + Sync {
    /// Source leg of a file-by-file migration. `src_path` points at a
    /// read-only consistency snapshot when one was taken.
    async fn migrate_volume(
        &self,
        vol: &VolumeCopy,
        src_path: &Path,
        conn: &mut (dyn MigrationConn + '_),
        args: &VolumeSourceArgs,
    ) -> Result<()>;

    /// Target leg of a file-by-file migration.
    async fn create_volume_from_migration(
        &self,
        vol: &VolumeCopy,
        target_path: &Path,
        conn: &mut (dyn MigrationConn + '_),
        args: &VolumeTargetArgs,
    ) -> Result<()>;

    /// File-by-file backup into the prepared tar sink.
    async fn backup_volume(
        &self,
        vol: &VolumeCopy,
        src_path: &Path,
        tar: &mut tar::Builder<Box<dyn Write + Send>>,
        snapshots: &[String],
    ) -> Result<()>;

    /// Unpack a non-optimized backup into place.
    async fn restore_backup(
        &self,
        vol: &VolumeCopy,
        target_path: &Path,
        src: &mut (dyn BackupSource + '_),
        info: &BackupInfo,
    ) -> Result<Option<RevertHook>>;
}

/// Seekable byte source holding a backup archive.
pub trait BackupSource: std::io::Read + std::io::Seek + Send {}

impl<T: std::io::Read + std::io::Seek + Send> BackupSource for T {}

/// Copy-on-write volume driver for one storage pool.
pub struct BtrfsDriver {
    pool: String,
    pool_mount: PathBuf,
    backend: Arc<dyn BtrfsBackend>,
    subvol: SubvolumeManager,
    quota: QuotaManager,
    generic: Option<Arc<dyn GenericTransport>>,
    mount_refs: Mutex<HashMap<String, u64>>,
}

impl BtrfsDriver {
    /// Create a driver for `pool` at its default mount location.
    pub fn new(pool: impl Into<String>, backend: Arc<dyn BtrfsBackend>) -> Self {
        let pool = pool.into();
        let pool_mount = paths::pool_mount_path(&pool);
        Self::with_mount_path(pool, backend, pool_mount)
    }

    /// Create a driver with an explicit pool mount path.
    pub fn with_mount_path(
        pool: impl Into<String>,
        backend: Arc<dyn BtrfsBackend>,
        pool_mount: PathBuf,
    ) -> Self {
        Self {
            pool: pool.into(),
            pool_mount: pool_mount.clone(),
            subvol: SubvolumeManager::new(backend.clone()),
            quota: QuotaManager::new(backend.clone(), pool_mount),
            backend,
            generic: None,
            mount_refs: Mutex::new(HashMap::new()),
        }
    }

    /// Wire in the fallback transport for non-optimized modes.
    pub fn set_generic_transport(&mut self, transport: Arc<dyn GenericTransport>) {
        self.generic = Some(transport);
    }

    #[must_use]
    pub fn pool(&self) -> &str {
        &self.pool
    }

    #[must_use]
    pub fn pool_mount(&self) -> &Path {
        &self.pool_mount
    }

    /// The subvolume manager used by this driver.
    #[must_use]
    pub fn subvolumes(&self) -> &SubvolumeManager {
        &self.subvol
    }

    pub(crate) fn backend(&self) -> &Arc<dyn BtrfsBackend> {
        self.subvol.backend()
    }

    pub(crate) fn generic_transport(&self) -> Result<Arc<dyn GenericTransport>> {
        self.generic.clone().ok_or_else(|| CowvolError::NotSupported {
            reason: "No generic transport configured for non-optimized mode".to_string(),
        })
    }

    // Paths

    /// On-disk location of a volume, honoring any temporary redirect.
    #[must_use]
    pub fn volume_path(&self, vol: &Volume) -> PathBuf {
        if let Some(custom) = vol.mount_custom_path() {
            return custom.to_path_buf();
        }

        let mut name = vol.name().to_string();
        if vol.vol_type() == VolumeType::Custom && vol.content_type() == ContentType::Iso {
            name.push_str(paths::ISO_VOL_SUFFIX);
        }

        paths::volume_mount_path(&self.pool_mount, vol.vol_type(), &name)
    }

    /// Location of the raw block backing file inside a block volume.
    #[must_use]
    pub fn volume_disk_path(&self, vol: &Volume) -> PathBuf {
        self.volume_path(vol).join(paths::ROOT_DISK_FILE)
    }

    /// The directory holding volumes of the given type.
    pub(crate) fn type_dir(&self, vol_type: VolumeType) -> PathBuf {
        self.pool_mount.join(vol_type.as_dir())
    }

    fn snapshots_parent_dir(&self, vol_type: VolumeType, vol_name: &str) -> PathBuf {
        paths::snapshots_dir_path(&self.pool_mount, vol_type, vol_name)
    }

    pub(crate) async fn create_parent_snapshot_dir(&self, vol: &Volume) -> Result<()> {
        let (parent, _) = vol.parent_and_snapshot();
        let dir = self.snapshots_parent_dir(vol.vol_type(), parent);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| CowvolError::io(&dir, e))
    }

    /// Garbage-collect the snapshots parent directory once empty.
    pub(crate) async fn delete_parent_snapshot_dir_if_empty(
        &self,
        vol_type: VolumeType,
        vol_name: &str,
    ) -> Result<()> {
        let dir = self.snapshots_parent_dir(vol_type, vol_name);

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(CowvolError::io(&dir, e)),
        };

        if entries.next_entry().await.map_err(|e| CowvolError::io(&dir, e))?.is_none() {
            tokio::fs::remove_dir(&dir).await.map_err(|e| CowvolError::io(&dir, e))?;
        }

        Ok(())
    }

    /// Fix up mount-path permissions after creation or filling.
    async fn ensure_mount_path(&self, path: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        if !path.exists() {
            tokio::fs::create_dir_all(path).await.map_err(|e| CowvolError::io(path, e))?;
        }

        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o711))
            .await
            .map_err(|e| CowvolError::io(path, e))
    }

    // Introspection

    /// Whether the volume exists on the pool.
    pub async fn has_volume(&self, vol: &Volume) -> bool {
        self.volume_path(vol).exists()
    }

    /// Snapshot short names of a volume, in directory order.
    pub async fn volume_snapshots(&self, vol: &Volume) -> Result<Vec<String>> {
        let (parent, _) = vol.parent_and_snapshot();
        let dir = self.snapshots_parent_dir(vol.vol_type(), parent);

        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CowvolError::io(&dir, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) =
            read_dir.next_entry().await.map_err(|e| CowvolError::io(&dir, e))?
        {
            names.push(entry.file_name().to_string_lossy().to_string());
        }

        Ok(names)
    }

    /// Snapshot short names ordered by creation.
    ///
    /// The pool's internal subvolume ID is monotonic and non-reusable, so
    /// ID order is creation order.
    pub async fn volume_snapshots_sorted(&self, vol: &Volume) -> Result<Vec<String>> {
        let (parent, _) = vol.parent_and_snapshot();
        let prefix = format!("{}/{}/", vol.vol_type().snapshots_dir(), parent);

        let subvols = self.backend().list_pool_subvolumes(&self.pool_mount).await?;

        let mut names = Vec::new();
        for (_, path) in subvols {
            let Some(rest) = path.strip_prefix(&prefix) else {
                continue;
            };

            // Exclude subvolumes nested inside snapshots.
            if rest.contains('/') {
                continue;
            }

            names.push(rest.to_string());
        }

        Ok(names)
    }

    /// Verify the snapshots recorded for a copy match what storage holds.
    pub async fn check_volume_snapshots(&self, vol: &VolumeCopy) -> Result<()> {
        let mut expected: Vec<&str> =
            vol.snapshots.iter().map(|s| s.snapshot_name()).collect();
        let mut on_disk = self.volume_snapshots(&vol.volume).await?;

        expected.sort_unstable();
        on_disk.sort_unstable();

        if expected != on_disk.iter().map(String::as_str).collect::<Vec<_>>() {
            return Err(CowvolError::Internal(format!(
                "Snapshot list for volume {:?} does not match storage",
                vol.volume.name()
            )));
        }

        Ok(())
    }

    /// Build the metadata header describing a volume and its snapshots,
    /// including subvolume UUIDs.
    pub(crate) async fn restoration_header(
        &self,
        vol: &Volume,
        snapshots: &[String],
    ) -> Result<MetaDataHeader> {
        let mut header = MetaDataHeader::default();

        for snap in snapshots {
            let snap_vol = vol.new_snapshot(snap);
            let path = self.volume_path(&snap_vol);

            let mut subvols = self.subvol.graph(&path, snap).await?;
            self.subvol.fill_uuids(&path, &mut subvols).await?;
            header.subvolumes.extend(subvols);
        }

        let path = self.volume_path(vol);
        let mut subvols = self.subvol.graph(&path, "").await?;
        self.subvol.fill_uuids(&path, &mut subvols).await?;
        header.subvolumes.extend(subvols);

        Ok(header)
    }

    /// Join a volume root with a subvolume graph path (`"/"`-rooted).
    pub(crate) fn join_subvol_path(base: &Path, sub_path: &str) -> PathBuf {
        base.join(sub_path.trim_start_matches('/'))
    }

    /// Re-apply read-only on every non-root subvolume flagged read-only in
    /// `subvols`, walking leaves-first so a read-only parent never blocks a
    /// child transition.
    async fn restore_readonly_reverse(
        &self,
        target: &Path,
        subvols: &[Subvolume],
    ) -> Result<()> {
        for sub in subvols.iter().rev() {
            if sub.readonly && !sub.is_root() {
                self.backend()
                    .set_readonly(&Self::join_subvol_path(target, &sub.path), true)
                    .await?;
            }
        }

        Ok(())
    }

    // Lifecycle

    /// Create an empty volume, optionally filling it.
    #[instrument(skip(self, vol, filler), fields(pool = %self.pool, volume = %vol.name()))]
    pub async fn create_volume(
        &self,
        vol: &Volume,
        filler: Option<&dyn VolumeFiller>,
    ) -> Result<()> {
        let mut revert = Reverter::new();
        let result = self.create_volume_inner(&mut revert, vol, filler).await;

        match result {
            Ok(()) => {
                revert.success();
                info!("Volume created");
                metrics::counter!("cowvol_volume_created_total").increment(1);
                Ok(())
            }
            Err(e) => {
                revert.fail().await;
                Err(e)
            }
        }
    }

    async fn create_volume_inner(
        &self,
        revert: &mut Reverter,
        vol: &Volume,
        filler: Option<&dyn VolumeFiller>,
    ) -> Result<()> {
        let vol_path = self.volume_path(vol);

        let type_dir = self.type_dir(vol.vol_type());
        tokio::fs::create_dir_all(&type_dir)
            .await
            .map_err(|e| CowvolError::io(&type_dir, e))?;

        self.backend().create_subvolume(&vol_path).await?;

        {
            let subvol = self.subvol.clone();
            let path = vol_path.clone();
            revert.add(async move {
                subvol.delete(&path, false).await?;
                let _ = tokio::fs::remove_dir(&path).await;
                Ok(())
            });
        }

        // Block volumes get a sparse loopback file; the enclosing subvolume
        // carries no-CoW before the file exists so the file inherits it.
        let mut block_path = None;
        if vol.content_type() == ContentType::Block {
            block::apply_nocow_policy(self.backend(), &vol_path).await?;
            block_path = Some(self.volume_disk_path(vol));
        }

        if let Some(filler) = filler {
            filler.fill(&vol_path, block_path.as_deref()).await?;
        }

        if let Some(disk) = &block_path {
            let mut size_bytes = units::parse_byte_size(vol.config_size())?;
            if size_bytes == 0 {
                size_bytes = DEFAULT_BLOCK_SIZE;
            }

            // The filler may legitimately have produced an image larger
            // than the requested size; that is not an error here.
            match block::ensure_block_file(vol, disk, size_bytes, false, &[]).await {
                Ok(_) | Err(CowvolError::CannotBeShrunk { .. }) => {}
                Err(e) => return Err(e),
            }

            if vol.is_vm_block() && filler.is_some() {
                self.backend().move_gpt_alt_header(disk).await?;
            }
        } else if vol.content_type() == ContentType::Filesystem {
            self.set_volume_quota(vol, vol.config_size(), false).await?;
        }

        self.ensure_mount_path(&vol_path).await?;

        // Image volumes are immutable sources for instance creation.
        if vol.vol_type() == VolumeType::Image {
            self.backend().set_readonly(&vol_path, true).await?;
        }

        Ok(())
    }

    /// Same-pool volume copy, including snapshots.
    #[instrument(skip_all, fields(pool = %self.pool, volume = %vol.volume.name(), source = %src.volume.name()))]
    pub async fn create_volume_from_copy(
        &self,
        vol: &VolumeCopy,
        src: &VolumeCopy,
    ) -> Result<()> {
        let mut revert = Reverter::new();
        let result = self.create_volume_from_copy_inner(&mut revert, vol, src, false).await;

        match result {
            Ok(()) => {
                revert.success();
                info!("Volume copied");
                Ok(())
            }
            Err(e) => {
                revert.fail().await;
                Err(e)
            }
        }
    }

    /// Same-pool volume and snapshot syncing onto an existing target.
    #[instrument(skip_all, fields(pool = %self.pool, volume = %vol.volume.name(), source = %src.volume.name()))]
    pub async fn refresh_volume(&self, vol: &VolumeCopy, src: &VolumeCopy) -> Result<()> {
        let mut revert = Reverter::new();
        let result = self.create_volume_from_copy_inner(&mut revert, vol, src, true).await;

        match result {
            Ok(()) => {
                revert.success();
                info!("Volume refreshed");
                Ok(())
            }
            Err(e) => {
                revert.fail().await;
                Err(e)
            }
        }
    }

    async fn create_volume_from_copy_inner(
        &self,
        revert: &mut Reverter,
        vol: &VolumeCopy,
        src: &VolumeCopy,
        refresh: bool,
    ) -> Result<()> {
        // Scan the source graph first so read-only properties can be
        // re-applied on the copy.
        let src_path = self.volume_path(&src.volume);
        let subvols = self.subvol.graph(&src_path, src.volume.snapshot_name()).await?;

        let target = self.volume_path(&vol.volume);

        // A refresh replaces the existing main volume wholesale.
        if refresh {
            self.subvol.delete(&target, true).await?;
        }

        let type_dir = self.type_dir(vol.volume.vol_type());
        tokio::fs::create_dir_all(&type_dir)
            .await
            .map_err(|e| CowvolError::io(&type_dir, e))?;

        self.subvol.snapshot(&src_path, &target, true).await?;

        {
            let subvol = self.subvol.clone();
            let path = target.clone();
            revert.add(async move { subvol.delete(&path, true).await });
        }

        // The root stays writable; nested read-only flags are restored
        // leaves-first.
        self.restore_readonly_reverse(&target, &subvols).await?;

        self.set_volume_quota(&vol.volume, vol.volume.config_size(), false).await?;
        self.ensure_mount_path(&target).await?;

        // Copy snapshots when the target wants them and the source is not
        // itself a snapshot.
        let mut snapshots = Vec::new();
        if !vol.snapshots.is_empty() && !src.volume.is_snapshot() {
            snapshots = self.volume_snapshots_sorted(&src.volume).await?;
        }

        if !snapshots.is_empty() {
            self.create_parent_snapshot_dir(&vol.volume).await?;

            let target_snapshots = self.volume_snapshots(&vol.volume).await?;

            for snap_name in snapshots {
                if refresh {
                    let wanted =
                        vol.snapshots.iter().any(|s| s.snapshot_name() == snap_name);

                    // Skip snapshots that are not marked for refresh or that
                    // already exist on the target.
                    if !wanted || target_snapshots.contains(&snap_name) {
                        continue;
                    }
                }

                let src_snap = self.volume_path(&src.volume.new_snapshot(&snap_name));
                let dst_snap = self.volume_path(&vol.volume.new_snapshot(&snap_name));

                self.subvol.snapshot(&src_snap, &dst_snap, true).await?;
                self.backend().set_readonly(&dst_snap, true).await?;

                let subvol = self.subvol.clone();
                revert.add(async move { subvol.delete(&dst_snap, true).await });
            }
        }

        Ok(())
    }

    /// Restore a volume from one of its snapshots.
    #[instrument(skip(self, vol, snap_vol), fields(pool = %self.pool, volume = %vol.name(), snapshot = %snap_vol.name()))]
    pub async fn restore_volume(&self, vol: &Volume, snap_vol: &Volume) -> Result<()> {
        let mut revert = Reverter::new();
        let result = self.restore_volume_inner(&mut revert, vol, snap_vol).await;

        match result {
            Ok(renamed_aside) => {
                revert.success();

                // Only once the restore is committed is the old root gone.
                self.subvol.delete(&renamed_aside, true).await?;
                info!("Volume restored");
                Ok(())
            }
            Err(e) => {
                revert.fail().await;
                Err(e)
            }
        }
    }

    async fn restore_volume_inner(
        &self,
        revert: &mut Reverter,
        vol: &Volume,
        snap_vol: &Volume,
    ) -> Result<PathBuf> {
        let snap_path = self.volume_path(snap_vol);
        let subvols = self.subvol.graph(&snap_path, snap_vol.snapshot_name()).await?;

        let target = self.volume_path(vol);

        // Rename the live root aside; this is the rollback anchor.
        let renamed_aside = PathBuf::from(format!(
            "{}{}",
            target.display(),
            paths::TMP_VOL_SUFFIX
        ));
        tokio::fs::rename(&target, &renamed_aside)
            .await
            .map_err(|e| CowvolError::io(&target, e))?;

        {
            let from = renamed_aside.clone();
            let to = target.clone();
            revert.add(async move {
                tokio::fs::rename(&from, &to).await.map_err(|e| CowvolError::io(&from, e))
            });
        }

        self.subvol.snapshot(&snap_path, &target, true).await?;

        {
            let subvol = self.subvol.clone();
            let path = target.clone();
            revert.add(async move { subvol.delete(&path, true).await });
        }

        self.restore_readonly_reverse(&target, &subvols).await?;

        Ok(renamed_aside)
    }

    /// Delete a volume. Fails while snapshots remain; succeeds when the
    /// volume is already gone.
    #[instrument(skip(self, vol), fields(pool = %self.pool, volume = %vol.name()))]
    pub async fn delete_volume(&self, vol: &Volume) -> Result<()> {
        let snapshots = self.volume_snapshots(vol).await?;
        if !snapshots.is_empty() {
            return Err(CowvolError::Internal(
                "Cannot remove a volume that has snapshots".to_string(),
            ));
        }

        let vol_path = self.volume_path(vol);
        if !vol_path.exists() {
            return Ok(());
        }

        self.subvol.delete(&vol_path, true).await?;
        self.delete_parent_snapshot_dir_if_empty(vol.vol_type(), vol.name()).await?;

        info!("Volume deleted");
        metrics::counter!("cowvol_volume_deleted_total").increment(1);
        Ok(())
    }

    /// Snapshot a volume. `snap_vol` carries the `parent/snapshot` name.
    #[instrument(skip(self, snap_vol), fields(pool = %self.pool, snapshot = %snap_vol.name()))]
    pub async fn create_volume_snapshot(&self, snap_vol: &Volume) -> Result<()> {
        let (parent, _) = snap_vol.parent_and_snapshot();
        let parent_vol = Volume::new(
            self.pool.clone(),
            snap_vol.vol_type(),
            snap_vol.content_type(),
            parent,
            snap_vol.config().clone(),
            snap_vol.pool_config().clone(),
        );

        let src_path = self.volume_path(&parent_vol);
        let snap_path = self.volume_path(snap_vol);

        self.create_parent_snapshot_dir(snap_vol).await?;

        let mut revert = Reverter::new();
        let result = async {
            self.subvol.snapshot(&src_path, &snap_path, true).await?;

            {
                let subvol = self.subvol.clone();
                let path = snap_path.clone();
                revert.add(async move { subvol.delete(&path, true).await });
            }

            self.backend().set_readonly(&snap_path, true).await?;

            // Propagate read-only to sub-subvolumes that were read-only on
            // the source.
            let subvols = self.subvol.graph(&src_path, "").await?;
            for sub in &subvols {
                if sub.readonly && !sub.is_root() {
                    self.backend()
                        .set_readonly(&Self::join_subvol_path(&snap_path, &sub.path), true)
                        .await?;
                }
            }

            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                revert.success();
                info!("Snapshot created");
                metrics::counter!("cowvol_snapshot_created_total").increment(1);
                Ok(())
            }
            Err(e) => {
                revert.fail().await;
                Err(e)
            }
        }
    }

    /// Delete a snapshot, garbage-collecting the snapshots directory when
    /// it empties.
    #[instrument(skip(self, snap_vol), fields(pool = %self.pool, snapshot = %snap_vol.name()))]
    pub async fn delete_volume_snapshot(&self, snap_vol: &Volume) -> Result<()> {
        let snap_path = self.volume_path(snap_vol);
        self.subvol.delete(&snap_path, true).await?;

        let (parent, _) = snap_vol.parent_and_snapshot();
        self.delete_parent_snapshot_dir_if_empty(snap_vol.vol_type(), parent).await?;

        info!("Snapshot deleted");
        metrics::counter!("cowvol_snapshot_deleted_total").increment(1);
        Ok(())
    }

    /// Rename a volume and its snapshots directory.
    #[instrument(skip(self, vol), fields(pool = %self.pool, volume = %vol.name(), new_name = %new_name))]
    pub async fn rename_volume(&self, vol: &Volume, new_name: &str) -> Result<()> {
        let mut revert = Reverter::new();

        let result = async {
            let old_snap_dir = self.snapshots_parent_dir(vol.vol_type(), vol.name());
            let new_snap_dir = self.snapshots_parent_dir(vol.vol_type(), new_name);

            if old_snap_dir.exists() {
                tokio::fs::rename(&old_snap_dir, &new_snap_dir)
                    .await
                    .map_err(|e| CowvolError::io(&old_snap_dir, e))?;

                let from = new_snap_dir.clone();
                let to = old_snap_dir.clone();
                revert.add(async move {
                    tokio::fs::rename(&from, &to).await.map_err(|e| CowvolError::io(&from, e))
                });
            }

            let old_path = self.volume_path(vol);
            let new_path =
                paths::volume_mount_path(&self.pool_mount, vol.vol_type(), new_name);

            tokio::fs::rename(&old_path, &new_path)
                .await
                .map_err(|e| CowvolError::io(&old_path, e))?;

            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                revert.success();
                Ok(())
            }
            Err(e) => {
                revert.fail().await;
                Err(e)
            }
        }
    }

    /// Rename a snapshot in place.
    pub async fn rename_volume_snapshot(
        &self,
        snap_vol: &Volume,
        new_snapshot: &str,
    ) -> Result<()> {
        paths::validate_snapshot_name(new_snapshot)?;

        let old_path = self.volume_path(snap_vol);
        let (parent, _) = snap_vol.parent_and_snapshot();
        let new_path = self.volume_path(
            &Volume::new(
                self.pool.clone(),
                snap_vol.vol_type(),
                snap_vol.content_type(),
                paths::snapshot_volume_name(parent, new_snapshot),
                snap_vol.config().clone(),
                snap_vol.pool_config().clone(),
            ),
        );

        tokio::fs::rename(&old_path, &new_path)
            .await
            .map_err(|e| CowvolError::io(&old_path, e))
    }

    /// Apply configuration changes. Only `size` has decision content.
    pub async fn update_volume(
        &self,
        vol: &Volume,
        changed: &HashMap<String, String>,
    ) -> Result<()> {
        if let Some(new_size) = changed.get("size") {
            self.set_volume_quota(vol, new_size, false).await?;
        }

        Ok(())
    }

    /// Validate the volume's configuration.
    pub async fn validate_volume(&self, vol: &Volume) -> Result<()> {
        units::parse_byte_size(vol.config_size())?;

        if let (_, Some(snap)) = vol.parent_and_snapshot() {
            paths::validate_snapshot_name(snap)?;
        }

        Ok(())
    }

    /// Apply a size limit.
    ///
    /// Block volumes resize the backing file (growing only); an empty or
    /// zero size is a no-op for them. Filesystem volumes apply a referenced
    /// quota; an empty size clears it.
    #[instrument(skip(self, vol), fields(pool = %self.pool, volume = %vol.name(), size = %size))]
    pub async fn set_volume_quota(
        &self,
        vol: &Volume,
        size: &str,
        allow_unsafe_resize: bool,
    ) -> Result<()> {
        let mut size_bytes = units::parse_byte_size(size)?;

        if vol.content_type() == ContentType::Block {
            if size_bytes == 0 {
                return Ok(());
            }

            let disk = self.volume_disk_path(vol);

            // Image block volumes have read-only snapshots instances are
            // created from; an in-place resize would not propagate, so the
            // caller gets NotSupported and regenerates instead.
            let resized = block::ensure_block_file(
                vol,
                &disk,
                size_bytes,
                allow_unsafe_resize,
                &[VolumeType::Image],
            )
            .await?;

            if vol.is_vm_block() && resized && !allow_unsafe_resize {
                self.backend().move_gpt_alt_header(&disk).await?;
            }

            return Ok(());
        }

        let vol_path = self.volume_path(vol);

        let qgroup = match self.quota.get(&vol_path).await {
            Ok((qgroup, _)) => qgroup,
            Err(CowvolError::NoQuota) if size_bytes == 0 => {
                // Nothing to clear when quotas were never enabled.
                return Ok(());
            }
            Err(CowvolError::NoQuota | CowvolError::NoQgroup) => {
                self.quota.ensure(&vol_path).await?
            }
            Err(e) => return Err(e),
        };

        if size_bytes > 0 {
            // A VM's filesystem volume co-hosts the block file; add its size
            // so the file is effectively excluded from the quota.
            let disk = vol_path.join(paths::ROOT_DISK_FILE);
            if vol.vol_type() == VolumeType::VirtualMachine && disk.exists() {
                let block_size = block::disk_size_bytes(&disk).await?;
                size_bytes += block_size;
                debug!(size_bytes, "Accounting for VM image file size");
            }

            self.quota.set_limit(&vol_path, &qgroup, size_bytes).await
        } else {
            self.quota.clear_limit(&vol_path, &qgroup).await
        }
    }

    /// Disk space used by the volume, from its quota group.
    pub async fn get_volume_usage(&self, vol: &Volume) -> Result<u64> {
        match self.quota.get(&self.volume_path(vol)).await {
            Ok((_, usage)) => Ok(usage),
            Err(CowvolError::NoQuota) => Err(CowvolError::NotSupported {
                reason: "Quotas disabled on pool".to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    /// Enumerate volumes present in the pool.
    pub async fn list_volumes(&self) -> Result<Vec<Volume>> {
        let mut volumes = Vec::new();

        for vol_type in [
            VolumeType::Container,
            VolumeType::VirtualMachine,
            VolumeType::Custom,
            VolumeType::Image,
        ] {
            let dir = self.type_dir(vol_type);
            let mut read_dir = match tokio::fs::read_dir(&dir).await {
                Ok(read_dir) => read_dir,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(CowvolError::io(&dir, e)),
            };

            while let Some(entry) =
                read_dir.next_entry().await.map_err(|e| CowvolError::io(&dir, e))?
            {
                let mut name = entry.file_name().to_string_lossy().to_string();

                let content_type = if name.ends_with(paths::ISO_VOL_SUFFIX) {
                    name.truncate(name.len() - paths::ISO_VOL_SUFFIX.len());
                    ContentType::Iso
                } else if entry.path().join(paths::ROOT_DISK_FILE).exists() {
                    ContentType::Block
                } else {
                    ContentType::Filesystem
                };

                volumes.push(Volume::new(
                    self.pool.clone(),
                    vol_type,
                    content_type,
                    name,
                    HashMap::new(),
                    HashMap::new(),
                ));
            }
        }

        Ok(volumes)
    }

    /// Mount a volume (a formality on this pool: ensure permissions and
    /// count the reference).
    pub async fn mount_volume(&self, vol: &Volume) -> Result<()> {
        let vol_path = self.volume_path(vol);

        // Don't reset permissions on an existing custom volume root; a user
        // inside an instance may have changed them deliberately.
        if !vol_path.exists() || vol.vol_type() != VolumeType::Custom {
            self.ensure_mount_path(&vol_path).await?;
        }

        let mut refs = self.mount_refs.lock().unwrap_or_else(|e| e.into_inner());
        *refs.entry(vol.name().to_string()).or_insert(0) += 1;
        Ok(())
    }

    /// Unmount a volume; fails with [`CowvolError::InUse`] while other
    /// references remain.
    pub async fn unmount_volume(&self, vol: &Volume) -> Result<()> {
        let mut refs = self.mount_refs.lock().unwrap_or_else(|e| e.into_inner());

        let count = refs.entry(vol.name().to_string()).or_insert(0);
        *count = count.saturating_sub(1);

        if *count > 0 {
            debug!(volume = %vol.name(), refs = *count, "Skipping unmount as in use");
            return Err(CowvolError::InUse { volume: vol.name().to_string() });
        }

        refs.remove(vol.name());
        Ok(())
    }

    /// Unwind action deleting a volume's snapshots (by short name), the
    /// emptied snapshots directory, then the main volume.
    pub(crate) fn delete_volume_unwind(
        &self,
        vol: &Volume,
        snapshots: Vec<String>,
    ) -> impl std::future::Future<Output = Result<()>> + Send + 'static {
        let subvol = self.subvol.clone();
        let (parent, _) = vol.parent_and_snapshot();

        let snap_paths: Vec<PathBuf> = snapshots
            .iter()
            .map(|s| self.volume_path(&vol.new_snapshot(s)))
            .collect();
        let snap_parent_dir =
            paths::snapshots_dir_path(&self.pool_mount, vol.vol_type(), parent);
        let main_path = self.volume_path(vol);

        async move {
            for path in snap_paths {
                if path.exists() {
                    let _ = subvol.delete(&path, true).await;
                }
            }

            let _ = tokio::fs::remove_dir(&snap_parent_dir).await;

            if main_path.exists() {
                subvol.delete(&main_path, true).await?;
            }

            Ok(())
        }
    }

    /// Take a recursive read-only snapshot of a live volume into a scratch
    /// directory, returning its path and a cleanup hook.
    ///
    /// Used to guarantee a consistent source for file-by-file transports.
    pub(crate) async fn readonly_snapshot(&self, vol: &Volume) -> Result<(PathBuf, RevertHook)> {
        let tmp_dir = tempfile::Builder::new()
            .prefix("backup.")
            .tempdir_in(&self.pool_mount)
            .map_err(|e| CowvolError::io(&self.pool_mount, e))?;

        // Keep the directory; the returned hook owns cleanup from here.
        let tmp_dir = tmp_dir.into_path();
        restrict_dir(&tmp_dir).await?;

        let (parent, _) = vol.parent_and_snapshot();
        let mount_path = tmp_dir.join(parent);

        let result = async {
            self.subvol.snapshot(&self.volume_path(vol), &mount_path, true).await?;
            self.backend().set_readonly(&mount_path, true).await
        }
        .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_dir_all(&tmp_dir).await;
            return Err(e);
        }

        debug!(path = %mount_path.display(), "Created read-only consistency snapshot");

        let subvol = self.subvol.clone();
        let snap_path = mount_path.clone();
        let hook = RevertHook::from_action(async move {
            subvol.delete(&snap_path, true).await?;
            tokio::fs::remove_dir_all(&tmp_dir)
                .await
                .map_err(|e| CowvolError::io(&tmp_dir, e))
        });

        Ok((mount_path, hook))
    }
}

/// Restrict a scratch directory to traversal only.
pub(crate) async fn restrict_dir(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o100))
        .await
        .map_err(|e| CowvolError::io(path, e))
}

