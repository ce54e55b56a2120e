//! Optimized backup and restore.
//!
//! A backup is a tar container holding the YAML manifest plus one spooled
//! send stream per subvolume, snapshots first (oldest to newest) so each
//! stream can be differential against its predecessor. Restore replays the
//! archive in the same order through `receive` into a scratch directory,
//! then renames everything into place.

use super::{restrict_dir, BackupSource, BtrfsDriver};
use crate::backup::{self, BackupInfo, BACKUP_HEADER_NAME};
use crate::error::{CowvolError, Result};
use crate::paths;
use crate::revert::{Reverter, RevertHook};
use crate::subvol::ReadonlyGuards;
use crate::types::{ContentType, MetaDataHeader, Volume, VolumeCopy};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

impl BtrfsDriver {
    /// Copy a volume (and optionally its snapshots) into a tar container.
    #[instrument(skip_all, fields(pool = %self.pool, volume = %vol.volume.name(), optimized))]
    pub async fn backup_volume(
        &self,
        vol: &VolumeCopy,
        tar: &mut tar::Builder<Box<dyn Write + Send>>,
        optimized: bool,
        snapshots: &[String],
    ) -> Result<()> {
        if !optimized {
            let transport = self.generic_transport()?;

            // The file-by-file packer cannot take a consistent copy of a
            // tree being modified; a cheap snapshot fixes that.
            if vol.volume.content_type() == ContentType::Filesystem {
                let (snap_path, cleanup) = self.readonly_snapshot(&vol.volume).await?;
                let result = transport.backup_volume(vol, &snap_path, tar, snapshots).await;
                cleanup.run().await;
                return result;
            }

            let src_path = self.volume_path(&vol.volume);
            return transport.backup_volume(vol, &src_path, tar, snapshots).await;
        }

        if !snapshots.is_empty() {
            self.check_volume_snapshots(vol).await?;
        }

        let header = self.restoration_header(&vol.volume, snapshots).await?;

        let yaml = serde_yaml::to_string(&header)
            .map_err(|e| CowvolError::Internal(format!("Failed encoding backup manifest: {}", e)))?;
        append_manifest(tar, yaml.as_bytes())?;

        // Snapshots first, oldest to newest, chained differentially.
        let mut last_vol_path: Option<PathBuf> = None;
        for snap_name in snapshots {
            let snap_vol = vol.volume.new_snapshot(snap_name);
            let snap_path = self.volume_path(&snap_vol);

            let file_prefix = backup::snapshot_prefix(
                vol.volume.vol_type(),
                vol.volume.content_type(),
                snap_name,
            );

            self.add_volume_to_backup(
                tar,
                &header,
                &vol.volume,
                &snap_vol,
                &snap_path,
                last_vol_path.as_deref(),
                &file_prefix,
            )
            .await?;

            last_vol_path = Some(snap_path);
        }

        // The main volume is sent from a scratch read-only snapshot, with
        // the last snapshot as its differential parent.
        let instances_dir = self.type_dir(vol.volume.vol_type());
        tokio::fs::create_dir_all(&instances_dir)
            .await
            .map_err(|e| CowvolError::io(&instances_dir, e))?;

        let scratch = tempfile::Builder::new()
            .prefix("backup.")
            .tempdir_in(&instances_dir)
            .map_err(|e| CowvolError::io(&instances_dir, e))?;
        restrict_dir(scratch.path()).await?;

        let target = scratch.path().join(".backup");
        self.subvol.snapshot(&self.volume_path(&vol.volume), &target, true).await?;
        self.backend().set_readonly(&target, true).await?;

        let file_prefix =
            backup::volume_prefix(vol.volume.vol_type(), vol.volume.content_type());

        let result = self
            .add_volume_to_backup(
                tar,
                &header,
                &vol.volume,
                &vol.volume,
                &target,
                last_vol_path.as_deref(),
                &file_prefix,
            )
            .await;

        match result {
            Ok(()) => {
                self.subvol.delete(&target, true).await?;
                info!("Volume backed up");
                metrics::counter!("cowvol_backup_created_total").increment(1);
                Ok(())
            }
            Err(e) => {
                let _ = self.subvol.delete(&target, true).await;
                Err(e)
            }
        }
    }

    /// Spool send streams for every manifest subvolume belonging to `v`
    /// into the archive.
    #[allow(clippy::too_many_arguments)]
    async fn add_volume_to_backup(
        &self,
        tar: &mut tar::Builder<Box<dyn Write + Send>>,
        header: &MetaDataHeader,
        main_vol: &Volume,
        v: &Volume,
        source_prefix: &Path,
        parent_prefix: Option<&Path>,
        file_prefix: &str,
    ) -> Result<()> {
        let snap_name =
            if v.is_snapshot() && v.name() != main_vol.name() { v.snapshot_name() } else { "" };

        let mut guards = ReadonlyGuards::new(self.backend().clone());

        let result = async {
            let mut sent = 0;

            for sub in header.subvolumes.iter().filter(|s| s.snapshot == snap_name) {
                let mut parent_path = None;
                if let Some(prefix) = parent_prefix {
                    let candidate = Self::join_subvol_path(prefix, &sub.path);
                    if self.backend().is_subvolume(&candidate).await {
                        guards.force(&candidate).await?;
                        parent_path = Some(candidate);
                    }
                }

                let source_path = Self::join_subvol_path(source_prefix, &sub.path);
                guards.force(&source_path).await?;

                let member = backup::member_name(file_prefix, &sub.path);
                debug!(
                    volume = %v.name(),
                    source = %source_path.display(),
                    parent = ?parent_path,
                    member = %member,
                    "Generating optimized volume file"
                );

                self.spool_send_to_tar(tar, &source_path, parent_path.as_deref(), &member)
                    .await
                    .map_err(|e| {
                        CowvolError::Internal(format!(
                            "Failed adding volume {}:{}: {}",
                            v.name(),
                            sub.path,
                            e
                        ))
                    })?;

                sent += 1;
            }

            if sent < 1 {
                return Err(CowvolError::Internal(format!(
                    "No matching subvolume(s) for {:?} found in subvolumes list",
                    v.name()
                )));
            }

            Ok(())
        }
        .await;

        guards.release_all().await;
        result
    }

    /// Send one subvolume into a spool file, then append it to the archive.
    ///
    /// Tar members need their size up front, so the stream cannot go into
    /// the archive directly.
    async fn spool_send_to_tar(
        &self,
        tar: &mut tar::Builder<Box<dyn Write + Send>>,
        source: &Path,
        parent: Option<&Path>,
        member: &str,
    ) -> Result<()> {
        let spool = NamedTempFile::new_in(&self.pool_mount)
            .map_err(|e| CowvolError::io(&self.pool_mount, e))?;

        let std_file = spool.reopen().map_err(|e| CowvolError::io(spool.path(), e))?;
        let mut async_file = tokio::fs::File::from_std(std_file);

        self.backend().send_subvolume(source, parent, &mut async_file).await?;
        async_file.flush().await.map_err(|e| CowvolError::io(spool.path(), e))?;
        drop(async_file);

        let mut reopened = spool.reopen().map_err(|e| CowvolError::io(spool.path(), e))?;
        tar.append_file(member, &mut reopened).map_err(|e| CowvolError::io(spool.path(), e))?;

        Ok(())
    }

    /// Restore a backup archive onto the pool.
    ///
    /// On success the returned hook lets the caller unwind the restored
    /// volume and snapshots later.
    #[instrument(skip_all, fields(pool = %self.pool, volume = %vol.volume.name()))]
    pub async fn create_volume_from_backup(
        &self,
        vol: &VolumeCopy,
        info: &BackupInfo,
        src: &mut (dyn BackupSource + '_),
    ) -> Result<Option<RevertHook>> {
        if !info.optimized {
            let transport = self.generic_transport()?;
            let target = self.volume_path(&vol.volume);
            return transport.restore_backup(vol, &target, src, info).await;
        }

        if self.has_volume(&vol.volume).await {
            return Err(CowvolError::AlreadyExists { volume: vol.volume.name().to_string() });
        }

        let mut revert = Reverter::new();

        // Used both to roll back a failure here and, returned on success,
        // to let the calling operation unwind later.
        revert.add(self.delete_volume_unwind(&vol.volume, info.snapshots.clone()));

        let result = self.restore_backup_inner(&mut revert, vol, info, src).await;

        match result {
            Ok(()) => {
                revert.success();
                info!("Volume restored from backup");
                metrics::counter!("cowvol_backup_restored_total").increment(1);
                Ok(Some(RevertHook::from_action(
                    self.delete_volume_unwind(&vol.volume, info.snapshots.clone()),
                )))
            }
            Err(e) => {
                revert.fail().await;
                Err(e)
            }
        }
    }

    async fn restore_backup_inner(
        &self,
        revert: &mut Reverter,
        vol: &VolumeCopy,
        info: &BackupInfo,
        src: &mut (dyn BackupSource + '_),
    ) -> Result<()> {
        let header = if info.optimized_header {
            self.load_backup_header(src)?
        } else {
            // Manifest-less archives can only describe root subvolumes, so
            // restoring them is limited to root-only volumes.
            Self::pseudo_header(&info.snapshots)
        };

        let instances_dir = self.type_dir(vol.volume.vol_type());
        tokio::fs::create_dir_all(&instances_dir)
            .await
            .map_err(|e| CowvolError::io(&instances_dir, e))?;

        let scratch = tempfile::Builder::new()
            .prefix("backup.")
            .tempdir_in(&instances_dir)
            .map_err(|e| CowvolError::io(&instances_dir, e))?;
        restrict_dir(scratch.path()).await?;

        let mut copy_ops: Vec<(PathBuf, PathBuf)> = Vec::new();

        if !info.snapshots.is_empty() {
            self.create_parent_snapshot_dir(&vol.volume).await?;

            // Restore snapshots oldest to newest to preserve the
            // differential chain.
            for snap_name in &info.snapshots {
                paths::validate_snapshot_name(snap_name)?;

                let snap_vol = vol.volume.new_snapshot(snap_name);
                let file_prefix = backup::snapshot_prefix(
                    vol.volume.vol_type(),
                    vol.volume.content_type(),
                    snap_name,
                );

                self.unpack_volume(
                    revert,
                    src,
                    &header,
                    &vol.volume,
                    &snap_vol,
                    scratch.path(),
                    &file_prefix,
                    &mut copy_ops,
                )
                .await?;
            }
        }

        let file_prefix =
            backup::volume_prefix(vol.volume.vol_type(), vol.volume.content_type());
        self.unpack_volume(
            revert,
            src,
            &header,
            &vol.volume,
            &vol.volume,
            scratch.path(),
            &file_prefix,
            &mut copy_ops,
        )
        .await?;

        // Everything received; move into place in one pass.
        for (received, dest) in &copy_ops {
            self.backend().set_readonly(received, false).await?;

            let _ = tokio::fs::remove_file(dest).await;
            let _ = tokio::fs::remove_dir(dest).await;

            tokio::fs::rename(received, dest)
                .await
                .map_err(|e| CowvolError::io(received, e))?;
        }

        // Restore read-only on subvolumes the manifest flags; everything
        // was made writable during unpacking.
        for sub in &header.subvolumes {
            if !sub.readonly {
                continue;
            }

            let base = if sub.snapshot.is_empty() {
                self.volume_path(&vol.volume)
            } else {
                self.volume_path(&vol.volume.new_snapshot(&sub.snapshot))
            };

            let path = Self::join_subvol_path(&base, &sub.path);
            debug!(path = %path.display(), "Setting subvolume read-only");
            self.backend().set_readonly(&path, true).await?;
        }

        Ok(())
    }

    /// Receive every manifest subvolume belonging to `v` from its archive
    /// members, recording the renames to perform later.
    #[allow(clippy::too_many_arguments)]
    async fn unpack_volume(
        &self,
        revert: &mut Reverter,
        src: &mut (dyn BackupSource + '_),
        header: &MetaDataHeader,
        main_vol: &Volume,
        v: &Volume,
        scratch: &Path,
        file_prefix: &str,
        copy_ops: &mut Vec<(PathBuf, PathBuf)>,
    ) -> Result<()> {
        let snap_name =
            if v.is_snapshot() && v.name() != main_vol.name() { v.snapshot_name() } else { "" };

        let target_path = self.volume_path(v);

        for sub in header.subvolumes.iter().filter(|s| s.snapshot == snap_name) {
            let member = backup::member_name(file_prefix, &sub.path);

            let unpack_dir = scratch.join(snap_name);
            tokio::fs::create_dir_all(&unpack_dir)
                .await
                .map_err(|e| CowvolError::io(&unpack_dir, e))?;

            let dest = Self::join_subvol_path(&target_path, &sub.path);
            debug!(
                volume = %v.name(),
                member = %member,
                unpack_dir = %unpack_dir.display(),
                path = %dest.display(),
                "Unpacking optimized volume"
            );

            let spooled = self.spool_tar_member(src, &member)?;
            let std_file =
                spooled.reopen().map_err(|e| CowvolError::io(spooled.path(), e))?;
            let mut reader = tokio::fs::File::from_std(std_file);

            let received =
                self.backend().receive_subvolume(&unpack_dir, &mut reader).await?;

            {
                let subvol = self.subvol.clone();
                let path = received.clone();
                revert.add(async move {
                    if path.exists() {
                        subvol.delete(&path, true).await?;
                    }
                    Ok(())
                });
            }

            copy_ops.push((received, dest));
        }

        Ok(())
    }

    /// Scan the archive for the optimized manifest.
    fn load_backup_header(&self, src: &mut (dyn BackupSource + '_)) -> Result<MetaDataHeader> {
        src.seek(SeekFrom::Start(0)).map_err(CowvolError::internal)?;

        let mut archive = tar::Archive::new(&mut *src);
        for entry in archive.entries().map_err(CowvolError::internal)? {
            let mut entry = entry.map_err(CowvolError::internal)?;

            let name = entry.path().map_err(CowvolError::internal)?.to_path_buf();
            if name != Path::new(BACKUP_HEADER_NAME) {
                continue;
            }

            let mut yaml = Vec::new();
            entry.read_to_end(&mut yaml).map_err(CowvolError::internal)?;

            return serde_yaml::from_slice(&yaml).map_err(|e| {
                CowvolError::Internal(format!("Failed decoding backup manifest: {}", e))
            });
        }

        Err(CowvolError::Internal(format!(
            "Could not find {:?} in backup",
            BACKUP_HEADER_NAME
        )))
    }

    /// Scan the archive for `member`, spooling its bytes into a temp file.
    fn spool_tar_member(
        &self,
        src: &mut (dyn BackupSource + '_),
        member: &str,
    ) -> Result<NamedTempFile> {
        src.seek(SeekFrom::Start(0)).map_err(CowvolError::internal)?;

        let mut archive = tar::Archive::new(&mut *src);
        for entry in archive.entries().map_err(CowvolError::internal)? {
            let mut entry = entry.map_err(CowvolError::internal)?;

            let name = entry.path().map_err(CowvolError::internal)?.to_path_buf();
            if name != Path::new(member) {
                continue;
            }

            let mut spool = NamedTempFile::new_in(&self.pool_mount)
                .map_err(|e| CowvolError::io(&self.pool_mount, e))?;
            std::io::copy(&mut entry, spool.as_file_mut()).map_err(CowvolError::internal)?;

            return Ok(spool);
        }

        Err(CowvolError::Internal(format!("Could not find {:?} in backup", member)))
    }
}

/// Append the YAML manifest as the archive's first member.
fn append_manifest(
    tar: &mut tar::Builder<Box<dyn Write + Send>>,
    yaml: &[u8],
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(yaml.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
    );
    header.set_cksum();

    tar.append_data(&mut header, BACKUP_HEADER_NAME, yaml)
        .map_err(CowvolError::internal)
}
