//! Optimized migration over a bidirectional byte stream.
//!
//! The source sends a JSON metadata header frame (when negotiated), reads
//! an optional refresh reply, then streams differential sends for each
//! snapshot followed by the main volume. The target receives each stream
//! into a scratch directory, then renames everything into place in one
//! pass, re-imprinting received UUIDs so later incremental receives can
//! still resolve their parents.

use super::{restrict_dir, BtrfsDriver};
use crate::error::{CowvolError, Result};
use crate::migration::{MigrationConn, MigrationFeature, MigrationType, VolumeSourceArgs, VolumeTargetArgs};
use crate::revert::{Reverter, RevertHook};
use crate::types::{ContentType, MetaDataHeader, Subvolume, Volume, VolumeCopy};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

impl BtrfsDriver {
    /// Send a volume (and snapshots) for migration.
    #[instrument(skip_all, fields(pool = %self.pool, volume = %vol.volume.name()))]
    pub async fn migrate_volume(
        &self,
        vol: &VolumeCopy,
        conn: &mut (dyn MigrationConn + '_),
        args: &VolumeSourceArgs,
    ) -> Result<()> {
        match args.migration_type {
            MigrationType::Rsync | MigrationType::BlockAndRsync => {
                let transport = self.generic_transport()?;

                // A file-by-file transport copies a live tree; snapshot it
                // first so the transfer is consistent.
                if vol.volume.content_type() == ContentType::Filesystem
                    && !vol.volume.is_snapshot()
                {
                    let (snap_path, cleanup) = self.readonly_snapshot(&vol.volume).await?;
                    let result = transport.migrate_volume(vol, &snap_path, conn, args).await;
                    cleanup.run().await;
                    return result;
                }

                let src_path = self.volume_path(&vol.volume);
                return transport.migrate_volume(vol, &src_path, conn, args).await;
            }
            MigrationType::Btrfs => {}
        }

        if args.multi_sync || args.final_sync {
            return Err(CowvolError::Internal(
                "Multi-sync should not be used with optimized migration".to_string(),
            ));
        }

        let mut snapshots = Vec::new();
        if !args.volume_only {
            snapshots = self.volume_snapshots_sorted(&vol.volume).await?;
        }

        let header = self.restoration_header(&vol.volume, &snapshots).await?;

        // Without subvolume support on the wire, a source holding nested
        // subvolumes would silently lose them on the target.
        if !args.has_feature(MigrationFeature::HeaderFrame)
            || !args.has_feature(MigrationFeature::Subvolumes)
        {
            if header.subvolumes.iter().any(|s| !s.is_root()) {
                return Err(CowvolError::NotSupported {
                    reason: "Subvolumes detected in source but target does not support \
                             receiving subvolumes"
                        .to_string(),
                });
            }
        }

        if args.has_feature(MigrationFeature::HeaderFrame) {
            let frame = serde_json::to_vec(&header)
                .map_err(|e| CowvolError::Internal(format!("Failed encoding migration header: {}", e)))?;
            conn.write_frame(&frame).await?;
            debug!("Sent migration metadata header");
        }

        let mut send_snapshots = args.snapshots.clone();
        let mut manifest = header.subvolumes;

        if args.refresh && args.has_feature(MigrationFeature::SubvolumeUuids) {
            let frame = conn.read_frame().await?;
            let reply: MetaDataHeader = serde_json::from_slice(&frame)
                .map_err(|e| CowvolError::Internal(format!("Failed decoding migration header: {}", e)))?;

            debug!("Received migration reply header");

            // The receiver replied with the subset it still needs.
            send_snapshots = reply
                .subvolumes
                .iter()
                .filter(|s| s.is_root() && !s.snapshot.is_empty())
                .map(|s| s.snapshot.clone())
                .collect();
            manifest = reply.subvolumes;
        }

        self.migrate_volume_optimized(vol, conn, args, &send_snapshots, &manifest).await?;

        info!("Volume migrated");
        metrics::counter!("cowvol_migration_sent_total").increment(1);
        Ok(())
    }

    async fn migrate_volume_optimized(
        &self,
        vol: &VolumeCopy,
        conn: &mut (dyn MigrationConn + '_),
        args: &VolumeSourceArgs,
        send_snapshots: &[String],
        manifest: &[Subvolume],
    ) -> Result<()> {
        let has_subvolumes = args.has_feature(MigrationFeature::Subvolumes);

        // Differential anchor: each snapshot sends against the previous
        // one, and the main volume against the last snapshot.
        let mut last_vol_path: Option<PathBuf> = None;

        if !vol.volume.is_snapshot() && !args.volume_only {
            if args.refresh {
                // Anchor the first transferred snapshot on its predecessor
                // (which the target already holds).
                for (i, snap) in vol.snapshots.iter().enumerate().skip(1) {
                    if !send_snapshots.is_empty()
                        && snap.snapshot_name() == send_snapshots[0]
                    {
                        last_vol_path = Some(self.volume_path(&vol.snapshots[i - 1]));
                        break;
                    }
                }
            }

            for snap_name in send_snapshots {
                let snap_vol = vol.volume.new_snapshot(snap_name);
                let snap_path = self.volume_path(&snap_vol);

                self.send_matching(
                    &vol.volume,
                    &snap_vol,
                    &snap_path,
                    last_vol_path.as_deref(),
                    manifest,
                    has_subvolumes,
                    conn,
                )
                .await?;

                last_vol_path = Some(snap_path);
            }

            // Even with nothing to transfer, existing snapshots make the
            // main volume's differential small.
            if args.refresh && send_snapshots.is_empty() && !vol.snapshots.is_empty() {
                last_vol_path = vol.snapshots.last().map(|s| self.volume_path(s));
            }
        }

        // Live subvolumes may be read-write; a recursive read-only snapshot
        // in scratch is the stable source for the send.
        let instances_dir = self.type_dir(vol.volume.vol_type());
        tokio::fs::create_dir_all(&instances_dir)
            .await
            .map_err(|e| CowvolError::io(&instances_dir, e))?;

        let scratch = tempfile::Builder::new()
            .prefix("migration.")
            .tempdir_in(&instances_dir)
            .map_err(|e| CowvolError::io(&instances_dir, e))?;
        restrict_dir(scratch.path()).await?;

        let send_prefix = scratch.path().join(".migration-send");
        self.subvol.snapshot(&self.volume_path(&vol.volume), &send_prefix, true).await?;

        let result = self
            .send_matching(
                &vol.volume,
                &vol.volume,
                &send_prefix,
                last_vol_path.as_deref(),
                manifest,
                has_subvolumes,
                conn,
            )
            .await;

        // Scratch snapshot goes away on every exit path.
        if let Err(e) = self.subvol.delete(&send_prefix, true).await {
            debug!(error = %e, "Failed deleting scratch send snapshot");
        }

        result
    }

    /// Send every manifest subvolume belonging to `v` from `source_prefix`,
    /// differential against `parent_prefix` where the matching parent
    /// subvolume exists.
    #[allow(clippy::too_many_arguments)]
    async fn send_matching(
        &self,
        main_vol: &Volume,
        v: &Volume,
        source_prefix: &Path,
        parent_prefix: Option<&Path>,
        manifest: &[Subvolume],
        has_subvolumes: bool,
        conn: &mut (dyn MigrationConn + '_),
    ) -> Result<()> {
        // The main volume may itself be a snapshot, so compare names rather
        // than relying on is_snapshot().
        let snap_name =
            if v.is_snapshot() && v.name() != main_vol.name() { v.snapshot_name() } else { "" };

        let mut guards = crate::subvol::ReadonlyGuards::new(self.backend().clone());

        let result = async {
            let mut sent = 0;

            for sub in manifest.iter().filter(|s| s.snapshot == snap_name) {
                if !sub.is_root() && !has_subvolumes {
                    continue;
                }

                // Sender and differential parent must both be read-only for
                // the duration of the send.
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

                debug!(
                    volume = %v.name(),
                    source = %source_path.display(),
                    parent = ?parent_path,
                    path = %sub.path,
                    "Sending subvolume"
                );

                self.backend()
                    .send_subvolume(&source_path, parent_path.as_deref(), conn.writer())
                    .await
                    .map_err(|e| {
                        CowvolError::Internal(format!(
                            "Failed sending volume {}:{}: {}",
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

    /// Receive a volume being sent via migration.
    ///
    /// On success the returned hook lets the caller unwind the whole
    /// receive later (snapshots, then the main volume).
    #[instrument(skip_all, fields(pool = %self.pool, volume = %vol.volume.name()))]
    pub async fn create_volume_from_migration(
        &self,
        vol: &VolumeCopy,
        conn: &mut (dyn MigrationConn + '_),
        args: &VolumeTargetArgs,
    ) -> Result<Option<RevertHook>> {
        match args.migration_type {
            MigrationType::Rsync | MigrationType::BlockAndRsync => {
                let transport = self.generic_transport()?;
                let target = self.volume_path(&vol.volume);
                transport.create_volume_from_migration(vol, &target, conn, args).await?;
                return Ok(None);
            }
            MigrationType::Btrfs => {}
        }

        let mut header = if args.has_feature(MigrationFeature::HeaderFrame) {
            let frame = conn.read_frame().await?;
            let header: MetaDataHeader = serde_json::from_slice(&frame)
                .map_err(|e| CowvolError::Internal(format!("Failed decoding migration header: {}", e)))?;
            debug!("Received migration metadata header");
            header
        } else {
            // Sources without header support can only hold root subvolumes.
            Self::pseudo_header(&args.snapshots)
        };

        let mut expected_snapshots = args.snapshots.clone();

        if args.refresh && args.has_feature(MigrationFeature::SubvolumeUuids) {
            let local_snapshots = self.volume_snapshots_sorted(&vol.volume).await?;

            // Local received UUIDs identify which incoming subvolumes are
            // already present.
            let mut local: HashMap<String, String> = HashMap::new();
            for snap in &local_snapshots {
                let snap_path = self.volume_path(&vol.volume.new_snapshot(snap));
                let info = self.backend().subvolume_info(&snap_path).await?;
                local.insert(snap.clone(), info.received_uuid);
            }

            expected_snapshots = Vec::new();
            let mut needed = Vec::new();

            for sub in &header.subvolumes {
                if local.get(&sub.snapshot).is_some_and(|uuid| *uuid == sub.uuid) {
                    continue;
                }

                if sub.is_root() && !sub.snapshot.is_empty() {
                    expected_snapshots.push(sub.snapshot.clone());
                }

                needed.push(Subvolume {
                    snapshot: sub.snapshot.clone(),
                    path: sub.path.clone(),
                    readonly: sub.readonly,
                    uuid: sub.uuid.clone(),
                    ..Default::default()
                });
            }

            header = MetaDataHeader { subvolumes: needed };

            let frame = serde_json::to_vec(&header)
                .map_err(|e| CowvolError::Internal(format!("Failed encoding migration header: {}", e)))?;
            conn.write_frame(&frame).await?;
            debug!("Sent migration reply header");
        }

        let sync_subvolumes = header.subvolumes;

        let mut revert = Reverter::new();

        // A mid-receive failure tears down every materialized snapshot plus
        // the main volume; the same unwind is returned on success so an
        // outer operation can do it later.
        revert.add(self.receive_unwind(vol));

        let result = self
            .receive_volume_optimized(&mut revert, vol, conn, args, &expected_snapshots, &sync_subvolumes)
            .await;

        match result {
            Ok(()) => {
                revert.success();
                info!("Volume received");
                metrics::counter!("cowvol_migration_received_total").increment(1);
                Ok(Some(RevertHook::from_action(self.receive_unwind(vol))))
            }
            Err(e) => {
                revert.fail().await;
                Err(e)
            }
        }
    }

    /// Header substitute for sources that cannot send one: root subvolumes
    /// only, snapshots read-only, main volume writable.
    pub(super) fn pseudo_header(snapshots: &[String]) -> MetaDataHeader {
        let mut header = MetaDataHeader::default();

        for snap in snapshots {
            header.subvolumes.push(Subvolume {
                snapshot: snap.clone(),
                path: "/".to_string(),
                readonly: true,
                ..Default::default()
            });
        }

        header.subvolumes.push(Subvolume {
            snapshot: String::new(),
            path: "/".to_string(),
            readonly: false,
            ..Default::default()
        });

        header
    }

    /// Unwind action deleting everything this receive materialized:
    /// snapshots first, then the main volume, then the emptied snapshots
    /// directory.
    fn receive_unwind(
        &self,
        vol: &VolumeCopy,
    ) -> impl std::future::Future<Output = Result<()>> + Send + 'static {
        let snapshots: Vec<String> =
            vol.snapshots.iter().map(|s| s.snapshot_name().to_string()).collect();
        self.delete_volume_unwind(&vol.volume, snapshots)
    }

    async fn receive_volume_optimized(
        &self,
        revert: &mut Reverter,
        vol: &VolumeCopy,
        conn: &mut (dyn MigrationConn + '_),
        args: &VolumeTargetArgs,
        expected_snapshots: &[String],
        sync_subvolumes: &[Subvolume],
    ) -> Result<()> {
        // (received path, final path, received UUID) per subvolume; renames
        // happen only after every receive completed.
        let mut copy_ops: Vec<(PathBuf, PathBuf, String)> = Vec::new();

        let instances_dir = self.type_dir(vol.volume.vol_type());
        tokio::fs::create_dir_all(&instances_dir)
            .await
            .map_err(|e| CowvolError::io(&instances_dir, e))?;

        let scratch = tempfile::Builder::new()
            .prefix("migration.")
            .tempdir_in(&instances_dir)
            .map_err(|e| CowvolError::io(&instances_dir, e))?;
        restrict_dir(scratch.path()).await?;

        if !args.volume_only && !expected_snapshots.is_empty() {
            self.create_parent_snapshot_dir(&vol.volume).await?;

            {
                let dir = crate::paths::snapshots_dir_path(
                    &self.pool_mount,
                    vol.volume.vol_type(),
                    vol.volume.name(),
                );
                revert.add(async move {
                    let _ = tokio::fs::remove_dir(&dir).await;
                    Ok(())
                });
            }

            for snap_name in expected_snapshots {
                let snap_vol = vol.volume.new_snapshot(snap_name);
                self.receive_matching(
                    revert,
                    &vol.volume,
                    &snap_vol,
                    scratch.path(),
                    sync_subvolumes,
                    conn,
                    &mut copy_ops,
                )
                .await?;
            }
        }

        self.receive_matching(
            revert,
            &vol.volume,
            &vol.volume,
            scratch.path(),
            sync_subvolumes,
            conn,
            &mut copy_ops,
        )
        .await?;

        // A refresh replaces the live root with the received one.
        if args.refresh {
            self.subvol.delete(&self.volume_path(&vol.volume), true).await?;
        }

        for (src, dest, received_uuid) in &copy_ops {
            self.backend().set_readonly(src, false).await?;

            // Clear the destination (an empty placeholder directory or a
            // leftover file) for the rename.
            let _ = tokio::fs::remove_file(dest).await;
            let _ = tokio::fs::remove_dir(dest).await;

            tokio::fs::rename(src, dest).await.map_err(|e| CowvolError::io(src, e))?;

            // The read-write transition cleared the received UUID; without
            // re-imprinting it, later incremental receives cannot find
            // their parent.
            if !received_uuid.is_empty() {
                self.backend().set_received_uuid(dest, received_uuid).await?;
            }
        }

        // Restore read-only on every subvolume the manifest flags.
        for sub in sync_subvolumes {
            if !sub.readonly {
                continue;
            }

            let base = if sub.snapshot.is_empty() {
                self.volume_path(&vol.volume)
            } else {
                self.volume_path(&vol.volume.new_snapshot(&sub.snapshot))
            };

            self.backend()
                .set_readonly(&Self::join_subvol_path(&base, &sub.path), true)
                .await?;
        }

        if vol.volume.content_type() == ContentType::Filesystem {
            self.set_volume_quota(&vol.volume, vol.volume.config_size(), false).await?;
        }

        Ok(())
    }

    /// Receive every manifest subvolume belonging to `v` into a scratch
    /// subdirectory, recording the rename to perform later.
    #[allow(clippy::too_many_arguments)]
    async fn receive_matching(
        &self,
        revert: &mut Reverter,
        main_vol: &Volume,
        v: &Volume,
        scratch: &Path,
        sync_subvolumes: &[Subvolume],
        conn: &mut (dyn MigrationConn + '_),
        copy_ops: &mut Vec<(PathBuf, PathBuf, String)>,
    ) -> Result<()> {
        let snap_name =
            if v.is_snapshot() && v.name() != main_vol.name() { v.snapshot_name() } else { "" };

        let target_path = self.volume_path(v);

        for sub in sync_subvolumes.iter().filter(|s| s.snapshot == snap_name) {
            let recv_dir = scratch.join(snap_name);
            tokio::fs::create_dir_all(&recv_dir)
                .await
                .map_err(|e| CowvolError::io(&recv_dir, e))?;

            let dest = Self::join_subvol_path(&target_path, &sub.path);
            debug!(
                volume = %v.name(),
                receive_dir = %recv_dir.display(),
                path = %dest.display(),
                "Receiving subvolume"
            );

            let received = self.backend().receive_subvolume(&recv_dir, conn.reader()).await?;

            // A received-but-not-yet-finalized subvolume is removed if the
            // operation fails before its rename.
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

            let info = self.backend().subvolume_info(&received).await?;
            copy_ops.push((received, dest, info.received_uuid));
        }

        Ok(())
    }
}
