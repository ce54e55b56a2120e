//! Integration tests for the optimized migration protocol and the
//! optimized backup format, run end-to-end between two mock pools.

mod support;

use cowvol::backup::BackupInfo;
use cowvol::error::CowvolError;
use cowvol::migration::{
    LengthPrefixedConn, MigrationFeature, MigrationType, VolumeSourceArgs, VolumeTargetArgs,
};
use cowvol::paths;
use cowvol::subvol::BtrfsBackend;
use cowvol::types::{ContentType, VolumeCopy, VolumeType};
use std::io::Write;
use std::path::Path;
use support::{fs_volume, new_pool, volume, TestPool};

fn all_features() -> Vec<MigrationFeature> {
    vec![
        MigrationFeature::HeaderFrame,
        MigrationFeature::Subvolumes,
        MigrationFeature::SubvolumeUuids,
    ]
}

fn source_args(snapshots: &[&str], refresh: bool) -> VolumeSourceArgs {
    VolumeSourceArgs {
        migration_type: MigrationType::Btrfs,
        features: all_features(),
        snapshots: snapshots.iter().map(|s| s.to_string()).collect(),
        volume_only: false,
        refresh,
        multi_sync: false,
        final_sync: false,
    }
}

fn target_args(snapshots: &[&str], refresh: bool) -> VolumeTargetArgs {
    VolumeTargetArgs {
        migration_type: MigrationType::Btrfs,
        features: all_features(),
        snapshots: snapshots.iter().map(|s| s.to_string()).collect(),
        volume_only: false,
        refresh,
    }
}

/// Build `c1` with a read-only `/data` subvolume and snapshots s1, s2.
async fn seed_source(pool: &TestPool) -> cowvol::Volume {
    let vol = fs_volume("c1", "1GiB");
    pool.driver.create_volume(&vol, None).await.unwrap();

    let vol_path = pool.driver.volume_path(&vol);
    std::fs::write(vol_path.join("app"), b"v1").unwrap();
    pool.backend.create_subvolume(&vol_path.join("data")).await.unwrap();
    std::fs::write(vol_path.join("data/keep"), b"payload").unwrap();
    pool.backend.set_readonly(&vol_path.join("data"), true).await.unwrap();

    pool.driver.create_volume_snapshot(&vol.new_snapshot("s1")).await.unwrap();

    std::fs::write(vol_path.join("app2"), b"v2").unwrap();
    pool.driver.create_volume_snapshot(&vol.new_snapshot("s2")).await.unwrap();

    vol
}

async fn run_migration(
    src_pool: &TestPool,
    dst_pool: &TestPool,
    src_copy: &VolumeCopy,
    dst_copy: &VolumeCopy,
    src_args: &VolumeSourceArgs,
    dst_args: &VolumeTargetArgs,
) {
    let (a, b) = tokio::io::duplex(1 << 20);
    let mut src_conn = LengthPrefixedConn::new(a);
    let mut dst_conn = LengthPrefixedConn::new(b);

    let (sent, received) = tokio::join!(
        src_pool.driver.migrate_volume(src_copy, &mut src_conn, src_args),
        dst_pool.driver.create_volume_from_migration(dst_copy, &mut dst_conn, dst_args),
    );

    sent.unwrap();
    let hook = received.unwrap();
    assert!(hook.is_some(), "optimized receive returns an unwind hook");
}

#[tokio::test]
async fn test_optimized_migration_full() {
    let src_pool = new_pool("p1");
    let dst_pool = new_pool("p2");
    let src_vol = seed_source(&src_pool).await;

    let src_copy = VolumeCopy::new(
        src_vol.clone(),
        vec![src_vol.new_snapshot("s1"), src_vol.new_snapshot("s2")],
    );
    let dst_vol = fs_volume("c1", "1GiB");
    let dst_copy = VolumeCopy::new(
        dst_vol.clone(),
        vec![dst_vol.new_snapshot("s1"), dst_vol.new_snapshot("s2")],
    );

    run_migration(
        &src_pool,
        &dst_pool,
        &src_copy,
        &dst_copy,
        &source_args(&["s1", "s2"], false),
        &target_args(&["s1", "s2"], false),
    )
    .await;

    let src_path = src_pool.driver.volume_path(&src_vol);
    let dst_path = dst_pool.driver.volume_path(&dst_vol);

    // Payload arrived bit-identical.
    assert_eq!(std::fs::read(dst_path.join("app")).unwrap(), b"v1");
    assert_eq!(std::fs::read(dst_path.join("app2")).unwrap(), b"v2");
    assert_eq!(std::fs::read(dst_path.join("data/keep")).unwrap(), b"payload");

    // Read-only flags match the source graph.
    assert_eq!(dst_pool.backend.readonly_of(&dst_path), Some(false));
    assert_eq!(dst_pool.backend.readonly_of(&dst_path.join("data")), Some(true));

    let src_graph = src_pool.driver.subvolumes().graph(&src_path, "").await.unwrap();
    let dst_graph = dst_pool.driver.subvolumes().graph(&dst_path, "").await.unwrap();
    assert_eq!(src_graph, dst_graph);

    // Received snapshots carry the source's UUID as their received UUID.
    for snap in ["s1", "s2"] {
        let src_snap = src_pool.driver.volume_path(&src_vol.new_snapshot(snap));
        let dst_snap = dst_pool.driver.volume_path(&dst_vol.new_snapshot(snap));

        assert_eq!(dst_pool.backend.readonly_of(&dst_snap), Some(true));
        assert_eq!(
            dst_pool.backend.received_uuid_of(&dst_snap),
            src_pool.backend.uuid_of(&src_snap),
        );
    }

    // The main volume's receive lineage survived the read-write rename.
    assert_ne!(dst_pool.backend.received_uuid_of(&dst_path), Some(String::new()));

    // Size quota applied on the target.
    let qgroup = dst_pool.backend.qgroup_of(&dst_path).unwrap();
    assert_eq!(qgroup.referenced_limit, Some(1073741824));
}

#[tokio::test]
async fn test_optimized_migration_refresh() {
    let src_pool = new_pool("p1");
    let dst_pool = new_pool("p2");
    let src_vol = seed_source(&src_pool).await;

    let dst_vol = fs_volume("c1", "1GiB");
    let full_src = VolumeCopy::new(
        src_vol.clone(),
        vec![src_vol.new_snapshot("s1"), src_vol.new_snapshot("s2")],
    );
    let full_dst = VolumeCopy::new(
        dst_vol.clone(),
        vec![dst_vol.new_snapshot("s1"), dst_vol.new_snapshot("s2")],
    );

    run_migration(
        &src_pool,
        &dst_pool,
        &full_src,
        &full_dst,
        &source_args(&["s1", "s2"], false),
        &target_args(&["s1", "s2"], false),
    )
    .await;

    // The source moves on: new file, new snapshot s3.
    let src_path = src_pool.driver.volume_path(&src_vol);
    std::fs::write(src_path.join("app3"), b"v3").unwrap();
    src_pool.driver.create_volume_snapshot(&src_vol.new_snapshot("s3")).await.unwrap();

    let refresh_src = VolumeCopy::new(
        src_vol.clone(),
        vec![
            src_vol.new_snapshot("s1"),
            src_vol.new_snapshot("s2"),
            src_vol.new_snapshot("s3"),
        ],
    );
    let refresh_dst = VolumeCopy::new(
        dst_vol.clone(),
        vec![
            dst_vol.new_snapshot("s1"),
            dst_vol.new_snapshot("s2"),
            dst_vol.new_snapshot("s3"),
        ],
    );

    // The receiver advertises s1/s2 via received UUIDs; only s3 and a main
    // volume differential flow.
    run_migration(
        &src_pool,
        &dst_pool,
        &refresh_src,
        &refresh_dst,
        &source_args(&["s3"], true),
        &target_args(&["s3"], true),
    )
    .await;

    let dst_path = dst_pool.driver.volume_path(&dst_vol);
    assert_eq!(std::fs::read(dst_path.join("app3")).unwrap(), b"v3");

    // The refreshed main volume keeps its nested read-only flag.
    assert_eq!(dst_pool.backend.readonly_of(&dst_path.join("data")), Some(true));

    let mut snapshots = dst_pool.driver.volume_snapshots(&dst_vol).await.unwrap();
    snapshots.sort();
    assert_eq!(snapshots, vec!["s1".to_string(), "s2".to_string(), "s3".to_string()]);

    let src_s3 = src_pool.driver.volume_path(&src_vol.new_snapshot("s3"));
    let dst_s3 = dst_pool.driver.volume_path(&dst_vol.new_snapshot("s3"));
    assert_eq!(
        dst_pool.backend.received_uuid_of(&dst_s3),
        src_pool.backend.uuid_of(&src_s3),
    );

    // Applying the same refresh again moves no snapshots: the reply header
    // is empty of snapshot roots, so only a main-volume differential runs.
    run_migration(
        &src_pool,
        &dst_pool,
        &refresh_src,
        &refresh_dst,
        &source_args(&[], true),
        &target_args(&[], true),
    )
    .await;

    let mut snapshots = dst_pool.driver.volume_snapshots(&dst_vol).await.unwrap();
    snapshots.sort();
    assert_eq!(snapshots, vec!["s1".to_string(), "s2".to_string(), "s3".to_string()]);
    assert_eq!(std::fs::read(dst_path.join("app3")).unwrap(), b"v3");
}

#[tokio::test]
async fn test_migration_rejects_subvolumes_without_feature() {
    let src_pool = new_pool("p1");
    let src_vol = seed_source(&src_pool).await;

    let src_copy = VolumeCopy::new(src_vol.clone(), vec![src_vol.new_snapshot("s1")]);

    let mut args = source_args(&["s1"], false);
    args.features = vec![MigrationFeature::HeaderFrame];

    let (a, _b) = tokio::io::duplex(1 << 16);
    let mut conn = LengthPrefixedConn::new(a);

    let err = src_pool.driver.migrate_volume(&src_copy, &mut conn, &args).await.unwrap_err();
    assert!(matches!(err, CowvolError::NotSupported { .. }));
}

#[tokio::test]
async fn test_migration_unsupported_wire_mode_without_transport() {
    let src_pool = new_pool("p1");
    let src_vol = seed_source(&src_pool).await;
    let src_copy = VolumeCopy::new(src_vol.clone(), vec![]);

    let mut args = source_args(&[], false);
    args.migration_type = MigrationType::Rsync;

    let (a, _b) = tokio::io::duplex(1 << 16);
    let mut conn = LengthPrefixedConn::new(a);

    let err = src_pool.driver.migrate_volume(&src_copy, &mut conn, &args).await.unwrap_err();
    assert!(matches!(err, CowvolError::NotSupported { .. }));
}

#[tokio::test]
async fn test_optimized_backup_restore_round_trip() {
    let pool = new_pool("p1");

    // A VM: one subvolume co-hosting config files and the block image,
    // with a read-only /data sub-subvolume.
    let vol_fs = volume("vm1", VolumeType::VirtualMachine, ContentType::Filesystem, "1GiB");
    pool.driver.create_volume(&vol_fs, None).await.unwrap();

    let vol_path = pool.driver.volume_path(&vol_fs);
    std::fs::write(vol_path.join("config.yaml"), b"cpus: 2").unwrap();
    std::fs::write(vol_path.join(paths::ROOT_DISK_FILE), vec![0xEE; 65536]).unwrap();
    pool.backend.create_subvolume(&vol_path.join("data")).await.unwrap();
    pool.backend.set_readonly(&vol_path.join("data"), true).await.unwrap();

    pool.driver.create_volume_snapshot(&vol_fs.new_snapshot("s1")).await.unwrap();

    // Pack both VM components into one archive.
    let tar_path = pool._dir.path().join("backup.tar");
    {
        let file = std::fs::File::create(&tar_path).unwrap();
        let mut builder = tar::Builder::new(Box::new(file) as Box<dyn Write + Send>);

        let vol_block = volume("vm1", VolumeType::VirtualMachine, ContentType::Block, "1GiB");
        let block_copy =
            VolumeCopy::new(vol_block.clone(), vec![vol_block.new_snapshot("s1")]);
        pool.driver
            .backup_volume(&block_copy, &mut builder, true, &["s1".to_string()])
            .await
            .unwrap();

        let fs_copy = VolumeCopy::new(vol_fs.clone(), vec![vol_fs.new_snapshot("s1")]);
        pool.driver
            .backup_volume(&fs_copy, &mut builder, true, &["s1".to_string()])
            .await
            .unwrap();

        builder.finish().unwrap();
    }

    // Both components and their subvolume members are in the archive.
    let members = tar_member_names(&tar_path);
    for expected in [
        "backup/optimized_header.yaml",
        "backup/virtual-machine.bin",
        "backup/virtual-machine_data.bin",
        "backup/virtual-machine-snapshots/s1.bin",
        "backup/virtual-machine-snapshots/s1_data.bin",
        "backup/virtual-machine-config.bin",
        "backup/virtual-machine-config_data.bin",
        "backup/virtual-machine-snapshots/s1-config.bin",
        "backup/virtual-machine-snapshots/s1-config_data.bin",
    ] {
        assert!(members.iter().any(|m| m == expected), "missing member {}", expected);
    }

    // Restore the config component into a fresh pool.
    let dst = new_pool("p2");
    let dst_fs = volume("vm1", VolumeType::VirtualMachine, ContentType::Filesystem, "1GiB");
    let dst_copy = VolumeCopy::new(dst_fs.clone(), vec![dst_fs.new_snapshot("s1")]);

    let info = BackupInfo {
        optimized: true,
        optimized_header: true,
        snapshots: vec!["s1".to_string()],
    };

    let mut file = std::fs::File::open(&tar_path).unwrap();
    let hook = dst.driver.create_volume_from_backup(&dst_copy, &info, &mut file).await.unwrap();
    assert!(hook.is_some());

    let dst_path = dst.driver.volume_path(&dst_fs);
    assert_eq!(std::fs::read(dst_path.join("config.yaml")).unwrap(), b"cpus: 2");
    assert_eq!(
        std::fs::read(dst_path.join(paths::ROOT_DISK_FILE)).unwrap(),
        vec![0xEE; 65536]
    );
    assert_eq!(dst.backend.readonly_of(&dst_path.join("data")), Some(true));
    assert_eq!(dst.backend.readonly_of(&dst_path), Some(false));

    let dst_s1 = dst.driver.volume_path(&dst_fs.new_snapshot("s1"));
    assert_eq!(dst.backend.readonly_of(&dst_s1), Some(true));

    // The subvolume graph is identical to the original.
    let src_graph = pool.driver.subvolumes().graph(&vol_path, "").await.unwrap();
    let dst_graph = dst.driver.subvolumes().graph(&dst_path, "").await.unwrap();
    assert_eq!(src_graph, dst_graph);

    // The same volume cannot be restored twice.
    let dst_block = volume("vm1", VolumeType::VirtualMachine, ContentType::Block, "1GiB");
    let block_copy = VolumeCopy::new(dst_block.clone(), vec![dst_block.new_snapshot("s1")]);
    let mut file = std::fs::File::open(&tar_path).unwrap();
    let err =
        dst.driver.create_volume_from_backup(&block_copy, &info, &mut file).await.unwrap_err();
    assert!(matches!(err, CowvolError::AlreadyExists { .. }));
}

#[tokio::test]
async fn test_legacy_backup_without_manifest_restores_root_only() {
    let pool = new_pool("p1");
    let vol = volume("web", VolumeType::Custom, ContentType::Filesystem, "");
    pool.driver.create_volume(&vol, None).await.unwrap();

    let vol_path = pool.driver.volume_path(&vol);
    std::fs::write(vol_path.join("index.html"), b"<html/>").unwrap();
    pool.driver.create_volume_snapshot(&vol.new_snapshot("s1")).await.unwrap();

    let tar_path = pool._dir.path().join("backup.tar");
    {
        let file = std::fs::File::create(&tar_path).unwrap();
        let mut builder = tar::Builder::new(Box::new(file) as Box<dyn Write + Send>);
        let copy = VolumeCopy::new(vol.clone(), vec![vol.new_snapshot("s1")]);
        pool.driver.backup_volume(&copy, &mut builder, true, &["s1".to_string()]).await.unwrap();
        builder.finish().unwrap();
    }

    // Restore as a legacy archive: the manifest is ignored and a root-only
    // pseudo manifest synthesized.
    let dst = new_pool("p2");
    let dst_vol = volume("web", VolumeType::Custom, ContentType::Filesystem, "");
    let dst_copy = VolumeCopy::new(dst_vol.clone(), vec![dst_vol.new_snapshot("s1")]);

    let info = BackupInfo {
        optimized: true,
        optimized_header: false,
        snapshots: vec!["s1".to_string()],
    };

    let mut file = std::fs::File::open(&tar_path).unwrap();
    dst.driver.create_volume_from_backup(&dst_copy, &info, &mut file).await.unwrap();

    let dst_path = dst.driver.volume_path(&dst_vol);
    assert_eq!(std::fs::read(dst_path.join("index.html")).unwrap(), b"<html/>");
    assert_eq!(dst.backend.readonly_of(&dst_path), Some(false));

    let dst_s1 = dst.driver.volume_path(&dst_vol.new_snapshot("s1"));
    assert_eq!(dst.backend.readonly_of(&dst_s1), Some(true));
}

#[tokio::test]
async fn test_restore_rejects_invalid_snapshot_name() {
    let pool = new_pool("p1");
    let vol = volume("web", VolumeType::Custom, ContentType::Filesystem, "");
    pool.driver.create_volume(&vol, None).await.unwrap();
    pool.driver.create_volume_snapshot(&vol.new_snapshot("s1")).await.unwrap();

    let tar_path = pool._dir.path().join("backup.tar");
    {
        let file = std::fs::File::create(&tar_path).unwrap();
        let mut builder = tar::Builder::new(Box::new(file) as Box<dyn Write + Send>);
        let copy = VolumeCopy::new(vol.clone(), vec![vol.new_snapshot("s1")]);
        pool.driver.backup_volume(&copy, &mut builder, true, &["s1".to_string()]).await.unwrap();
        builder.finish().unwrap();
    }

    let dst = new_pool("p2");
    let dst_vol = volume("web2", VolumeType::Custom, ContentType::Filesystem, "");
    let dst_copy = VolumeCopy::new(dst_vol.clone(), vec![]);

    let info = BackupInfo {
        optimized: true,
        optimized_header: false,
        snapshots: vec!["../evil".to_string()],
    };

    let mut file = std::fs::File::open(&tar_path).unwrap();
    let err = dst.driver.create_volume_from_backup(&dst_copy, &info, &mut file).await.unwrap_err();
    assert!(matches!(err, CowvolError::InvalidName { .. }));
}

/// Generic transport stub recording where the driver pointed it.
#[derive(Default)]
struct RecordingTransport {
    backup_src: std::sync::Mutex<Option<std::path::PathBuf>>,
    migrate_src: std::sync::Mutex<Option<std::path::PathBuf>>,
}

#[async_trait::async_trait]
impl cowvol::GenericTransport for RecordingTransport {
    async fn migrate_volume(
        &self,
        _vol: &VolumeCopy,
        src_path: &Path,
        _conn: &mut (dyn cowvol::MigrationConn + '_),
        _args: &VolumeSourceArgs,
    ) -> cowvol::Result<()> {
        *self.migrate_src.lock().unwrap() = Some(src_path.to_path_buf());
        Ok(())
    }

    async fn create_volume_from_migration(
        &self,
        _vol: &VolumeCopy,
        _target_path: &Path,
        _conn: &mut (dyn cowvol::MigrationConn + '_),
        _args: &VolumeTargetArgs,
    ) -> cowvol::Result<()> {
        Ok(())
    }

    async fn backup_volume(
        &self,
        _vol: &VolumeCopy,
        src_path: &Path,
        _tar: &mut tar::Builder<Box<dyn Write + Send>>,
        _snapshots: &[String],
    ) -> cowvol::Result<()> {
        *self.backup_src.lock().unwrap() = Some(src_path.to_path_buf());
        Ok(())
    }

    async fn restore_backup(
        &self,
        _vol: &VolumeCopy,
        _target_path: &Path,
        _src: &mut (dyn cowvol::BackupSource + '_),
        _info: &BackupInfo,
    ) -> cowvol::Result<Option<cowvol::RevertHook>> {
        Ok(None)
    }
}

#[tokio::test]
async fn test_non_optimized_modes_delegate_with_consistency_snapshot() {
    let mut pool = new_pool("p1");
    let transport = std::sync::Arc::new(RecordingTransport::default());
    pool.driver.set_generic_transport(transport.clone());

    let vol = fs_volume("c1", "");
    pool.driver.create_volume(&vol, None).await.unwrap();
    let vol_path = pool.driver.volume_path(&vol);

    // Non-optimized backup reads from a scratch read-only snapshot rather
    // than the live tree, and cleans it up afterwards.
    let tar_path = pool._dir.path().join("backup.tar");
    {
        let file = std::fs::File::create(&tar_path).unwrap();
        let mut builder = tar::Builder::new(Box::new(file) as Box<dyn Write + Send>);
        let copy = VolumeCopy::new(vol.clone(), vec![]);
        pool.driver.backup_volume(&copy, &mut builder, false, &[]).await.unwrap();
        builder.finish().unwrap();
    }

    let backup_src = transport.backup_src.lock().unwrap().clone().expect("delegated");
    assert_ne!(backup_src, vol_path);
    assert!(!backup_src.exists(), "consistency snapshot cleaned up");
    assert!(vol_path.exists());

    // Same for an rsync-mode migration source leg.
    let mut args = source_args(&[], false);
    args.migration_type = MigrationType::Rsync;

    let (a, _b) = tokio::io::duplex(1 << 16);
    let mut conn = LengthPrefixedConn::new(a);
    let copy = VolumeCopy::new(vol.clone(), vec![]);
    pool.driver.migrate_volume(&copy, &mut conn, &args).await.unwrap();

    let migrate_src = transport.migrate_src.lock().unwrap().clone().expect("delegated");
    assert_ne!(migrate_src, vol_path);
    assert!(!migrate_src.exists(), "consistency snapshot cleaned up");
}

fn tar_member_names(path: &Path) -> Vec<String> {
    let file = std::fs::File::open(path).unwrap();
    let mut archive = tar::Archive::new(file);

    archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
        .collect()
}
