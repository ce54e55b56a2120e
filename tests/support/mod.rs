//! Shared test support: an in-memory pool backend.
//!
//! `MockBackend` simulates the pool tooling against a temp directory so the
//! full lifecycle, migration and backup flows run without a real btrfs
//! filesystem. Subvolume state is keyed by inode, so plain renames behave
//! the way the real pool does. Send streams are length-prefixed JSON
//! payloads carrying the subvolume's files and lineage UUIDs; receive
//! validates differential parents by UUID exactly like the real tooling.

use async_trait::async_trait;
use cowvol::error::{CowvolError, Result};
use cowvol::subvol::{BtrfsBackend, SubvolumeInfo};
use cowvol::types::{ContentType, Volume, VolumeType};
use cowvol::BtrfsDriver;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone)]
struct SubvolState {
    id: u64,
    uuid: String,
    received_uuid: String,
    readonly: bool,
}

#[derive(Debug, Default, Clone)]
pub struct QgroupState {
    pub referenced_limit: Option<u64>,
    pub exclusive_limit: Option<u64>,
    pub usage: u64,
}

#[derive(Default)]
struct Inner {
    /// Subvolume state keyed by directory inode.
    subvols: HashMap<u64, SubvolState>,
    qgroups: HashMap<String, QgroupState>,
    quotas_enabled: bool,
    next_id: u64,
    nocow: Vec<PathBuf>,
    gpt_moves: u64,
}

/// Wire payload of one simulated send stream.
#[derive(Serialize, Deserialize)]
struct Stream {
    name: String,
    uuid: String,
    parent_uuid: Option<String>,
    files: Vec<(String, Vec<u8>)>,
}

pub struct MockBackend {
    inner: Mutex<Inner>,
    mount_options: Vec<String>,
}

fn tool_failed(command: &str, stderr: impl Into<String>) -> CowvolError {
    CowvolError::ToolFailed { command: command.to_string(), stderr: stderr.into() }
}

fn path_ino(path: &Path) -> Option<u64> {
    std::fs::metadata(path).ok().map(|m| m.ino())
}

impl MockBackend {
    pub fn new() -> Self {
        Self::with_mount_options(vec![
            "rw".to_string(),
            "relatime".to_string(),
            "space_cache=v2".to_string(),
        ])
    }

    pub fn with_mount_options(mount_options: Vec<String>) -> Self {
        Self { inner: Mutex::new(Inner { next_id: 256, ..Default::default() }), mount_options }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state_for(inner: &Inner, path: &Path) -> Option<SubvolState> {
        path_ino(path).and_then(|ino| inner.subvols.get(&ino)).cloned()
    }

    /// Walk `root` collecting (relative path, state) for registered
    /// subvolumes strictly below it.
    fn nested_subvols(inner: &Inner, root: &Path) -> Vec<(String, SubvolState)> {
        fn walk(inner: &Inner, root: &Path, dir: &Path, out: &mut Vec<(String, SubvolState)>) {
            let Ok(entries) = std::fs::read_dir(dir) else {
                return;
            };

            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }

                if let Some(ino) = path_ino(&path) {
                    if let Some(state) = inner.subvols.get(&ino) {
                        let rel = path.strip_prefix(root).unwrap().to_string_lossy().to_string();
                        out.push((rel, state.clone()));
                    }
                }

                walk(inner, root, &path, out);
            }
        }

        let mut out = Vec::new();
        walk(inner, root, root, &mut out);
        out
    }

    /// Copy a subvolume's tree, leaving empty directories where nested
    /// subvolumes sit (snapshots do not descend into them).
    fn copy_tree(inner: &Inner, src: &Path, dst: &Path) -> std::io::Result<()> {
        std::fs::create_dir(dst)?;

        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            let from = entry.path();
            let to = dst.join(entry.file_name());

            if from.is_dir() {
                let is_subvol = path_ino(&from)
                    .map(|ino| inner.subvols.contains_key(&ino))
                    .unwrap_or(false);

                if is_subvol {
                    std::fs::create_dir(&to)?;
                } else {
                    Self::copy_tree(inner, &from, &to)?;
                }
            } else {
                std::fs::copy(&from, &to)?;
            }
        }

        Ok(())
    }

    /// Collect the files of one subvolume (excluding nested subvolumes).
    fn collect_files(inner: &Inner, root: &Path) -> Vec<(String, Vec<u8>)> {
        fn walk(inner: &Inner, root: &Path, dir: &Path, out: &mut Vec<(String, Vec<u8>)>) {
            let Ok(entries) = std::fs::read_dir(dir) else {
                return;
            };

            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    let is_subvol = path_ino(&path)
                        .map(|ino| inner.subvols.contains_key(&ino))
                        .unwrap_or(false);
                    if !is_subvol {
                        walk(inner, root, &path, out);
                    }
                } else if let Ok(contents) = std::fs::read(&path) {
                    let rel = path.strip_prefix(root).unwrap().to_string_lossy().to_string();
                    out.push((rel, contents));
                }
            }
        }

        let mut out = Vec::new();
        walk(inner, root, root, &mut out);
        out.sort();
        out
    }

    fn register(inner: &mut Inner, path: &Path, readonly: bool, received_uuid: String) -> u64 {
        let ino = path_ino(path).expect("registered path must exist");
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subvols.insert(
            ino,
            SubvolState { id, uuid: uuid::Uuid::new_v4().to_string(), received_uuid, readonly },
        );
        id
    }

    // Test inspection helpers

    pub fn uuid_of(&self, path: &Path) -> Option<String> {
        let inner = self.lock();
        Self::state_for(&inner, path).map(|s| s.uuid)
    }

    pub fn received_uuid_of(&self, path: &Path) -> Option<String> {
        let inner = self.lock();
        Self::state_for(&inner, path).map(|s| s.received_uuid)
    }

    pub fn readonly_of(&self, path: &Path) -> Option<bool> {
        let inner = self.lock();
        Self::state_for(&inner, path).map(|s| s.readonly)
    }

    pub fn qgroup_of(&self, path: &Path) -> Option<QgroupState> {
        let inner = self.lock();
        let state = Self::state_for(&inner, path)?;
        inner.qgroups.get(&format!("0/{}", state.id)).cloned()
    }

    pub fn set_usage(&self, path: &Path, usage: u64) {
        let mut inner = self.lock();
        let Some(state) = Self::state_for(&inner, path) else {
            return;
        };
        inner.qgroups.entry(format!("0/{}", state.id)).or_default().usage = usage;
    }

    pub fn nocow_applied(&self, path: &Path) -> bool {
        self.lock().nocow.iter().any(|p| p == path)
    }

    pub fn gpt_moves(&self) -> u64 {
        self.lock().gpt_moves
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BtrfsBackend for MockBackend {
    async fn create_subvolume(&self, path: &Path) -> Result<()> {
        let mut inner = self.lock();

        std::fs::create_dir(path)
            .map_err(|e| tool_failed("btrfs subvolume create", e.to_string()))?;
        Self::register(&mut inner, path, false, String::new());
        Ok(())
    }

    async fn delete_subvolume(&self, path: &Path) -> Result<()> {
        let mut inner = self.lock();

        let ino = path_ino(path)
            .filter(|ino| inner.subvols.contains_key(ino))
            .ok_or_else(|| tool_failed("btrfs subvolume delete", "not a subvolume"))?;

        if !Self::nested_subvols(&inner, path).is_empty() {
            return Err(tool_failed("btrfs subvolume delete", "subvolume is not empty"));
        }

        std::fs::remove_dir_all(path)
            .map_err(|e| tool_failed("btrfs subvolume delete", e.to_string()))?;
        inner.subvols.remove(&ino);
        Ok(())
    }

    async fn snapshot_subvolume(&self, src: &Path, dst: &Path, readonly: bool) -> Result<()> {
        let mut inner = self.lock();

        if Self::state_for(&inner, src).is_none() {
            return Err(tool_failed("btrfs subvolume snapshot", "source is not a subvolume"));
        }

        Self::copy_tree(&inner, src, dst)
            .map_err(|e| tool_failed("btrfs subvolume snapshot", e.to_string()))?;
        Self::register(&mut inner, dst, readonly, String::new());
        Ok(())
    }

    async fn is_subvolume(&self, path: &Path) -> bool {
        let inner = self.lock();
        Self::state_for(&inner, path).is_some()
    }

    async fn subvolume_paths(&self, root: &Path) -> Result<Vec<String>> {
        let inner = self.lock();
        Ok(Self::nested_subvols(&inner, root).into_iter().map(|(rel, _)| rel).collect())
    }

    async fn is_readonly(&self, path: &Path) -> Result<bool> {
        let inner = self.lock();
        Self::state_for(&inner, path)
            .map(|s| s.readonly)
            .ok_or_else(|| tool_failed("btrfs property get", "not a subvolume"))
    }

    async fn set_readonly(&self, path: &Path, readonly: bool) -> Result<()> {
        let mut inner = self.lock();

        let ino = path_ino(path)
            .filter(|ino| inner.subvols.contains_key(ino))
            .ok_or_else(|| tool_failed("btrfs property set", "not a subvolume"))?;

        if let Some(state) = inner.subvols.get_mut(&ino) {
            state.readonly = readonly;
        }
        Ok(())
    }

    async fn subvolume_info(&self, path: &Path) -> Result<SubvolumeInfo> {
        let inner = self.lock();
        let state = Self::state_for(&inner, path)
            .ok_or_else(|| tool_failed("btrfs subvolume show", "not a subvolume"))?;

        Ok(SubvolumeInfo {
            id: state.id,
            uuid: state.uuid,
            received_uuid: state.received_uuid,
        })
    }

    async fn set_received_uuid(&self, path: &Path, uuid: &str) -> Result<()> {
        let mut inner = self.lock();

        let ino = path_ino(path)
            .filter(|ino| inner.subvols.contains_key(ino))
            .ok_or_else(|| tool_failed("set received uuid", "not a subvolume"))?;

        if let Some(state) = inner.subvols.get_mut(&ino) {
            state.received_uuid = uuid.to_string();
        }
        Ok(())
    }

    async fn send_subvolume(
        &self,
        path: &Path,
        parent: Option<&Path>,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        let payload = {
            let inner = self.lock();

            let state = Self::state_for(&inner, path)
                .ok_or_else(|| tool_failed("btrfs send", "not a subvolume"))?;
            if !state.readonly {
                return Err(tool_failed("btrfs send", "subvolume is not read-only"));
            }

            let parent_uuid = match parent {
                Some(parent) => {
                    let parent_state = Self::state_for(&inner, parent)
                        .ok_or_else(|| tool_failed("btrfs send", "parent is not a subvolume"))?;
                    if !parent_state.readonly {
                        return Err(tool_failed("btrfs send", "parent is not read-only"));
                    }
                    Some(parent_state.uuid)
                }
                None => None,
            };

            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();

            let stream = Stream {
                name,
                uuid: state.uuid,
                parent_uuid,
                files: Self::collect_files(&inner, path),
            };

            serde_json::to_vec(&stream).map_err(CowvolError::internal)?
        };

        sink.write_u64(payload.len() as u64)
            .await
            .map_err(|e| CowvolError::io(path, e))?;
        sink.write_all(&payload).await.map_err(|e| CowvolError::io(path, e))?;
        sink.flush().await.map_err(|e| CowvolError::io(path, e))?;
        Ok(())
    }

    async fn receive_subvolume(
        &self,
        target_dir: &Path,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<PathBuf> {
        let len = source
            .read_u64()
            .await
            .map_err(|e| CowvolError::io(target_dir, e))? as usize;

        let mut payload = vec![0u8; len];
        source
            .read_exact(&mut payload)
            .await
            .map_err(|e| CowvolError::io(target_dir, e))?;

        let stream: Stream = serde_json::from_slice(&payload).map_err(CowvolError::internal)?;

        let mut inner = self.lock();

        // Differential streams need their parent present locally, found by
        // UUID or received UUID.
        if let Some(parent_uuid) = &stream.parent_uuid {
            let found = inner
                .subvols
                .values()
                .any(|s| s.uuid == *parent_uuid || s.received_uuid == *parent_uuid);
            if !found {
                return Err(tool_failed("btrfs receive", "cannot find parent subvolume"));
            }
        }

        let dest = target_dir.join(&stream.name);
        std::fs::create_dir(&dest).map_err(|e| tool_failed("btrfs receive", e.to_string()))?;

        for (rel, contents) in &stream.files {
            let file_path = dest.join(rel);
            if let Some(dir) = file_path.parent() {
                std::fs::create_dir_all(dir)
                    .map_err(|e| tool_failed("btrfs receive", e.to_string()))?;
            }
            std::fs::write(&file_path, contents)
                .map_err(|e| tool_failed("btrfs receive", e.to_string()))?;
        }

        let ino = path_ino(&dest).expect("received path exists");
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subvols.insert(
            ino,
            SubvolState {
                id,
                uuid: uuid::Uuid::new_v4().to_string(),
                received_uuid: stream.uuid,
                readonly: true,
            },
        );

        Ok(dest)
    }

    async fn list_pool_subvolumes(&self, pool_mount: &Path) -> Result<Vec<(u64, String)>> {
        let inner = self.lock();

        let mut subvols: Vec<(u64, String)> = Self::nested_subvols(&inner, pool_mount)
            .into_iter()
            .map(|(rel, state)| (state.id, rel))
            .collect();

        subvols.sort();
        Ok(subvols)
    }

    async fn quota_enable(&self, _pool_mount: &Path) -> Result<()> {
        self.lock().quotas_enabled = true;
        Ok(())
    }

    async fn qgroup_show(&self, path: &Path) -> Result<(String, u64)> {
        let inner = self.lock();

        if !inner.quotas_enabled {
            return Err(CowvolError::NoQuota);
        }

        let state = Self::state_for(&inner, path)
            .ok_or_else(|| tool_failed("btrfs qgroup show", "not a subvolume"))?;

        let key = format!("0/{}", state.id);
        match inner.qgroups.get(&key) {
            Some(qgroup) => Ok((key, qgroup.usage)),
            None => Err(CowvolError::NoQgroup),
        }
    }

    async fn qgroup_create(&self, qgroup: &str, _path: &Path) -> Result<()> {
        self.lock().qgroups.insert(qgroup.to_string(), QgroupState::default());
        Ok(())
    }

    async fn qgroup_limit(
        &self,
        limit: Option<u64>,
        exclusive: bool,
        qgroup: &str,
        _path: &Path,
    ) -> Result<()> {
        let mut inner = self.lock();

        let state = inner
            .qgroups
            .get_mut(qgroup)
            .ok_or_else(|| tool_failed("btrfs qgroup limit", "no such qgroup"))?;

        if exclusive {
            state.exclusive_limit = limit;
        } else {
            state.referenced_limit = limit;
        }
        Ok(())
    }

    async fn set_nocow(&self, path: &Path) -> Result<()> {
        self.lock().nocow.push(path.to_path_buf());
        Ok(())
    }

    async fn mount_options(&self, _path: &Path) -> Result<Vec<String>> {
        Ok(self.mount_options.clone())
    }

    async fn move_gpt_alt_header(&self, _path: &Path) -> Result<()> {
        self.lock().gpt_moves += 1;
        Ok(())
    }
}

/// One simulated pool: temp directory, mock backend and driver.
pub struct TestPool {
    pub _dir: TempDir,
    pub backend: Arc<MockBackend>,
    pub driver: BtrfsDriver,
}

pub fn new_pool(name: &str) -> TestPool {
    let dir = TempDir::new().expect("create temp dir");
    let mount = dir.path().join(name);
    std::fs::create_dir_all(&mount).expect("create pool mount");

    let backend = Arc::new(MockBackend::new());
    let driver = BtrfsDriver::with_mount_path(name, backend.clone(), mount);

    TestPool { _dir: dir, backend, driver }
}

pub fn volume(name: &str, vol_type: VolumeType, content_type: ContentType, size: &str) -> Volume {
    let mut config = HashMap::new();
    if !size.is_empty() {
        config.insert("size".to_string(), size.to_string());
    }

    Volume::new("default", vol_type, content_type, name, config, HashMap::new())
}

pub fn fs_volume(name: &str, size: &str) -> Volume {
    volume(name, VolumeType::Container, ContentType::Filesystem, size)
}
