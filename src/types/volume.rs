//! Volume domain types.

use crate::error::Result;
use crate::paths;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Volume type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeType {
    Container,
    VirtualMachine,
    Custom,
    Image,
}

impl VolumeType {
    /// Directory name under the pool mount for volumes of this type.
    #[must_use]
    pub fn as_dir(&self) -> &'static str {
        match self {
            Self::Container => "containers",
            Self::VirtualMachine => "virtual-machines",
            Self::Custom => "custom",
            Self::Image => "images",
        }
    }

    /// Directory name under the pool mount for snapshots of this type.
    #[must_use]
    pub fn snapshots_dir(&self) -> &'static str {
        match self {
            Self::Container => "containers-snapshots",
            Self::VirtualMachine => "virtual-machines-snapshots",
            Self::Custom => "custom-snapshots",
            Self::Image => "images-snapshots",
        }
    }

    /// Parse from string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "container" | "containers" => Some(Self::Container),
            "virtual-machine" | "virtual-machines" => Some(Self::VirtualMachine),
            "custom" => Some(Self::Custom),
            "image" | "images" => Some(Self::Image),
            _ => None,
        }
    }
}

impl std::fmt::Display for VolumeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_dir())
    }
}

/// Volume content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    /// A mountable filesystem tree.
    Filesystem,
    /// A raw block device image backed by a sparse loopback file.
    Block,
    /// An ISO image.
    Iso,
}

impl ContentType {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Filesystem => "filesystem",
            Self::Block => "block",
            Self::Iso => "iso",
        }
    }
}

/// A volume managed by the driver.
///
/// Identified by `(pool, type, content type, name)`. A snapshot volume's
/// name follows the `parent/snapshot` form and resolves into the typed
/// snapshots directory.
#[derive(Debug, Clone)]
pub struct Volume {
    pool: String,
    vol_type: VolumeType,
    content_type: ContentType,
    name: String,
    config: HashMap<String, String>,
    pool_config: HashMap<String, String>,
    /// Override for the on-disk location, used when an operation redirects
    /// reads to a temporary consistency snapshot.
    mount_custom_path: Option<PathBuf>,
}

impl Volume {
    /// Create a new volume description.
    pub fn new(
        pool: impl Into<String>,
        vol_type: VolumeType,
        content_type: ContentType,
        name: impl Into<String>,
        config: HashMap<String, String>,
        pool_config: HashMap<String, String>,
    ) -> Self {
        Self {
            pool: pool.into(),
            vol_type,
            content_type,
            name: name.into(),
            config,
            pool_config,
            mount_custom_path: None,
        }
    }

    #[must_use]
    pub fn pool(&self) -> &str {
        &self.pool
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn vol_type(&self) -> VolumeType {
        self.vol_type
    }

    #[must_use]
    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    #[must_use]
    pub fn config(&self) -> &HashMap<String, String> {
        &self.config
    }

    #[must_use]
    pub fn pool_config(&self) -> &HashMap<String, String> {
        &self.pool_config
    }

    /// The configured size, or an empty string when unset.
    #[must_use]
    pub fn config_size(&self) -> &str {
        self.config.get("size").map(String::as_str).unwrap_or("")
    }

    /// Whether this volume is a snapshot (`parent/snapshot` name).
    #[must_use]
    pub fn is_snapshot(&self) -> bool {
        self.name.contains('/')
    }

    /// Whether this is a virtual machine block volume.
    #[must_use]
    pub fn is_vm_block(&self) -> bool {
        self.vol_type == VolumeType::VirtualMachine && self.content_type == ContentType::Block
    }

    /// The parent volume name and optional snapshot short name.
    #[must_use]
    pub fn parent_and_snapshot(&self) -> (&str, Option<&str>) {
        paths::parent_and_snapshot(&self.name)
    }

    /// The snapshot short name, or an empty string for a main volume.
    #[must_use]
    pub fn snapshot_name(&self) -> &str {
        self.parent_and_snapshot().1.unwrap_or("")
    }

    /// Describe a snapshot of this volume.
    #[must_use]
    pub fn new_snapshot(&self, snapshot: &str) -> Volume {
        let (parent, _) = self.parent_and_snapshot();
        Volume {
            pool: self.pool.clone(),
            vol_type: self.vol_type,
            content_type: self.content_type,
            name: paths::snapshot_volume_name(parent, snapshot),
            config: self.config.clone(),
            pool_config: self.pool_config.clone(),
            mount_custom_path: None,
        }
    }

    /// Redirect this volume's on-disk location, e.g. to a temporary
    /// read-only consistency snapshot.
    pub fn set_mount_custom_path(&mut self, path: impl Into<PathBuf>) {
        self.mount_custom_path = Some(path.into());
    }

    #[must_use]
    pub fn mount_custom_path(&self) -> Option<&Path> {
        self.mount_custom_path.as_deref()
    }
}

/// A volume paired with its ordered snapshot list (oldest first).
#[derive(Debug, Clone)]
pub struct VolumeCopy {
    pub volume: Volume,
    pub snapshots: Vec<Volume>,
}

impl VolumeCopy {
    /// Pair a volume with its snapshots, oldest first.
    pub fn new(volume: Volume, snapshots: Vec<Volume>) -> Self {
        Self { volume, snapshots }
    }

    /// A copy without snapshots.
    pub fn without_snapshots(volume: Volume) -> Self {
        Self { volume, snapshots: Vec::new() }
    }
}

/// Fills a freshly created volume with content, e.g. by unpacking an image.
///
/// For block volumes the filler is expected to produce a raw disk image at
/// `block_path`; for filesystem volumes it populates `vol_path` directly.
#[async_trait]
pub trait VolumeFiller: Send + Sync {
    async fn fill(&self, vol_path: &Path, block_path: Option<&Path>) -> Result<()>;
}
