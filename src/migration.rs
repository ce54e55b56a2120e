//! Optimized migration wire protocol.
//!
//! Header frames are exchanged over a caller-supplied bidirectional byte
//! stream before the raw send streams flow. On transports with half-close,
//! the half-close terminates a frame; [`LengthPrefixedConn`] substitutes a
//! length-prefixed framing for transports without it.

use crate::error::{CowvolError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Negotiated transport kind for a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationType {
    /// Pool-native send/receive streams (the optimized path).
    Btrfs,
    /// File-by-file sync via the generic transport.
    Rsync,
    /// Block device plus file sync via the generic transport.
    BlockAndRsync,
}

/// Optional wire features negotiated between source and target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationFeature {
    /// The first frame carries a JSON metadata header.
    HeaderFrame,
    /// Non-root subvolumes may be transferred.
    Subvolumes,
    /// Subvolume UUIDs are exchanged, enabling refresh to skip
    /// already-present snapshots.
    SubvolumeUuids,
}

impl MigrationFeature {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HeaderFrame => "header_frame",
            Self::Subvolumes => "subvolumes",
            Self::SubvolumeUuids => "subvolume_uuids",
        }
    }

    /// Parse from string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "header_frame" => Some(Self::HeaderFrame),
            "subvolumes" => Some(Self::Subvolumes),
            "subvolume_uuids" => Some(Self::SubvolumeUuids),
            _ => None,
        }
    }
}

/// Arguments describing the source leg of a migration.
#[derive(Debug, Clone)]
pub struct VolumeSourceArgs {
    pub migration_type: MigrationType,
    pub features: Vec<MigrationFeature>,
    /// Snapshot short names to transfer, oldest first.
    pub snapshots: Vec<String>,
    /// Transfer the main volume only, ignoring snapshots.
    pub volume_only: bool,
    /// Refresh an existing target instead of populating a fresh one.
    pub refresh: bool,
    /// Multi-pass sync flags used by the generic transport; unsupported on
    /// the optimized path.
    pub multi_sync: bool,
    pub final_sync: bool,
}

impl VolumeSourceArgs {
    #[must_use]
    pub fn has_feature(&self, feature: MigrationFeature) -> bool {
        self.features.contains(&feature)
    }
}

/// Arguments describing the target leg of a migration.
#[derive(Debug, Clone)]
pub struct VolumeTargetArgs {
    pub migration_type: MigrationType,
    pub features: Vec<MigrationFeature>,
    /// Snapshot short names expected from the source, oldest first.
    pub snapshots: Vec<String>,
    pub volume_only: bool,
    pub refresh: bool,
}

impl VolumeTargetArgs {
    #[must_use]
    pub fn has_feature(&self, feature: MigrationFeature) -> bool {
        self.features.contains(&feature)
    }
}

/// Bidirectional migration stream with frame semantics.
///
/// A frame is a discrete header payload; how frames are delimited is the
/// transport's concern (half-close on capable transports, length prefixes
/// otherwise). After the header exchange the raw send streams flow over the
/// same stream via [`reader`](Self::reader)/[`writer`](Self::writer).
#[async_trait]
pub trait MigrationConn: Send {
    /// Read one complete header frame.
    async fn read_frame(&mut self) -> Result<Vec<u8>>;

    /// Write one complete header frame and terminate it.
    async fn write_frame(&mut self, frame: &[u8]) -> Result<()>;

    /// Raw read access for receive streams.
    fn reader(&mut self) -> &mut (dyn AsyncRead + Send + Unpin);

    /// Raw write access for send streams.
    fn writer(&mut self) -> &mut (dyn AsyncWrite + Send + Unpin);
}

/// [`MigrationConn`] over any byte stream, delimiting frames with a
/// big-endian `u32` length prefix.
///
/// This is the substitute framing for transports without half-close; both
/// ends must agree on it during feature negotiation at the platform layer.
pub struct LengthPrefixedConn<S> {
    stream: S,
}

impl<S> LengthPrefixedConn<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Consume the conn, returning the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

/// Frames larger than this are rejected as corrupt.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

#[async_trait]
impl<S> MigrationConn for LengthPrefixedConn<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    async fn read_frame(&mut self) -> Result<Vec<u8>> {
        let len = self
            .stream
            .read_u32()
            .await
            .map_err(|e| CowvolError::Internal(format!("Failed reading frame length: {}", e)))?;

        if len > MAX_FRAME_LEN {
            return Err(CowvolError::Internal(format!("Frame length {} exceeds limit", len)));
        }

        let mut frame = vec![0u8; len as usize];
        self.stream
            .read_exact(&mut frame)
            .await
            .map_err(|e| CowvolError::Internal(format!("Failed reading frame: {}", e)))?;

        Ok(frame)
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let len = u32::try_from(frame.len())
            .map_err(|_| CowvolError::Internal("Frame too large".to_string()))?;

        self.stream
            .write_u32(len)
            .await
            .map_err(|e| CowvolError::Internal(format!("Failed writing frame length: {}", e)))?;
        self.stream
            .write_all(frame)
            .await
            .map_err(|e| CowvolError::Internal(format!("Failed writing frame: {}", e)))?;
        self.stream
            .flush()
            .await
            .map_err(|e| CowvolError::Internal(format!("Failed flushing frame: {}", e)))?;

        Ok(())
    }

    fn reader(&mut self) -> &mut (dyn AsyncRead + Send + Unpin) {
        &mut self.stream
    }

    fn writer(&mut self) -> &mut (dyn AsyncWrite + Send + Unpin) {
        &mut self.stream
    }
}
