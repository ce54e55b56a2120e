//! Quota group management.
//!
//! Quota groups are pool-level counters keyed by `0/<subvolume-id>`. The
//! manager distinguishes two recoverable conditions: quotas disabled on the
//! pool ([`CowvolError::NoQuota`]) and no qgroup covering the subvolume
//! ([`CowvolError::NoQgroup`]). [`ensure`](QuotaManager::ensure) recovers
//! from both; pool-wide quota accounting, once enabled, is never disabled.

use crate::error::{CowvolError, Result};
use crate::subvol::BtrfsBackend;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Manages quota groups for subvolumes of one pool.
#[derive(Clone)]
pub struct QuotaManager {
    backend: Arc<dyn BtrfsBackend>,
    pool_mount: PathBuf,
}

impl QuotaManager {
    pub fn new(backend: Arc<dyn BtrfsBackend>, pool_mount: PathBuf) -> Self {
        Self { backend, pool_mount }
    }

    /// Locate the qgroup for a subvolume, returning `(qgroup id, used bytes)`.
    pub async fn get(&self, path: &Path) -> Result<(String, u64)> {
        self.backend.qgroup_show(path).await
    }

    /// Locate the qgroup for a subvolume, creating whatever is missing.
    ///
    /// Idempotent: enables pool-wide quotas if they are disabled, creates a
    /// qgroup keyed on the subvolume ID if none exists, then retries once.
    pub async fn ensure(&self, path: &Path) -> Result<String> {
        let result = self.backend.qgroup_show(path).await;

        let result = match result {
            Err(CowvolError::NoQuota) => {
                info!(pool = %self.pool_mount.display(), "Enabling pool-wide quota accounting");
                self.backend.quota_enable(&self.pool_mount).await?;
                self.backend.qgroup_show(path).await
            }
            other => other,
        };

        match result {
            Ok((qgroup, _)) => Ok(qgroup),
            Err(CowvolError::NoQgroup) => {
                let info = self.backend.subvolume_info(path).await?;
                let qgroup = format!("0/{}", info.id);

                debug!(path = %path.display(), qgroup = %qgroup, "Creating qgroup");
                self.backend.qgroup_create(&qgroup, path).await?;

                let (qgroup, _) = self.backend.qgroup_show(path).await?;
                Ok(qgroup)
            }
            Err(e) => Err(e),
        }
    }

    /// Apply a referenced-bytes limit, unconditionally clearing any
    /// exclusive limit.
    pub async fn set_limit(&self, path: &Path, qgroup: &str, referenced_bytes: u64) -> Result<()> {
        self.backend.qgroup_limit(Some(referenced_bytes), false, qgroup, path).await?;
        self.backend.qgroup_limit(None, true, qgroup, path).await?;
        Ok(())
    }

    /// Clear both referenced and exclusive limits.
    pub async fn clear_limit(&self, path: &Path, qgroup: &str) -> Result<()> {
        self.backend.qgroup_limit(None, false, qgroup, path).await?;
        self.backend.qgroup_limit(None, true, qgroup, path).await?;
        Ok(())
    }
}
