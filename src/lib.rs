//! cowvol: copy-on-write volume engine.
//!
//! Exposes a uniform volume lifecycle (create, copy, refresh, snapshot,
//! restore, delete, quota) over a btrfs storage pool, plus an optimized
//! migration protocol over a bidirectional byte stream and an optimized
//! backup format packing differential send streams into a tar container.
//!
//! The engine is one driver inside a larger container/VM platform: the
//! platform serializes per-volume operations and supplies the byte streams
//! and tar sinks; the driver owns the pool's subvolume graph, quota groups
//! and block backing files, and undoes partial failures in reverse order.

pub mod backup;
pub mod block;
pub mod driver;
pub mod error;
pub mod migration;
pub mod paths;
pub mod qgroup;
pub mod revert;
pub mod subvol;
pub mod types;
pub mod units;

// Re-export commonly used items
pub use backup::BackupInfo;
pub use driver::{BackupSource, BtrfsDriver, GenericTransport};
pub use error::{CowvolError, Result};
pub use migration::{
    LengthPrefixedConn, MigrationConn, MigrationFeature, MigrationType, VolumeSourceArgs,
    VolumeTargetArgs,
};
pub use revert::{Reverter, RevertHook};
pub use subvol::{BtrfsBackend, BtrfsCli, SubvolumeInfo, SubvolumeManager};
pub use types::{
    ContentType, MetaDataHeader, Subvolume, Volume, VolumeCopy, VolumeFiller, VolumeType,
};
