//! Core domain types for cowvol.

pub mod subvolume;
pub mod volume;

// Re-exports
pub use subvolume::{MetaDataHeader, Subvolume};
pub use volume::{ContentType, Volume, VolumeCopy, VolumeFiller, VolumeType};
