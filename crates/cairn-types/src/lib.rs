pub mod error;
pub mod hash;
pub mod id;

pub use error::{CairnError, Result};
pub use hash::ContentHash;
pub use id::{SnapshotId, VolumeId, LATEST};
