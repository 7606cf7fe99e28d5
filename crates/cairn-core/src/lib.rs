pub mod backend;
pub mod chunker;
pub mod compress;
pub mod crypto;
pub mod index;
pub mod pipeline;
pub mod progress;
pub mod redundancy;
pub mod repo;
pub mod restore;
pub mod scan;
pub mod snapshot;
pub mod verify;

pub use cairn_types::{CairnError, ContentHash, Result, SnapshotId, VolumeId, LATEST};

pub use backend::{Backend, BackendRegistry, Distributor, LocalBackend};
pub use compress::Compression;
pub use crypto::Encryption;
pub use index::ChunkIndex;
pub use repo::{Repository, Volume, REPOSITORY_VERSION};
pub use restore::{decode_snapshot, ArchiveReader, ChunkCache, RestoreStats};
pub use snapshot::store::{store, StoreOptions};
pub use snapshot::{Archive, Chunk, Snapshot, Stats};
pub use verify::{verify, VerifyReport, VerifyScope};

#[cfg(test)]
pub(crate) mod testutil;
