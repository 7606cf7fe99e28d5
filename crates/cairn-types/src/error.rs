use thiserror::Error;

use crate::hash::ContentHash;

pub type Result<T> = std::result::Result<T, CairnError>;

#[derive(Debug, Error)]
pub enum CairnError {
    #[error("repository not found at '{0}'")]
    RepoNotFound(String),

    #[error("repository already exists at '{0}'")]
    RepoAlreadyExists(String),

    #[error("unsupported repository version {found} (expected {expected})")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("volume not found: '{0}'")]
    VolumeNotFound(String),

    #[error("snapshot not found: '{0}'")]
    SnapshotNotFound(String),

    #[error("chunk {0} not found on any backend")]
    ChunkNotFound(ContentHash),

    #[error("chunk {hash} content hash mismatch after decode")]
    Integrity { hash: ContentHash },

    #[error("chunk {hash}: only {found} of {required} required shards obtainable")]
    Reconstruction {
        hash: ContentHash,
        found: usize,
        required: usize,
    },

    #[error("invalid redundancy configuration: {0}")]
    RedundancyConfig(String),

    #[error("password must not be empty when encryption is enabled")]
    EmptyPassword,

    #[error("decryption failed: wrong password or corrupted data")]
    Crypto,

    #[error("backend error at '{location}': {message}")]
    Backend { location: String, message: String },

    #[error("unsupported backend scheme: '{0}'")]
    UnsupportedScheme(String),

    #[error("repository is locked by another process (lock: {0})")]
    Locked(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("unknown compression tag: {0}")]
    UnknownCompressionTag(u8),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconstruction_error_reports_counts() {
        let err = CairnError::Reconstruction {
            hash: ContentHash([0; 32]),
            found: 2,
            required: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("2 of 3"), "got: {msg}");
    }
}
