pub mod distributor;
pub mod local;

use std::collections::HashMap;

use cairn_types::{CairnError, ContentHash, Result, SnapshotId};

pub use distributor::Distributor;
pub use local::LocalBackend;

pub const REPOSITORY_KEY: &str = "repository";
pub const CHUNK_INDEX_KEY: &str = "index";
pub const LOCK_KEY: &str = "lock";

/// Storage key for one shard of a chunk. Two levels of hash-derived
/// prefix directories keep the fan-out of any single directory bounded.
pub fn shard_key(hash: &ContentHash, part: u32, total: u32) -> String {
    let (first, second) = hash.key_prefix();
    format!("chunks/{first}/{second}/{}.{part}_{total}", hash.to_hex())
}

/// The minimal capability set a storage backend must provide. All byte
/// payloads are opaque here; encoding and decoding happen in the caller.
pub trait Backend: Send + Sync {
    fn load_chunk_shard(&self, hash: &ContentHash, part: u32, total: u32) -> Result<Vec<u8>>;

    /// Returns the stored size in bytes.
    fn store_chunk_shard(
        &self,
        hash: &ContentHash,
        part: u32,
        total: u32,
        data: &[u8],
    ) -> Result<u64>;

    /// Deleting a shard that does not exist is not an error.
    fn delete_chunk_shard(&self, hash: &ContentHash, part: u32, total: u32) -> Result<()>;

    fn load_snapshot(&self, id: &SnapshotId) -> Result<Vec<u8>>;
    fn save_snapshot(&self, id: &SnapshotId, data: &[u8]) -> Result<()>;

    fn load_chunk_index(&self) -> Result<Vec<u8>>;
    fn save_chunk_index(&self, data: &[u8]) -> Result<()>;

    /// Prepare the backing store for a fresh repository. Fails with
    /// `RepoAlreadyExists` if repository metadata is already present.
    fn init_repository(&self) -> Result<()>;
    fn load_repository(&self) -> Result<Vec<u8>>;
    fn save_repository(&self, data: &[u8]) -> Result<()>;

    /// Try to acquire the repository lock. Returns the existing lock
    /// payload if another holder already has it, `None` on success.
    fn lock_repository(&self, payload: &[u8]) -> Result<Option<Vec<u8>>>;
    fn unlock_repository(&self) -> Result<()>;

    /// Free space in bytes, or `None` if the backend cannot report it.
    fn available_space(&self) -> Result<Option<u64>>;

    fn location(&self) -> &str;
    fn protocols(&self) -> &'static [&'static str];
}

/// Constructor for a backend from its location string.
pub type BackendConstructor = fn(&str) -> Result<Box<dyn Backend>>;

/// Maps URL schemes to backend constructors. Built once by the host
/// application; locations without a scheme resolve as local paths.
pub struct BackendRegistry {
    constructors: HashMap<String, BackendConstructor>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry with the built-in local filesystem backend.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("file", |location| {
            Ok(Box::new(LocalBackend::open(location)?))
        });
        registry
    }

    pub fn register(&mut self, scheme: &str, constructor: BackendConstructor) {
        self.constructors.insert(scheme.to_string(), constructor);
    }

    pub fn open(&self, location: &str) -> Result<Box<dyn Backend>> {
        let scheme = location
            .split_once("://")
            .map(|(scheme, _)| scheme)
            .unwrap_or("file");
        let constructor = self
            .constructors
            .get(scheme)
            .ok_or_else(|| CairnError::UnsupportedScheme(scheme.to_string()))?;
        constructor(location)
    }

    pub fn open_all(&self, locations: &[String]) -> Result<Vec<Box<dyn Backend>>> {
        locations.iter().map(|loc| self.open(loc)).collect()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_key_layout() {
        let hash = ContentHash([0xAB; 32]);
        let key = shard_key(&hash, 2, 5);
        assert!(key.starts_with("chunks/ab/ab/"));
        assert!(key.ends_with(".2_5"));
    }

    #[test]
    fn registry_resolves_bare_paths_as_local() {
        let dir = tempfile::tempdir().unwrap();
        let registry = BackendRegistry::with_defaults();
        let backend = registry.open(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(backend.protocols(), &["file"]);
    }

    #[test]
    fn registry_rejects_unknown_scheme() {
        let registry = BackendRegistry::with_defaults();
        let err = registry.open("carrier-pigeon://roost").err().unwrap();
        assert!(matches!(
            err,
            CairnError::UnsupportedScheme(scheme) if scheme == "carrier-pigeon"
        ));
    }
}
