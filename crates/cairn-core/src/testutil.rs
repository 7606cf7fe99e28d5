use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use cairn_types::{CairnError, ContentHash, Result, SnapshotId};

use crate::backend::{shard_key, Backend, CHUNK_INDEX_KEY, LOCK_KEY, REPOSITORY_KEY};

/// In-memory backend for tests. Clones share the same storage, so a
/// test can hand a clone to a `Distributor` and keep one for probing.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

struct Inner {
    location: String,
    data: Mutex<HashMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
    shard_stores: AtomicUsize,
}

impl MemoryBackend {
    pub fn new(location: &str) -> Self {
        Self {
            inner: Arc::new(Inner {
                location: location.to_string(),
                data: Mutex::new(HashMap::new()),
                fail_writes: AtomicBool::new(false),
                shard_stores: AtomicUsize::new(0),
            }),
        }
    }

    /// Make every subsequent write fail with a backend error.
    pub fn fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of `store_chunk_shard` calls made against this backend.
    pub fn shard_store_calls(&self) -> usize {
        self.inner.shard_stores.load(Ordering::SeqCst)
    }

    /// Number of shard payloads currently held.
    pub fn shard_count(&self) -> usize {
        let map = self.inner.data.lock().unwrap();
        map.keys().filter(|k| k.starts_with("chunks/")).count()
    }

    pub fn shard_keys(&self) -> Vec<String> {
        let map = self.inner.data.lock().unwrap();
        map.keys()
            .filter(|k| k.starts_with("chunks/"))
            .cloned()
            .collect()
    }

    /// Flip one byte of a stored shard.
    pub fn corrupt_shard(&self, hash: &ContentHash, part: u32, total: u32) {
        let key = shard_key(hash, part, total);
        let mut map = self.inner.data.lock().unwrap();
        let data = map.get_mut(&key).expect("shard present");
        data[0] ^= 0xFF;
    }

    pub fn remove_shard(&self, hash: &ContentHash, part: u32, total: u32) {
        let key = shard_key(hash, part, total);
        self.inner.data.lock().unwrap().remove(&key);
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let map = self.inner.data.lock().unwrap();
        map.get(key).cloned().ok_or_else(|| CairnError::Backend {
            location: self.inner.location.clone(),
            message: format!("key not found: {key}"),
        })
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(CairnError::Backend {
                location: self.inner.location.clone(),
                message: "write failure injected".into(),
            });
        }
        let mut map = self.inner.data.lock().unwrap();
        map.insert(key.to_string(), data.to_vec());
        Ok(())
    }
}

impl Backend for MemoryBackend {
    fn load_chunk_shard(&self, hash: &ContentHash, part: u32, total: u32) -> Result<Vec<u8>> {
        self.get(&shard_key(hash, part, total))
    }

    fn store_chunk_shard(
        &self,
        hash: &ContentHash,
        part: u32,
        total: u32,
        data: &[u8],
    ) -> Result<u64> {
        self.inner.shard_stores.fetch_add(1, Ordering::SeqCst);
        self.put(&shard_key(hash, part, total), data)?;
        Ok(data.len() as u64)
    }

    fn delete_chunk_shard(&self, hash: &ContentHash, part: u32, total: u32) -> Result<()> {
        let mut map = self.inner.data.lock().unwrap();
        map.remove(&shard_key(hash, part, total));
        Ok(())
    }

    fn load_snapshot(&self, id: &SnapshotId) -> Result<Vec<u8>> {
        self.get(&id.storage_key())
    }

    fn save_snapshot(&self, id: &SnapshotId, data: &[u8]) -> Result<()> {
        self.put(&id.storage_key(), data)
    }

    fn load_chunk_index(&self) -> Result<Vec<u8>> {
        self.get(CHUNK_INDEX_KEY)
    }

    fn save_chunk_index(&self, data: &[u8]) -> Result<()> {
        self.put(CHUNK_INDEX_KEY, data)
    }

    fn init_repository(&self) -> Result<()> {
        let map = self.inner.data.lock().unwrap();
        if map.contains_key(REPOSITORY_KEY) {
            return Err(CairnError::RepoAlreadyExists(self.inner.location.clone()));
        }
        Ok(())
    }

    fn load_repository(&self) -> Result<Vec<u8>> {
        let map = self.inner.data.lock().unwrap();
        map.get(REPOSITORY_KEY)
            .cloned()
            .ok_or_else(|| CairnError::RepoNotFound(self.inner.location.clone()))
    }

    fn save_repository(&self, data: &[u8]) -> Result<()> {
        self.put(REPOSITORY_KEY, data)
    }

    fn lock_repository(&self, payload: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut map = self.inner.data.lock().unwrap();
        if let Some(existing) = map.get(LOCK_KEY) {
            return Ok(Some(existing.clone()));
        }
        map.insert(LOCK_KEY.to_string(), payload.to_vec());
        Ok(None)
    }

    fn unlock_repository(&self) -> Result<()> {
        self.inner.data.lock().unwrap().remove(LOCK_KEY);
        Ok(())
    }

    fn available_space(&self) -> Result<Option<u64>> {
        Ok(None)
    }

    fn location(&self) -> &str {
        &self.inner.location
    }

    fn protocols(&self) -> &'static [&'static str] {
        &["memory"]
    }
}
