use std::sync::Mutex;

use tracing::{debug, warn};

use cairn_types::{CairnError, ContentHash, Result, SnapshotId};

use super::Backend;

/// Composes the configured backends for one repository.
///
/// Chunk shards are spread round-robin across backends; replicated
/// metadata (repository, snapshots, chunk index) is written to every
/// backend and read with failover.
pub struct Distributor {
    backends: Vec<Box<dyn Backend>>,
    // Round-robin cursor shared by all concurrent stores.
    cursor: Mutex<usize>,
}

impl Distributor {
    pub fn new(backends: Vec<Box<dyn Backend>>) -> Result<Self> {
        if backends.is_empty() {
            return Err(CairnError::Config("no backends configured".into()));
        }
        Ok(Self {
            backends,
            cursor: Mutex::new(0),
        })
    }

    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }

    /// Store all shards of a chunk, advancing the shared round-robin
    /// cursor per shard. Returns the total stored size in bytes.
    pub fn store_chunk(&self, hash: &ContentHash, shards: &[Vec<u8>]) -> Result<u64> {
        let total = shards.len() as u32;
        let mut stored = 0;
        for (part, shard) in shards.iter().enumerate() {
            let backend = self.next_backend();
            stored += backend.store_chunk_shard(hash, part as u32, total, shard)?;
        }
        Ok(stored)
    }

    fn next_backend(&self) -> &dyn Backend {
        let mut cursor = self.cursor.lock().unwrap();
        *cursor = (*cursor + 1) % self.backends.len();
        self.backends[*cursor].as_ref()
    }

    /// Fetch one shard, trying every backend in order. `None` means no
    /// backend holds it; callers count shards and raise a reconstruction
    /// error if too few are obtainable.
    pub fn load_chunk_shard(&self, hash: &ContentHash, part: u32, total: u32) -> Option<Vec<u8>> {
        for backend in &self.backends {
            match backend.load_chunk_shard(hash, part, total) {
                Ok(data) => return Some(data),
                Err(e) => {
                    debug!(
                        location = backend.location(),
                        %hash, part, "shard load failed: {e}"
                    );
                }
            }
        }
        None
    }

    /// Verify a stored shard byte-for-byte against the expected payload.
    pub fn verify_chunk_shard(
        &self,
        hash: &ContentHash,
        part: u32,
        total: u32,
        expected: &[u8],
    ) -> Result<()> {
        match self.load_chunk_shard(hash, part, total) {
            Some(data) if data == expected => Ok(()),
            Some(_) => Err(CairnError::Integrity { hash: *hash }),
            None => Err(CairnError::ChunkNotFound(*hash)),
        }
    }

    /// Delete every shard of a chunk from every backend. Missing shards
    /// are ignored; transport errors are not.
    pub fn delete_chunk(&self, hash: &ContentHash, total: u32) -> Result<()> {
        for part in 0..total {
            for backend in &self.backends {
                backend.delete_chunk_shard(hash, part, total)?;
            }
        }
        Ok(())
    }

    pub fn load_snapshot(&self, id: &SnapshotId) -> Result<Vec<u8>> {
        self.load_with_failover(
            |b| b.load_snapshot(id),
            || CairnError::SnapshotNotFound(id.to_hex()),
        )
    }

    pub fn save_snapshot(&self, id: &SnapshotId, data: &[u8]) -> Result<()> {
        self.save_everywhere(|b| b.save_snapshot(id, data))
    }

    pub fn load_chunk_index(&self) -> Result<Vec<u8>> {
        self.load_with_failover(
            |b| b.load_chunk_index(),
            || CairnError::InvalidFormat("chunk index missing on all backends".into()),
        )
    }

    pub fn save_chunk_index(&self, data: &[u8]) -> Result<()> {
        self.save_everywhere(|b| b.save_chunk_index(data))
    }

    /// Initialization must succeed on every backend; an existing
    /// repository on any backend aborts the whole init.
    pub fn init_repository(&self) -> Result<()> {
        for backend in &self.backends {
            backend.init_repository()?;
        }
        Ok(())
    }

    pub fn load_repository(&self) -> Result<Vec<u8>> {
        self.load_with_failover(
            |b| b.load_repository(),
            || CairnError::RepoNotFound(self.locations().join(", ")),
        )
    }

    pub fn save_repository(&self, data: &[u8]) -> Result<()> {
        self.save_everywhere(|b| b.save_repository(data))
    }

    /// Acquire the advisory lock on every backend. If any backend
    /// reports an existing holder, locks taken so far are released.
    pub fn lock_repository(&self, payload: &[u8]) -> Result<Option<Vec<u8>>> {
        for (i, backend) in self.backends.iter().enumerate() {
            if let Some(existing) = backend.lock_repository(payload)? {
                for held in &self.backends[..i] {
                    if let Err(e) = held.unlock_repository() {
                        warn!(location = held.location(), "failed to release lock: {e}");
                    }
                }
                return Ok(Some(existing));
            }
        }
        Ok(None)
    }

    pub fn unlock_repository(&self) -> Result<()> {
        for backend in &self.backends {
            backend.unlock_repository()?;
        }
        Ok(())
    }

    pub fn locations(&self) -> Vec<String> {
        self.backends
            .iter()
            .map(|b| b.location().to_string())
            .collect()
    }

    fn load_with_failover<F, M>(&self, load: F, missing: M) -> Result<Vec<u8>>
    where
        F: Fn(&dyn Backend) -> Result<Vec<u8>>,
        M: FnOnce() -> CairnError,
    {
        for backend in &self.backends {
            match load(backend.as_ref()) {
                Ok(data) => return Ok(data),
                Err(e) => {
                    debug!(location = backend.location(), "read failed over: {e}");
                }
            }
        }
        Err(missing())
    }

    /// Replicated writes require every backend to succeed.
    fn save_everywhere<F>(&self, save: F) -> Result<()>
    where
        F: Fn(&dyn Backend) -> Result<()>,
    {
        for backend in &self.backends {
            save(backend.as_ref())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemoryBackend;

    fn distributor(n: usize) -> (Vec<MemoryBackend>, Distributor) {
        let memories: Vec<MemoryBackend> = (0..n)
            .map(|i| MemoryBackend::new(&format!("mem{i}")))
            .collect();
        let backends: Vec<Box<dyn Backend>> = memories
            .iter()
            .map(|m| Box::new(m.clone()) as Box<dyn Backend>)
            .collect();
        (memories, Distributor::new(backends).unwrap())
    }

    #[test]
    fn rejects_empty_backend_list() {
        assert!(Distributor::new(Vec::new()).is_err());
    }

    #[test]
    fn store_spreads_shards_round_robin() {
        let (memories, dist) = distributor(3);
        let hash = ContentHash::digest(b"chunk");
        let shards = vec![vec![1u8; 8], vec![2u8; 8], vec![3u8; 8]];
        let stored = dist.store_chunk(&hash, &shards).unwrap();
        assert_eq!(stored, 24);

        // Each of the 3 backends got exactly one shard.
        for memory in &memories {
            assert_eq!(memory.shard_count(), 1);
        }
    }

    #[test]
    fn load_fails_over_to_the_backend_holding_the_shard() {
        let (memories, dist) = distributor(2);
        let hash = ContentHash::digest(b"chunk");
        // Put the shard only on the second backend.
        memories[1].store_chunk_shard(&hash, 0, 1, b"payload").unwrap();

        assert_eq!(dist.load_chunk_shard(&hash, 0, 1).unwrap(), b"payload");
        assert_eq!(dist.load_chunk_shard(&hash, 1, 2), None);
    }

    #[test]
    fn replicated_save_requires_all_backends() {
        let (memories, dist) = distributor(2);
        dist.save_chunk_index(b"index").unwrap();
        for memory in &memories {
            assert_eq!(memory.load_chunk_index().unwrap(), b"index");
        }

        memories[1].fail_writes(true);
        assert!(dist.save_chunk_index(b"index2").is_err());
    }

    #[test]
    fn delete_chunk_removes_all_shards_everywhere() {
        let (memories, dist) = distributor(2);
        let hash = ContentHash::digest(b"chunk");
        dist.store_chunk(&hash, &[vec![0u8; 4], vec![1u8; 4]]).unwrap();
        dist.delete_chunk(&hash, 2).unwrap();
        for memory in &memories {
            assert_eq!(memory.shard_count(), 0);
        }
    }

    #[test]
    fn lock_conflict_releases_partial_locks() {
        let (memories, dist) = distributor(2);
        // Second backend is already locked by someone else.
        memories[1].lock_repository(b"them").unwrap();

        let existing = dist.lock_repository(b"us").unwrap();
        assert_eq!(existing, Some(b"them".to_vec()));
        // The lock taken on the first backend was rolled back.
        assert_eq!(memories[0].lock_repository(b"probe").unwrap(), None);
    }

    #[test]
    fn verify_shard_detects_mismatch() {
        let (_memories, dist) = distributor(1);
        let hash = ContentHash::digest(b"chunk");
        dist.store_chunk(&hash, &[b"expected".to_vec()]).unwrap();
        assert!(dist.verify_chunk_shard(&hash, 0, 1, b"expected").is_ok());
        assert!(matches!(
            dist.verify_chunk_shard(&hash, 0, 1, b"different").unwrap_err(),
            CairnError::Integrity { .. }
        ));
    }
}
