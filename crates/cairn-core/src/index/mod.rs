use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::info;

use cairn_types::{ContentHash, Result, SnapshotId};

use crate::backend::Distributor;
use crate::pipeline::{metadata_decode_pipeline, metadata_encode_pipeline};
use crate::snapshot::{Archive, Snapshot};

/// Dedup ledger entry: one physically stored chunk and the snapshots
/// referencing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkIndexItem {
    pub data_parts: u32,
    pub parity_parts: u32,
    /// Processed (post-pipeline) payload size in bytes.
    pub size: u64,
    pub snapshots: HashSet<SnapshotId>,
}

/// The dedup ledger and reference-counted garbage collector.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ChunkIndex {
    chunks: HashMap<ContentHash, ChunkIndexItem>,
}

impl ChunkIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Whether a chunk's payload is already physically stored.
    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.chunks.contains_key(hash)
    }

    pub fn get(&self, hash: &ContentHash) -> Option<&ChunkIndexItem> {
        self.chunks.get(hash)
    }

    /// Register every chunk of an archive against `snapshot_id`,
    /// creating ledger entries on first occurrence.
    pub fn add_archive(&mut self, archive: &Archive, snapshot_id: SnapshotId) {
        for chunk in &archive.chunks {
            self.chunks
                .entry(chunk.hash)
                .or_insert_with(|| ChunkIndexItem {
                    data_parts: chunk.data_parts,
                    parity_parts: chunk.parity_parts,
                    size: chunk.stored_size,
                    snapshots: HashSet::new(),
                })
                .snapshots
                .insert(snapshot_id);
        }
    }

    /// Strip a snapshot from every entry's reference set. Entries may
    /// become unreferenced; deletion is deferred to `pack`.
    pub fn remove_snapshot(&mut self, snapshot_id: &SnapshotId) {
        for item in self.chunks.values_mut() {
            item.snapshots.remove(snapshot_id);
        }
    }

    /// Garbage collection: deletes every unreferenced chunk's shards
    /// from all backends and drops its entry. Returns freed bytes.
    pub fn pack(&mut self, distributor: &Distributor) -> Result<u64> {
        let dead: Vec<(ContentHash, u32, u64)> = self
            .chunks
            .iter()
            .filter(|(_, item)| item.snapshots.is_empty())
            .map(|(hash, item)| (*hash, item.data_parts + item.parity_parts, item.size))
            .collect();

        let mut freed = 0;
        for (hash, total_parts, size) in dead {
            distributor.delete_chunk(&hash, total_parts)?;
            self.chunks.remove(&hash);
            freed += size;
        }
        if freed > 0 {
            info!(freed_bytes = freed, "packed chunk index");
        }
        Ok(freed)
    }

    /// Full rebuild from the given snapshots, replaying `add_archive`.
    /// Used when the index is missing or corrupted but the repository
    /// is non-empty, which signals a crash between payload writes and
    /// index persistence.
    pub fn reindex(snapshots: &[Snapshot]) -> Self {
        let mut index = Self::new();
        for snapshot in snapshots {
            for archive in snapshot.archives.values() {
                index.add_archive(archive, snapshot.id);
            }
        }
        index
    }

    /// Persist the whole index through the fixed metadata pipeline to
    /// every backend.
    pub fn save(&self, distributor: &Distributor, password: &str) -> Result<()> {
        let encoded = metadata_encode_pipeline(password)?.encode(self)?;
        distributor.save_chunk_index(&encoded)
    }

    pub fn load(distributor: &Distributor, password: &str) -> Result<Self> {
        let encoded = distributor.load_chunk_index()?;
        metadata_decode_pipeline(password)?.decode(&encoded)
    }
}
