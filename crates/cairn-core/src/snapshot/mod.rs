pub mod store;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cairn_types::{ContentHash, Result, SnapshotId};

use crate::backend::Distributor;
use crate::compress::Compression;
use crate::crypto::Encryption;
use crate::pipeline::{metadata_decode_pipeline, metadata_encode_pipeline};
use crate::scan::EntryKind;

/// One stored chunk of a file: the processed payload, erasure-coded
/// into `data_parts + parity_parts` shards addressed by `hash`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Position in the file's chunk sequence, contiguous from 0.
    pub num: u64,
    pub data_parts: u32,
    pub parity_parts: u32,
    pub original_size: u64,
    /// Size of the processed (compressed+encrypted) payload.
    pub stored_size: u64,
    /// Hash of the processed (compressed+encrypted) bytes; the
    /// storage address of the chunk's shards.
    pub hash: ContentHash,
    /// Hash of the original bytes, verified after decode.
    pub original_hash: ContentHash,
}

impl Chunk {
    pub fn total_parts(&self) -> u32 {
        self.data_parts + self.parity_parts
    }
}

/// Metadata record for one filesystem entry within a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Archive {
    pub path: String,
    pub kind: EntryKind,
    pub mode: u32,
    /// Modification time in nanoseconds since Unix epoch.
    pub mtime: i64,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub stored_size: u64,
    /// For regular files: the chunks making up the content.
    #[serde(default)]
    pub chunks: Vec<Chunk>,
    /// For symlinks: the link target.
    #[serde(default)]
    pub link_target: Option<String>,
    pub compression: Compression,
    pub encryption: Encryption,
}

/// Aggregate counters for one backup run. Mutated concurrently by the
/// store pipeline workers under the snapshot mutex.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Stats {
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    pub total_size: u64,
    /// Bytes read and processed this run (deduplicated chunks included).
    pub transferred_size: u64,
    /// Bytes physically written to backends this run.
    pub stored_size: u64,
    pub errors: u64,
}

/// One complete backup run: a map of path to archive plus run stats.
/// Immutable once saved; a new run supersedes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub date: DateTime<Utc>,
    pub description: String,
    pub stats: Stats,
    pub archives: BTreeMap<String, Archive>,
}

impl Snapshot {
    pub fn new(description: &str) -> Self {
        Self {
            id: SnapshotId::generate(),
            date: Utc::now(),
            description: description.to_string(),
            stats: Stats::default(),
            archives: BTreeMap::new(),
        }
    }

    /// Seed an incremental backup: carries over stats and the full
    /// archive map under a fresh identity. A following store run over
    /// the same paths overwrites entries as it goes.
    pub fn clone_from(source: &Snapshot, description: &str) -> Self {
        Self {
            id: SnapshotId::generate(),
            date: Utc::now(),
            description: description.to_string(),
            stats: source.stats,
            archives: source.archives.clone(),
        }
    }

    /// Insert an archive keyed by path; a later entry for the same
    /// path wins.
    pub fn add_archive(&mut self, archive: Archive) {
        self.archives.insert(archive.path.clone(), archive);
    }

    /// Persist through the fixed metadata pipeline to every backend.
    pub fn save(&self, distributor: &Distributor, password: &str) -> Result<()> {
        let encoded = metadata_encode_pipeline(password)?.encode(self)?;
        distributor.save_snapshot(&self.id, &encoded)
    }

    pub fn load(distributor: &Distributor, password: &str, id: &SnapshotId) -> Result<Self> {
        let encoded = distributor.load_snapshot(id)?;
        metadata_decode_pipeline(password)?.decode(&encoded)
    }
}
