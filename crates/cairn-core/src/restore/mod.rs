//! Restore pipeline: locate, fetch, reconstruct, decode, verify, write.

pub mod cache;

use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, warn};

use cairn_types::{CairnError, ContentHash, Result};

use crate::backend::Distributor;
use crate::pipeline::Pipeline;
use crate::progress::{Progress, ProgressFn};
use crate::redundancy::RedundancyEncoder;
use crate::scan::EntryKind;
use crate::snapshot::{Archive, Chunk, Snapshot};

pub use cache::ChunkCache;

#[derive(Debug, Default, Clone, Copy)]
pub struct RestoreStats {
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    pub bytes: u64,
    pub errors: u64,
}

/// Fetch, reconstruct, and decode one chunk, verifying both hashes.
///
/// Shards are fetched lazily until `data_parts` are on hand; if the
/// reconstructed payload fails its hash check, the remaining shards are
/// pulled in and reconstruction is retried with each suspect shard
/// excluded in turn before giving up.
pub fn load_chunk(
    distributor: &Distributor,
    decode: &Pipeline,
    chunk: &Chunk,
) -> Result<Vec<u8>> {
    let coder = RedundancyEncoder::new(chunk.data_parts as usize, chunk.parity_parts as usize)?;
    let total = chunk.total_parts();
    let required = coder.data_parts();
    let mut shards: Vec<Option<Vec<u8>>> = vec![None; total as usize];

    let mut found = 0;
    let mut next_part = 0u32;
    while found < required && next_part < total {
        if let Some(bytes) = distributor.load_chunk_shard(&chunk.hash, next_part, total) {
            shards[next_part as usize] = Some(bytes);
            found += 1;
        }
        next_part += 1;
    }
    if found < required {
        return Err(CairnError::Reconstruction {
            hash: chunk.hash,
            found,
            required,
        });
    }

    if let Some(payload) = try_reconstruct(&coder, &shards, chunk) {
        return decode_payload(decode, payload, chunk);
    }

    // A shard came back corrupted. Fetch everything we have not tried
    // yet and retry with each currently used shard excluded.
    for part in next_part..total {
        if let Some(bytes) = distributor.load_chunk_shard(&chunk.hash, part, total) {
            shards[part as usize] = Some(bytes);
            found += 1;
        }
    }
    if found > required {
        for suspect in 0..shards.len() {
            if shards[suspect].is_none() {
                continue;
            }
            let mut candidate = shards.clone();
            candidate[suspect] = None;
            if let Some(payload) = try_reconstruct(&coder, &candidate, chunk) {
                debug!(hash = %chunk.hash, suspect, "recovered around a corrupted shard");
                return decode_payload(decode, payload, chunk);
            }
        }
    }
    Err(CairnError::Integrity { hash: chunk.hash })
}

/// Reconstruct the processed payload and validate it against the
/// chunk's processed-bytes hash. `None` means this shard set is bad.
fn try_reconstruct(
    coder: &RedundancyEncoder,
    shards: &[Option<Vec<u8>>],
    chunk: &Chunk,
) -> Option<Vec<u8>> {
    let mut working = shards.to_vec();
    let payload = coder
        .reconstruct(&mut working, payload_len(chunk), chunk.hash)
        .ok()?;
    (ContentHash::digest(&payload) == chunk.hash).then_some(payload)
}

/// Length of the processed payload before shard padding. With a single
/// shard the stored size is exact; with erasure coding the padding is
/// stripped by the hash-validated reconstruction length.
fn payload_len(chunk: &Chunk) -> usize {
    chunk.stored_size as usize
}

fn decode_payload(decode: &Pipeline, payload: Vec<u8>, chunk: &Chunk) -> Result<Vec<u8>> {
    let original = decode.process(&payload)?;
    if ContentHash::digest(&original) != chunk.original_hash {
        return Err(CairnError::Integrity {
            hash: chunk.original_hash,
        });
    }
    Ok(original)
}

/// Restore every archive of a snapshot under `dest`, excluding paths
/// matching `excludes`. Directories are created first, then symlinks
/// and files; per-item failures are counted and reported but do not
/// abort the restore.
pub fn decode_snapshot(
    snapshot: &Snapshot,
    distributor: &Distributor,
    password: &str,
    dest: &Path,
    excludes: &[String],
    cancel: &AtomicBool,
    progress: &ProgressFn,
) -> Result<RestoreStats> {
    let excludes = build_excludes(excludes)?;
    let mut stats = RestoreStats::default();

    let selected: Vec<&Archive> = snapshot
        .archives
        .values()
        .filter(|a| !excludes.is_match(&a.path))
        .collect();
    let total_bytes: u64 = selected
        .iter()
        .filter(|a| a.kind == EntryKind::File)
        .map(|a| a.size)
        .sum();

    // Pass 1: directories, so files and links always have a parent.
    for archive in selected.iter().filter(|a| a.kind == EntryKind::Dir) {
        if cancel.load(Ordering::Relaxed) {
            return Err(CairnError::Cancelled);
        }
        match restore_dir(archive, dest) {
            Ok(()) => stats.dirs += 1,
            Err(e) => item_failed(&mut stats, archive, e, progress),
        }
    }

    // Pass 2: symlinks and file contents.
    for archive in &selected {
        if cancel.load(Ordering::Relaxed) {
            return Err(CairnError::Cancelled);
        }
        match archive.kind {
            EntryKind::Dir => {}
            EntryKind::Symlink => match restore_symlink(archive, dest) {
                Ok(()) => stats.symlinks += 1,
                Err(e) => item_failed(&mut stats, archive, e, progress),
            },
            EntryKind::File => {
                match restore_file(archive, distributor, password, dest) {
                    Ok(written) => {
                        stats.files += 1;
                        stats.bytes += written;
                        progress(Progress {
                            current_path: archive.path.clone(),
                            current_item_bytes_total: archive.size,
                            current_item_bytes_done: written,
                            cumulative_bytes_total: total_bytes,
                            cumulative_bytes_done: stats.bytes,
                            error: None,
                        });
                    }
                    Err(e) => item_failed(&mut stats, archive, e, progress),
                }
            }
        }
    }
    Ok(stats)
}

fn item_failed(
    stats: &mut RestoreStats,
    archive: &Archive,
    error: CairnError,
    progress: &ProgressFn,
) {
    stats.errors += 1;
    progress(Progress::for_path(archive.path.as_str()).with_error(error));
}

fn build_excludes(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| {
            CairnError::Config(format!("invalid exclude pattern '{pattern}': {e}"))
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| CairnError::Config(format!("exclude matcher build failed: {e}")))
}

/// Map a stored archive path to a relative path safe to join under the
/// restore destination. Absolute paths are re-rooted; parent traversal
/// is refused.
fn sanitize_path(raw: &str) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                return Err(CairnError::InvalidFormat(format!(
                    "refusing to restore unsafe path: {raw}"
                )));
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(CairnError::InvalidFormat(format!(
            "refusing to restore empty path: {raw}"
        )));
    }
    Ok(out)
}

fn restore_dir(archive: &Archive, dest: &Path) -> Result<()> {
    let target = dest.join(sanitize_path(&archive.path)?);
    fs::create_dir_all(&target)?;
    apply_mode(&target, archive.mode);
    Ok(())
}

fn restore_symlink(archive: &Archive, dest: &Path) -> Result<()> {
    let link_target = archive.link_target.as_ref().ok_or_else(|| {
        CairnError::InvalidFormat(format!("symlink archive without target: {}", archive.path))
    })?;
    let target = dest.join(sanitize_path(&archive.path)?);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(link_target, &target)?;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = target;
        Err(CairnError::Other(format!(
            "symlink restore unsupported on this platform: {link_target}"
        )))
    }
}

/// Reconstruct a file from its chunks in sequence order and restore its
/// metadata. Returns the number of bytes written.
fn restore_file(
    archive: &Archive,
    distributor: &Distributor,
    password: &str,
    dest: &Path,
) -> Result<u64> {
    let decode = Pipeline::decode_pipeline(archive.encryption, password)?;
    let target = dest.join(sanitize_path(&archive.path)?);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut chunks: Vec<&Chunk> = archive.chunks.iter().collect();
    chunks.sort_by_key(|c| c.num);

    let mut file = fs::File::create(&target)?;
    let mut written = 0u64;
    for chunk in chunks {
        let data = load_chunk(distributor, &decode, chunk)?;
        file.write_all(&data)?;
        written += data.len() as u64;
    }
    file.flush()?;
    drop(file);

    apply_mode(&target, archive.mode);
    apply_mtime(&target, archive.mtime);
    apply_ownership(&target, archive.uid, archive.gid);
    Ok(written)
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777)) {
        warn!(path = %path.display(), "failed to set mode: {e}");
    }
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: u32) {}

fn apply_mtime(path: &Path, mtime_nanos: i64) {
    if mtime_nanos <= 0 {
        return;
    }
    let mtime = std::time::UNIX_EPOCH + std::time::Duration::from_nanos(mtime_nanos as u64);
    let result = fs::File::options()
        .write(true)
        .open(path)
        .and_then(|f| f.set_modified(mtime));
    if let Err(e) = result {
        warn!(path = %path.display(), "failed to set mtime: {e}");
    }
}

#[cfg(unix)]
fn apply_ownership(path: &Path, uid: u32, gid: u32) {
    // Needs privileges; best-effort like every other metadata bit.
    if let Err(e) = std::os::unix::fs::chown(path, Some(uid), Some(gid)) {
        debug!(path = %path.display(), "failed to set ownership: {e}");
    }
}

#[cfg(not(unix))]
fn apply_ownership(_path: &Path, _uid: u32, _gid: u32) {}

/// Random-access reads over one file archive, backed by a shared
/// decoded-chunk cache. Consumed by read-only virtual filesystem
/// mounts.
pub struct ArchiveReader {
    archive: Archive,
    distributor: Arc<Distributor>,
    decode: Arc<Pipeline>,
    cache: Arc<ChunkCache>,
    /// Chunk start offsets in sequence order.
    offsets: Vec<u64>,
}

impl ArchiveReader {
    pub fn new(
        archive: Archive,
        distributor: Arc<Distributor>,
        password: &str,
        cache: Arc<ChunkCache>,
    ) -> Result<Self> {
        let decode = Arc::new(Pipeline::decode_pipeline(archive.encryption, password)?);
        let mut archive = archive;
        archive.chunks.sort_by_key(|c| c.num);
        let mut offsets = Vec::with_capacity(archive.chunks.len());
        let mut offset = 0u64;
        for chunk in &archive.chunks {
            offsets.push(offset);
            offset += chunk.original_size;
        }
        Ok(Self {
            archive,
            distributor,
            decode,
            cache,
            offsets,
        })
    }

    pub fn size(&self) -> u64 {
        self.archive.size
    }

    /// Read up to `size` bytes at `offset`; short reads happen only at
    /// end of file. After satisfying the read, the next chunk is
    /// prefetched in the background.
    pub fn read_at(&self, offset: u64, size: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(size);
        let mut position = offset;
        while out.len() < size && position < self.archive.size {
            let idx = match self.offsets.binary_search(&position) {
                Ok(i) => i,
                Err(i) => i - 1,
            };
            let data = self.chunk_bytes(idx)?;
            let intra = (position - self.offsets[idx]) as usize;
            let take = (size - out.len()).min(data.len() - intra);
            out.extend_from_slice(&data[intra..intra + take]);
            position += take as u64;
        }
        self.prefetch(offset, size);
        Ok(out)
    }

    fn chunk_bytes(&self, idx: usize) -> Result<Arc<Vec<u8>>> {
        let chunk = &self.archive.chunks[idx];
        if let Some(data) = self.cache.get(&chunk.hash) {
            return Ok(data);
        }
        let data = load_chunk(&self.distributor, &self.decode, chunk)?;
        Ok(self.cache.insert(chunk.hash, data))
    }

    /// Opportunistically decode the chunk following the one that
    /// satisfied this read, off the calling thread.
    fn prefetch(&self, offset: u64, size: usize) {
        let end = offset + size as u64;
        let next = match self.offsets.binary_search(&end) {
            Ok(i) => i,
            Err(i) => i,
        };
        let Some(chunk) = self.archive.chunks.get(next) else {
            return;
        };
        if self.cache.contains(&chunk.hash) {
            return;
        }
        let chunk = chunk.clone();
        let distributor = Arc::clone(&self.distributor);
        let decode = Arc::clone(&self.decode);
        let cache = Arc::clone(&self.cache);
        std::thread::spawn(move || {
            if let Ok(data) = load_chunk(&distributor, &decode, &chunk) {
                cache.insert(chunk.hash, data);
            }
        });
    }
}
