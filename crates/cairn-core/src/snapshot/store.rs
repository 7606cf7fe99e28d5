//! Store pipeline: scan, chunk, encode, shard, distribute, index.
//!
//! One walk thread enumerates entries and chunks file contents into a
//! bounded work queue; a fixed pool of workers runs the CPU-bound
//! hash/encode/shard sequence; a single consumer stores shards,
//! deduplicates against the chunk index, and assembles archives.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crossbeam_channel::{bounded, Sender};
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::debug;

use cairn_types::{CairnError, ContentHash, Result};

use crate::backend::Distributor;
use crate::chunker::{chunk_data, ChunkerParams};
use crate::compress::Compression;
use crate::crypto::Encryption;
use crate::index::ChunkIndex;
use crate::pipeline::Pipeline;
use crate::progress::{Progress, ProgressFn};
use crate::redundancy::RedundancyEncoder;
use crate::scan::{self, EntryKind, ScanEntry};
use crate::snapshot::{Archive, Chunk, Snapshot, Stats};

/// Worker pool size for the compress/encrypt/erasure-code stage.
const WORKERS: usize = 4;

pub struct StoreOptions {
    /// Root paths to back up.
    pub paths: Vec<PathBuf>,
    /// Exclude glob patterns, matched against archive paths.
    pub excludes: Vec<String>,
    pub compression: Compression,
    pub encryption: Encryption,
    pub data_parts: u32,
    pub parity_parts: u32,
    pub chunker: ChunkerParams,
    /// Abort on the first error instead of skipping the item.
    pub pedantic: bool,
    /// Re-read and byte-compare every shard after writing it.
    pub verify: bool,
}

impl StoreOptions {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self {
            paths,
            excludes: Vec::new(),
            compression: Compression::default(),
            encryption: Encryption::default(),
            data_parts: 1,
            parity_parts: 0,
            chunker: ChunkerParams::default(),
            pedantic: false,
            verify: false,
        }
    }
}

struct ProcessedChunk {
    chunk: Chunk,
    shards: Vec<Vec<u8>>,
}

enum Msg {
    /// A completed non-file archive, or a file with no content.
    Entry(Box<Archive>),
    /// A file archive whose chunk results will follow.
    FileStart {
        archive: Box<Archive>,
        chunk_count: u64,
    },
    Chunk {
        path: String,
        result: Result<ProcessedChunk>,
    },
    ScanError(CairnError),
}

struct WorkItem {
    path: String,
    seq: u64,
    data: Vec<u8>,
}

struct PendingFile {
    archive: Archive,
    chunks: Vec<Chunk>,
    remaining: u64,
    failed: bool,
}

/// Run a backup of `opts.paths` into `snapshot`, storing chunk shards
/// through `distributor` and registering them in `index`. Drains to
/// completion unless pedantic or cancelled; per-item errors are counted
/// in the snapshot stats and reported through `progress`.
pub fn store(
    snapshot: &mut Snapshot,
    index: &mut ChunkIndex,
    distributor: &Distributor,
    password: &str,
    opts: &StoreOptions,
    cancel: &AtomicBool,
    progress: &ProgressFn,
) -> Result<()> {
    if opts.parity_parts > 0 && opts.parity_parts as usize >= distributor.backend_count() {
        return Err(CairnError::RedundancyConfig(format!(
            "failure tolerance {} requires more than {} backend(s)",
            opts.parity_parts,
            distributor.backend_count()
        )));
    }
    let encode = Pipeline::encode_pipeline(opts.compression, opts.encryption, password)?;
    let coder = RedundancyEncoder::new(opts.data_parts as usize, opts.parity_parts as usize)?;
    let excludes = build_excludes(&opts.excludes)?;
    let cwd = std::env::current_dir()?;

    let stats = Mutex::new(snapshot.stats);
    let mut outcome: Result<()> = Ok(());

    std::thread::scope(|s| {
        let (work_tx, work_rx) = bounded::<WorkItem>(WORKERS * 2);
        let (msg_tx, msg_rx) = bounded::<Msg>(WORKERS * 2);

        let encode = &encode;
        let coder = &coder;
        let stats = &stats;

        // Walk thread: enumerate entries, chunk file contents.
        let walk_msg_tx = msg_tx.clone();
        s.spawn(move || {
            scan_stage(
                opts, &excludes, &cwd, cancel, stats, work_tx, walk_msg_tx,
            );
        });

        // Worker pool: pre-hash, encode, post-hash, shard.
        for _ in 0..WORKERS {
            let rx = work_rx.clone();
            let tx = msg_tx.clone();
            s.spawn(move || {
                for item in rx {
                    let result = process_chunk(item.seq, &item.data, encode, coder);
                    let msg = Msg::Chunk {
                        path: item.path,
                        result,
                    };
                    if tx.send(msg).is_err() {
                        return;
                    }
                }
            });
        }
        drop(work_rx);
        drop(msg_tx);

        // Consumer: dedup, store, verify, assemble archives.
        let mut pending: HashMap<String, PendingFile> = HashMap::new();
        let mut stored_this_run: HashSet<ContentHash> = HashSet::new();
        for msg in &msg_rx {
            if cancel.load(Ordering::Relaxed) {
                outcome = Err(CairnError::Cancelled);
                break;
            }
            match msg {
                Msg::Entry(archive) => {
                    finish_archive(snapshot, index, *archive);
                }
                Msg::FileStart {
                    archive,
                    chunk_count,
                } => {
                    if chunk_count == 0 {
                        finish_archive(snapshot, index, *archive);
                    } else {
                        pending.insert(
                            archive.path.clone(),
                            PendingFile {
                                archive: *archive,
                                chunks: Vec::new(),
                                remaining: chunk_count,
                                failed: false,
                            },
                        );
                    }
                }
                Msg::Chunk { path, result } => {
                    let Some(file) = pending.get_mut(&path) else {
                        continue;
                    };
                    file.remaining -= 1;
                    match result {
                        Ok(processed) if !file.failed => {
                            if let Err(e) = consume_chunk(
                                file,
                                processed,
                                index,
                                &mut stored_this_run,
                                distributor,
                                opts,
                                stats,
                                progress,
                            ) {
                                if opts.pedantic {
                                    outcome = Err(e);
                                    cancel.store(true, Ordering::Relaxed);
                                } else {
                                    item_error(&path, e, stats, progress);
                                    file.failed = true;
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            if opts.pedantic {
                                outcome = Err(e);
                                cancel.store(true, Ordering::Relaxed);
                            } else if !file.failed {
                                item_error(&path, e, stats, progress);
                                file.failed = true;
                            }
                        }
                    }
                    if outcome.is_err() {
                        break;
                    }
                    if file.remaining == 0 {
                        let file = pending.remove(&path).unwrap();
                        if !file.failed {
                            let mut archive = file.archive;
                            let mut chunks = file.chunks;
                            chunks.sort_by_key(|c| c.num);
                            archive.stored_size = chunks.iter().map(|c| c.stored_size).sum();
                            archive.chunks = chunks;
                            finish_archive(snapshot, index, archive);
                        }
                    }
                }
                Msg::ScanError(e) => {
                    if opts.pedantic {
                        outcome = Err(e);
                        cancel.store(true, Ordering::Relaxed);
                        break;
                    }
                    item_error("", e, stats, progress);
                }
            }
        }
        // Drain so the walk and worker threads can exit.
        drop(pending);
        for _ in msg_rx {}
    });

    snapshot.stats = *stats.lock().unwrap();
    if outcome.is_ok() && cancel.load(Ordering::Relaxed) {
        outcome = Err(CairnError::Cancelled);
    }
    outcome
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

/// Archive path for a scanned entry: relative to the working directory
/// where possible, `/`-separated. `.` and `..` entries resolve to
/// `None` and are dropped.
fn archive_path(path: &Path, cwd: &Path) -> Option<String> {
    let rel = path.strip_prefix(cwd).unwrap_or(path);
    let text = rel.to_string_lossy();
    if text.is_empty() || text == "." || text == ".." {
        return None;
    }
    Some(text.into_owned())
}

fn scan_stage(
    opts: &StoreOptions,
    excludes: &GlobSet,
    cwd: &Path,
    cancel: &AtomicBool,
    stats: &Mutex<Stats>,
    work_tx: Sender<WorkItem>,
    msg_tx: Sender<Msg>,
) {
    let (entry_tx, entry_rx) = bounded::<Result<ScanEntry>>(WORKERS * 2);
    std::thread::scope(|s| {
        s.spawn(move || {
            for root in &opts.paths {
                scan::walk(root, &entry_tx);
            }
        });

        for entry in entry_rx {
            if cancel.load(Ordering::Relaxed) {
                break;
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    if msg_tx.send(Msg::ScanError(e)).is_err() {
                        return;
                    }
                    continue;
                }
            };
            let Some(path) = archive_path(&entry.path, cwd) else {
                continue;
            };
            if excludes.is_match(&path) {
                debug!(path, "excluded");
                continue;
            }

            record_scanned(stats, &entry);
            let archive = to_archive(path, &entry, opts);
            match entry.kind {
                EntryKind::File => {
                    if let Err(e) = dispatch_file(&entry, archive, &work_tx, &msg_tx, opts) {
                        if msg_tx.send(Msg::ScanError(e)).is_err() {
                            return;
                        }
                    }
                }
                EntryKind::Dir | EntryKind::Symlink => {
                    if msg_tx.send(Msg::Entry(Box::new(archive))).is_err() {
                        return;
                    }
                }
            }
        }
    });
}

fn record_scanned(stats: &Mutex<Stats>, entry: &ScanEntry) {
    let mut stats = stats.lock().unwrap();
    match entry.kind {
        EntryKind::File => {
            stats.files += 1;
            stats.total_size += entry.size;
        }
        EntryKind::Dir => stats.dirs += 1,
        EntryKind::Symlink => stats.symlinks += 1,
    }
}

fn to_archive(path: String, entry: &ScanEntry, opts: &StoreOptions) -> Archive {
    Archive {
        path,
        kind: entry.kind,
        mode: entry.mode,
        mtime: entry.mtime,
        uid: entry.uid,
        gid: entry.gid,
        size: entry.size,
        stored_size: 0,
        chunks: Vec::new(),
        link_target: entry
            .link_target
            .as_ref()
            .map(|t| t.to_string_lossy().into_owned()),
        compression: opts.compression,
        encryption: opts.encryption,
    }
}

/// Read a file, chunk it, and enqueue the raw chunks. The file-start
/// message goes out before any chunk work is dispatched so the consumer
/// always sees it first.
fn dispatch_file(
    entry: &ScanEntry,
    archive: Archive,
    work_tx: &Sender<WorkItem>,
    msg_tx: &Sender<Msg>,
    opts: &StoreOptions,
) -> Result<()> {
    let data = std::fs::read(&entry.path)?;
    let chunks = chunk_data(&data, &opts.chunker);
    let path = archive.path.clone();
    if msg_tx
        .send(Msg::FileStart {
            archive: Box::new(archive),
            chunk_count: chunks.len() as u64,
        })
        .is_err()
    {
        return Ok(());
    }
    for raw in chunks {
        let item = WorkItem {
            path: path.clone(),
            seq: raw.seq,
            data: data[raw.offset..raw.offset + raw.length].to_vec(),
        };
        if work_tx.send(item).is_err() {
            return Ok(());
        }
    }
    Ok(())
}

/// CPU-bound chunk stage: pre-hash, codec encode, post-hash, shard.
fn process_chunk(
    seq: u64,
    data: &[u8],
    encode: &Pipeline,
    coder: &RedundancyEncoder,
) -> Result<ProcessedChunk> {
    let original_hash = ContentHash::digest(data);
    let processed = encode.process(data)?;
    let hash = ContentHash::digest(&processed);
    // Processed payload length, before shard padding and parity. The
    // restore path needs it to strip the padding exactly.
    let stored_size = processed.len() as u64;
    let shards = coder.encode(&processed)?;
    Ok(ProcessedChunk {
        chunk: Chunk {
            num: seq,
            data_parts: coder.data_parts() as u32,
            parity_parts: coder.parity_parts() as u32,
            original_size: data.len() as u64,
            stored_size,
            hash,
            original_hash,
        },
        shards,
    })
}

/// Store a processed chunk's shards unless the payload is already in
/// the index or was stored earlier in this run; shard bytes are dropped
/// as soon as they are on the backends.
fn consume_chunk(
    file: &mut PendingFile,
    processed: ProcessedChunk,
    index: &ChunkIndex,
    stored_this_run: &mut HashSet<ContentHash>,
    distributor: &Distributor,
    opts: &StoreOptions,
    stats: &Mutex<Stats>,
    progress: &ProgressFn,
) -> Result<()> {
    let ProcessedChunk { chunk, shards } = processed;
    let duplicate = index.contains(&chunk.hash) || stored_this_run.contains(&chunk.hash);

    let mut stored = 0;
    if !duplicate {
        stored = distributor.store_chunk(&chunk.hash, &shards)?;
        if opts.verify {
            let total = shards.len() as u32;
            for (part, shard) in shards.iter().enumerate() {
                distributor.verify_chunk_shard(&chunk.hash, part as u32, total, shard)?;
            }
        }
        stored_this_run.insert(chunk.hash);
    }
    drop(shards);

    let (done, total) = {
        let mut stats = stats.lock().unwrap();
        stats.transferred_size += chunk.original_size;
        stats.stored_size += stored;
        (stats.transferred_size, stats.total_size)
    };
    progress(Progress {
        current_path: file.archive.path.clone(),
        current_item_bytes_total: file.archive.size,
        current_item_bytes_done: file.chunks.iter().map(|c| c.original_size).sum::<u64>()
            + chunk.original_size,
        cumulative_bytes_total: total,
        cumulative_bytes_done: done,
        error: None,
    });

    file.chunks.push(chunk);
    Ok(())
}

fn finish_archive(snapshot: &mut Snapshot, index: &mut ChunkIndex, archive: Archive) {
    index.add_archive(&archive, snapshot.id);
    snapshot.add_archive(archive);
}

fn item_error(path: &str, error: CairnError, stats: &Mutex<Stats>, progress: &ProgressFn) {
    stats.lock().unwrap().errors += 1;
    progress(Progress::for_path(path).with_error(error));
}
