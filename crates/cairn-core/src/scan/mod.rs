use std::fs;
use std::path::{Path, PathBuf};

use crossbeam_channel::Sender;
use tracing::warn;

use cairn_types::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

/// One filesystem entry produced by the scanner.
#[derive(Debug, Clone)]
pub struct ScanEntry {
    pub path: PathBuf,
    pub kind: EntryKind,
    pub mode: u32,
    /// Modification time in nanoseconds since Unix epoch.
    pub mtime: i64,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    /// For symlinks: the link target.
    pub link_target: Option<PathBuf>,
}

impl ScanEntry {
    pub fn from_path(path: &Path) -> Result<Self> {
        let meta = fs::symlink_metadata(path)?;
        let file_type = meta.file_type();
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };
        let link_target = if kind == EntryKind::Symlink {
            Some(fs::read_link(path)?)
        } else {
            None
        };
        let (mode, uid, gid) = owner_fields(&meta);
        Ok(Self {
            path: path.to_path_buf(),
            kind,
            mode,
            mtime: mtime_nanos(&meta),
            uid,
            gid,
            size: if kind == EntryKind::File { meta.len() } else { 0 },
            link_target,
        })
    }
}

#[cfg(unix)]
fn owner_fields(meta: &fs::Metadata) -> (u32, u32, u32) {
    use std::os::unix::fs::MetadataExt;
    (meta.mode(), meta.uid(), meta.gid())
}

#[cfg(not(unix))]
fn owner_fields(_meta: &fs::Metadata) -> (u32, u32, u32) {
    (0, 0, 0)
}

fn mtime_nanos(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Walk a root path depth-first, sending each entry (or the error that
/// prevented reading it) down the channel. Directory entries are sorted
/// by name so repeated scans of the same tree produce the same order.
/// Stops early if the receiving side hangs up.
pub fn walk(root: &Path, tx: &Sender<Result<ScanEntry>>) {
    let entry = match ScanEntry::from_path(root) {
        Ok(entry) => entry,
        Err(e) => {
            let _ = tx.send(Err(e));
            return;
        }
    };
    let is_dir = entry.kind == EntryKind::Dir;
    if tx.send(Ok(entry)).is_err() {
        return;
    }
    if !is_dir {
        return;
    }

    let read_dir = match fs::read_dir(root) {
        Ok(rd) => rd,
        Err(e) => {
            warn!(path = %root.display(), error = %e, "failed to read directory");
            let _ = tx.send(Err(e.into()));
            return;
        }
    };
    let mut children: Vec<PathBuf> = read_dir
        .filter_map(|res| res.ok().map(|d| d.path()))
        .collect();
    children.sort();
    for child in children {
        walk(&child, tx);
    }
}
