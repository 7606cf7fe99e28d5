use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use cairn_types::{CairnError, ContentHash, Result, SnapshotId};

use super::{shard_key, Backend, CHUNK_INDEX_KEY, LOCK_KEY, REPOSITORY_KEY};

/// Local filesystem backend using `std::fs` directly.
pub struct LocalBackend {
    root: PathBuf,
    location: String,
}

impl LocalBackend {
    /// Open a backend at a location string, with or without the
    /// `file://` scheme prefix.
    pub fn open(location: &str) -> Result<Self> {
        let path = location.strip_prefix("file://").unwrap_or(location);
        let root_path = PathBuf::from(path);
        // Canonicalize if the path already exists for clearer errors and
        // correct behavior with symlinked roots.
        let root = if root_path.exists() {
            fs::canonicalize(&root_path)?
        } else {
            root_path
        };
        Ok(Self {
            root,
            location: location.to_string(),
        })
    }

    /// Reject storage keys that could escape the repository root.
    fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(CairnError::InvalidFormat("unsafe storage key: empty".into()));
        }
        if key.starts_with('/') || key.starts_with('\\') {
            return Err(CairnError::InvalidFormat(format!(
                "unsafe storage key: absolute path '{key}'"
            )));
        }
        if key.contains('\\') {
            return Err(CairnError::InvalidFormat(format!(
                "unsafe storage key: contains backslash '{key}'"
            )));
        }
        for component in Path::new(key).components() {
            if component == Component::ParentDir {
                return Err(CairnError::InvalidFormat(format!(
                    "unsafe storage key: parent traversal '{key}'"
                )));
            }
        }
        Ok(())
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        Self::validate_key(key)?;
        Ok(self.root.join(key))
    }

    /// Write data to a temp file in the same directory, then atomically
    /// rename into place so readers never see a partial file.
    fn atomic_write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let dir = path.parent().unwrap_or(&self.root);
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key)?;
        fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CairnError::Backend {
                    location: self.location.clone(),
                    message: format!("key not found: {key}"),
                }
            } else {
                e.into()
            }
        })
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve(key)?;
        match self.atomic_write(&path, data) {
            Err(CairnError::Io(ref e)) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                self.atomic_write(&path, data)
            }
            other => other,
        }
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Backend for LocalBackend {
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
        self.put(&shard_key(hash, part, total), data)?;
        Ok(data.len() as u64)
    }

    fn delete_chunk_shard(&self, hash: &ContentHash, part: u32, total: u32) -> Result<()> {
        self.remove(&shard_key(hash, part, total))
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
        if self.root.join(REPOSITORY_KEY).exists() {
            return Err(CairnError::RepoAlreadyExists(self.location.clone()));
        }
        fs::create_dir_all(self.root.join("chunks"))?;
        fs::create_dir_all(self.root.join("snapshots"))?;
        Ok(())
    }

    fn load_repository(&self) -> Result<Vec<u8>> {
        let path = self.root.join(REPOSITORY_KEY);
        fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CairnError::RepoNotFound(self.location.clone())
            } else {
                e.into()
            }
        })
    }

    fn save_repository(&self, data: &[u8]) -> Result<()> {
        self.put(REPOSITORY_KEY, data)
    }

    fn lock_repository(&self, payload: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.get(LOCK_KEY) {
            Ok(existing) => Ok(Some(existing)),
            Err(CairnError::Backend { .. }) => {
                self.put(LOCK_KEY, payload)?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn unlock_repository(&self) -> Result<()> {
        self.remove(LOCK_KEY)
    }

    fn available_space(&self) -> Result<Option<u64>> {
        Ok(None)
    }

    fn location(&self) -> &str {
        &self.location
    }

    fn protocols(&self) -> &'static [&'static str] {
        &["file"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (tempfile::TempDir, LocalBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::open(dir.path().to_str().unwrap()).unwrap();
        (dir, backend)
    }

    #[test]
    fn validate_key_rejects_unsafe_keys() {
        assert!(LocalBackend::validate_key("/etc/passwd").is_err());
        assert!(LocalBackend::validate_key("../../outside").is_err());
        assert!(LocalBackend::validate_key("foo/../../etc/passwd").is_err());
        assert!(LocalBackend::validate_key("foo\\bar").is_err());
        assert!(LocalBackend::validate_key("").is_err());
    }

    #[test]
    fn validate_key_accepts_safe_keys() {
        assert!(LocalBackend::validate_key("repository").is_ok());
        assert!(LocalBackend::validate_key("chunks/ab/cd/deadbeef.0_3").is_ok());
        assert!(LocalBackend::validate_key("snapshots/abc123").is_ok());
    }

    #[test]
    fn shard_roundtrip_and_delete() {
        let (_dir, backend) = backend();
        let hash = ContentHash::digest(b"shard data");
        backend.store_chunk_shard(&hash, 0, 2, b"first").unwrap();
        backend.store_chunk_shard(&hash, 1, 2, b"second").unwrap();

        assert_eq!(backend.load_chunk_shard(&hash, 0, 2).unwrap(), b"first");
        assert_eq!(backend.load_chunk_shard(&hash, 1, 2).unwrap(), b"second");

        backend.delete_chunk_shard(&hash, 0, 2).unwrap();
        assert!(backend.load_chunk_shard(&hash, 0, 2).is_err());
        // Deleting again is not an error.
        backend.delete_chunk_shard(&hash, 0, 2).unwrap();
    }

    #[test]
    fn init_twice_fails() {
        let (_dir, backend) = backend();
        backend.init_repository().unwrap();
        backend.save_repository(b"meta").unwrap();
        assert!(matches!(
            backend.init_repository().unwrap_err(),
            CairnError::RepoAlreadyExists(_)
        ));
    }

    #[test]
    fn load_repository_missing_is_repo_not_found() {
        let (_dir, backend) = backend();
        assert!(matches!(
            backend.load_repository().unwrap_err(),
            CairnError::RepoNotFound(_)
        ));
    }

    #[test]
    fn lock_reports_existing_holder() {
        let (_dir, backend) = backend();
        assert_eq!(backend.lock_repository(b"me").unwrap(), None);
        assert_eq!(backend.lock_repository(b"other").unwrap(), Some(b"me".to_vec()));
        backend.unlock_repository().unwrap();
        assert_eq!(backend.lock_repository(b"other").unwrap(), None);
    }

    #[test]
    fn snapshot_roundtrip() {
        let (_dir, backend) = backend();
        let id = SnapshotId::generate();
        backend.save_snapshot(&id, b"snapshot bytes").unwrap();
        assert_eq!(backend.load_snapshot(&id).unwrap(), b"snapshot bytes");
    }
}
