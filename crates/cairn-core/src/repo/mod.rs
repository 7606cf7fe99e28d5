pub mod lock;

use serde::{Deserialize, Serialize};
use tracing::info;

use cairn_types::{CairnError, Result, SnapshotId, VolumeId, LATEST};

use crate::backend::Distributor;
use crate::pipeline::{metadata_decode_pipeline, metadata_encode_pipeline};
use crate::snapshot::Snapshot;

/// Hard compatibility gate: repositories persisted by another version
/// fail to open, with no implicit migration.
pub const REPOSITORY_VERSION: u32 = 1;

/// A named series of snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub id: VolumeId,
    pub name: String,
    pub description: String,
    /// Snapshot ids in creation order.
    pub snapshots: Vec<SnapshotId>,
}

impl Volume {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            id: VolumeId::generate(),
            name: name.to_string(),
            description: description.to_string(),
            snapshots: Vec::new(),
        }
    }

    pub fn add_snapshot(&mut self, id: SnapshotId) {
        self.snapshots.push(id);
    }

    pub fn remove_snapshot(&mut self, id: &SnapshotId) -> bool {
        let before = self.snapshots.len();
        self.snapshots.retain(|s| s != id);
        self.snapshots.len() != before
    }
}

/// Top-level repository metadata: the volume ledger and the backend
/// locations holding the data. Re-saved on every mutating operation.
#[derive(Debug, Serialize, Deserialize)]
pub struct Repository {
    pub version: u32,
    pub volumes: Vec<Volume>,
    pub locations: Vec<String>,
}

impl Repository {
    /// Create, initialize, and persist a fresh repository on every
    /// configured backend.
    pub fn init(distributor: &Distributor, password: &str) -> Result<Self> {
        distributor.init_repository()?;
        let repo = Self {
            version: REPOSITORY_VERSION,
            volumes: Vec::new(),
            locations: distributor.locations(),
        };
        repo.save(distributor, password)?;
        info!(locations = ?repo.locations, "initialized repository");
        Ok(repo)
    }

    /// Load and decode the repository metadata. A wrong password and
    /// corrupted metadata are indistinguishable; a version mismatch is
    /// fatal and loads nothing.
    pub fn open(distributor: &Distributor, password: &str) -> Result<Self> {
        let encoded = distributor.load_repository()?;
        let repo: Repository = metadata_decode_pipeline(password)?.decode(&encoded)?;
        if repo.version != REPOSITORY_VERSION {
            return Err(CairnError::VersionMismatch {
                found: repo.version,
                expected: REPOSITORY_VERSION,
            });
        }
        Ok(repo)
    }

    /// Persist to every configured backend through the fixed metadata
    /// pipeline.
    pub fn save(&self, distributor: &Distributor, password: &str) -> Result<()> {
        let encoded = metadata_encode_pipeline(password)?.encode(self)?;
        distributor.save_repository(&encoded)
    }

    pub fn add_volume(&mut self, name: &str, description: &str) -> &mut Volume {
        self.volumes.push(Volume::new(name, description));
        self.volumes.last_mut().unwrap()
    }

    /// Find a volume by hex id, name, or the `latest` sentinel (the
    /// most recently added volume).
    pub fn find_volume(&self, selector: &str) -> Result<&Volume> {
        self.volume_position(selector).map(|i| &self.volumes[i])
    }

    pub fn find_volume_mut(&mut self, selector: &str) -> Result<&mut Volume> {
        self.volume_position(selector)
            .map(move |i| &mut self.volumes[i])
    }

    fn volume_position(&self, selector: &str) -> Result<usize> {
        if selector == LATEST {
            return self
                .volumes
                .len()
                .checked_sub(1)
                .ok_or_else(|| CairnError::VolumeNotFound(selector.to_string()));
        }
        self.volumes
            .iter()
            .position(|v| v.name == selector || v.id.to_hex() == selector)
            .ok_or_else(|| CairnError::VolumeNotFound(selector.to_string()))
    }

    /// A volume can only be deleted once all its snapshots are gone.
    pub fn remove_volume(&mut self, selector: &str) -> Result<Volume> {
        let pos = self.volume_position(selector)?;
        if !self.volumes[pos].snapshots.is_empty() {
            return Err(CairnError::Config(format!(
                "volume '{}' still has {} snapshots",
                self.volumes[pos].name,
                self.volumes[pos].snapshots.len()
            )));
        }
        Ok(self.volumes.remove(pos))
    }

    /// Strip a snapshot id from whichever volume holds it.
    pub fn remove_snapshot(&mut self, id: &SnapshotId) -> bool {
        self.volumes.iter_mut().any(|v| v.remove_snapshot(id))
    }

    /// Resolve a snapshot by hex id or the `latest` sentinel (most
    /// recent creation date across all volumes) and load it.
    pub fn find_snapshot(
        &self,
        distributor: &Distributor,
        password: &str,
        selector: &str,
    ) -> Result<Snapshot> {
        if selector == LATEST {
            let mut latest: Option<Snapshot> = None;
            for volume in &self.volumes {
                for id in &volume.snapshots {
                    let snapshot = Snapshot::load(distributor, password, id)?;
                    if latest.as_ref().map_or(true, |l| snapshot.date > l.date) {
                        latest = Some(snapshot);
                    }
                }
            }
            return latest.ok_or_else(|| CairnError::SnapshotNotFound(selector.to_string()));
        }

        let id = SnapshotId::from_hex(selector)
            .map_err(|_| CairnError::SnapshotNotFound(selector.to_string()))?;
        if !self.volumes.iter().any(|v| v.snapshots.contains(&id)) {
            return Err(CairnError::SnapshotNotFound(selector.to_string()));
        }
        Snapshot::load(distributor, password, &id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::testutil::MemoryBackend;

    fn distributor() -> Distributor {
        Distributor::new(vec![
            Box::new(MemoryBackend::new("mem")) as Box<dyn Backend>
        ])
        .unwrap()
    }

    #[test]
    fn init_open_roundtrip() {
        let dist = distributor();
        let mut repo = Repository::init(&dist, "pw").unwrap();
        repo.add_volume("docs", "documents");
        repo.save(&dist, "pw").unwrap();

        let reopened = Repository::open(&dist, "pw").unwrap();
        assert_eq!(reopened.version, REPOSITORY_VERSION);
        assert_eq!(reopened.volumes.len(), 1);
        assert_eq!(reopened.volumes[0].name, "docs");
    }

    #[test]
    fn wrong_password_looks_like_corruption() {
        let dist = distributor();
        Repository::init(&dist, "right").unwrap();
        assert!(matches!(
            Repository::open(&dist, "wrong").unwrap_err(),
            CairnError::Crypto
        ));
    }

    #[test]
    fn version_mismatch_is_fatal() {
        let dist = distributor();
        let mut repo = Repository::init(&dist, "pw").unwrap();
        repo.version = REPOSITORY_VERSION + 1;
        repo.save(&dist, "pw").unwrap();

        assert!(matches!(
            Repository::open(&dist, "pw").unwrap_err(),
            CairnError::VersionMismatch { found, expected }
                if found == REPOSITORY_VERSION + 1 && expected == REPOSITORY_VERSION
        ));
    }

    #[test]
    fn find_volume_by_name_id_and_latest() {
        let dist = distributor();
        let mut repo = Repository::init(&dist, "pw").unwrap();
        let first_id = repo.add_volume("first", "").id;
        repo.add_volume("second", "");

        assert_eq!(repo.find_volume("first").unwrap().id, first_id);
        assert_eq!(repo.find_volume(&first_id.to_hex()).unwrap().id, first_id);
        assert_eq!(repo.find_volume(LATEST).unwrap().name, "second");
        assert!(repo.find_volume("third").is_err());
    }

    #[test]
    fn volume_with_snapshots_cannot_be_removed() {
        let dist = distributor();
        let mut repo = Repository::init(&dist, "pw").unwrap();
        let volume = repo.add_volume("v", "");
        volume.add_snapshot(SnapshotId::generate());

        assert!(repo.remove_volume("v").is_err());
        let id = repo.volumes[0].snapshots[0];
        repo.remove_snapshot(&id);
        assert!(repo.remove_volume("v").is_ok());
        assert!(repo.volumes.is_empty());
    }

    #[test]
    fn find_snapshot_latest_picks_most_recent_across_volumes() {
        let dist = distributor();
        let mut repo = Repository::init(&dist, "pw").unwrap();

        let older = Snapshot::new("older");
        let mut newer = Snapshot::new("newer");
        newer.date = older.date + chrono::Duration::seconds(10);
        older.save(&dist, "pw").unwrap();
        newer.save(&dist, "pw").unwrap();

        repo.add_volume("a", "").add_snapshot(older.id);
        repo.add_volume("b", "").add_snapshot(newer.id);

        let found = repo.find_snapshot(&dist, "pw", LATEST).unwrap();
        assert_eq!(found.id, newer.id);

        let by_id = repo
            .find_snapshot(&dist, "pw", &older.id.to_hex())
            .unwrap();
        assert_eq!(by_id.id, older.id);

        assert!(repo
            .find_snapshot(&dist, "pw", &SnapshotId::generate().to_hex())
            .is_err());
    }
}
