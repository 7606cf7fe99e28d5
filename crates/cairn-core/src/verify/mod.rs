//! Sampling-based integrity scrub. Reuses the restore pipeline's
//! fetch/reconstruct/decode/verify stages and discards the bytes.

use std::sync::atomic::{AtomicBool, Ordering};

use rand::seq::index::sample;
use tracing::info;

use cairn_types::{CairnError, Result};

use crate::backend::Distributor;
use crate::pipeline::Pipeline;
use crate::progress::{Progress, ProgressFn};
use crate::repo::Repository;
use crate::restore::load_chunk;
use crate::snapshot::{Archive, Snapshot};

#[derive(Debug, Clone, Copy)]
pub enum VerifyScope<'a> {
    /// Every snapshot of every volume.
    Repository,
    /// Every snapshot of one volume, by name, id, or `latest`.
    Volume(&'a str),
    /// One snapshot, by id or `latest`.
    Snapshot(&'a str),
}

#[derive(Debug, Default)]
pub struct VerifyReport {
    pub archives_in_scope: u64,
    pub archives_checked: u64,
    pub chunks_checked: u64,
    /// Archive path and the error hit while checking it.
    pub errors: Vec<(String, CairnError)>,
}

/// Check a random sample of `percentage`% (clamped to 0..=100) of the
/// archives in scope. Individual failures are accumulated in the
/// report, not raised; the scan always runs to completion unless
/// cancelled.
pub fn verify(
    repo: &Repository,
    distributor: &Distributor,
    password: &str,
    scope: VerifyScope<'_>,
    percentage: u32,
    cancel: &AtomicBool,
    progress: &ProgressFn,
) -> Result<VerifyReport> {
    let snapshots = snapshots_in_scope(repo, distributor, password, scope)?;
    let archives: Vec<&Archive> = snapshots
        .iter()
        .flat_map(|s| s.archives.values())
        .collect();

    let percentage = percentage.min(100);
    let count = (archives.len() * percentage as usize).div_ceil(100);
    let selected = sample(&mut rand::thread_rng(), archives.len(), count);

    let mut report = VerifyReport {
        archives_in_scope: archives.len() as u64,
        ..VerifyReport::default()
    };
    for idx in selected {
        if cancel.load(Ordering::Relaxed) {
            return Err(CairnError::Cancelled);
        }
        let archive = archives[idx];
        match check_archive(archive, distributor, password, &mut report.chunks_checked) {
            Ok(()) => progress(Progress::for_path(archive.path.as_str())),
            Err(e) => {
                progress(Progress::for_path(archive.path.as_str()).with_error(
                    CairnError::Other(e.to_string()),
                ));
                report.errors.push((archive.path.clone(), e));
            }
        }
        report.archives_checked += 1;
    }
    info!(
        checked = report.archives_checked,
        errors = report.errors.len(),
        "verify pass finished"
    );
    Ok(report)
}

fn snapshots_in_scope(
    repo: &Repository,
    distributor: &Distributor,
    password: &str,
    scope: VerifyScope<'_>,
) -> Result<Vec<Snapshot>> {
    let load_all = |ids: &[cairn_types::SnapshotId]| -> Result<Vec<Snapshot>> {
        ids.iter()
            .map(|id| Snapshot::load(distributor, password, id))
            .collect()
    };
    match scope {
        VerifyScope::Repository => {
            let mut snapshots = Vec::new();
            for volume in &repo.volumes {
                snapshots.extend(load_all(&volume.snapshots)?);
            }
            Ok(snapshots)
        }
        VerifyScope::Volume(selector) => load_all(&repo.find_volume(selector)?.snapshots),
        VerifyScope::Snapshot(selector) => {
            Ok(vec![repo.find_snapshot(distributor, password, selector)?])
        }
    }
}

fn check_archive(
    archive: &Archive,
    distributor: &Distributor,
    password: &str,
    chunks_checked: &mut u64,
) -> Result<()> {
    let decode = Pipeline::decode_pipeline(archive.encryption, password)?;
    for chunk in &archive.chunks {
        load_chunk(distributor, &decode, chunk)?;
        *chunks_checked += 1;
    }
    Ok(())
}
