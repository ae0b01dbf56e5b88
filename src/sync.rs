//! Three-way reconciliation of two file-set snapshots
//!
//! `reconcile` is pure: two metadata snapshots in, a disjoint
//! {upload, download, conflict} partition out. `MirrorSync` is the
//! acting variant: it reconciles a mirror directory against the master
//! store and performs the physical copies the classification implies,
//! demoting any copy failure to a conflict entry instead of failing the
//! job.
//!
//! Timestamp policy: modification times compare strictly, and only
//! exactly-equal stamps classify as a conflict. Sync copies preserve
//! source mtimes, so equal-after-copy is the converged state.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::sync::Arc;

use filetime::FileTime;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::checksum;
use crate::error::Result;
use crate::logger::Logger;
use crate::store::{FileMeta, Store};

/// Outcome of one reconciliation. The three sets are pairwise disjoint
/// and, together with the equal-checksum names they omit, cover the
/// union of both input name sets. Lists are sorted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub files_to_upload: Vec<String>,
    pub files_to_download: Vec<String>,
    pub conflict_files: Vec<String>,
}

impl SyncReport {
    pub fn is_conflict_free(&self) -> bool {
        self.conflict_files.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "uploads={} downloads={} conflicts={}",
            self.files_to_upload.len(),
            self.files_to_download.len(),
            self.conflict_files.len()
        )
    }
}

/// Classifies every name in the union of the two snapshots.
///
/// Symmetric by construction: swapping the arguments swaps the upload
/// and download sets and leaves conflicts unchanged.
pub fn reconcile(client: &[FileMeta], server: &[FileMeta]) -> SyncReport {
    let client_by: BTreeMap<&str, &FileMeta> =
        client.iter().map(|m| (m.name.as_str(), m)).collect();
    let server_by: BTreeMap<&str, &FileMeta> =
        server.iter().map(|m| (m.name.as_str(), m)).collect();

    let mut names: BTreeSet<&str> = client_by.keys().copied().collect();
    names.extend(server_by.keys().copied());

    let mut report = SyncReport::default();
    for name in names {
        match (client_by.get(name), server_by.get(name)) {
            (Some(_), None) => report.files_to_upload.push(name.to_string()),
            (None, Some(_)) => report.files_to_download.push(name.to_string()),
            (Some(c), Some(s)) => {
                if let (Some(cc), Some(sc)) = (&c.checksum, &s.checksum) {
                    if checksum::digests_match(cc, sc) {
                        continue;
                    }
                }
                match c.last_modified.cmp(&s.last_modified) {
                    Ordering::Greater => report.files_to_upload.push(name.to_string()),
                    Ordering::Less => report.files_to_download.push(name.to_string()),
                    Ordering::Equal => report.conflict_files.push(name.to_string()),
                }
            }
            (None, None) => unreachable!("name came from one of the two maps"),
        }
    }
    report
}

/// Server-side sync between a mirror directory (the "client" side) and
/// the master store.
#[derive(Clone)]
pub struct MirrorSync {
    master: Store,
    mirror: Store,
}

impl MirrorSync {
    pub fn new(master: Store, mirror: Store) -> Self {
        Self { master, mirror }
    }

    /// Opens the mirror directory with the master's options.
    pub fn open(master: &Store, mirror_root: impl Into<std::path::PathBuf>) -> Result<Self> {
        let mirror = Store::open(mirror_root, master.options())?;
        Ok(Self::new(master.clone(), mirror))
    }

    /// Scans both sides, reconciles, and performs the copies the
    /// classification implies. Copies run in parallel; each failure
    /// demotes its name from upload/download to the conflict list. The
    /// returned report reflects those demotions.
    pub fn run(&self, logger: &dyn Logger) -> Result<SyncReport> {
        let client = self.mirror.scan()?;
        let server = self.master.scan()?;
        let mut report = reconcile(&client, &server);

        let failed_up: Vec<String> = report
            .files_to_upload
            .par_iter()
            .filter_map(|name| {
                match copy_preserving_mtime(&self.mirror, &self.master, name) {
                    Ok(bytes) => {
                        logger.copied("mirror->master", name, bytes);
                        None
                    }
                    Err(e) => {
                        logger.error("sync-upload", name, &e.to_string());
                        Some(name.clone())
                    }
                }
            })
            .collect();
        let failed_down: Vec<String> = report
            .files_to_download
            .par_iter()
            .filter_map(|name| {
                match copy_preserving_mtime(&self.master, &self.mirror, name) {
                    Ok(bytes) => {
                        logger.copied("master->mirror", name, bytes);
                        None
                    }
                    Err(e) => {
                        logger.error("sync-download", name, &e.to_string());
                        Some(name.clone())
                    }
                }
            })
            .collect();

        if !failed_up.is_empty() {
            report.files_to_upload.retain(|n| !failed_up.contains(n));
            report.conflict_files.extend(failed_up);
        }
        if !failed_down.is_empty() {
            report.files_to_download.retain(|n| !failed_down.contains(n));
            report.conflict_files.extend(failed_down);
        }
        report.conflict_files.sort();
        Ok(report)
    }

    /// Runs the whole job on the blocking pool. There is no cancellation:
    /// dropping the handle abandons the future but the sync continues.
    pub fn spawn(self, logger: Arc<dyn Logger>) -> tokio::task::JoinHandle<Result<SyncReport>> {
        tokio::task::spawn_blocking(move || self.run(logger.as_ref()))
    }
}

/// Transactional copy of one finished file between stores, carrying the
/// source modification time so reconciliation converges.
fn copy_preserving_mtime(src: &Store, dst: &Store, name: &str) -> Result<u64> {
    let src_path = src.root().join(name);
    let meta = fs::metadata(&src_path)?;
    let reader = File::open(&src_path)?;
    dst.save_stream(name, meta.len(), reader, None)?;
    filetime::set_file_mtime(
        dst.root().join(name),
        FileTime::from_last_modification_time(&meta),
    )?;
    Ok(meta.len())
}
