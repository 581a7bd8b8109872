//! lpx tracker: per (series, source package) build-status state machine.
//!
//! For every pocket a [`SourcePackage`] remembers the creation time of the
//! newest publication it has looked at and the build outcome per
//! architecture of that publication. A refresh asks the archive for the
//! newest publication created since that time and only re-reads builds when
//! something may have changed:
//!
//! - nothing published: state is left alone
//! - same publication and every build succeeded: skipped without touching builds
//! - anything else (new publication, failed or in-progress builds): builds
//!   are fetched and the pocket's build map replaced
//!
//! Builds come from the publication's build records or, for sources copied
//! into the series without being rebuilt, from its binary publications.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use lpx_archive::ArchiveClient;
use lpx_core::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Version and outcome of the newest known build on one architecture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStatus {
    pub version: String,
    pub state: BuildState,
}

pub type ArchBuilds = BTreeMap<String, BuildStatus>;

#[derive(Debug, Clone, Default)]
struct PocketState {
    last_checked: Option<DateTime<Utc>>,
    builds: ArchBuilds,
}

impl PocketState {
    fn all_successful(&self) -> bool { self.builds.values().all(|b| b.state.is_successful()) }
}

/// What a single pocket refresh did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PocketOutcome {
    /// No publication in this pocket (since the last check)
    NotPublished,
    /// Same publication as last time and all builds succeeded
    UpToDate,
    /// Archive returned a publication older than the one already recorded
    Stale,
    Updated { arches: usize },
    /// Build records were refused; previous state kept
    Unauthorized,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshSummary {
    pub not_published: usize,
    pub up_to_date: usize,
    pub updated: usize,
    pub unauthorized: usize,
}

impl RefreshSummary {
    fn record(&mut self, outcome: PocketOutcome) {
        match outcome {
            PocketOutcome::NotPublished => self.not_published += 1,
            PocketOutcome::UpToDate | PocketOutcome::Stale => self.up_to_date += 1,
            PocketOutcome::Updated { .. } => self.updated += 1,
            PocketOutcome::Unauthorized => self.unauthorized += 1,
        }
    }
}

/// Tracked build state of one source package in one series.
///
/// One instance exists per (series, name); packagesets share it through `Arc`.
#[derive(Debug)]
pub struct SourcePackage {
    series: String,
    name: String,
    pockets: Mutex<BTreeMap<Pocket, PocketState>>,
}

impl SourcePackage {
    pub fn new(series: impl Into<String>, name: impl Into<String>) -> Self {
        Self { series: series.into(), name: name.into(), pockets: Mutex::new(BTreeMap::new()) }
    }

    pub fn series(&self) -> &str { &self.series }
    pub fn name(&self) -> &str { &self.name }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<Pocket, PocketState>> {
        self.pockets.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn last_checked(&self, pocket: Pocket) -> Option<DateTime<Utc>> {
        self.lock().get(&pocket).and_then(|p| p.last_checked)
    }

    pub fn build_status(&self, pocket: Pocket) -> ArchBuilds {
        self.lock().get(&pocket).map(|p| p.builds.clone()).unwrap_or_default()
    }

    /// True once any pocket has at least one recorded build.
    pub fn has_builds(&self) -> bool { self.lock().values().any(|p| !p.builds.is_empty()) }

    /// Per pocket, the architectures whose latest build failed.
    pub fn get_failed_builds(&self) -> BTreeMap<Pocket, ArchBuilds> {
        self.lock()
            .iter()
            .filter_map(|(pocket, st)| {
                let failed: ArchBuilds = st
                    .builds
                    .iter()
                    .filter(|(_, b)| b.state.is_failed())
                    .map(|(arch, b)| (arch.clone(), b.clone()))
                    .collect();
                (!failed.is_empty()).then_some((*pocket, failed))
            })
            .collect()
    }

    /// Refresh every pocket. Unauthorized build lookups are absorbed; any
    /// other archive error aborts the refresh and is returned.
    pub fn refresh(&self, client: &dyn ArchiveClient, archive: &Archive, series: &Series) -> ArchiveResult<RefreshSummary> {
        let mut summary = RefreshSummary::default();
        for pocket in Pocket::ALL {
            summary.record(self.refresh_pocket(client, archive, series, pocket)?);
        }
        debug!(series = %self.series, source = %self.name, ?summary, "refreshed build status");
        Ok(summary)
    }

    pub fn refresh_pocket(
        &self,
        client: &dyn ArchiveClient,
        archive: &Archive,
        series: &Series,
        pocket: Pocket,
    ) -> ArchiveResult<PocketOutcome> {
        let (since, all_successful) = {
            let pockets = self.lock();
            match pockets.get(&pocket) {
                Some(st) => (st.last_checked, st.all_successful()),
                None => (None, true),
            }
        };

        let publication = match client.latest_published_source(archive, series, pocket, &self.name, since) {
            Ok(Some(p)) => p,
            Ok(None) => return Ok(PocketOutcome::NotPublished),
            Err(e) if e.is_not_found() => return Ok(PocketOutcome::NotPublished),
            Err(e) => return Err(e),
        };

        if let Some(prev) = since {
            if publication.date_created < prev {
                return Ok(PocketOutcome::Stale);
            }
            if publication.date_created == prev && all_successful {
                return Ok(PocketOutcome::UpToDate);
            }
        }

        let builds = match fetch_builds(client, &publication) {
            Ok(b) => b,
            Err(e) if e.is_unauthorized() => {
                warn!(
                    series = %self.series,
                    source = %self.name,
                    pocket = %pocket,
                    error = %e,
                    "not allowed to read builds; keeping previous state"
                );
                return Ok(PocketOutcome::Unauthorized);
            }
            Err(e) => return Err(e),
        };

        let mut pockets = self.lock();
        let st = pockets.entry(pocket).or_default();
        // A concurrent refresh may have recorded a newer publication meanwhile.
        if st.last_checked.is_some_and(|t| t > publication.date_created) {
            return Ok(PocketOutcome::Stale);
        }
        let arches = builds.len();
        st.last_checked = Some(publication.date_created);
        st.builds = builds;
        debug!(
            series = %self.series,
            source = %self.name,
            pocket = %pocket,
            version = %publication.version,
            arches,
            "recorded builds"
        );
        Ok(PocketOutcome::Updated { arches })
    }
}

/// Build outcome per architecture for `publication`, falling back to its
/// binary publications when it has no build records in this series.
fn fetch_builds(client: &dyn ArchiveClient, publication: &PublishedSource) -> ArchiveResult<ArchBuilds> {
    let records = client.build_records(publication)?;
    if !records.is_empty() {
        return Ok(records
            .into_iter()
            .map(|r| (r.arch, BuildStatus { version: r.version, state: r.state }))
            .collect());
    }
    let mut out = ArchBuilds::new();
    for bin in client.binary_publications(publication)? {
        out.entry(bin.arch)
            .or_insert_with(|| BuildStatus { version: publication.version.clone(), state: bin.state });
    }
    Ok(out)
}
