// In-memory archive used by tests across the workspace.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use lpx_core::prelude::*;

use crate::ArchiveClient;

#[derive(Default)]
struct MockState {
    series: BTreeMap<String, Series>,
    packagesets: BTreeMap<String, BTreeMap<String, Vec<String>>>,
    queues: HashMap<(String, QueueStatus, Pocket), usize>,
    publications: HashMap<(String, Pocket, String), PublishedSource>,
    builds: HashMap<String, Vec<BuildRecord>>,
    binaries: HashMap<String, Vec<BinaryPublication>>,
    denied_builds: HashSet<String>,
    failing_sources: HashSet<String>,
    ignore_created_since: bool,
    calls: HashMap<&'static str, usize>,
    next_id: u64,
}

/// Simple in-memory archive with call counters and injectable failures.
#[derive(Default)]
pub struct MockArchive {
    state: Mutex<MockState>,
}

impl MockArchive {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn hit(&self, op: &'static str) -> MutexGuard<'_, MockState> {
        let mut st = self.lock();
        *st.calls.entry(op).or_default() += 1;
        st
    }

    /// How many times `op` (the trait method name) has been called.
    pub fn calls(&self, op: &str) -> usize {
        self.lock().calls.get(op).copied().unwrap_or(0)
    }

    pub fn add_series(&self, name: &str, status: SeriesStatus) {
        let link = format!("mock://ubuntu/{name}");
        self.lock().series.insert(name.to_string(), Series { name: name.to_string(), status, link });
    }

    /// Define (or replace) a packageset's member list.
    pub fn set_packageset(&self, series: &str, packageset: &str, sources: &[&str]) {
        self.lock()
            .packagesets
            .entry(series.to_string())
            .or_default()
            .insert(packageset.to_string(), sources.iter().map(|s| s.to_string()).collect());
    }

    pub fn set_queue(&self, series: &str, status: QueueStatus, pocket: Pocket, depth: usize) {
        self.lock().queues.insert((series.to_string(), status, pocket), depth);
    }

    /// Publish `source` and return the publication link used to attach builds.
    pub fn publish(&self, series: &str, pocket: Pocket, source: &str, version: &str, date_created: DateTime<Utc>) -> String {
        let mut st = self.lock();
        st.next_id += 1;
        let link = format!("mock://ubuntu/+archive/primary/+sourcepub/{}", st.next_id);
        let publication = PublishedSource {
            source_name: source.to_string(),
            version: version.to_string(),
            pocket,
            date_created,
            link: link.clone(),
        };
        st.publications.insert((series.to_string(), pocket, source.to_string()), publication);
        link
    }

    pub fn set_builds(&self, publication: &str, builds: &[(&str, BuildState)]) {
        let mut st = self.lock();
        let version = st
            .publications
            .values()
            .find(|p| p.link == publication)
            .map(|p| p.version.clone())
            .unwrap_or_default();
        let records = builds
            .iter()
            .map(|(arch, state)| BuildRecord { arch: arch.to_string(), version: version.clone(), state: state.clone() })
            .collect();
        st.builds.insert(publication.to_string(), records);
    }

    pub fn set_binaries(&self, publication: &str, binaries: &[(&str, BuildState)]) {
        let records = binaries
            .iter()
            .map(|(arch, state)| BinaryPublication { arch: arch.to_string(), state: state.clone() })
            .collect();
        self.lock().binaries.insert(publication.to_string(), records);
    }

    /// Reject build-record lookups for every publication of `source`.
    pub fn deny_builds(&self, source: &str) {
        self.lock().denied_builds.insert(source.to_string());
    }

    /// Answer publication lookups without honouring `created_since`, like a
    /// lagging replica that can hand back an older publication.
    pub fn ignore_created_since(&self) {
        self.lock().ignore_created_since = true;
    }

    /// Make publication lookups for `source` fail with a transport error.
    pub fn fail_source(&self, source: &str) {
        self.lock().failing_sources.insert(source.to_string());
    }
}

impl ArchiveClient for MockArchive {
    fn resolve_distribution(&self, name: &str) -> ArchiveResult<Distribution> {
        let _st = self.hit("resolve_distribution");
        Ok(Distribution { name: name.to_string(), link: format!("mock://{name}") })
    }

    fn resolve_series(&self, _distribution: &Distribution, name: &str) -> ArchiveResult<Series> {
        let st = self.hit("resolve_series");
        st.series.get(name).cloned().ok_or_else(|| ArchiveError::NotFound(format!("series {name}")))
    }

    fn list_current_series_names(&self, _distribution: &Distribution) -> ArchiveResult<Vec<String>> {
        let st = self.hit("list_current_series_names");
        Ok(st.series.values().filter(|s| s.status.is_current()).map(|s| s.name.clone()).collect())
    }

    fn resolve_archive(&self, distribution: &Distribution) -> ArchiveResult<Archive> {
        let _st = self.hit("resolve_archive");
        Ok(Archive { name: "primary".to_string(), link: format!("{}/+archive/primary", distribution.link) })
    }

    fn list_packagesets(&self, series: &Series) -> ArchiveResult<Vec<String>> {
        let st = self.hit("list_packagesets");
        Ok(st.packagesets.get(&series.name).map(|m| m.keys().cloned().collect()).unwrap_or_default())
    }

    fn resolve_packageset(&self, series: &Series, name: &str) -> ArchiveResult<Packageset> {
        let st = self.hit("resolve_packageset");
        match st.packagesets.get(&series.name).and_then(|m| m.get(name)) {
            Some(_) => Ok(Packageset {
                name: name.to_string(),
                series: series.name.clone(),
                link: format!("mock://package-sets/{}/{name}", series.name),
            }),
            None => Err(ArchiveError::NotFound(format!("packageset {}/{name}", series.name))),
        }
    }

    fn list_packageset_sources(&self, packageset: &Packageset) -> ArchiveResult<Vec<String>> {
        let st = self.hit("list_packageset_sources");
        st.packagesets
            .get(&packageset.series)
            .and_then(|m| m.get(&packageset.name))
            .cloned()
            .ok_or_else(|| ArchiveError::NotFound(packageset.link.clone()))
    }

    fn list_queue(&self, series: &Series, status: QueueStatus, pocket: Pocket) -> ArchiveResult<Vec<QueueEntry>> {
        let st = self.hit("list_queue");
        let depth = st.queues.get(&(series.name.clone(), status, pocket)).copied().unwrap_or(0);
        Ok((0..depth)
            .map(|i| QueueEntry {
                display_name: format!("upload-{i}"),
                link: format!("{}/+upload/{status}/{pocket}/{i}", series.link),
            })
            .collect())
    }

    fn latest_published_source(
        &self,
        _archive: &Archive,
        series: &Series,
        pocket: Pocket,
        source_name: &str,
        created_since: Option<DateTime<Utc>>,
    ) -> ArchiveResult<Option<PublishedSource>> {
        let st = self.hit("latest_published_source");
        if st.failing_sources.contains(source_name) {
            return Err(ArchiveError::Transport(format!("connection reset fetching {source_name}")));
        }
        let found = st.publications.get(&(series.name.clone(), pocket, source_name.to_string())).cloned();
        if st.ignore_created_since {
            return Ok(found);
        }
        Ok(found.filter(|p| created_since.map_or(true, |since| p.date_created >= since)))
    }

    fn build_records(&self, source: &PublishedSource) -> ArchiveResult<Vec<BuildRecord>> {
        let st = self.hit("build_records");
        if st.denied_builds.contains(&source.source_name) {
            return Err(ArchiveError::Unauthorized(source.link.clone()));
        }
        Ok(st.builds.get(&source.link).cloned().unwrap_or_default())
    }

    fn binary_publications(&self, source: &PublishedSource) -> ArchiveResult<Vec<BinaryPublication>> {
        let st = self.hit("binary_publications");
        Ok(st.binaries.get(&source.link).cloned().unwrap_or_default())
    }
}
