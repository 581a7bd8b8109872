//! Packageset membership, queue depth and build-status refresh across series.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use lpx_cache::ResourceCache;
use lpx_core::prelude::*;
use lpx_tracker::{RefreshSummary, SourcePackage};
use tracing::{debug, info, warn};

use crate::pool::WorkerPool;
use crate::ExporterConfig;

/// Members of one packageset, keyed by source name.
pub type Members = BTreeMap<String, Arc<SourcePackage>>;

/// series → pocket → status → pending uploads
pub type QueueCounts = BTreeMap<String, BTreeMap<Pocket, BTreeMap<QueueStatus, usize>>>;

#[derive(Debug, Default)]
pub struct SeriesMaps {
    /// Every source seen in any packageset of the series; one object per name
    pub sources: BTreeMap<String, Arc<SourcePackage>>,
    pub packagesets: BTreeMap<String, Members>,
}

/// Shared per-series state. All mutation goes through the one mutex.
#[derive(Debug)]
pub struct SeriesState {
    name: String,
    maps: Mutex<SeriesMaps>,
}

impl SeriesState {
    fn new(name: &str) -> Self { Self { name: name.to_string(), maps: Mutex::new(SeriesMaps::default()) } }

    pub fn name(&self) -> &str { &self.name }

    pub fn lock(&self) -> MutexGuard<'_, SeriesMaps> {
        self.maps.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Existing tracker for `source`, or a new one registered under the lock.
    pub fn source(&self, source: &str) -> Arc<SourcePackage> {
        self.lock()
            .sources
            .entry(source.to_string())
            .or_insert_with(|| Arc::new(SourcePackage::new(self.name.clone(), source)))
            .clone()
    }

    pub fn sources(&self) -> Vec<Arc<SourcePackage>> { self.lock().sources.values().cloned().collect() }

    /// Copy of the packageset → members map.
    pub fn packagesets(&self) -> BTreeMap<String, Members> { self.lock().packagesets.clone() }

    fn merge(&self, found: Vec<(String, Members)>) {
        let mut maps = self.lock();
        for (packageset, members) in found {
            maps.packagesets.entry(packageset).or_default().extend(members);
        }
    }
}

/// Totals of one build-status pass over a series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildRefreshReport {
    pub sources: usize,
    pub failed: usize,
    pub summary: RefreshSummary,
}

pub struct Aggregator {
    cfg: ExporterConfig,
    cache: Arc<ResourceCache>,
    pool: WorkerPool,
    series: Mutex<BTreeMap<String, Arc<SeriesState>>>,
    queues: ArcSwap<QueueCounts>,
}

impl Aggregator {
    pub fn new(cfg: ExporterConfig, cache: Arc<ResourceCache>, pool: WorkerPool) -> Self {
        Self {
            cfg,
            cache,
            pool,
            series: Mutex::new(BTreeMap::new()),
            queues: ArcSwap::from_pointee(QueueCounts::new()),
        }
    }

    pub fn config(&self) -> &ExporterConfig { &self.cfg }
    pub fn cache(&self) -> &ResourceCache { &self.cache }

    fn distribution(&self) -> Result<Distribution> {
        self.cache
            .distribution(self.pool.coordinator_client(), &self.cfg.distribution)
            .with_context(|| format!("resolving distribution {}", self.cfg.distribution))
    }

    /// State for `name`, created on first use.
    pub fn series_state(&self, name: &str) -> Arc<SeriesState> {
        let mut all = self.series.lock().unwrap_or_else(|e| e.into_inner());
        all.entry(name.to_string()).or_insert_with(|| Arc::new(SeriesState::new(name))).clone()
    }

    /// Series that have been populated at least once.
    pub fn known_series(&self) -> Vec<Arc<SeriesState>> {
        self.series.lock().unwrap_or_else(|e| e.into_inner()).values().cloned().collect()
    }

    pub fn queue_counts(&self) -> Arc<QueueCounts> { self.queues.load_full() }

    /// Configured series, or every current series of the distribution.
    /// A configured series that fails to resolve is logged and skipped.
    pub fn series_to_consider(&self) -> Result<Vec<Series>> {
        let client = self.pool.coordinator_client();
        let distro = self.distribution()?;
        let names = if self.cfg.series.is_empty() {
            client
                .list_current_series_names(&distro)
                .with_context(|| format!("listing current series of {}", distro.name))?
        } else {
            self.cfg.series.clone()
        };
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            match self.cache.series(client, &distro, &name) {
                Ok(s) => out.push(s),
                Err(e) => warn!(series = %name, error = %e, "cannot resolve series; skipping"),
            }
        }
        Ok(out)
    }

    /// Refresh packageset membership for every series under consideration.
    pub fn populate_packageset_maps(&self) -> Result<()> {
        for series in self.series_to_consider()? {
            if let Err(e) = self.populate_series(&series) {
                warn!(series = %series.name, error = ?e, "packageset refresh failed");
            }
        }
        info!("done fetching packagesets");
        Ok(())
    }

    /// Fetch membership of every packageset of `series` on the pool and merge
    /// the results into the series maps.
    pub fn populate_series(&self, series: &Series) -> Result<()> {
        info!(series = %series.name, "fetching packagesets");
        let names = if self.cfg.packagesets.is_empty() {
            self.cache
                .packageset_names(self.pool.coordinator_client(), series)
                .with_context(|| format!("listing packagesets of {}", series.name))?
        } else {
            self.cfg.packagesets.clone()
        };
        let distro = self.distribution()?;
        let state = self.series_state(&series.name);
        let cache = &self.cache;

        let report = self.pool.run("packageset", names, |client, packageset: String| {
            let series = cache.series(client, &distro, &series.name)?;
            let ps = cache
                .packageset(client, &series, &packageset)
                .with_context(|| format!("resolving packageset {}/{packageset}", series.name))?;
            let sources = cache
                .packageset_sources(client, &ps)
                .with_context(|| format!("listing sources of {}/{packageset}", series.name))?;
            debug!(series = %series.name, packageset = %packageset, sources = sources.len(), "got packageset");
            let members: Members = sources.into_iter().map(|name| (name.clone(), state.source(&name))).collect();
            Ok((packageset, members))
        });

        state.merge(report.results);
        if report.failed > 0 {
            warn!(series = %series.name, failed = report.failed, "some packagesets could not be fetched");
        }
        Ok(())
    }

    /// Recompute the queue depth of every (series, pocket, status).
    ///
    /// A queue that cannot be read keeps its previous count.
    pub fn fetch_queues(&self) -> Result<()> {
        let client = self.pool.coordinator_client();
        let previous = self.queues.load_full();
        let mut counts = QueueCounts::new();
        for series in self.series_to_consider()? {
            info!(series = %series.name, "fetching queues");
            let per_series = counts.entry(series.name.clone()).or_default();
            for status in QueueStatus::ALL {
                for pocket in Pocket::ALL {
                    let n = match self.cache.queue(client, &series, status, pocket) {
                        Ok(q) => q.len(),
                        Err(e) => {
                            warn!(series = %series.name, %status, %pocket, error = %e, "queue fetch failed");
                            previous
                                .get(&series.name)
                                .and_then(|p| p.get(&pocket))
                                .and_then(|s| s.get(&status))
                                .copied()
                                .unwrap_or(0)
                        }
                    };
                    debug!(series = %series.name, %status, %pocket, n_queue_items = n, "got queue");
                    per_series.entry(pocket).or_default().insert(status, n);
                }
            }
        }
        self.queues.store(Arc::new(counts));
        Ok(())
    }

    /// Re-check build status of every source known in `series_name`.
    pub fn fetch_build_statuses(&self, series_name: &str) -> Result<BuildRefreshReport> {
        let client = self.pool.coordinator_client();
        let distro = self.distribution()?;
        let archive = self
            .cache
            .archive(client, &distro)
            .with_context(|| format!("resolving primary archive of {}", distro.name))?;
        let series = self
            .cache
            .series(client, &distro, series_name)
            .with_context(|| format!("resolving series {series_name}"))?;
        let sources = self.series_state(series_name).sources();
        info!(series = %series_name, sources = sources.len(), "fetching build statuses");

        let report = self.pool.run("build_status", sources, |client, source: Arc<SourcePackage>| {
            source
                .refresh(client, &archive, &series)
                .with_context(|| format!("refreshing {}/{}", series.name, source.name()))
        });

        let mut total = BuildRefreshReport { sources: report.results.len() + report.failed, failed: report.failed, ..Default::default() };
        for s in &report.results {
            total.summary.not_published += s.not_published;
            total.summary.up_to_date += s.up_to_date;
            total.summary.updated += s.updated;
            total.summary.unauthorized += s.unauthorized;
        }
        info!(series = %series_name, ?total, "done fetching build statuses");
        Ok(total)
    }
}
