use std::sync::Arc;
use std::time::Duration;

use lpx_archive::ArchiveClient;
use lpx_core::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{Cache, CachePolicy, Clock, SystemClock};

/// Capacities and lifetimes of the per-kind caches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheConfig {
    /// Distributions, series and archives: LRU only
    pub lookup_capacity: usize,
    pub packageset_capacity: usize,
    pub packageset_ttl_secs: u64,
    pub sources_capacity: usize,
    pub sources_ttl_secs: u64,
    pub queue_capacity: usize,
    /// Queues churn quickly
    pub queue_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lookup_capacity: 50,
            packageset_capacity: 1024,
            packageset_ttl_secs: 10 * 60,
            sources_capacity: 4096,
            sources_ttl_secs: 60 * 60,
            queue_capacity: 256,
            queue_ttl_secs: 60,
        }
    }
}

/// One cache per archive resource kind; misses are filled from the supplied client.
pub struct ResourceCache {
    pub distributions: Cache<String, Distribution>,
    pub series: Cache<String, Series>,
    pub archives: Cache<String, Archive>,
    /// Packageset names per series
    pub packageset_names: Cache<String, Vec<String>>,
    pub packagesets: Cache<(String, String), Packageset>,
    pub packageset_sources: Cache<(String, String), Vec<String>>,
    pub queues: Cache<(String, QueueStatus, Pocket), Vec<QueueEntry>>,
}

impl ResourceCache {
    pub fn new(cfg: &CacheConfig) -> Self { Self::with_clock(cfg, Arc::new(SystemClock)) }

    pub fn with_clock(cfg: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let lookup = CachePolicy::lru(cfg.lookup_capacity);
        let packageset = CachePolicy::ttl(cfg.packageset_capacity, Duration::from_secs(cfg.packageset_ttl_secs));
        Self {
            distributions: Cache::with_clock("distribution", lookup, clock.clone()),
            series: Cache::with_clock("series", lookup, clock.clone()),
            archives: Cache::with_clock("archive", lookup, clock.clone()),
            packageset_names: Cache::with_clock("packageset_names", packageset, clock.clone()),
            packagesets: Cache::with_clock("packageset", packageset, clock.clone()),
            packageset_sources: Cache::with_clock(
                "packageset_sources",
                CachePolicy::ttl(cfg.sources_capacity, Duration::from_secs(cfg.sources_ttl_secs)),
                clock.clone(),
            ),
            queues: Cache::with_clock(
                "queue",
                CachePolicy::ttl(cfg.queue_capacity, Duration::from_secs(cfg.queue_ttl_secs)),
                clock,
            ),
        }
    }

    pub fn distribution(&self, client: &dyn ArchiveClient, name: &str) -> ArchiveResult<Distribution> {
        self.distributions.get_or_compute(name.to_string(), || client.resolve_distribution(name))
    }

    pub fn series(&self, client: &dyn ArchiveClient, distribution: &Distribution, name: &str) -> ArchiveResult<Series> {
        self.series.get_or_compute(name.to_string(), || client.resolve_series(distribution, name))
    }

    pub fn archive(&self, client: &dyn ArchiveClient, distribution: &Distribution) -> ArchiveResult<Archive> {
        self.archives
            .get_or_compute(distribution.name.clone(), || client.resolve_archive(distribution))
    }

    pub fn packageset_names(&self, client: &dyn ArchiveClient, series: &Series) -> ArchiveResult<Vec<String>> {
        self.packageset_names.get_or_compute(series.name.clone(), || client.list_packagesets(series))
    }

    pub fn packageset(&self, client: &dyn ArchiveClient, series: &Series, name: &str) -> ArchiveResult<Packageset> {
        self.packagesets
            .get_or_compute((series.name.clone(), name.to_string()), || client.resolve_packageset(series, name))
    }

    pub fn packageset_sources(&self, client: &dyn ArchiveClient, packageset: &Packageset) -> ArchiveResult<Vec<String>> {
        self.packageset_sources.get_or_compute((packageset.series.clone(), packageset.name.clone()), || {
            client.list_packageset_sources(packageset)
        })
    }

    pub fn queue(
        &self,
        client: &dyn ArchiveClient,
        series: &Series,
        status: QueueStatus,
        pocket: Pocket,
    ) -> ArchiveResult<Vec<QueueEntry>> {
        self.queues
            .get_or_compute((series.name.clone(), status, pocket), || client.list_queue(series, status, pocket))
    }
}
