#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use lpx_aggregate::{Aggregator, ExporterConfig, WorkerPool};
use lpx_archive::{ArchiveClient, MockArchive};
use lpx_cache::ResourceCache;
use lpx_core::prelude::*;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 4, 25, 9, 30, 0).unwrap()
}

pub fn mock_with_noble() -> Arc<MockArchive> {
    let mock = Arc::new(MockArchive::new());
    mock.add_series("noble", SeriesStatus::Supported);
    mock
}

/// Aggregator whose workers all share `mock`, so call counters see every request.
pub fn aggregator(mock: &Arc<MockArchive>, cfg: ExporterConfig) -> Aggregator {
    let client: Arc<dyn ArchiveClient> = mock.clone();
    let pool = WorkerPool::with_clients(client.clone(), vec![client; 4]).unwrap();
    let cache = Arc::new(ResourceCache::new(&cfg.cache));
    Aggregator::new(cfg, cache, pool)
}

pub fn noble_only() -> ExporterConfig {
    ExporterConfig { series: vec!["noble".to_string()], ..ExporterConfig::default() }
}

/// Publish `source` in Release with the given per-arch outcomes.
pub fn publish_release(mock: &MockArchive, source: &str, builds: &[(&str, BuildState)]) {
    let link = mock.publish("noble", Pocket::Release, source, "1.0-1", t0());
    mock.set_builds(&link, builds);
}
