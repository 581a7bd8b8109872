//! lpx aggregate: concurrent packageset/build aggregation, refresh loops and
//! the exported metrics view.

#![forbid(unsafe_code)]

use lpx_cache::CacheConfig;
use serde::{Deserialize, Serialize};

pub mod aggregator;
pub mod pool;
pub mod scheduler;
pub mod view;

pub use aggregator::{Aggregator, BuildRefreshReport, Members, QueueCounts, SeriesState};
pub use pool::{BatchReport, WorkerPool};
pub use scheduler::{initial_fetch, Intervals, Scheduler};
pub use view::{MetricsSnapshot, MetricsView};

/// What to export and how hard to hit the archive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExporterConfig {
    pub distribution: String,
    /// Explicit series; empty means every current series
    pub series: Vec<String>,
    /// Explicit packagesets; empty means all packagesets of each series
    pub packagesets: Vec<String>,
    pub workers: usize,
    pub fast_interval_secs: u64,
    pub slow_interval_secs: u64,
    pub cache: CacheConfig,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            distribution: "ubuntu".to_string(),
            series: Vec::new(),
            packagesets: Vec::new(),
            workers: 10,
            fast_interval_secs: 60,
            slow_interval_secs: 5 * 60,
            cache: CacheConfig::default(),
        }
    }
}

impl ExporterConfig {
    pub fn intervals(&self) -> Intervals {
        Intervals {
            fast: std::time::Duration::from_secs(self.fast_interval_secs.max(1)),
            slow: std::time::Duration::from_secs(self.slow_interval_secs.max(1)),
        }
    }
}
