//! lpx archive: read-only access to the package archive.
//!
//! The aggregation engine only talks to [`ArchiveClient`]. Production uses the
//! anonymous Launchpad REST client in [`launchpad`]; tests use [`MockArchive`].

#![forbid(unsafe_code)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use lpx_core::prelude::*;

pub mod launchpad;
mod mock;

pub use launchpad::{LaunchpadClient, LaunchpadConfig};
pub use mock::MockArchive;

/// Blocking, read-only archive API consumed by the cache, tracker and aggregator.
pub trait ArchiveClient: Send + Sync {
    fn resolve_distribution(&self, name: &str) -> ArchiveResult<Distribution>;

    fn resolve_series(&self, distribution: &Distribution, name: &str) -> ArchiveResult<Series>;

    /// Names of every series whose status counts as current.
    fn list_current_series_names(&self, distribution: &Distribution) -> ArchiveResult<Vec<String>>;

    /// The distribution's primary archive.
    fn resolve_archive(&self, distribution: &Distribution) -> ArchiveResult<Archive>;

    fn list_packagesets(&self, series: &Series) -> ArchiveResult<Vec<String>>;

    fn resolve_packageset(&self, series: &Series, name: &str) -> ArchiveResult<Packageset>;

    fn list_packageset_sources(&self, packageset: &Packageset) -> ArchiveResult<Vec<String>>;

    fn list_queue(&self, series: &Series, status: QueueStatus, pocket: Pocket) -> ArchiveResult<Vec<QueueEntry>>;

    /// Newest publication of `source_name` in `pocket`, optionally restricted to
    /// publications created at or after `created_since`.
    fn latest_published_source(
        &self,
        archive: &Archive,
        series: &Series,
        pocket: Pocket,
        source_name: &str,
        created_since: Option<DateTime<Utc>>,
    ) -> ArchiveResult<Option<PublishedSource>>;

    fn build_records(&self, source: &PublishedSource) -> ArchiveResult<Vec<BuildRecord>>;

    fn binary_publications(&self, source: &PublishedSource) -> ArchiveResult<Vec<BinaryPublication>>;
}

/// Creates one client per worker so connection setup is paid once per worker.
pub trait ClientFactory: Send + Sync {
    fn create(&self) -> ArchiveResult<Arc<dyn ArchiveClient>>;
}

impl<F> ClientFactory for F
where
    F: Fn() -> ArchiveResult<Arc<dyn ArchiveClient>> + Send + Sync,
{
    fn create(&self) -> ArchiveResult<Arc<dyn ArchiveClient>> { self() }
}
