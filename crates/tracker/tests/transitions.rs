#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use lpx_archive::{ArchiveClient, MockArchive};
use lpx_core::prelude::*;
use lpx_tracker::{PocketOutcome, SourcePackage};

struct Fixture {
    mock: MockArchive,
    archive: Archive,
    series: Series,
    t0: DateTime<Utc>,
}

fn fixture() -> Fixture {
    let mock = MockArchive::new();
    mock.add_series("noble", SeriesStatus::Supported);
    let d = mock.resolve_distribution("ubuntu").unwrap();
    let archive = mock.resolve_archive(&d).unwrap();
    let series = mock.resolve_series(&d, "noble").unwrap();
    let t0 = Utc.with_ymd_and_hms(2024, 4, 25, 9, 30, 0).unwrap();
    Fixture { mock, archive, series, t0 }
}

#[test]
fn unchanged_successful_publication_is_skipped() {
    let f = fixture();
    let link = f.mock.publish("noble", Pocket::Release, "foo", "1.2-1", f.t0);
    f.mock.set_builds(&link, &[("amd64", BuildState::SuccessfullyBuilt), ("arm64", BuildState::SuccessfullyBuilt)]);

    let src = SourcePackage::new("noble", "foo");
    src.refresh_pocket(&f.mock, &f.archive, &f.series, Pocket::Release).unwrap();
    assert_eq!(src.last_checked(Pocket::Release), Some(f.t0));
    let before = src.build_status(Pocket::Release);
    let fetches = f.mock.calls("build_records");

    // Upstream build map changes, but the publication timestamp does not
    f.mock.set_builds(&link, &[("amd64", BuildState::FailedToBuild)]);
    let out = src.refresh_pocket(&f.mock, &f.archive, &f.series, Pocket::Release).unwrap();

    assert_eq!(out, PocketOutcome::UpToDate);
    assert_eq!(f.mock.calls("build_records"), fetches);
    assert_eq!(src.build_status(Pocket::Release), before);
}

#[test]
fn copied_source_falls_back_to_binaries_first_arch_wins() {
    let f = fixture();
    let link = f.mock.publish("noble", Pocket::Release, "copied", "3.0-1", f.t0);
    f.mock.set_binaries(
        &link,
        &[
            ("amd64", BuildState::SuccessfullyBuilt),
            ("arm64", BuildState::FailedToBuild),
            ("amd64", BuildState::FailedToBuild),
        ],
    );

    let src = SourcePackage::new("noble", "copied");
    let out = src.refresh_pocket(&f.mock, &f.archive, &f.series, Pocket::Release).unwrap();

    assert_eq!(out, PocketOutcome::Updated { arches: 2 });
    assert_eq!(f.mock.calls("binary_publications"), 1);
    let builds = src.build_status(Pocket::Release);
    assert!(builds["amd64"].state.is_successful());
    assert!(builds["arm64"].state.is_failed());
    assert_eq!(builds["arm64"].version, "3.0-1");
}

#[test]
fn build_records_win_over_binaries() {
    let f = fixture();
    let link = f.mock.publish("noble", Pocket::Proposed, "native", "1", f.t0);
    f.mock.set_builds(&link, &[("s390x", BuildState::FailedToBuild)]);
    f.mock.set_binaries(&link, &[("s390x", BuildState::SuccessfullyBuilt)]);

    let src = SourcePackage::new("noble", "native");
    src.refresh_pocket(&f.mock, &f.archive, &f.series, Pocket::Proposed).unwrap();
    assert_eq!(f.mock.calls("binary_publications"), 0);
    assert!(src.get_failed_builds()[&Pocket::Proposed].contains_key("s390x"));
}

#[test]
fn unauthorized_keeps_previous_state() {
    let f = fixture();
    let link = f.mock.publish("noble", Pocket::Security, "private", "1", f.t0);
    f.mock.set_builds(&link, &[("amd64", BuildState::FailedToBuild)]);
    let src = SourcePackage::new("noble", "private");
    src.refresh_pocket(&f.mock, &f.archive, &f.series, Pocket::Security).unwrap();

    let t1 = f.t0 + chrono::Duration::days(1);
    f.mock.publish("noble", Pocket::Security, "private", "2", t1);
    f.mock.deny_builds("private");
    let out = src.refresh_pocket(&f.mock, &f.archive, &f.series, Pocket::Security).unwrap();

    assert_eq!(out, PocketOutcome::Unauthorized);
    assert_eq!(src.last_checked(Pocket::Security), Some(f.t0));
    assert_eq!(src.build_status(Pocket::Security)["amd64"].version, "1");
}

#[test]
fn full_refresh_walks_every_pocket() {
    let f = fixture();
    let link = f.mock.publish("noble", Pocket::Release, "bar", "1", f.t0);
    f.mock.set_builds(&link, &[("amd64", BuildState::SuccessfullyBuilt)]);
    let upd = f.mock.publish("noble", Pocket::Updates, "bar", "1.1", f.t0);
    f.mock.set_builds(&upd, &[("amd64", BuildState::FailedToBuild)]);

    let src = SourcePackage::new("noble", "bar");
    let summary = src.refresh(&f.mock, &f.archive, &f.series).unwrap();
    assert_eq!(summary.updated, 2);
    assert_eq!(summary.not_published, 3);
    assert_eq!(f.mock.calls("latest_published_source"), 5);
    assert!(src.has_builds());

    let failed = src.get_failed_builds();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[&Pocket::Updates]["amd64"].version, "1.1");
}

#[test]
fn transport_errors_propagate() {
    let f = fixture();
    f.mock.fail_source("flaky");
    let src = SourcePackage::new("noble", "flaky");
    let err = src.refresh(&f.mock, &f.archive, &f.series).unwrap_err();
    assert!(matches!(err, ArchiveError::Transport(_)));
}

#[test]
fn older_publication_never_rolls_state_back() {
    let f = fixture();
    let newer = f.t0 + Duration::hours(3);
    let link = f.mock.publish("noble", Pocket::Updates, "foo", "1.3-1", newer);
    f.mock.set_builds(&link, &[("amd64", BuildState::FailedToBuild)]);
    let src = SourcePackage::new("noble", "foo");
    src.refresh_pocket(&f.mock, &f.archive, &f.series, Pocket::Updates).unwrap();
    let before = src.build_status(Pocket::Updates);
    let fetches = f.mock.calls("build_records");

    let old = f.mock.publish("noble", Pocket::Updates, "foo", "1.2-1", f.t0);
    f.mock.set_builds(&old, &[("amd64", BuildState::SuccessfullyBuilt)]);
    f.mock.ignore_created_since();
    let out = src.refresh_pocket(&f.mock, &f.archive, &f.series, Pocket::Updates).unwrap();

    assert_eq!(out, PocketOutcome::Stale);
    assert_eq!(src.last_checked(Pocket::Updates), Some(newer));
    assert_eq!(src.build_status(Pocket::Updates), before);
    assert_eq!(f.mock.calls("build_records"), fetches);
}

/// Archive that, while the first build lookup is in flight, publishes a newer
/// upload and lets a second refresh of the same source record it.
struct OvertakingArchive {
    inner: MockArchive,
    source: Arc<SourcePackage>,
    archive: Archive,
    series: Series,
    newer: DateTime<Utc>,
    overtaken: AtomicBool,
}

impl ArchiveClient for OvertakingArchive {
    fn resolve_distribution(&self, name: &str) -> ArchiveResult<Distribution> { self.inner.resolve_distribution(name) }
    fn resolve_series(&self, d: &Distribution, name: &str) -> ArchiveResult<Series> { self.inner.resolve_series(d, name) }
    fn list_current_series_names(&self, d: &Distribution) -> ArchiveResult<Vec<String>> {
        self.inner.list_current_series_names(d)
    }
    fn resolve_archive(&self, d: &Distribution) -> ArchiveResult<Archive> { self.inner.resolve_archive(d) }
    fn list_packagesets(&self, series: &Series) -> ArchiveResult<Vec<String>> { self.inner.list_packagesets(series) }
    fn resolve_packageset(&self, series: &Series, name: &str) -> ArchiveResult<Packageset> {
        self.inner.resolve_packageset(series, name)
    }
    fn list_packageset_sources(&self, ps: &Packageset) -> ArchiveResult<Vec<String>> { self.inner.list_packageset_sources(ps) }
    fn list_queue(&self, series: &Series, status: QueueStatus, pocket: Pocket) -> ArchiveResult<Vec<QueueEntry>> {
        self.inner.list_queue(series, status, pocket)
    }
    fn latest_published_source(
        &self,
        archive: &Archive,
        series: &Series,
        pocket: Pocket,
        source_name: &str,
        created_since: Option<DateTime<Utc>>,
    ) -> ArchiveResult<Option<PublishedSource>> {
        self.inner.latest_published_source(archive, series, pocket, source_name, created_since)
    }
    fn build_records(&self, publication: &PublishedSource) -> ArchiveResult<Vec<BuildRecord>> {
        if !self.overtaken.swap(true, Ordering::SeqCst) {
            let link = self.inner.publish("noble", publication.pocket, &publication.source_name, "2.0-1", self.newer);
            self.inner.set_builds(&link, &[("riscv64", BuildState::SuccessfullyBuilt)]);
            let out = self.source.refresh_pocket(self, &self.archive, &self.series, publication.pocket).unwrap();
            assert_eq!(out, PocketOutcome::Updated { arches: 1 });
        }
        self.inner.build_records(publication)
    }
    fn binary_publications(&self, publication: &PublishedSource) -> ArchiveResult<Vec<BinaryPublication>> {
        self.inner.binary_publications(publication)
    }
}

#[test]
fn concurrent_newer_record_wins_over_slow_older_fetch() {
    let f = fixture();
    let link = f.mock.publish("noble", Pocket::Proposed, "foo", "1.0-1", f.t0);
    f.mock.set_builds(&link, &[("amd64", BuildState::FailedToBuild)]);
    let source = Arc::new(SourcePackage::new("noble", "foo"));
    let client = OvertakingArchive {
        inner: f.mock,
        source: source.clone(),
        archive: f.archive.clone(),
        series: f.series.clone(),
        newer: f.t0 + Duration::hours(1),
        overtaken: AtomicBool::new(false),
    };

    let out = source.refresh_pocket(&client, &f.archive, &f.series, Pocket::Proposed).unwrap();

    assert_eq!(out, PocketOutcome::Stale);
    assert_eq!(source.last_checked(Pocket::Proposed), Some(f.t0 + Duration::hours(1)));
    let builds = source.build_status(Pocket::Proposed);
    assert_eq!(builds.keys().collect::<Vec<_>>(), vec!["riscv64"]);
    assert_eq!(builds["riscv64"].version, "2.0-1");
}
