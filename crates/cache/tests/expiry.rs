#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use lpx_archive::{ArchiveClient, MockArchive};
use lpx_cache::{CacheConfig, ManualClock, ResourceCache};
use lpx_core::prelude::*;

fn fixture() -> (Arc<MockArchive>, Arc<ManualClock>, ResourceCache) {
    let mock = Arc::new(MockArchive::new());
    mock.add_series("noble", SeriesStatus::Supported);
    mock.set_packageset("noble", "core", &["bash", "coreutils"]);
    let clock = Arc::new(ManualClock::new());
    let cache = ResourceCache::with_clock(&CacheConfig::default(), clock.clone());
    (mock, clock, cache)
}

#[test]
fn packageset_sources_live_for_an_hour() {
    let (mock, clock, cache) = fixture();
    let client: &dyn ArchiveClient = mock.as_ref();
    let d = cache.distribution(client, "ubuntu").unwrap();
    let series = cache.series(client, &d, "noble").unwrap();
    let ps = cache.packageset(client, &series, "core").unwrap();

    let first = cache.packageset_sources(client, &ps).unwrap();
    assert_eq!(first, vec!["bash".to_string(), "coreutils".to_string()]);
    assert_eq!(mock.calls("list_packageset_sources"), 1);

    // Membership changes upstream; the cached copy is still served at t0+30min
    mock.set_packageset("noble", "core", &["bash", "coreutils", "dash"]);
    clock.advance(Duration::from_secs(30 * 60));
    assert_eq!(cache.packageset_sources(client, &ps).unwrap(), first);
    assert_eq!(mock.calls("list_packageset_sources"), 1);

    // ...and recomputed at t0+61min
    clock.advance(Duration::from_secs(31 * 60));
    let fresh = cache.packageset_sources(client, &ps).unwrap();
    assert_eq!(fresh.len(), 3);
    assert_eq!(mock.calls("list_packageset_sources"), 2);
}

#[test]
fn queues_expire_after_a_minute_but_series_do_not() {
    let (mock, clock, cache) = fixture();
    let client: &dyn ArchiveClient = mock.as_ref();
    let d = cache.distribution(client, "ubuntu").unwrap();
    let series = cache.series(client, &d, "noble").unwrap();

    mock.set_queue("noble", QueueStatus::New, Pocket::Proposed, 2);
    assert_eq!(cache.queue(client, &series, QueueStatus::New, Pocket::Proposed).unwrap().len(), 2);
    mock.set_queue("noble", QueueStatus::New, Pocket::Proposed, 5);
    assert_eq!(cache.queue(client, &series, QueueStatus::New, Pocket::Proposed).unwrap().len(), 2);

    clock.advance(Duration::from_secs(61));
    assert_eq!(cache.queue(client, &series, QueueStatus::New, Pocket::Proposed).unwrap().len(), 5);
    assert_eq!(mock.calls("list_queue"), 2);

    clock.advance(Duration::from_secs(24 * 3600));
    cache.series(client, &d, "noble").unwrap();
    assert_eq!(mock.calls("resolve_series"), 1);
}

#[test]
fn unknown_series_is_not_cached() {
    let (mock, _clock, cache) = fixture();
    let client: &dyn ArchiveClient = mock.as_ref();
    let d = cache.distribution(client, "ubuntu").unwrap();
    assert!(cache.series(client, &d, "hoary").unwrap_err().is_not_found());
    mock.add_series("hoary", SeriesStatus::Obsolete);
    assert_eq!(cache.series(client, &d, "hoary").unwrap().name, "hoary");
    assert_eq!(mock.calls("resolve_series"), 2);
}
