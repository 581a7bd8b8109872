//! Read-side derivation of the exported gauges.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use lpx_core::prelude::*;
use metrics::gauge;
use serde::Serialize;
use tracing::debug;

use crate::aggregator::Aggregator;

/// Counter families derived from aggregator state at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// series → packageset → members with at least one recorded build
    pub packages_per_packageset: BTreeMap<String, BTreeMap<String, usize>>,
    /// pocket → arch → failed builds
    pub failed_builds: BTreeMap<Pocket, BTreeMap<String, usize>>,
    /// series → pocket → status → pending uploads; every pocket/status present
    pub queue_depth: BTreeMap<String, BTreeMap<Pocket, BTreeMap<QueueStatus, usize>>>,
}

impl MetricsSnapshot {
    /// Derive a snapshot from current state. May observe a refresh half done.
    pub fn collect(agg: &Aggregator) -> Self {
        let mut snap = MetricsSnapshot::default();

        for state in agg.known_series() {
            let per_series = snap.packages_per_packageset.entry(state.name().to_string()).or_default();
            for (packageset, members) in state.packagesets() {
                let built = members.values().filter(|s| s.has_builds()).count();
                per_series.insert(packageset, built);
                // A source in several packagesets counts once per packageset.
                for source in members.values() {
                    for (pocket, arches) in source.get_failed_builds() {
                        let per_pocket = snap.failed_builds.entry(pocket).or_default();
                        for arch in arches.into_keys() {
                            *per_pocket.entry(arch).or_default() += 1;
                        }
                    }
                }
            }
        }

        let queues = agg.queue_counts();
        let series_names = queues.keys().cloned().chain(snap.packages_per_packageset.keys().cloned()).collect::<Vec<_>>();
        for series in series_names {
            let per_series = snap.queue_depth.entry(series.clone()).or_default();
            for pocket in Pocket::ALL {
                let per_pocket = per_series.entry(pocket).or_default();
                for status in QueueStatus::ALL {
                    let n = queues
                        .get(&series)
                        .and_then(|p| p.get(&pocket))
                        .and_then(|s| s.get(&status))
                        .copied()
                        .unwrap_or(0);
                    per_pocket.insert(status, n);
                }
            }
        }
        snap
    }

    pub fn queue_entries(&self) -> usize {
        self.queue_depth.values().flat_map(|p| p.values()).map(|s| s.len()).sum()
    }

    /// Write every value into the process-wide metrics recorder.
    ///
    /// Label sets present in `previous` but gone from `self` are set to 0 so
    /// the exported gauges never keep a stale value.
    pub fn publish(&self, previous: &MetricsSnapshot) {
        for (series, sets) in &previous.packages_per_packageset {
            for packageset in sets.keys() {
                if !self.packages_per_packageset.get(series).is_some_and(|s| s.contains_key(packageset)) {
                    set_packageset_members(series, packageset, 0);
                }
            }
        }
        for (pocket, arches) in &previous.failed_builds {
            for arch in arches.keys() {
                if !self.failed_builds.get(pocket).is_some_and(|a| a.contains_key(arch)) {
                    set_failed_builds(*pocket, arch, 0);
                }
            }
        }
        for (series, pockets) in &previous.queue_depth {
            if self.queue_depth.contains_key(series) {
                continue;
            }
            for (pocket, statuses) in pockets {
                for status in statuses.keys() {
                    set_queue_depth(series, *pocket, *status, 0);
                }
            }
        }

        for (series, sets) in &self.packages_per_packageset {
            for (packageset, n) in sets {
                set_packageset_members(series, packageset, *n);
            }
        }
        for (pocket, arches) in &self.failed_builds {
            for (arch, n) in arches {
                set_failed_builds(*pocket, arch, *n);
            }
        }
        for (series, pockets) in &self.queue_depth {
            for (pocket, statuses) in pockets {
                for (status, n) in statuses {
                    set_queue_depth(series, *pocket, *status, *n);
                }
            }
        }
    }
}

fn set_packageset_members(series: &str, packageset: &str, n: usize) {
    gauge!("packageset_number_packages", n as f64, "series" => series.to_string(), "packageset" => packageset.to_string());
}

fn set_failed_builds(pocket: Pocket, arch: &str, n: usize) {
    gauge!("packageset_failed_builds", n as f64, "pocket" => pocket.as_str(), "arch" => arch.to_string());
}

fn set_queue_depth(series: &str, pocket: Pocket, status: QueueStatus, n: usize) {
    gauge!(
        "queue_number_packages",
        n as f64,
        "series" => series.to_string(),
        "pocket" => pocket.as_str(),
        "status" => status.as_str()
    );
}

/// Latest published snapshot, readable from any thread.
pub struct MetricsView {
    current: ArcSwap<MetricsSnapshot>,
}

impl Default for MetricsView {
    fn default() -> Self { Self::new() }
}

impl MetricsView {
    pub fn new() -> Self { Self { current: ArcSwap::from_pointee(MetricsSnapshot::default()) } }

    pub fn current(&self) -> Arc<MetricsSnapshot> { self.current.load_full() }

    /// Recompute from `agg`, publish the gauges and swap the snapshot in.
    pub fn refresh(&self, agg: &Aggregator) -> Arc<MetricsSnapshot> {
        let snap = Arc::new(MetricsSnapshot::collect(agg));
        let previous = self.current.swap(snap.clone());
        snap.publish(&previous);
        debug!(
            series = snap.packages_per_packageset.len(),
            queue_entries = snap.queue_entries(),
            "metrics refreshed"
        );
        snap
    }
}
