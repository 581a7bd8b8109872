//! Periodic refresh loops.
//!
//! After one synchronous full fetch two kinds of loop run:
//! - the fast loop refreshes packageset membership and queues, then republishes
//! - one slow loop per series re-checks build statuses
//!
//! A series first seen by the fast loop (for example a new development
//! series) gets its slow loop started from there.
//!
//! Loops look at the cancellation token only while waiting for the next
//! cycle. A cycle already running is never interrupted, so stopping waits
//! for in-flight archive requests to finish.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::Aggregator;
use crate::view::MetricsView;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intervals {
    pub fast: Duration,
    pub slow: Duration,
}

impl Default for Intervals {
    fn default() -> Self { Self { fast: Duration::from_secs(60), slow: Duration::from_secs(5 * 60) } }
}

/// Populate everything once: membership, queues, build statuses of every
/// series in parallel, then publish.
pub fn initial_fetch(agg: &Aggregator, view: &MetricsView) -> Result<()> {
    agg.populate_packageset_maps()?;
    agg.fetch_queues()?;
    let series = agg.series_to_consider()?;
    std::thread::scope(|s| {
        for series in &series {
            s.spawn(move || {
                if let Err(e) = agg.fetch_build_statuses(&series.name) {
                    warn!(series = %series.name, error = ?e, "initial build status fetch failed");
                }
            });
        }
    });
    view.refresh(agg);
    Ok(())
}

fn fast_cycle(agg: &Aggregator, view: &MetricsView, loops: &Loops) {
    info!("refreshing metrics");
    if let Err(e) = agg.populate_packageset_maps() {
        warn!(error = ?e, "packageset refresh failed");
    }
    if let Err(e) = agg.fetch_queues() {
        warn!(error = ?e, "queue refresh failed");
    }
    for state in agg.known_series() {
        loops.ensure_slow_loop(state.name());
    }
    view.refresh(agg);
}

/// Wait `every`, run `cycle` on the blocking pool, repeat until `token` is cancelled.
pub async fn run_periodic<F>(name: String, every: Duration, token: CancellationToken, cycle: F)
where
    F: Fn() + Send + Sync + 'static,
{
    let cycle = Arc::new(cycle);
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(every) => {}
        }
        let c = Arc::clone(&cycle);
        if let Err(e) = tokio::task::spawn_blocking(move || (*c)()).await {
            error!(loop_name = %name, error = %e, "refresh cycle panicked");
        }
    }
    info!(loop_name = %name, "refresh loop stopped");
}

/// Running loop tasks and the series that already have a slow loop.
struct Loops {
    agg: Arc<Aggregator>,
    token: CancellationToken,
    slow_every: Duration,
    runtime: tokio::runtime::Handle,
    series: Mutex<BTreeSet<String>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Loops {
    fn push(&self, handle: JoinHandle<()>) {
        self.handles.lock().unwrap_or_else(|e| e.into_inner()).push(handle);
    }

    fn ensure_slow_loop(&self, name: &str) {
        if self.token.is_cancelled() {
            return;
        }
        if !self.series.lock().unwrap_or_else(|e| e.into_inner()).insert(name.to_string()) {
            return;
        }
        let agg = self.agg.clone();
        let series = name.to_string();
        let slow = move || {
            if let Err(e) = agg.fetch_build_statuses(&series) {
                warn!(series = %series, error = ?e, "build status refresh failed");
            }
        };
        debug!(series = %name, "starting build status loop");
        let task = run_periodic(format!("builds/{name}"), self.slow_every, self.token.clone(), slow);
        self.push(self.runtime.spawn(task));
    }

    fn take_handles(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.handles.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

/// Owns the running loops and their shared stop token.
pub struct Scheduler {
    loops: Arc<Loops>,
}

impl Scheduler {
    /// Run [`initial_fetch`], then spawn the fast loop and one slow loop per series.
    pub async fn start(agg: Arc<Aggregator>, view: Arc<MetricsView>, intervals: Intervals) -> Result<Self> {
        let series = {
            let (agg, view) = (agg.clone(), view.clone());
            tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
                initial_fetch(&agg, &view)?;
                Ok(agg.series_to_consider()?.into_iter().map(|s| s.name).collect())
            })
            .await
            .context("initial fetch panicked")??
        };
        Ok(Self::spawn_loops(agg, view, series, intervals))
    }

    /// Spawn loops without the initial fetch. Must be called within a tokio runtime.
    pub fn spawn_loops(agg: Arc<Aggregator>, view: Arc<MetricsView>, series: Vec<String>, intervals: Intervals) -> Self {
        let loops = Arc::new(Loops {
            agg: agg.clone(),
            token: CancellationToken::new(),
            slow_every: intervals.slow,
            runtime: tokio::runtime::Handle::current(),
            series: Mutex::new(BTreeSet::new()),
            handles: Mutex::new(Vec::new()),
        });

        let fast = {
            let loops = loops.clone();
            move || fast_cycle(&agg, &view, &loops)
        };
        loops.push(tokio::spawn(run_periodic("fast".into(), intervals.fast, loops.token.clone(), fast)));
        for name in &series {
            loops.ensure_slow_loop(name);
        }
        info!(series = series.len(), "refresh loops started");
        Self { loops }
    }

    pub fn token(&self) -> CancellationToken { self.loops.token.clone() }

    /// Series that currently have a build status loop.
    pub fn slow_loops(&self) -> Vec<String> {
        self.loops.series.lock().unwrap_or_else(|e| e.into_inner()).iter().cloned().collect()
    }

    pub fn stop(&self) {
        info!("stopping refresh loops");
        self.loops.token.cancel();
    }

    /// Wait for every loop to exit, including ones started while waiting.
    /// Call [`Scheduler::stop`] first.
    pub async fn join(self) {
        loop {
            let handles = self.loops.take_handles();
            if handles.is_empty() {
                break;
            }
            for h in handles {
                if let Err(e) = h.await {
                    warn!(error = %e, "refresh loop task failed");
                }
            }
        }
    }
}
