//! Fixed-size worker pool where every worker owns one archive client.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use lpx_archive::{ArchiveClient, ClientFactory};
use metrics::{counter, histogram};
use rayon::prelude::*;
use tracing::{debug, warn};

/// Outputs of one batch. Failed tasks were logged and are only counted.
#[derive(Debug)]
pub struct BatchReport<R> {
    pub results: Vec<R>,
    pub failed: usize,
}

pub struct WorkerPool {
    threads: rayon::ThreadPool,
    /// Indexed by rayon worker index; created once when the pool is built
    clients: Vec<Arc<dyn ArchiveClient>>,
    /// Used by the calling thread, never by a worker
    coordinator: Arc<dyn ArchiveClient>,
}

impl WorkerPool {
    /// Build `workers` threads, one client per thread and one more for the coordinator.
    pub fn new(factory: &dyn ClientFactory, workers: usize) -> Result<Self> {
        let workers = workers.max(1);
        let coordinator = factory.create().context("creating coordinator archive client")?;
        let clients = (0..workers)
            .map(|i| factory.create().with_context(|| format!("creating archive client for worker {i}")))
            .collect::<Result<Vec<_>>>()?;
        Self::with_clients(coordinator, clients)
    }

    /// One worker per supplied client; `coordinator` serves [`WorkerPool::coordinator_client`].
    pub fn with_clients(coordinator: Arc<dyn ArchiveClient>, clients: Vec<Arc<dyn ArchiveClient>>) -> Result<Self> {
        anyhow::ensure!(!clients.is_empty(), "worker pool needs at least one client");
        let threads = rayon::ThreadPoolBuilder::new()
            .num_threads(clients.len())
            .thread_name(|i| format!("lpx-worker-{i}"))
            .build()
            .context("building worker pool")?;
        debug!(workers = clients.len(), "worker pool ready");
        Ok(Self { threads, clients, coordinator })
    }

    pub fn size(&self) -> usize { self.clients.len() }

    /// Client for work done outside the pool (series and archive resolution).
    pub fn coordinator_client(&self) -> &dyn ArchiveClient { self.coordinator.as_ref() }

    fn worker_client(&self) -> &dyn ArchiveClient {
        let idx = rayon::current_thread_index().unwrap_or(0);
        self.clients[idx % self.clients.len()].as_ref()
    }

    /// Run `job` once per task with at most `size()` tasks in flight.
    ///
    /// A task that errors or panics is logged and counted; its siblings still run.
    pub fn run<T, R, F>(&self, batch: &'static str, tasks: Vec<T>, job: F) -> BatchReport<R>
    where
        T: Send,
        R: Send,
        F: Fn(&dyn ArchiveClient, T) -> Result<R> + Sync,
    {
        let started = Instant::now();
        let total = tasks.len();
        let outcomes: Vec<Option<R>> = self.threads.install(|| {
            tasks
                .into_par_iter()
                .map(|task| {
                    let client = self.worker_client();
                    match catch_unwind(AssertUnwindSafe(|| job(client, task))) {
                        Ok(Ok(r)) => Some(r),
                        Ok(Err(e)) => {
                            warn!(batch, error = ?e, "task failed");
                            counter!("lpx_task_failures_total", 1u64, "batch" => batch);
                            None
                        }
                        Err(_) => {
                            warn!(batch, "task panicked");
                            counter!("lpx_task_failures_total", 1u64, "batch" => batch);
                            None
                        }
                    }
                })
                .collect()
        });
        let results: Vec<R> = outcomes.into_iter().flatten().collect();
        let failed = total - results.len();
        histogram!("lpx_batch_ms", started.elapsed().as_secs_f64() * 1000.0, "batch" => batch);
        debug!(batch, total, failed, "batch finished");
        BatchReport { results, failed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lpx_archive::MockArchive;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn pool(workers: usize) -> WorkerPool {
        let factory = || -> lpx_core::ArchiveResult<Arc<dyn ArchiveClient>> { Ok(Arc::new(MockArchive::new())) };
        WorkerPool::new(&factory, workers).unwrap()
    }

    #[test]
    fn failures_do_not_stop_siblings() {
        let p = pool(3);
        let report = p.run("t", (0..20).collect(), |_, n: i32| {
            if n % 5 == 0 {
                anyhow::bail!("task {n} failed");
            }
            if n == 7 {
                panic!("task 7 exploded");
            }
            Ok(n * 2)
        });
        assert_eq!(report.failed, 5);
        assert_eq!(report.results.len(), 15);
    }

    fn addr(client: &dyn ArchiveClient) -> usize { client as *const dyn ArchiveClient as *const () as usize }

    #[test]
    fn coordinator_has_a_client_of_its_own() {
        let created = AtomicUsize::new(0);
        let factory = || -> lpx_core::ArchiveResult<Arc<dyn ArchiveClient>> {
            created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(MockArchive::new()))
        };
        let p = WorkerPool::new(&factory, 3).unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 4);
        assert_eq!(p.size(), 3);

        let coordinator = addr(p.coordinator_client());
        let seen = Mutex::new(HashSet::new());
        p.run("t", (0..32).collect(), |client, _n: u32| {
            seen.lock().unwrap().insert(addr(client));
            std::thread::sleep(std::time::Duration::from_millis(1));
            Ok(())
        });
        assert!(!seen.lock().unwrap().contains(&coordinator));
    }

    #[test]
    fn each_worker_uses_its_own_client() {
        let p = pool(4);
        let seen = Mutex::new(HashSet::new());
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        p.run("t", (0..64).collect(), |client, _n: u32| {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            seen.lock().unwrap().insert(addr(client));
            std::thread::sleep(std::time::Duration::from_millis(2));
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert!(seen.lock().unwrap().len() <= 4);
    }
}
