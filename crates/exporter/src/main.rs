use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use lpx_aggregate::{Aggregator, ExporterConfig, MetricsView, Scheduler, WorkerPool};
use lpx_archive::{ArchiveClient, LaunchpadClient, LaunchpadConfig};
use lpx_cache::ResourceCache;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const LOG_FILE_PREFIX: &str = "launchpad-exporter.log";
const LOG_FILES_KEPT: usize = 5;

#[derive(Parser, Debug)]
#[command(name = "launchpad-exporter", version, about = "Export Launchpad packageset build and queue status to Prometheus")]
struct Cli {
    /// Series to export (repeat or comma-separate); default: every current series
    #[arg(long = "series", env = "LPX_SERIES", value_delimiter = ',')]
    series: Vec<String>,

    /// Packagesets to export; default: all packagesets of each series
    #[arg(long = "packageset", env = "LPX_PACKAGESETS", value_delimiter = ',')]
    packagesets: Vec<String>,

    #[arg(long, default_value = "ubuntu")]
    distribution: String,

    /// Address the Prometheus endpoint listens on
    #[arg(long = "metrics-addr", env = "LPX_METRICS_ADDR", default_value = "0.0.0.0:8000")]
    metrics_addr: SocketAddr,

    #[arg(long = "api-root", default_value = "https://api.launchpad.net/devel/")]
    api_root: String,

    /// Concurrent archive requests
    #[arg(long, default_value_t = 10)]
    workers: usize,

    #[arg(long = "fast-interval-secs", default_value_t = 60)]
    fast_interval_secs: u64,

    #[arg(long = "slow-interval-secs", default_value_t = 300)]
    slow_interval_secs: u64,

    #[arg(long = "http-timeout-secs", default_value_t = 60)]
    http_timeout_secs: u64,

    /// Log at debug level, overriding LPX_LOG
    #[arg(long, action = ArgAction::SetTrue)]
    debug: bool,

    /// Also write logs to a daily rotated file in this directory
    #[arg(long = "log-directory", env = "LPX_LOG_DIRECTORY")]
    log_directory: Option<PathBuf>,
}

impl Cli {
    fn exporter_config(&self) -> ExporterConfig {
        ExporterConfig {
            distribution: self.distribution.clone(),
            series: self.series.clone(),
            packagesets: self.packagesets.clone(),
            workers: self.workers.max(1),
            fast_interval_secs: self.fast_interval_secs,
            slow_interval_secs: self.slow_interval_secs,
            ..ExporterConfig::default()
        }
    }

    fn launchpad_config(&self) -> LaunchpadConfig {
        LaunchpadConfig { api_root: self.api_root.clone(), timeout_secs: self.http_timeout_secs, ..LaunchpadConfig::default() }
    }
}

fn log_filter(debug: bool, env: Option<&str>) -> tracing_subscriber::EnvFilter {
    if debug {
        return tracing_subscriber::EnvFilter::new("debug");
    }
    env.and_then(|e| tracing_subscriber::EnvFilter::from_str(e).ok())
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new("info"))
}

fn log_file_appender(dir: &Path) -> Result<RollingFileAppender> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating log directory {}", dir.display()))?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .max_log_files(LOG_FILES_KEPT)
        .build(dir)
        .with_context(|| format!("opening log file in {}", dir.display()))
}

/// Stderr logging plus an optional rotated log file. Keep the guard alive
/// until exit so buffered file output is flushed.
fn init_tracing(debug: bool, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let env = std::env::var("LPX_LOG").ok();
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let (writer, guard) = tracing_appender::non_blocking(log_file_appender(dir)?);
            let layer = tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false).with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(log_filter(debug, env.as_deref()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(true))
        .with(file_layer)
        .init();
    Ok(guard)
}

fn init_metrics(addr: SocketAddr) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("installing Prometheus exporter on {addr}"))?;
    info!(addr = %addr, "Prometheus metrics exporter listening");
    Ok(())
}

/// Resolves once on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM; waiting for Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.debug, cli.log_directory.as_deref())?;
    init_metrics(cli.metrics_addr)?;

    let cfg = cli.exporter_config();
    let lp = cli.launchpad_config();
    info!(
        distribution = %cfg.distribution,
        series = ?cfg.series,
        packagesets = ?cfg.packagesets,
        workers = cfg.workers,
        "starting launchpad exporter"
    );

    // Blocking HTTP clients must be built (and dropped) off the async workers.
    let agg = tokio::task::spawn_blocking(move || -> Result<Aggregator> {
        let factory = move || -> lpx_core::ArchiveResult<Arc<dyn ArchiveClient>> { Ok(Arc::new(LaunchpadClient::new(&lp)?)) };
        let pool = WorkerPool::new(&factory, cfg.workers)?;
        let cache = Arc::new(ResourceCache::new(&cfg.cache));
        Ok(Aggregator::new(cfg, cache, pool))
    })
    .await
    .context("building aggregator panicked")??;
    let agg = Arc::new(agg);
    let view = Arc::new(MetricsView::new());
    let intervals = agg.config().intervals();

    let outcome = tokio::select! {
        res = Scheduler::start(agg.clone(), view.clone(), intervals) => Some(res),
        _ = shutdown_signal() => None,
    };
    let result = match outcome {
        Some(Ok(scheduler)) => {
            info!("initial fetch complete; serving metrics");
            shutdown_signal().await;
            scheduler.stop();
            scheduler.join().await;
            Ok(())
        }
        Some(Err(e)) => Err(e.context("initial fetch failed")),
        None => {
            info!("shutdown requested during initial fetch");
            Ok(())
        }
    };

    tokio::task::spawn_blocking(move || drop(agg)).await.context("releasing archive clients")?;
    info!("bye");
    result
}
