//! Metrics Consumer
//!
//! Polls a metrics endpoint and logs running aggregates until Ctrl-C.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | METRICS_CONFIG | - | TOML config file, loaded before overrides |
//! | METRICS_SOURCE_URL | http://localhost:8080/metrics | Endpoint to poll |
//! | METRICS_SOURCE_TIMEOUT_MS | 10000 | Per-request timeout |
//! | METRICS_SUBSCRIPTIONS | all | Comma-separated kinds to aggregate |
//! | METRICS_POLL_INTERVAL_MS | 0 | Pause between fetches |
//! | METRICS_FETCH_LIMIT | - | Stop after this many fetches |
//! | METRICS_INTROSPECTION_INTERVAL_MS | 5000 | How often to log aggregates |
//! | RUST_LOG | info | Log filter |
//! | METRICS_LOG_JSON | false | JSON log output |

use metrics_consumer::metrics::{HttpFetcher, Pipeline, PipelineConfig, PipelineSnapshot};
use metrics_consumer::observability::{init_tracing, LogConfig};
use tracing::{info, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    init_tracing(&LogConfig::from_env())?;

    let config = PipelineConfig::from_env()?;
    let fetcher = HttpFetcher::new(&config.source)?;
    info!(
        url = fetcher.url(),
        timeout_ms = config.source.timeout.as_millis() as u64,
        "Metrics consumer starting"
    );

    let pipeline = Pipeline::start(&config, fetcher);

    let mut ticker = tokio::time::interval(config.introspection_interval);
    ticker.tick().await;

    let report = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "Failed to listen for Ctrl-C, shutting down");
                }
                break pipeline.shutdown().await;
            }
            _ = ticker.tick() => {
                if pipeline.is_stopped() {
                    break pipeline.wait().await;
                }
                log_snapshot(&pipeline.snapshot().await);
            }
        }
    };

    info!(
        published = report.published,
        failed_fetches = report.dispatch.failed_fetches,
        dispatched = report.dispatch.dispatched,
        "Metrics consumer stopped"
    );
    log_snapshot(&PipelineSnapshot {
        load_avg: report.load_avg,
        cpu_usage: report.cpu_usage,
        last_kernel_upgrade: report.last_kernel_upgrade,
    });
    Ok(())
}

fn log_snapshot(snapshot: &PipelineSnapshot) {
    use metrics_consumer::metrics::Aggregate;

    if let Some(load) = &snapshot.load_avg {
        info!(count = load.count(), min = load.min, max = load.max, "load_avg");
    }
    if let Some(cpu) = &snapshot.cpu_usage {
        info!(count = cpu.count(), averages = ?cpu.averages, "cpu_usage");
    }
    if let Some(kernel) = &snapshot.last_kernel_upgrade {
        match kernel.most_recent {
            Some(ts) => info!(count = kernel.count(), most_recent = %ts.to_rfc3339(), "last_kernel_upgrade"),
            None => info!(count = kernel.count(), "last_kernel_upgrade"),
        }
    }
}
