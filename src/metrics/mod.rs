//! Metrics Aggregation Pipeline
//!
//! Pulls batches of typed readings from a remote source and keeps one running
//! aggregate per metric kind:
//!
//! - **load_avg**: minimum and maximum load average
//! - **cpu_usage**: per-channel running mean
//! - **last_kernel_upgrade**: most recent upgrade timestamp
//!
//! ```text
//! Fetcher → Generator → Dispatcher ─┬→ LoadStats handler
//!                                   ├→ CpuUsageStats handler
//!                                   └→ KernelUpgradeStats handler
//! ```
//!
//! Every stage is a tokio task connected by bounded channels and stopped by a
//! shared `CancellationToken`. Aggregates are owned by their handler task and
//! read through snapshot requests.

mod config;
pub mod dispatcher;
pub mod dst;
mod error;
pub mod fetcher;
pub mod generator;
pub mod handler;
pub mod pipeline;
pub mod simulated_fetcher;
mod stats;
mod types;

pub use config::{ConfigError, DispatcherConfig, GeneratorConfig, PipelineConfig, SourceConfig};
pub use dispatcher::{spawn_dispatcher, DispatchStats};
pub use dst::{
    run_dst_batch, summarize_batch, PipelineDSTConfig, PipelineDSTHarness, PipelineDSTResult,
};
pub use error::{FetchError, HandlerError, StatError};
pub use fetcher::{Fetcher, HttpFetcher, ScriptedFetcher};
pub use generator::spawn_generator;
pub use handler::{spawn_stat_handler, StatReader};
pub use pipeline::{Pipeline, PipelineReport, PipelineSnapshot};
pub use simulated_fetcher::{SimulatedFetcher, SimulatedFetcherConfig, SimulatedFetcherStats};
pub use stats::{Aggregate, CpuUsageStats, KernelUpgradeStats, LoadStats};
pub use types::{
    decode_batch, encode_batch, Batch, FetchResult, MetricKind, Reading, UnknownMetricKind, Value,
    ValueShape,
};
