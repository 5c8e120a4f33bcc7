pub mod metrics;
pub mod observability;

pub use metrics::{MetricKind, Pipeline, PipelineConfig, Reading, Value};
