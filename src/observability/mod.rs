//! Structured logging setup
//!
//! Every task in the pipeline logs through `tracing`; this module installs
//! the global subscriber for binaries.

mod config;

pub use config::LogConfig;

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global `tracing` subscriber.
///
/// Fails if the filter directives do not parse or a subscriber is already set.
pub fn init_tracing(config: &LogConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_new(&config.filter)?;

    if config.json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_target(config.with_target)
            .try_init()
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(config.with_target)
            .try_init()
    }
}
