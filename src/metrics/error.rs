//! Error types for the ingestion pipeline

use crate::metrics::types::{MetricKind, ValueShape};

/// Error produced by a single fetch
#[derive(Debug, Clone, PartialEq)]
pub enum FetchError {
    /// Network failure, or the response body could not be read
    Transport(String),
    /// The source answered with a 4xx or 5xx status
    RemoteStatus { status: u16, reason: String },
    /// The body is not a JSON array of readings
    Decode(String),
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Transport(msg) => write!(f, "transport error: {}", msg),
            FetchError::RemoteStatus { status, reason } => {
                write!(f, "unsuccessful request: {} {}", status, reason)
            }
            FetchError::Decode(msg) => write!(f, "failed to decode metrics batch: {}", msg),
        }
    }
}

impl std::error::Error for FetchError {}

/// Error produced when a reading cannot be folded into an aggregate.
/// The aggregate is left untouched whenever one of these is returned.
#[derive(Debug, Clone, PartialEq)]
pub enum StatError {
    /// Payload shape does not match what the kind expects
    ShapeMismatch {
        kind: MetricKind,
        expected: ValueShape,
        found: ValueShape,
    },
    /// CPU usage reading with a different number of channels than established
    ChannelCountMismatch { expected: usize, actual: usize },
    /// Timestamp is not valid RFC 3339
    Parse { input: String, reason: String },
}

impl std::fmt::Display for StatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatError::ShapeMismatch {
                kind,
                expected,
                found,
            } => write!(
                f,
                "{} reading has wrong shape: expected {}, found {}",
                kind, expected, found
            ),
            StatError::ChannelCountMismatch { expected, actual } => write!(
                f,
                "invalid length of usages array: expected {}, got {}",
                expected, actual
            ),
            StatError::Parse { input, reason } => {
                write!(f, "unable to parse timestamp {:?}: {}", input, reason)
            }
        }
    }
}

impl std::error::Error for StatError {}

/// Error returned to snapshot readers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerError {
    /// The handler task has exited and no longer answers requests
    Stopped(MetricKind),
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerError::Stopped(kind) => write!(f, "{} handler stopped", kind),
        }
    }
}

impl std::error::Error for HandlerError {}
