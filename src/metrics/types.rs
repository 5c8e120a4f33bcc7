//! Core metric types for the ingestion pipeline
//!
//! Readings arrive from the remote source as a JSON array of
//! `{"type": ..., "payload": {"value": ...}}` objects. They are decoded here,
//! once, into [`Reading`]s whose payload is a [`Value`] sum type, so handlers
//! match on variants instead of casting untyped values.

use crate::metrics::error::FetchError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Kind of metric reported by the remote source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MetricKind {
    /// System load average, a single number
    #[serde(rename = "load_avg")]
    LoadAverage,

    /// Per-core CPU usage, an array of numbers
    #[serde(rename = "cpu_usage")]
    CpuUsage,

    /// Time of the last kernel upgrade, an RFC 3339 string
    #[serde(rename = "last_kernel_upgrade")]
    LastKernelUpgrade,
}

impl MetricKind {
    /// Every kind the pipeline knows how to aggregate
    pub const ALL: [MetricKind; 3] = [
        MetricKind::LoadAverage,
        MetricKind::CpuUsage,
        MetricKind::LastKernelUpgrade,
    ];

    /// Wire name used in the `type` field
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::LoadAverage => "load_avg",
            MetricKind::CpuUsage => "cpu_usage",
            MetricKind::LastKernelUpgrade => "last_kernel_upgrade",
        }
    }

    /// Parse a wire name back to a kind
    pub fn from_wire(name: &str) -> Option<MetricKind> {
        match name {
            "load_avg" => Some(MetricKind::LoadAverage),
            "cpu_usage" => Some(MetricKind::CpuUsage),
            "last_kernel_upgrade" => Some(MetricKind::LastKernelUpgrade),
            _ => None,
        }
    }

    /// Payload shape readings of this kind must carry
    pub fn expected_shape(&self) -> ValueShape {
        match self {
            MetricKind::LoadAverage => ValueShape::Number,
            MetricKind::CpuUsage => ValueShape::Series,
            MetricKind::LastKernelUpgrade => ValueShape::Text,
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string names no known metric kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMetricKind(pub String);

impl fmt::Display for UnknownMetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown metric kind: {:?}", self.0)
    }
}

impl std::error::Error for UnknownMetricKind {}

impl FromStr for MetricKind {
    type Err = UnknownMetricKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricKind::from_wire(s.trim()).ok_or_else(|| UnknownMetricKind(s.to_string()))
    }
}

/// Structural shape of a payload value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueShape {
    Number,
    Series,
    Text,
    Other,
}

impl fmt::Display for ValueShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueShape::Number => "number",
            ValueShape::Series => "array of numbers",
            ValueShape::Text => "string",
            ValueShape::Other => "other json value",
        };
        f.write_str(name)
    }
}

/// Payload carried by a reading
///
/// `Other` keeps payloads that fit none of the expected shapes so the owning
/// handler can report the mismatch instead of the whole batch failing.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Series(Vec<f64>),
    Text(String),
    Other(serde_json::Value),
}

impl Value {
    pub fn shape(&self) -> ValueShape {
        match self {
            Value::Number(_) => ValueShape::Number,
            Value::Series(_) => ValueShape::Series,
            Value::Text(_) => ValueShape::Text,
            Value::Other(_) => ValueShape::Other,
        }
    }

    /// Encode back to the JSON representation used on the wire
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Number(x) => serde_json::json!(x),
            Value::Series(xs) => serde_json::json!(xs),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Other(v) => v.clone(),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(x) => Value::Number(x),
                None => Value::Other(serde_json::Value::Number(n)),
            },
            serde_json::Value::String(s) => Value::Text(s),
            serde_json::Value::Array(items) => {
                let numbers: Option<Vec<f64>> = items.iter().map(|v| v.as_f64()).collect();
                match numbers {
                    Some(xs) => Value::Series(xs),
                    None => Value::Other(serde_json::Value::Array(items)),
                }
            }
            other => Value::Other(other),
        }
    }
}

/// One typed metric observation
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub kind: MetricKind,
    pub value: Value,
}

impl Reading {
    pub fn new(kind: MetricKind, value: Value) -> Self {
        Reading { kind, value }
    }

    pub fn load_average(load: f64) -> Self {
        Reading::new(MetricKind::LoadAverage, Value::Number(load))
    }

    pub fn cpu_usage(usages: Vec<f64>) -> Self {
        Reading::new(MetricKind::CpuUsage, Value::Series(usages))
    }

    pub fn kernel_upgrade(timestamp: impl Into<String>) -> Self {
        Reading::new(MetricKind::LastKernelUpgrade, Value::Text(timestamp.into()))
    }

    /// Wire representation of this reading
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "type": self.kind.as_str(),
            "payload": { "value": self.value.to_json() },
        })
    }
}

/// Ordered readings produced by a single fetch
pub type Batch = Vec<Reading>;

/// Outcome of a single fetch
pub type FetchResult = Result<Batch, FetchError>;

#[derive(Deserialize)]
struct WireReading {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    payload: WirePayload,
}

#[derive(Deserialize, Default)]
struct WirePayload {
    #[serde(default)]
    value: serde_json::Value,
}

/// Decode a response body into a batch
///
/// A body that is not a JSON array fails the whole batch. Individual
/// elements that are `null`, lack a `type`, or name an unrecognized kind are
/// dropped with a warning.
pub fn decode_batch(body: &[u8]) -> Result<Batch, FetchError> {
    let wire: Vec<Option<WireReading>> =
        serde_json::from_slice(body).map_err(|e| FetchError::Decode(e.to_string()))?;

    let mut batch = Vec::with_capacity(wire.len());
    for (index, entry) in wire.into_iter().enumerate() {
        let Some(entry) = entry else {
            warn!(index, "Dropping null reading");
            continue;
        };
        let Some(name) = entry.kind else {
            warn!(index, "Dropping reading without a type");
            continue;
        };
        match MetricKind::from_wire(&name) {
            Some(kind) => batch.push(Reading::new(kind, Value::from(entry.payload.value))),
            None => warn!(kind = %name, "Dropping reading of unknown metric kind"),
        }
    }
    Ok(batch)
}

/// Encode readings as a response body
pub fn encode_batch(readings: &[Reading]) -> serde_json::Result<Vec<u8>> {
    let wire: Vec<serde_json::Value> = readings.iter().map(Reading::to_json).collect();
    serde_json::to_vec(&wire)
}
