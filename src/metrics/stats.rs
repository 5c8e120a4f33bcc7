//! Running aggregates, one per metric kind
//!
//! Each aggregate is owned by exactly one handler task. Readers only ever see
//! clones, so every type here is a plain value with no interior sharing.

use crate::metrics::error::StatError;
use crate::metrics::types::{MetricKind, Value};
use chrono::{DateTime, FixedOffset};
use serde::Serialize;

/// A running statistic that can be driven by a handler task
pub trait Aggregate: Clone + Default + Send + std::fmt::Debug + 'static {
    /// Kind of reading this aggregate consumes
    const KIND: MetricKind;

    /// Validate the payload shape and fold it in.
    /// On error the aggregate is unchanged.
    fn apply(&mut self, value: Value) -> Result<(), StatError>;

    /// Number of readings folded in so far
    fn count(&self) -> u64;
}

fn shape_mismatch(kind: MetricKind, value: &Value) -> StatError {
    StatError::ShapeMismatch {
        kind,
        expected: kind.expected_shape(),
        found: value.shape(),
    }
}

// ============================================================================
// LoadStats
// ============================================================================

/// Minimum and maximum load average seen
///
/// `min` and `max` are meaningful only once `count() >= 1`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadStats {
    count: u64,
    pub min: f64,
    pub max: f64,
}

impl LoadStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, load: f64) {
        self.count += 1;
        if self.count == 1 {
            self.min = load;
            self.max = load;
            return;
        }
        if load < self.min {
            self.min = load;
        }
        if load > self.max {
            self.max = load;
        }
    }
}

impl Aggregate for LoadStats {
    const KIND: MetricKind = MetricKind::LoadAverage;

    fn apply(&mut self, value: Value) -> Result<(), StatError> {
        match value {
            Value::Number(load) => {
                self.update(load);
                Ok(())
            }
            other => Err(shape_mismatch(Self::KIND, &other)),
        }
    }

    fn count(&self) -> u64 {
        self.count
    }
}

// ============================================================================
// CpuUsageStats
// ============================================================================

/// Running average CPU usage per core
///
/// The number of channels is fixed by the first reading.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CpuUsageStats {
    count: u64,
    totals: Vec<f64>,
    pub averages: Vec<f64>,
}

impl CpuUsageStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of channels established by the first reading (0 before it)
    pub fn channel_count(&self) -> usize {
        self.totals.len()
    }

    pub fn totals(&self) -> &[f64] {
        &self.totals
    }

    pub fn update(&mut self, usages: &[f64]) -> Result<(), StatError> {
        if self.count > 0 && usages.len() != self.totals.len() {
            return Err(StatError::ChannelCountMismatch {
                expected: self.totals.len(),
                actual: usages.len(),
            });
        }

        self.count += 1;
        if self.count == 1 {
            self.totals = vec![0.0; usages.len()];
            self.averages = vec![0.0; usages.len()];
        }
        let n = self.count as f64;
        for (i, usage) in usages.iter().enumerate() {
            self.totals[i] += usage;
            self.averages[i] = self.totals[i] / n;
        }
        Ok(())
    }
}

impl Aggregate for CpuUsageStats {
    const KIND: MetricKind = MetricKind::CpuUsage;

    fn apply(&mut self, value: Value) -> Result<(), StatError> {
        match value {
            Value::Series(usages) => self.update(&usages),
            other => Err(shape_mismatch(Self::KIND, &other)),
        }
    }

    fn count(&self) -> u64 {
        self.count
    }
}

// ============================================================================
// KernelUpgradeStats
// ============================================================================

/// Most recent kernel upgrade time seen
///
/// "Most recent" is by timestamp, not arrival order. Every successfully parsed
/// reading is counted, including ones older than the current maximum.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KernelUpgradeStats {
    count: u64,
    /// `None` until the first valid reading (the zero timestamp)
    pub most_recent: Option<DateTime<FixedOffset>>,
}

impl KernelUpgradeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, timestamp: &str) -> Result<(), StatError> {
        let parsed =
            DateTime::parse_from_rfc3339(timestamp).map_err(|e| StatError::Parse {
                input: timestamp.to_string(),
                reason: e.to_string(),
            })?;

        self.count += 1;
        let is_newer = match self.most_recent {
            Some(current) => parsed > current,
            None => true,
        };
        if is_newer {
            self.most_recent = Some(parsed);
        }
        Ok(())
    }
}

impl Aggregate for KernelUpgradeStats {
    const KIND: MetricKind = MetricKind::LastKernelUpgrade;

    fn apply(&mut self, value: Value) -> Result<(), StatError> {
        match value {
            Value::Text(timestamp) => self.update(&timestamp),
            other => Err(shape_mismatch(Self::KIND, &other)),
        }
    }

    fn count(&self) -> u64 {
        self.count
    }
}
