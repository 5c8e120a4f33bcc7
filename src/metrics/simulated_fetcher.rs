//! Simulated Fetcher with Fault Injection
//!
//! DST-compatible fetcher that generates random batches from a seed and
//! injects faults at both the fetch level (transport, status, decode) and the
//! reading level (wrong shapes, bad timestamps, channel-count changes,
//! unknown kinds). Bodies go through the real [`decode_batch`] path.
//!
//! Every batch that decodes successfully is recorded, so a test can fold the
//! exact readings the pipeline saw into a shadow model.

use crate::metrics::error::FetchError;
use crate::metrics::fetcher::Fetcher;
use crate::metrics::types::{decode_batch, Batch, FetchResult, MetricKind, Reading, Value};
use chrono::{DateTime, FixedOffset, SecondsFormat};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Seeded RNG used by the simulated fetcher
pub struct SimulatedRng {
    inner: rand_chacha::ChaCha8Rng,
}

impl SimulatedRng {
    pub fn new(seed: u64) -> Self {
        use rand::SeedableRng;
        SimulatedRng {
            inner: rand_chacha::ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn gen_bool(&mut self, probability: f64) -> bool {
        use rand::Rng;
        self.inner.gen_bool(probability.clamp(0.0, 1.0))
    }

    pub fn gen_range(&mut self, min: u64, max: u64) -> u64 {
        use rand::Rng;
        if min >= max {
            return min;
        }
        self.inner.gen_range(min..max)
    }

    pub fn gen_f64(&mut self) -> f64 {
        use rand::Rng;
        self.inner.gen::<f64>()
    }
}

/// Configuration for simulated fault injection
#[derive(Debug, Clone)]
pub struct SimulatedFetcherConfig {
    /// Probability of a network failure
    pub transport_fail_prob: f64,
    /// Probability of a 5xx response
    pub status_fail_prob: f64,
    /// Probability of a truncated (undecodable) body
    pub decode_fail_prob: f64,
    /// Probability a reading carries the wrong payload shape
    pub bad_shape_prob: f64,
    /// Probability a kernel reading carries an unparseable timestamp
    pub bad_timestamp_prob: f64,
    /// Probability a CPU reading reports one extra channel
    pub channel_change_prob: f64,
    /// Probability of an extra reading of an unknown kind
    pub unknown_kind_prob: f64,
    /// Readings per batch (min, max inclusive)
    pub batch_size: (u64, u64),
    /// Channels in a well-formed CPU reading
    pub cpu_channels: usize,
    /// Simulated latency range in microseconds (min, max)
    pub latency_range_us: (u64, u64),
}

impl Default for SimulatedFetcherConfig {
    fn default() -> Self {
        SimulatedFetcherConfig {
            transport_fail_prob: 0.05,
            status_fail_prob: 0.05,
            decode_fail_prob: 0.02,
            bad_shape_prob: 0.02,
            bad_timestamp_prob: 0.02,
            channel_change_prob: 0.01,
            unknown_kind_prob: 0.05,
            batch_size: (1, 8),
            cpu_channels: 4,
            latency_range_us: (0, 200),
        }
    }
}

impl SimulatedFetcherConfig {
    /// No faults - for baseline testing
    pub fn no_faults() -> Self {
        SimulatedFetcherConfig {
            transport_fail_prob: 0.0,
            status_fail_prob: 0.0,
            decode_fail_prob: 0.0,
            bad_shape_prob: 0.0,
            bad_timestamp_prob: 0.0,
            channel_change_prob: 0.0,
            unknown_kind_prob: 0.0,
            latency_range_us: (0, 0),
            ..Default::default()
        }
    }

    /// High chaos configuration for stress testing
    pub fn high_chaos() -> Self {
        SimulatedFetcherConfig {
            transport_fail_prob: 0.15,
            status_fail_prob: 0.15,
            decode_fail_prob: 0.1,
            bad_shape_prob: 0.1,
            bad_timestamp_prob: 0.1,
            channel_change_prob: 0.05,
            unknown_kind_prob: 0.2,
            batch_size: (0, 16),
            cpu_channels: 8,
            latency_range_us: (0, 1_000),
        }
    }
}

/// Statistics for fault injection
#[derive(Debug, Clone, Default)]
pub struct SimulatedFetcherStats {
    pub fetches: u64,
    pub transport_failures: u64,
    pub status_failures: u64,
    pub decode_failures: u64,
    pub readings: u64,
    pub bad_shapes: u64,
    pub bad_timestamps: u64,
    pub channel_changes: u64,
    pub unknown_kinds: u64,
}

struct SimulatedFetcherInner {
    rng: SimulatedRng,
    stats: SimulatedFetcherStats,
    delivered: Vec<Batch>,
}

/// Fetcher producing seeded random batches with injected faults
pub struct SimulatedFetcher {
    config: SimulatedFetcherConfig,
    state: Mutex<SimulatedFetcherInner>,
}

/// Readings are timestamped within this window after 2020-01-01T00:00:00Z
const TIMESTAMP_BASE_SECS: i64 = 1_577_836_800;
const TIMESTAMP_WINDOW_SECS: u64 = 365 * 24 * 3600;

impl SimulatedFetcher {
    pub fn new(seed: u64, config: SimulatedFetcherConfig) -> Self {
        SimulatedFetcher {
            config,
            state: Mutex::new(SimulatedFetcherInner {
                rng: SimulatedRng::new(seed),
                stats: SimulatedFetcherStats::default(),
                delivered: Vec::new(),
            }),
        }
    }

    /// Get current statistics
    pub fn stats(&self) -> SimulatedFetcherStats {
        self.state.lock().stats.clone()
    }

    /// Every batch returned successfully so far, in fetch order
    pub fn delivered_batches(&self) -> Vec<Batch> {
        self.state.lock().delivered.clone()
    }

    fn latency(&self) -> Duration {
        let (min, max) = self.config.latency_range_us;
        if max == 0 {
            return Duration::ZERO;
        }
        let us = self.state.lock().rng.gen_range(min, max + 1);
        Duration::from_micros(us)
    }

    /// Roll the dice for one fetch, then decode the generated body
    fn next_result(&self) -> FetchResult {
        let mut s = self.state.lock();
        let inner = &mut *s;
        let config = &self.config;
        inner.stats.fetches += 1;

        if inner.rng.gen_bool(config.transport_fail_prob) {
            inner.stats.transport_failures += 1;
            return Err(FetchError::Transport("simulated connection reset".to_string()));
        }
        if inner.rng.gen_bool(config.status_fail_prob) {
            inner.stats.status_failures += 1;
            return Err(FetchError::RemoteStatus {
                status: 503,
                reason: "Service Unavailable".to_string(),
            });
        }

        let size = inner.rng.gen_range(config.batch_size.0, config.batch_size.1 + 1);
        let mut wire = Vec::with_capacity(size as usize);
        for _ in 0..size {
            let reading = generate_reading(&mut inner.rng, &mut inner.stats, config);
            wire.push(reading.to_json());
            if inner.rng.gen_bool(config.unknown_kind_prob) {
                inner.stats.unknown_kinds += 1;
                wire.push(serde_json::json!({
                    "type": "disk_io",
                    "payload": { "value": inner.rng.gen_range(0, 1000) },
                }));
            }
        }

        let mut body = match serde_json::to_vec(&wire) {
            Ok(body) => body,
            Err(e) => return Err(FetchError::Decode(e.to_string())),
        };
        if inner.rng.gen_bool(config.decode_fail_prob) {
            inner.stats.decode_failures += 1;
            let keep = inner.rng.gen_range(0, body.len() as u64 - 1) as usize;
            body.truncate(keep);
        }

        let result = decode_batch(&body);
        if let Ok(batch) = &result {
            inner.stats.readings += batch.len() as u64;
            inner.delivered.push(batch.clone());
        }
        result
    }
}

fn generate_reading(
    rng: &mut SimulatedRng,
    stats: &mut SimulatedFetcherStats,
    config: &SimulatedFetcherConfig,
) -> Reading {
    let kind = MetricKind::ALL[rng.gen_range(0, MetricKind::ALL.len() as u64) as usize];

    if rng.gen_bool(config.bad_shape_prob) {
        stats.bad_shapes += 1;
        let value = match kind {
            MetricKind::LoadAverage => Value::Text("n/a".to_string()),
            MetricKind::CpuUsage => Value::Number(rng.gen_f64()),
            MetricKind::LastKernelUpgrade => Value::Other(serde_json::Value::Bool(true)),
        };
        return Reading::new(kind, value);
    }

    match kind {
        MetricKind::LoadAverage => Reading::load_average(rng.gen_f64() * 4.0),
        MetricKind::CpuUsage => {
            let mut channels = config.cpu_channels;
            if rng.gen_bool(config.channel_change_prob) {
                stats.channel_changes += 1;
                channels += 1;
            }
            Reading::cpu_usage((0..channels).map(|_| rng.gen_f64()).collect())
        }
        MetricKind::LastKernelUpgrade => {
            if rng.gen_bool(config.bad_timestamp_prob) {
                stats.bad_timestamps += 1;
                return Reading::kernel_upgrade("NO. BAD TIMESTAMP. BAD.");
            }
            Reading::kernel_upgrade(generate_timestamp(rng))
        }
    }
}

/// Random RFC 3339 timestamp with a random whole-hour offset
fn generate_timestamp(rng: &mut SimulatedRng) -> String {
    let secs = TIMESTAMP_BASE_SECS + rng.gen_range(0, TIMESTAMP_WINDOW_SECS) as i64;
    let nanos = rng.gen_range(0, 1_000_000_000) as u32;
    let offset_hours = rng.gen_range(0, 25) as i32 - 12;

    let utc = DateTime::from_timestamp(secs, nanos).unwrap_or_default();
    match FixedOffset::east_opt(offset_hours * 3600) {
        Some(offset) => utc
            .with_timezone(&offset)
            .to_rfc3339_opts(SecondsFormat::AutoSi, true),
        None => utc.to_rfc3339_opts(SecondsFormat::AutoSi, true),
    }
}

impl Fetcher for SimulatedFetcher {
    fn fetch(&self) -> Pin<Box<dyn Future<Output = FetchResult> + Send + '_>> {
        Box::pin(async move {
            let latency = self.latency();
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            self.next_result()
        })
    }
}
