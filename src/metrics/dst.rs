//! Deterministic Simulation Testing for the aggregation pipeline
//!
//! Runs a bounded pipeline against a [`SimulatedFetcher`] and checks the
//! final aggregates against a shadow model folded from exactly the batches
//! the fetcher delivered.
//!
//! Invariants checked:
//! 1. Load count, min and max match the shadow model
//! 2. CPU channel count is fixed by the first valid reading; averages match
//! 3. Most recent kernel upgrade is the maximum valid timestamp
//! 4. Every dispatched value reached its handler (or was rejected by it)
//! 5. Failed fetches equal the fetcher's injected fetch-level faults
//! 6. Counts observed by a concurrent reader never decrease

use crate::metrics::config::{DispatcherConfig, GeneratorConfig, PipelineConfig};
use crate::metrics::dispatcher::DispatchStats;
use crate::metrics::pipeline::{Pipeline, PipelineReport};
use crate::metrics::simulated_fetcher::{
    SimulatedFetcher, SimulatedFetcherConfig, SimulatedFetcherStats,
};
use crate::metrics::stats::Aggregate;
use crate::metrics::types::{Batch, MetricKind, Value};
use chrono::{DateTime, FixedOffset};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for a pipeline DST run
#[derive(Debug, Clone)]
pub struct PipelineDSTConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Number of fetches the generator performs
    pub fetches: u64,
    /// Kinds subscribed (unsubscribed readings are dropped)
    pub subscriptions: Vec<MetricKind>,
    /// Capacity of every internal stream
    pub channel_capacity: usize,
    /// Fault injection for the fetcher
    pub fetcher: SimulatedFetcherConfig,
}

impl Default for PipelineDSTConfig {
    fn default() -> Self {
        PipelineDSTConfig {
            seed: 0,
            fetches: 100,
            subscriptions: MetricKind::ALL.to_vec(),
            channel_capacity: 1,
            fetcher: SimulatedFetcherConfig::default(),
        }
    }
}

impl PipelineDSTConfig {
    pub fn new(seed: u64) -> Self {
        PipelineDSTConfig {
            seed,
            ..Default::default()
        }
    }

    /// No faults, every kind subscribed
    pub fn calm(seed: u64) -> Self {
        PipelineDSTConfig {
            seed,
            fetcher: SimulatedFetcherConfig::no_faults(),
            ..Default::default()
        }
    }

    /// Default faults, one kind left unsubscribed
    pub fn moderate(seed: u64) -> Self {
        let skipped = MetricKind::ALL[(seed % 3) as usize];
        PipelineDSTConfig {
            seed,
            subscriptions: MetricKind::ALL
                .iter()
                .copied()
                .filter(|k| *k != skipped)
                .collect(),
            channel_capacity: 4,
            ..Default::default()
        }
    }

    /// High fault rates and more fetches
    pub fn chaos(seed: u64) -> Self {
        PipelineDSTConfig {
            seed,
            fetches: 300,
            fetcher: SimulatedFetcherConfig::high_chaos(),
            ..Default::default()
        }
    }

    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            subscriptions: self.subscriptions.clone(),
            generator: GeneratorConfig {
                channel_capacity: self.channel_capacity,
                ..GeneratorConfig::bounded(self.fetches)
            },
            dispatcher: DispatcherConfig {
                channel_capacity: self.channel_capacity,
            },
            ..PipelineConfig::test()
        }
    }
}

/// Result of a pipeline DST run
#[derive(Debug, Clone)]
pub struct PipelineDSTResult {
    /// Seed used
    pub seed: u64,
    /// Fetch results published by the generator
    pub published: u64,
    /// Dispatcher counters
    pub dispatch: DispatchStats,
    /// Fetcher fault statistics
    pub fetcher_stats: SimulatedFetcherStats,
    /// Snapshots taken while the pipeline was running
    pub snapshots_taken: u64,
    /// Invariant violations found
    pub invariant_violations: Vec<String>,
}

impl PipelineDSTResult {
    pub fn new(seed: u64) -> Self {
        PipelineDSTResult {
            seed,
            published: 0,
            dispatch: DispatchStats::default(),
            fetcher_stats: SimulatedFetcherStats::default(),
            snapshots_taken: 0,
            invariant_violations: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Seed {}: {} fetches ({} failed), {} readings ({} dispatched, {} dropped), {} snapshots, {} violations",
            self.seed,
            self.published,
            self.dispatch.failed_fetches,
            self.fetcher_stats.readings,
            self.dispatch.dispatched,
            self.dispatch.dropped,
            self.snapshots_taken,
            self.invariant_violations.len()
        )
    }
}

// ============================================================================
// Shadow model
// ============================================================================

/// Independent fold of the delivered readings
#[derive(Debug, Default)]
struct ShadowModel {
    load_count: u64,
    load_min: f64,
    load_max: f64,
    cpu_channels: Option<usize>,
    cpu_totals: Vec<f64>,
    cpu_count: u64,
    kernel_count: u64,
    kernel_max: Option<DateTime<FixedOffset>>,
    /// Subscribed readings delivered, valid or not
    subscribed_readings: u64,
}

impl ShadowModel {
    fn fold(batches: &[Batch], subscriptions: &[MetricKind]) -> Self {
        let mut model = ShadowModel::default();
        for reading in batches.iter().flatten() {
            if !subscriptions.contains(&reading.kind) {
                continue;
            }
            model.subscribed_readings += 1;
            match (reading.kind, &reading.value) {
                (MetricKind::LoadAverage, Value::Number(x)) => {
                    if model.load_count == 0 {
                        model.load_min = *x;
                        model.load_max = *x;
                    } else {
                        model.load_min = model.load_min.min(*x);
                        model.load_max = model.load_max.max(*x);
                    }
                    model.load_count += 1;
                }
                (MetricKind::CpuUsage, Value::Series(usages)) => {
                    let channels = *model.cpu_channels.get_or_insert(usages.len());
                    if usages.len() != channels {
                        continue;
                    }
                    model.cpu_totals.resize(channels, 0.0);
                    for (total, usage) in model.cpu_totals.iter_mut().zip(usages) {
                        *total += usage;
                    }
                    model.cpu_count += 1;
                }
                (MetricKind::LastKernelUpgrade, Value::Text(ts)) => {
                    if let Ok(parsed) = DateTime::parse_from_rfc3339(ts) {
                        model.kernel_count += 1;
                        if model.kernel_max.map_or(true, |m| parsed > m) {
                            model.kernel_max = Some(parsed);
                        }
                    }
                }
                _ => {}
            }
        }
        model
    }
}

// ============================================================================
// Harness
// ============================================================================

/// DST harness for one seeded pipeline run
pub struct PipelineDSTHarness {
    config: PipelineDSTConfig,
    fetcher: Arc<SimulatedFetcher>,
    result: PipelineDSTResult,
    report: Option<PipelineReport>,
}

impl PipelineDSTHarness {
    pub fn new(config: PipelineDSTConfig) -> Self {
        let fetcher = Arc::new(SimulatedFetcher::new(config.seed, config.fetcher.clone()));
        let result = PipelineDSTResult::new(config.seed);
        PipelineDSTHarness {
            config,
            fetcher,
            result,
            report: None,
        }
    }

    /// Run the pipeline to completion while a reader polls snapshots
    pub async fn run(&mut self) {
        let pipeline = Pipeline::start(&self.config.pipeline_config(), self.fetcher.clone());

        let mut last_counts = [0u64; 3];
        let mut snapshots = 0u64;
        while !pipeline.is_stopped() {
            let snapshot = pipeline.snapshot().await;
            snapshots += 1;

            let counts = [
                snapshot.load_avg.as_ref().map(|s| s.count()),
                snapshot.cpu_usage.as_ref().map(|s| s.count()),
                snapshot.last_kernel_upgrade.as_ref().map(|s| s.count()),
            ];
            for (i, count) in counts.into_iter().enumerate() {
                let Some(count) = count else { continue };
                if count < last_counts[i] {
                    self.result.invariant_violations.push(format!(
                        "{} count went backwards: {} -> {}",
                        MetricKind::ALL[i],
                        last_counts[i],
                        count
                    ));
                }
                last_counts[i] = count;
            }
            tokio::time::sleep(Duration::from_micros(200)).await;
        }

        let report = pipeline.wait().await;
        self.result.published = report.published;
        self.result.dispatch = report.dispatch;
        self.result.snapshots_taken = snapshots;
        self.result.fetcher_stats = self.fetcher.stats();
        self.report = Some(report);
    }

    /// Check final aggregates against the shadow model
    pub fn check_invariants(&mut self) {
        let Some(report) = &self.report else {
            self.result
                .invariant_violations
                .push("check_invariants called before run".to_string());
            return;
        };
        let subscriptions = &self.config.subscriptions;
        let shadow = ShadowModel::fold(&self.fetcher.delivered_batches(), subscriptions);
        let stats = &self.result.fetcher_stats;
        let mut violations = Vec::new();

        if report.published != self.config.fetches {
            violations.push(format!(
                "published {} results, expected {}",
                report.published, self.config.fetches
            ));
        }

        // Invariant 5: fetch-level faults are exactly the failed fetches
        let injected = stats.transport_failures + stats.status_failures + stats.decode_failures;
        if report.dispatch.failed_fetches != injected {
            violations.push(format!(
                "dispatcher saw {} failed fetches, fetcher injected {}",
                report.dispatch.failed_fetches, injected
            ));
        }

        // Invariant 4: nothing lost between dispatcher and handlers
        if report.dispatch.dispatched != shadow.subscribed_readings {
            violations.push(format!(
                "dispatched {} values, shadow expected {}",
                report.dispatch.dispatched, shadow.subscribed_readings
            ));
        }
        if report.dispatch.dispatched + report.dispatch.dropped != stats.readings {
            violations.push(format!(
                "dispatched {} + dropped {} != delivered readings {}",
                report.dispatch.dispatched, report.dispatch.dropped, stats.readings
            ));
        }

        // Invariant 1: load
        match (&report.load_avg, subscriptions.contains(&MetricKind::LoadAverage)) {
            (Some(load), true) => {
                if load.count() != shadow.load_count {
                    violations.push(format!(
                        "load count {} != shadow {}",
                        load.count(),
                        shadow.load_count
                    ));
                }
                if shadow.load_count > 0
                    && (load.min != shadow.load_min || load.max != shadow.load_max)
                {
                    violations.push(format!(
                        "load min/max {}/{} != shadow {}/{}",
                        load.min, load.max, shadow.load_min, shadow.load_max
                    ));
                }
            }
            (None, false) => {}
            (got, subscribed) => violations.push(format!(
                "load aggregate present={} but subscribed={}",
                got.is_some(),
                subscribed
            )),
        }

        // Invariant 2: cpu
        match (&report.cpu_usage, subscriptions.contains(&MetricKind::CpuUsage)) {
            (Some(cpu), true) => {
                if cpu.count() != shadow.cpu_count {
                    violations.push(format!(
                        "cpu count {} != shadow {}",
                        cpu.count(),
                        shadow.cpu_count
                    ));
                }
                if cpu.count() > 0 && Some(cpu.channel_count()) != shadow.cpu_channels {
                    violations.push(format!(
                        "cpu channels {} != shadow {:?}",
                        cpu.channel_count(),
                        shadow.cpu_channels
                    ));
                }
                if cpu.count() > 0 {
                    let expected: Vec<f64> = shadow
                        .cpu_totals
                        .iter()
                        .map(|t| t / shadow.cpu_count as f64)
                        .collect();
                    let close = cpu.averages.len() == expected.len()
                        && cpu
                            .averages
                            .iter()
                            .zip(&expected)
                            .all(|(a, e)| (a - e).abs() <= 1e-9);
                    if !close {
                        violations.push(format!(
                            "cpu averages {:?} != shadow {:?}",
                            cpu.averages, expected
                        ));
                    }
                }
            }
            (None, false) => {}
            (got, subscribed) => violations.push(format!(
                "cpu aggregate present={} but subscribed={}",
                got.is_some(),
                subscribed
            )),
        }

        // Invariant 3: kernel
        match (
            &report.last_kernel_upgrade,
            subscriptions.contains(&MetricKind::LastKernelUpgrade),
        ) {
            (Some(kernel), true) => {
                if kernel.count() != shadow.kernel_count {
                    violations.push(format!(
                        "kernel count {} != shadow {}",
                        kernel.count(),
                        shadow.kernel_count
                    ));
                }
                if kernel.most_recent != shadow.kernel_max {
                    violations.push(format!(
                        "kernel most_recent {:?} != shadow {:?}",
                        kernel.most_recent, shadow.kernel_max
                    ));
                }
            }
            (None, false) => {}
            (got, subscribed) => violations.push(format!(
                "kernel aggregate present={} but subscribed={}",
                got.is_some(),
                subscribed
            )),
        }

        self.result.invariant_violations.extend(violations);
    }

    /// Get the result
    pub fn result(&self) -> &PipelineDSTResult {
        &self.result
    }

    /// Consume and return the result
    pub fn into_result(self) -> PipelineDSTResult {
        self.result
    }
}

/// Run a batch of pipeline DST tests with different seeds
pub async fn run_dst_batch(
    base_seed: u64,
    count: usize,
    config_fn: impl Fn(u64) -> PipelineDSTConfig,
) -> Vec<PipelineDSTResult> {
    let mut results = Vec::with_capacity(count);

    for i in 0..count {
        let seed = base_seed + i as u64;
        let mut harness = PipelineDSTHarness::new(config_fn(seed));
        harness.run().await;
        harness.check_invariants();
        results.push(harness.into_result());
    }

    results
}

/// Summary of batch results
pub fn summarize_batch(results: &[PipelineDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.is_success()).count();
    let failed_seeds: Vec<u64> = results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.seed)
        .collect();

    let total_fetches: u64 = results.iter().map(|r| r.published).sum();
    let total_dispatched: u64 = results.iter().map(|r| r.dispatch.dispatched).sum();

    let mut summary = format!(
        "Pipeline DST Batch: {}/{} passed, {} fetches, {} values dispatched",
        passed, total, total_fetches, total_dispatched
    );

    if !failed_seeds.is_empty() {
        summary.push_str(&format!("\nFailed seeds: {:?}", failed_seeds));
        if let Some(first_failure) = results.iter().find(|r| !r.is_success()) {
            summary.push_str(&format!(
                "\nFirst failure violations:\n  {}",
                first_failure.invariant_violations.join("\n  ")
            ));
        }
    }

    summary
}
