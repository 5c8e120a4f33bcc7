//! Pipeline Wiring
//!
//! Connects `Fetcher → Generator → Dispatcher → per-kind stream → Handler`
//! under one cancellation token and owns the join handles of every task.
//!
//! A pipeline ends in one of two ways:
//! - [`Pipeline::shutdown`]: cancel everything, then join
//! - [`Pipeline::wait`]: let a bounded generator finish and the streams drain
//!
//! Both return a [`PipelineReport`] with the final aggregates.

use crate::metrics::config::PipelineConfig;
use crate::metrics::dispatcher::{spawn_dispatcher, DispatchStats};
use crate::metrics::fetcher::Fetcher;
use crate::metrics::generator::spawn_generator;
use crate::metrics::handler::{spawn_stat_handler, StatReader};
use crate::metrics::stats::{Aggregate, CpuUsageStats, KernelUpgradeStats, LoadStats};
use crate::metrics::types::{MetricKind, Value};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Reader and task for one subscribed kind
struct Subscription<A: Aggregate> {
    reader: StatReader<A>,
    task: JoinHandle<A>,
}

impl<A: Aggregate> Subscription<A> {
    fn spawn(cancel: &CancellationToken, input: mpsc::Receiver<Value>) -> Self {
        let (reader, task) = spawn_stat_handler(cancel.clone(), input);
        Subscription { reader, task }
    }

    async fn join(self) -> Option<A> {
        match self.task.await {
            Ok(stats) => Some(stats),
            Err(e) => {
                error!(kind = %A::KIND, error = %e, "Handler task failed");
                None
            }
        }
    }
}

/// Point-in-time copy of every subscribed aggregate.
///
/// A field is `None` when its kind is not subscribed or its handler has
/// already stopped.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineSnapshot {
    pub load_avg: Option<LoadStats>,
    pub cpu_usage: Option<CpuUsageStats>,
    pub last_kernel_upgrade: Option<KernelUpgradeStats>,
}

/// Final state of a pipeline after all tasks have exited
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineReport {
    /// Results published by the generator
    pub published: u64,
    pub dispatch: DispatchStats,
    pub load_avg: Option<LoadStats>,
    pub cpu_usage: Option<CpuUsageStats>,
    pub last_kernel_upgrade: Option<KernelUpgradeStats>,
}

/// A running aggregation pipeline
pub struct Pipeline {
    cancel: CancellationToken,
    generator: JoinHandle<u64>,
    dispatcher: JoinHandle<DispatchStats>,
    load: Option<Subscription<LoadStats>>,
    cpu: Option<Subscription<CpuUsageStats>>,
    kernel: Option<Subscription<KernelUpgradeStats>>,
}

impl Pipeline {
    /// Start a pipeline with its own cancellation token
    pub fn start<F: Fetcher>(config: &PipelineConfig, fetcher: F) -> Self {
        Self::start_with_cancel(config, fetcher, CancellationToken::new())
    }

    /// Start a pipeline bound to an existing cancellation token.
    /// Must be called from within a tokio runtime.
    pub fn start_with_cancel<F: Fetcher>(
        config: &PipelineConfig,
        fetcher: F,
        cancel: CancellationToken,
    ) -> Self {
        let (results, generator) = spawn_generator(cancel.clone(), fetcher, &config.generator);
        let (mut streams, dispatcher) = spawn_dispatcher(
            cancel.clone(),
            &config.subscriptions,
            results,
            &config.dispatcher,
        );

        let load = streams
            .remove(&MetricKind::LoadAverage)
            .map(|rx| Subscription::spawn(&cancel, rx));
        let cpu = streams
            .remove(&MetricKind::CpuUsage)
            .map(|rx| Subscription::spawn(&cancel, rx));
        let kernel = streams
            .remove(&MetricKind::LastKernelUpgrade)
            .map(|rx| Subscription::spawn(&cancel, rx));

        info!(
            subscriptions = ?config.subscriptions,
            limit = ?config.generator.limit,
            "Pipeline started"
        );

        Pipeline {
            cancel,
            generator,
            dispatcher,
            load,
            cpu,
            kernel,
        }
    }

    /// Token that stops every task in this pipeline when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn load_stats(&self) -> Option<&StatReader<LoadStats>> {
        self.load.as_ref().map(|s| &s.reader)
    }

    pub fn cpu_usage_stats(&self) -> Option<&StatReader<CpuUsageStats>> {
        self.cpu.as_ref().map(|s| &s.reader)
    }

    pub fn kernel_upgrade_stats(&self) -> Option<&StatReader<KernelUpgradeStats>> {
        self.kernel.as_ref().map(|s| &s.reader)
    }

    /// True once every task, including generator and dispatcher, has exited
    pub fn is_stopped(&self) -> bool {
        self.generator.is_finished()
            && self.dispatcher.is_finished()
            && self.load.as_ref().map_or(true, |s| s.reader.is_stopped())
            && self.cpu.as_ref().map_or(true, |s| s.reader.is_stopped())
            && self.kernel.as_ref().map_or(true, |s| s.reader.is_stopped())
    }

    /// Copy every subscribed aggregate
    pub async fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            load_avg: snapshot_of(self.load.as_ref()).await,
            cpu_usage: snapshot_of(self.cpu.as_ref()).await,
            last_kernel_upgrade: snapshot_of(self.kernel.as_ref()).await,
        }
    }

    /// Cancel every task, then wait for all of them to exit
    pub async fn shutdown(self) -> PipelineReport {
        info!("Pipeline shutting down");
        self.cancel.cancel();
        self.join().await
    }

    /// Wait for the pipeline to finish on its own.
    ///
    /// Only returns once the generator stops, so use this with a bounded
    /// generator or when something else owns the cancellation token.
    pub async fn wait(self) -> PipelineReport {
        self.join().await
    }

    async fn join(self) -> PipelineReport {
        let published = self.generator.await.unwrap_or_else(|e| {
            error!(error = %e, "Generator task failed");
            0
        });
        let dispatch = self.dispatcher.await.unwrap_or_else(|e| {
            error!(error = %e, "Dispatcher task failed");
            DispatchStats::default()
        });

        let load_avg = match self.load {
            Some(s) => s.join().await,
            None => None,
        };
        let cpu_usage = match self.cpu {
            Some(s) => s.join().await,
            None => None,
        };
        let last_kernel_upgrade = match self.kernel {
            Some(s) => s.join().await,
            None => None,
        };

        info!(
            published,
            dispatched = dispatch.dispatched,
            "Pipeline stopped"
        );

        PipelineReport {
            published,
            dispatch,
            load_avg,
            cpu_usage,
            last_kernel_upgrade,
        }
    }
}

async fn snapshot_of<A: Aggregate>(subscription: Option<&Subscription<A>>) -> Option<A> {
    subscription?.reader.snapshot().await.ok()
}
