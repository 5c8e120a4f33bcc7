//! Batch Dispatcher
//!
//! Demultiplexes fetched batches onto one stream per subscribed metric kind.
//!
//! ```text
//!                          ┌──► load_avg stream ──► LoadStats handler
//! Generator ──results──► Dispatcher ──► cpu_usage stream ──► CpuUsageStats handler
//!                          └──► last_kernel_upgrade stream ──► KernelUpgradeStats handler
//! ```
//!
//! The dispatcher task is the only writer of every per-kind stream. Streams
//! are closed exactly once, by dropping their senders when the task exits.

use crate::metrics::config::DispatcherConfig;
use crate::metrics::types::{Batch, FetchResult, MetricKind, Value};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counters reported by the dispatcher when it exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Successful batches received
    pub batches: u64,
    /// Error results received (logged, not dispatched)
    pub failed_fetches: u64,
    /// Values handed to a subscriber stream
    pub dispatched: u64,
    /// Readings with no (remaining) subscriber
    pub dropped: u64,
}

/// Dispatcher task state
pub struct Dispatcher {
    input: mpsc::Receiver<FetchResult>,
    outputs: HashMap<MetricKind, mpsc::Sender<Value>>,
    cancel: CancellationToken,
    stats: DispatchStats,
}

impl Dispatcher {
    /// Run until the input closes or cancellation fires
    pub async fn run(mut self) -> DispatchStats {
        loop {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("Dispatcher cancelled");
                    break;
                }
                result = self.input.recv() => match result {
                    Some(result) => result,
                    None => {
                        debug!("Dispatcher input closed");
                        break;
                    }
                },
            };

            match result {
                Ok(batch) => {
                    self.stats.batches += 1;
                    if !self.dispatch(batch).await {
                        break;
                    }
                }
                Err(e) => {
                    self.stats.failed_fetches += 1;
                    error!(error = %e, "Failed to fetch metrics batch");
                }
            }
        }

        // Dropping the senders closes every subscriber stream
        self.outputs.clear();

        info!(
            batches = self.stats.batches,
            failed_fetches = self.stats.failed_fetches,
            dispatched = self.stats.dispatched,
            dropped = self.stats.dropped,
            "Dispatcher stopped"
        );
        self.stats
    }

    /// Route each reading to its kind's stream, in batch order.
    /// Returns false if cancelled mid-batch.
    async fn dispatch(&mut self, batch: Batch) -> bool {
        for reading in batch {
            let kind = reading.kind;
            let Some(tx) = self.outputs.get(&kind) else {
                self.stats.dropped += 1;
                debug!(kind = %kind, "No subscriber for reading, dropping");
                continue;
            };

            let sent = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                sent = tx.send(reading.value) => sent,
            };

            match sent {
                Ok(()) => self.stats.dispatched += 1,
                Err(_) => {
                    warn!(kind = %kind, "Subscriber stream closed, unsubscribing");
                    self.outputs.remove(&kind);
                    self.stats.dropped += 1;
                }
            }
        }
        true
    }
}

/// Create one stream per subscribed kind and spawn the dispatcher.
///
/// The stream map is returned before any dispatch happens, so subscribers can
/// start consuming immediately. Duplicate subscriptions share one stream.
pub fn spawn_dispatcher(
    cancel: CancellationToken,
    subscriptions: &[MetricKind],
    input: mpsc::Receiver<FetchResult>,
    config: &DispatcherConfig,
) -> (HashMap<MetricKind, mpsc::Receiver<Value>>, JoinHandle<DispatchStats>) {
    let mut outputs = HashMap::with_capacity(subscriptions.len());
    let mut streams = HashMap::with_capacity(subscriptions.len());

    for &kind in subscriptions {
        if outputs.contains_key(&kind) {
            continue;
        }
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        outputs.insert(kind, tx);
        streams.insert(kind, rx);
    }

    let dispatcher = Dispatcher {
        input,
        outputs,
        cancel,
        stats: DispatchStats::default(),
    };
    let task = tokio::spawn(dispatcher.run());
    (streams, task)
}
