//! Stat Handler Actor
//!
//! Each handler task exclusively owns one aggregate. It multiplexes three
//! event sources: values dispatched for its kind, snapshot requests from
//! readers, and the pipeline-wide cancellation token.
//!
//! ```text
//! Dispatcher ──values──►┐
//!                       ├──► StatHandler<A> (owns A) ──► final A on exit
//! StatReader ──request─►┘            │
//!      ▲                             │
//!      └────────── clone of A ◄──────┘
//! ```
//!
//! Snapshots are answered with a clone, never a reference, so a reader can do
//! whatever it likes with the value it receives. Requests and updates are
//! serialized by the task itself, so a reader never sees a partial update.

use crate::metrics::error::HandlerError;
use crate::metrics::stats::Aggregate;
use crate::metrics::types::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Messages accepted by a handler task
pub enum HandlerMessage<A> {
    /// Reply with a copy of the current aggregate
    Snapshot { response_tx: oneshot::Sender<A> },
}

/// Handler task that folds values into an aggregate
pub struct StatHandler<A: Aggregate> {
    stats: A,
    input: mpsc::Receiver<Value>,
    rx: mpsc::UnboundedReceiver<HandlerMessage<A>>,
    cancel: CancellationToken,
    /// Readings skipped because they failed validation
    rejected: u64,
}

impl<A: Aggregate> StatHandler<A> {
    fn new(
        input: mpsc::Receiver<Value>,
        rx: mpsc::UnboundedReceiver<HandlerMessage<A>>,
        cancel: CancellationToken,
    ) -> Self {
        StatHandler {
            stats: A::default(),
            input,
            rx,
            cancel,
            rejected: 0,
        }
    }

    /// Run until the input stream closes or cancellation fires.
    /// Returns the final aggregate.
    pub async fn run(mut self) -> A {
        debug!(kind = %A::KIND, "Stat handler started");
        let mut requests_open = true;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(kind = %A::KIND, "Stat handler cancelled");
                    break;
                }
                msg = self.rx.recv(), if requests_open => match msg {
                    Some(msg) => self.handle_message(msg),
                    // Every reader is gone; keep aggregating
                    None => requests_open = false,
                },
                value = self.input.recv() => match value {
                    Some(value) => self.handle_value(value),
                    None => {
                        debug!(kind = %A::KIND, "Stat handler input closed");
                        break;
                    }
                },
            }
        }

        info!(
            kind = %A::KIND,
            count = self.stats.count(),
            rejected = self.rejected,
            "Stat handler stopped"
        );
        self.stats
    }

    fn handle_message(&mut self, msg: HandlerMessage<A>) {
        match msg {
            HandlerMessage::Snapshot { response_tx } => {
                // Reader may have given up waiting
                let _ = response_tx.send(self.stats.clone());
            }
        }
    }

    fn handle_value(&mut self, value: Value) {
        if let Err(e) = self.stats.apply(value) {
            self.rejected = self.rejected.saturating_add(1);
            warn!(kind = %A::KIND, error = %e, "Skipping reading");
        }
    }
}

// ============================================================================
// StatReader - public interface for reading a handler's aggregate
// ============================================================================

/// Handle for requesting snapshots from a handler task
pub struct StatReader<A> {
    tx: mpsc::UnboundedSender<HandlerMessage<A>>,
}

impl<A> Clone for StatReader<A> {
    fn clone(&self) -> Self {
        StatReader {
            tx: self.tx.clone(),
        }
    }
}

impl<A: Aggregate> StatReader<A> {
    /// Get an independent copy of the aggregate as of the last applied update.
    ///
    /// Fails with [`HandlerError::Stopped`] once the handler has exited,
    /// including when it exits with this request still queued.
    pub async fn snapshot(&self) -> Result<A, HandlerError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(HandlerMessage::Snapshot { response_tx })
            .map_err(|_| HandlerError::Stopped(A::KIND))?;
        response_rx.await.map_err(|_| HandlerError::Stopped(A::KIND))
    }

    /// True once the handler task has exited
    pub fn is_stopped(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn a handler task consuming `input` and return its reader + join handle.
/// The join handle resolves to the final aggregate.
pub fn spawn_stat_handler<A: Aggregate>(
    cancel: CancellationToken,
    input: mpsc::Receiver<Value>,
) -> (StatReader<A>, JoinHandle<A>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = StatHandler::<A>::new(input, rx, cancel);
    let task = tokio::spawn(handler.run());
    (StatReader { tx }, task)
}
