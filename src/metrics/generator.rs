//! Fetch Generator
//!
//! Repeatedly invokes a [`Fetcher`] and publishes every result, success or
//! failure, on a single-consumer stream. Both the fetch and the publish race
//! the cancellation token, so the task never blocks forever on a reader that
//! has stopped reading.

use crate::metrics::config::GeneratorConfig;
use crate::metrics::fetcher::Fetcher;
use crate::metrics::types::FetchResult;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Fetch loop task
pub struct Generator<F: Fetcher> {
    fetcher: F,
    tx: mpsc::Sender<FetchResult>,
    cancel: CancellationToken,
    poll_interval: Duration,
    limit: Option<u64>,
}

impl<F: Fetcher> Generator<F> {
    /// Run until cancelled, the consumer goes away, or the limit is reached.
    /// Returns the number of results published.
    pub async fn run(self) -> u64 {
        let mut published = 0u64;

        loop {
            if let Some(limit) = self.limit {
                if published >= limit {
                    debug!(limit, "Generator reached fetch limit");
                    break;
                }
            }

            if published > 0 && !self.poll_interval.is_zero() {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = self.fetcher.fetch() => result,
            };

            if let Err(e) = &result {
                debug!(error = %e, "Fetch failed, forwarding error");
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                sent = self.tx.send(result) => {
                    if sent.is_err() {
                        debug!("Generator consumer dropped");
                        break;
                    }
                }
            }
            published += 1;
        }

        info!(published, "Generator stopped");
        published
    }
}

/// Spawn a generator and return its output stream + join handle.
/// The stream closes when the task exits.
pub fn spawn_generator<F: Fetcher>(
    cancel: CancellationToken,
    fetcher: F,
    config: &GeneratorConfig,
) -> (mpsc::Receiver<FetchResult>, JoinHandle<u64>) {
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let generator = Generator {
        fetcher,
        tx,
        cancel,
        poll_interval: config.poll_interval,
        limit: config.limit,
    };
    let task = tokio::spawn(generator.run());
    (rx, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::error::FetchError;
    use crate::metrics::fetcher::ScriptedFetcher;
    use crate::metrics::types::Reading;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::time::Instant;

    /// Fetcher whose requests never complete
    struct HangingFetcher;

    impl Fetcher for HangingFetcher {
        fn fetch(&self) -> Pin<Box<dyn Future<Output = FetchResult> + Send + '_>> {
            Box::pin(futures::future::pending())
        }
    }

    #[tokio::test]
    async fn test_bounded_generator_stops_after_n() {
        let cancel = CancellationToken::new();
        let fetcher = Arc::new(ScriptedFetcher::from_batches(vec![
            vec![Reading::load_average(0.1)],
            vec![Reading::load_average(0.2)],
            vec![Reading::load_average(0.3)],
            vec![Reading::load_average(0.4)],
        ]));

        let (mut rx, task) =
            spawn_generator(cancel, fetcher.clone(), &GeneratorConfig::bounded(3));

        let mut received = Vec::new();
        while let Some(result) = rx.recv().await {
            received.push(result.unwrap());
        }

        assert_eq!(
            received,
            vec![
                vec![Reading::load_average(0.1)],
                vec![Reading::load_average(0.2)],
                vec![Reading::load_average(0.3)],
            ]
        );
        assert_eq!(task.await.unwrap(), 3);
        assert_eq!(fetcher.calls(), 3);
    }

    #[tokio::test]
    async fn test_generator_forwards_errors_unchanged() {
        let cancel = CancellationToken::new();
        let err = FetchError::RemoteStatus {
            status: 500,
            reason: "Internal Server Error".to_string(),
        };
        let fetcher = ScriptedFetcher::new(vec![Err(err.clone()), Ok(vec![])]);

        let (mut rx, task) = spawn_generator(cancel, fetcher, &GeneratorConfig::bounded(2));

        assert_eq!(rx.recv().await, Some(Err(err)));
        assert_eq!(rx.recv().await, Some(Ok(vec![])));
        assert_eq!(rx.recv().await, None);
        assert_eq!(task.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_cancel_unblocks_pending_publish() {
        let cancel = CancellationToken::new();
        let fetcher = ScriptedFetcher::new(Vec::new());

        // Nobody reads: the generator fills the buffer and blocks on send
        let (rx, task) = spawn_generator(cancel.clone(), fetcher, &GeneratorConfig::default());
        tokio::time::sleep(Duration::from_millis(20)).await;

        cancel.cancel();
        let published = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("generator did not observe cancellation")
            .unwrap();
        assert_eq!(published, 1);
        drop(rx);
    }

    #[tokio::test]
    async fn test_cancel_aborts_hanging_fetch() {
        let cancel = CancellationToken::new();
        let (mut rx, task) =
            spawn_generator(cancel.clone(), HangingFetcher, &GeneratorConfig::default());

        cancel.cancel();
        let published = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("generator did not observe cancellation")
            .unwrap();
        assert_eq!(published, 0);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_generator_exits_when_consumer_dropped() {
        let cancel = CancellationToken::new();
        let (rx, task) = spawn_generator(
            cancel,
            ScriptedFetcher::new(Vec::new()),
            &GeneratorConfig::default(),
        );
        drop(rx);

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("generator kept running without a consumer")
            .unwrap();
    }

    #[tokio::test]
    async fn test_poll_interval_spaces_fetches() {
        let cancel = CancellationToken::new();
        let config = GeneratorConfig {
            poll_interval: Duration::from_millis(20),
            ..GeneratorConfig::bounded(3)
        };

        let start = Instant::now();
        let (mut rx, task) = spawn_generator(cancel, ScriptedFetcher::new(Vec::new()), &config);
        while rx.recv().await.is_some() {}

        assert_eq!(task.await.unwrap(), 3);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}
