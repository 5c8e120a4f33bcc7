//! Fetcher Abstraction
//!
//! A fetcher performs one request against the metrics source and decodes the
//! response into a [`Batch`]. Failures are returned as values; a fetcher never
//! panics and never retries.
//!
//! Implementations:
//! - `HttpFetcher`: production client for the HTTP metrics endpoint
//! - `ScriptedFetcher`: replays a fixed sequence of results (tests, demos)
//! - `SimulatedFetcher`: seeded fault injection for DST (see `simulated_fetcher`)

use crate::metrics::config::SourceConfig;
use crate::metrics::error::FetchError;
use crate::metrics::types::{decode_batch, Batch, FetchResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Fetch-one-batch operation consumed by the generator
pub trait Fetcher: Send + Sync + 'static {
    /// Perform a single fetch. Dropping the returned future aborts the fetch.
    fn fetch(&self) -> Pin<Box<dyn Future<Output = FetchResult> + Send + '_>>;
}

impl<F: Fetcher + ?Sized> Fetcher for Arc<F> {
    fn fetch(&self) -> Pin<Box<dyn Future<Output = FetchResult> + Send + '_>> {
        (**self).fetch()
    }
}

// ============================================================================
// HttpFetcher - production client
// ============================================================================

/// Fetches batches with an HTTP GET against the configured endpoint
pub struct HttpFetcher {
    http: reqwest::Client,
    url: String,
}

impl HttpFetcher {
    pub fn new(config: &SourceConfig) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| FetchError::Transport(format!("building HTTP client: {}", e)))?;

        Ok(HttpFetcher {
            http,
            url: config.url.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn fetch_batch(&self) -> FetchResult {
        let start = Instant::now();

        let response = self
            .http
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(FetchError::RemoteStatus {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or_default().to_string(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Transport(format!("reading response body: {}", e)))?;
        let batch = decode_batch(&body)?;

        debug!(
            url = %self.url,
            readings = batch.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Fetched metrics batch"
        );
        Ok(batch)
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self) -> Pin<Box<dyn Future<Output = FetchResult> + Send + '_>> {
        Box::pin(self.fetch_batch())
    }
}

// ============================================================================
// ScriptedFetcher - replays canned results
// ============================================================================

struct ScriptedState {
    script: VecDeque<FetchResult>,
    calls: u64,
}

/// Returns queued results in order, then empty batches once exhausted
pub struct ScriptedFetcher {
    state: Mutex<ScriptedState>,
}

impl ScriptedFetcher {
    pub fn new(script: impl IntoIterator<Item = FetchResult>) -> Self {
        ScriptedFetcher {
            state: Mutex::new(ScriptedState {
                script: script.into_iter().collect(),
                calls: 0,
            }),
        }
    }

    /// Script where every fetch succeeds with the given batch
    pub fn from_batches(batches: impl IntoIterator<Item = Batch>) -> Self {
        Self::new(batches.into_iter().map(Ok))
    }

    /// Number of fetches performed so far
    pub fn calls(&self) -> u64 {
        self.state.lock().calls
    }

    /// Results not yet handed out
    pub fn remaining(&self) -> usize {
        self.state.lock().script.len()
    }
}

impl Fetcher for ScriptedFetcher {
    fn fetch(&self) -> Pin<Box<dyn Future<Output = FetchResult> + Send + '_>> {
        let result = {
            let mut state = self.state.lock();
            state.calls += 1;
            state.script.pop_front().unwrap_or_else(|| Ok(Vec::new()))
        };
        Box::pin(async move { result })
    }
}
