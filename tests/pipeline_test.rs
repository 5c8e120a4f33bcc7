//! Pipeline Integration Tests
//!
//! Exercises the full `Fetcher → Generator → Dispatcher → Handler` chain:
//! - End-to-end aggregation over scripted batches
//! - Fetch errors interleaved with good batches
//! - Cancellation with blocked and hanging stages
//! - Snapshot reads while ingestion continues
//! - The HTTP fetcher against a local endpoint

use metrics_consumer::metrics::{
    Aggregate, DispatchStats, FetchError, FetchResult, Fetcher, GeneratorConfig, HttpFetcher,
    MetricKind, Pipeline, PipelineConfig, Reading, ScriptedFetcher, SourceConfig, Value,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn bounded(n: u64) -> PipelineConfig {
    PipelineConfig {
        generator: GeneratorConfig::bounded(n),
        ..PipelineConfig::test()
    }
}

// ============================================================================
// End-to-end aggregation
// ============================================================================

#[tokio::test]
async fn test_load_batches_end_to_end() {
    let fetcher = ScriptedFetcher::from_batches(vec![
        vec![Reading::load_average(0.5)],
        vec![Reading::load_average(0.9)],
        vec![Reading::load_average(0.2)],
    ]);

    let report = Pipeline::start(&bounded(3), fetcher).wait().await;

    let load = report.load_avg.unwrap();
    assert_eq!(load.count(), 3);
    assert_eq!(load.min, 0.2);
    assert_eq!(load.max, 0.9);
    assert_eq!(report.published, 3);
}

#[tokio::test]
async fn test_mixed_batches_end_to_end() {
    let fetcher = ScriptedFetcher::from_batches(vec![
        vec![
            Reading::cpu_usage(vec![0.2, 0.4]),
            Reading::kernel_upgrade("2021-03-01T10:00:00+02:00"),
            Reading::load_average(1.0),
        ],
        vec![
            Reading::cpu_usage(vec![0.4, 0.8]),
            Reading::kernel_upgrade("2021-03-01T09:00:00Z"),
            Reading::cpu_usage(vec![0.9]),
        ],
    ]);

    let report = Pipeline::start(&bounded(2), fetcher).wait().await;

    let cpu = report.cpu_usage.unwrap();
    assert_eq!(cpu.count(), 2);
    assert_eq!(cpu.channel_count(), 2);
    assert!((cpu.averages[0] - 0.3).abs() < 1e-12);
    assert!((cpu.averages[1] - 0.6).abs() < 1e-12);

    // 09:00Z is later than 10:00+02:00 (08:00Z)
    let kernel = report.last_kernel_upgrade.unwrap();
    assert_eq!(kernel.count(), 2);
    assert_eq!(
        kernel.most_recent.map(|t| t.to_rfc3339()),
        Some("2021-03-01T09:00:00+00:00".to_string())
    );

    assert_eq!(report.load_avg.unwrap().count(), 1);
    assert_eq!(report.dispatch.dispatched, 6);
}

#[tokio::test]
async fn test_only_subscribed_kind_is_aggregated() {
    let good = Reading::load_average(0.0);
    let other = Reading::cpu_usage(vec![0.0]);
    let fetcher = ScriptedFetcher::from_batches(vec![vec![
        good.clone(),
        good.clone(),
        other.clone(),
        other.clone(),
        other,
        good.clone(),
        good,
    ]]);
    let config = PipelineConfig {
        subscriptions: vec![MetricKind::LoadAverage],
        ..bounded(1)
    };

    let report = Pipeline::start(&config, fetcher).wait().await;

    assert_eq!(report.load_avg.unwrap().count(), 4);
    assert!(report.cpu_usage.is_none());
    assert_eq!(
        report.dispatch,
        DispatchStats {
            batches: 1,
            failed_fetches: 0,
            dispatched: 4,
            dropped: 3,
        }
    );
}

#[tokio::test]
async fn test_fetch_errors_do_not_stop_the_pipeline() {
    let fetcher = ScriptedFetcher::new(vec![
        Err(FetchError::Transport("connection refused".to_string())),
        Ok(vec![Reading::load_average(0.4)]),
        Err(FetchError::RemoteStatus {
            status: 502,
            reason: "Bad Gateway".to_string(),
        }),
        Err(FetchError::Decode("expected value".to_string())),
        Ok(vec![Reading::load_average(0.6)]),
    ]);

    let report = Pipeline::start(&bounded(5), fetcher).wait().await;

    assert_eq!(report.dispatch.failed_fetches, 3);
    assert_eq!(report.dispatch.batches, 2);
    let load = report.load_avg.unwrap();
    assert_eq!((load.count(), load.min, load.max), (2, 0.4, 0.6));
}

#[tokio::test]
async fn test_invalid_readings_are_skipped() {
    let fetcher = ScriptedFetcher::from_batches(vec![vec![
        Reading::kernel_upgrade("2020-05-01T00:00:00Z"),
        Reading::kernel_upgrade("yesterday"),
        Reading::new(MetricKind::LoadAverage, Value::Text("high".to_string())),
        Reading::load_average(0.7),
    ]]);

    let report = Pipeline::start(&bounded(1), fetcher).wait().await;

    assert_eq!(report.last_kernel_upgrade.unwrap().count(), 1);
    assert_eq!(report.load_avg.unwrap().count(), 1);
    assert_eq!(report.dispatch.dispatched, 4);
}

// ============================================================================
// Snapshots
// ============================================================================

#[tokio::test]
async fn test_snapshot_while_ingesting() {
    let batches: Vec<_> = (0..200)
        .map(|i| vec![Reading::load_average(i as f64)])
        .collect();
    let pipeline = Pipeline::start(&bounded(200), ScriptedFetcher::from_batches(batches));

    let mut last = 0;
    while !pipeline.is_stopped() {
        if let Some(load) = pipeline.snapshot().await.load_avg {
            assert!(load.count() >= last);
            if load.count() > 0 {
                // Values arrive in order, so max tracks count exactly
                assert_eq!(load.max, (load.count() - 1) as f64);
                assert_eq!(load.min, 0.0);
            }
            last = load.count();
        }
        tokio::task::yield_now().await;
    }

    assert_eq!(pipeline.wait().await.load_avg.unwrap().count(), 200);
}

#[tokio::test]
async fn test_mutating_snapshot_does_not_affect_handler() {
    let fetcher = ScriptedFetcher::from_batches(vec![vec![Reading::cpu_usage(vec![0.5, 0.5])]]);
    let config = PipelineConfig {
        generator: GeneratorConfig::default(),
        ..PipelineConfig::test()
    };
    let pipeline = Pipeline::start(&config, fetcher);
    let reader = pipeline.cpu_usage_stats().cloned().unwrap();

    let mut first = loop {
        let snapshot = reader.snapshot().await.unwrap();
        if snapshot.count() == 1 {
            break snapshot;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    first.averages[0] = 42.0;
    assert_eq!(first.averages[0], 42.0);

    let second = reader.snapshot().await.unwrap();
    assert_eq!(second.averages, vec![0.5, 0.5]);
    pipeline.shutdown().await;
}

// ============================================================================
// Cancellation
// ============================================================================

/// Fetcher whose requests never complete
struct HangingFetcher;

impl Fetcher for HangingFetcher {
    fn fetch(&self) -> Pin<Box<dyn Future<Output = FetchResult> + Send + '_>> {
        Box::pin(futures::future::pending())
    }
}

#[tokio::test]
async fn test_shutdown_unbounded_generator() {
    // Unbounded generator: the exhausted script keeps returning empty batches
    let fetcher = Arc::new(ScriptedFetcher::new(Vec::new()));
    let config = PipelineConfig {
        generator: GeneratorConfig::default(),
        ..PipelineConfig::test()
    };
    let pipeline = Pipeline::start(&config, fetcher.clone());
    tokio::time::sleep(Duration::from_millis(20)).await;

    let report = tokio::time::timeout(Duration::from_secs(2), pipeline.shutdown())
        .await
        .expect("pipeline did not shut down");
    assert!(report.published > 0);
    assert!(fetcher.calls() >= report.published);
}

#[tokio::test]
async fn test_shutdown_with_full_streams() {
    let batches: Vec<_> = (0..100)
        .map(|_| {
            vec![
                Reading::load_average(1.0),
                Reading::cpu_usage(vec![0.1]),
                Reading::kernel_upgrade("2022-01-01T00:00:00Z"),
            ]
        })
        .collect();
    let pipeline = Pipeline::start(
        &PipelineConfig::test(),
        ScriptedFetcher::from_batches(batches),
    );
    tokio::time::sleep(Duration::from_millis(10)).await;

    let report = tokio::time::timeout(Duration::from_secs(2), pipeline.shutdown())
        .await
        .expect("pipeline did not shut down");
    assert!(report.load_avg.is_some());
    assert!(report.cpu_usage.is_some());
    assert!(report.last_kernel_upgrade.is_some());
}

#[tokio::test]
async fn test_shutdown_aborts_hanging_fetch() {
    let pipeline = Pipeline::start(&PipelineConfig::test(), HangingFetcher);
    let reader = pipeline.load_stats().cloned().unwrap();

    let report = tokio::time::timeout(Duration::from_secs(2), pipeline.shutdown())
        .await
        .expect("pipeline did not shut down");
    assert_eq!(report.published, 0);
    assert_eq!(report.load_avg.unwrap().count(), 0);

    assert!(reader.is_stopped());
    assert!(reader.snapshot().await.is_err());
}

#[tokio::test]
async fn test_external_cancel_token() {
    let cancel = tokio_util::sync::CancellationToken::new();
    let pipeline =
        Pipeline::start_with_cancel(&PipelineConfig::test(), HangingFetcher, cancel.clone());

    cancel.cancel();
    let report = tokio::time::timeout(Duration::from_secs(2), pipeline.wait())
        .await
        .expect("pipeline ignored external cancellation");
    assert_eq!(report.published, 0);
}

// ============================================================================
// HTTP source
// ============================================================================

/// Serve the given bodies to successive requests, one connection each
async fn serve_bodies(bodies: Vec<&'static str>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        for body in bodies {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
        }
    });

    format!("http://{}/metrics", addr)
}

#[tokio::test]
async fn test_http_source_end_to_end() {
    let url = serve_bodies(vec![
        r#"[{"type":"load_avg","payload":{"value":0.5}}]"#,
        r#"[{"type":"load_avg","payload":{"value":0.9}},{"type":"disk_io","payload":{"value":3}}]"#,
        r#"[{"type":"load_avg","payload":{"value":0.2}},{"type":"last_kernel_upgrade","payload":{"value":"2023-06-01T12:00:00Z"}}]"#,
    ])
    .await;

    let config = PipelineConfig {
        source: SourceConfig {
            url,
            timeout: Duration::from_secs(2),
        },
        ..bounded(3)
    };
    let fetcher = HttpFetcher::new(&config.source).unwrap();
    let report = Pipeline::start(&config, fetcher).wait().await;

    assert_eq!(report.dispatch.failed_fetches, 0);
    let load = report.load_avg.unwrap();
    assert_eq!((load.count(), load.min, load.max), (3, 0.2, 0.9));
    assert_eq!(report.last_kernel_upgrade.unwrap().count(), 1);
}
