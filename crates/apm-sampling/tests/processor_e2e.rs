//! End-to-end scenarios for the tail-sampling processor: chain pass-through,
//! keep/drop policies, late events, remote decisions, and storage pressure.

use std::sync::Arc;
use std::time::{Duration, Instant};

use httptest::{matchers::*, responders::*, Expectation, Server};
use tempfile::TempDir;
use tokio::task::JoinHandle;

use apm_model::test_support::{span_event, transaction_event, SinkProcessor};
use apm_model::{Batch, BatchProcessor, Chained, ManagedProcessor, ProcessingError};
use apm_sampling::eventstorage::{JsonCodec, ShardedReadWriter, StorageManager};
use apm_sampling::{Config, DataStreamConfig, Policy, PolicyCriteria, Processor};

const FLUSH_INTERVAL: Duration = Duration::from_millis(200);

struct Harness {
    processor: Arc<Processor>,
    chain: Chained,
    sink: Arc<SinkProcessor>,
    storage: Arc<ShardedReadWriter>,
    runner: Option<JoinHandle<Result<(), ProcessingError>>>,
    _dir: TempDir,
    _server: Server,
}

impl Harness {
    async fn new(policies: Vec<Policy>, storage_limit: u64) -> Self {
        Self::with_search_response(
            policies,
            storage_limit,
            serde_json::json!({"hits": {"hits": []}}),
        )
        .await
    }

    async fn with_search_response(
        policies: Vec<Policy>,
        storage_limit: u64,
        search_response: serde_json::Value,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "POST",
                "/traces-apm.sampled-default/_bulk",
            ))
            .times(0..)
            .respond_with(status_code(200)),
        );
        server.expect(
            Expectation::matching(request::method_path(
                "POST",
                "/traces-apm.sampled-default/_search",
            ))
            .times(0..)
            .respond_with(json_encoded(search_response)),
        );

        let manager = StorageManager::open(
            dir.path(),
            Arc::new(JsonCodec),
            Duration::from_secs(60),
            storage_limit,
        )
        .unwrap();
        let storage =
            ShardedReadWriter::with_flush_window(manager, 2, Duration::from_millis(50));
        let elasticsearch = Arc::new(
            apm_sampling::elasticsearch::ElasticsearchClient::new(
                &apm_sampling::elasticsearch::ElasticsearchConfig {
                    base_url: server.url_str("/"),
                    api_key: None,
                    timeout: Duration::from_secs(2),
                    compression_level: 5,
                },
            )
            .unwrap(),
        );

        let sink = Arc::new(SinkProcessor::default());
        let processor = Arc::new(
            Processor::new(Config {
                beat_id: "observer-a".to_owned(),
                flush_interval: FLUSH_INTERVAL,
                max_dynamic_services: 100,
                policies,
                default_sample_rate: 1.0,
                ingest_rate_decay_factor: 0.25,
                storage: Arc::clone(&storage),
                storage_dir: dir.path().to_path_buf(),
                storage_gc_interval: Duration::from_secs(5),
                elasticsearch,
                sampled_traces_data_stream: DataStreamConfig::sampled_traces("default"),
                downstream: sink.clone(),
            })
            .unwrap(),
        );

        let runner = {
            let processor = Arc::clone(&processor);
            tokio::spawn(async move { processor.run().await })
        };
        let chain = Chained(vec![processor.clone(), sink.clone()]);

        Harness {
            processor,
            chain,
            sink,
            storage,
            runner: Some(runner),
            _dir: dir,
            _server: server,
        }
    }

    async fn send(&self, events: Vec<apm_model::Event>) {
        let mut batch = Batch::from(events);
        self.chain.process_batch(&mut batch).await.unwrap();
    }

    async fn shutdown(mut self) {
        self.processor.stop(Duration::from_secs(5)).await.unwrap();
        if let Some(runner) = self.runner.take() {
            runner.await.unwrap().unwrap();
        }
    }
}

fn catch_all_policy(sample_rate: f64) -> Vec<Policy> {
    vec![Policy {
        criteria: PolicyCriteria::default(),
        sample_rate,
    }]
}

fn trace_events(trace_id: &str) -> (apm_model::Event, Vec<apm_model::Event>) {
    let root = transaction_event(trace_id, &format!("{trace_id}-root"), "svc", "GET /");
    let spans = vec![
        span_event(trace_id, &format!("{trace_id}-span-a"), "svc", "SELECT"),
        span_event(trace_id, &format!("{trace_id}-span-b"), "svc", "PUT cache"),
        span_event(trace_id, &format!("{trace_id}-span-c"), "svc", "GET http"),
    ];
    (root, spans)
}

async fn wait_until(description: &str, timeout: Duration, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {description}");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn keep_all_forwards_every_event_and_records_the_decision() {
    let harness = Harness::new(catch_all_policy(1.0), 0).await;
    let (root, spans) = trace_events("t1");

    // Spans arrive first and are buffered; the root's keep decision flushes
    // them downstream.
    harness.send(spans).await;
    assert!(harness.sink.events().is_empty());
    harness.send(vec![root]).await;

    wait_until("all four events downstream", Duration::from_secs(5), || {
        harness.sink.events().len() == 4
    })
    .await;
    assert_eq!(harness.storage.read_decision("t1").unwrap(), Some(true));
    // Buffered entries were purged after the flush.
    harness.storage.sync_trace("t1").await.unwrap();
    assert_eq!(harness.storage.read_events("t1").count(), 0);
    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn drop_all_forwards_nothing_and_purges_storage() {
    let harness = Harness::new(catch_all_policy(0.0), 0).await;
    let (root, spans) = trace_events("t2");

    harness.send(spans).await;
    harness.send(vec![root]).await;
    tokio::time::sleep(2 * FLUSH_INTERVAL).await;

    assert!(harness.sink.events().is_empty());
    assert_eq!(harness.storage.read_decision("t2").unwrap(), Some(false));
    harness.storage.sync_trace("t2").await.unwrap();
    assert_eq!(harness.storage.read_events("t2").count(), 0);
    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn late_events_after_drop_are_discarded_without_buffering() {
    let harness = Harness::new(catch_all_policy(0.0), 0).await;
    let (root, spans) = trace_events("t2");
    harness.send(spans).await;
    harness.send(vec![root]).await;

    let late = span_event("t2", "t2-late-span", "svc", "SELECT");
    harness.send(vec![late]).await;

    assert!(harness.sink.events().is_empty());
    harness.storage.sync_trace("t2").await.unwrap();
    assert_eq!(harness.storage.read_events("t2").count(), 0);
    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn fractional_rate_decides_at_flush_and_forwards_exactly_once() {
    let harness = Harness::new(catch_all_policy(0.5), 0).await;
    let (root, spans) = trace_events("t5");

    harness.send(spans).await;
    harness.send(vec![root]).await;
    // Everything is held back until the flush tick.
    assert!(harness.sink.events().is_empty());

    wait_until("flush tick decision", Duration::from_secs(5), || {
        harness.storage.read_decision("t5").unwrap().is_some()
    })
    .await;
    // A single undecided trace always fits the priming reservoir.
    assert_eq!(harness.storage.read_decision("t5").unwrap(), Some(true));

    wait_until("buffered events downstream", Duration::from_secs(5), || {
        harness.sink.events().len() == 4
    })
    .await;
    // No duplicates: one emission per event.
    tokio::time::sleep(2 * FLUSH_INTERVAL).await;
    let mut ids: Vec<String> = harness.sink.events().iter().map(|e| e.id.clone()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 4);
    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_decision_flushes_buffered_events_without_local_decision() {
    let search_response = serde_json::json!({"hits": {"hits": [
        {"_seq_no": 3, "_source": {"trace": {"id": "t3"},
                                   "observer": {"id": "observer-b"},
                                   "decision": "sampled"}},
    ]}});
    // A fractional policy so nothing is decided locally before the remote
    // decision arrives.
    let harness =
        Harness::with_search_response(catch_all_policy(0.5), 0, search_response).await;

    // Two non-root spans; ids chosen so storage order differs from arrival
    // order.
    let second = span_event("t3", "b-span", "svc", "SELECT");
    let first = span_event("t3", "a-span", "svc", "GET http");
    harness.send(vec![second, first]).await;

    wait_until("remote decision applied", Duration::from_secs(5), || {
        harness.sink.events().len() == 2
    })
    .await;
    let ids: Vec<String> = harness.sink.events().iter().map(|e| e.id.clone()).collect();
    // Forwarded in storage-scan (key) order.
    assert_eq!(ids, vec!["a-span".to_owned(), "b-span".to_owned()]);
    // The remote observer owns the decision; nothing is written locally.
    assert_eq!(harness.storage.read_decision("t3").unwrap(), None);
    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn storage_pressure_fails_open() {
    // Small limit: the first writes fit, then buffering is refused and
    // events flow through raw.
    let harness = Harness::new(catch_all_policy(0.5), 64 * 1024).await;

    let mut buffered = 0usize;
    let mut forwarded = 0usize;
    for i in 0..4000 {
        let event = span_event("t4", &format!("span-{i:05}"), "svc", "SELECT");
        let mut batch = Batch::from(vec![event]);
        harness.chain.process_batch(&mut batch).await.unwrap();
        if batch.is_empty() {
            buffered += 1;
        } else {
            forwarded += 1;
        }
    }
    assert!(buffered > 0, "no events were buffered before the limit");
    assert!(forwarded > 0, "the storage limit never engaged");
    // Fail-open events reached the sink while the trace stayed undecided.
    assert_eq!(harness.sink.events().len(), forwarded);
    assert_eq!(harness.storage.read_decision("t4").unwrap(), None);
    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn events_without_trace_id_pass_through() {
    let harness = Harness::new(catch_all_policy(0.0), 0).await;

    let mut orphan = span_event("t9", "orphan", "svc", "SELECT");
    orphan.trace_id = None;
    harness.send(vec![orphan]).await;
    assert_eq!(harness.sink.events().len(), 1);
    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stopped_processor_rejects_new_batches() {
    let mut harness = Harness::new(catch_all_policy(1.0), 0).await;
    harness.processor.stop(Duration::from_secs(5)).await.unwrap();

    let mut batch = Batch::from(vec![transaction_event("t6", "e1", "svc", "GET /")]);
    let err = harness.processor.process_batch(&mut batch).await.unwrap_err();
    assert!(matches!(err, ProcessingError::Stopped));

    if let Some(runner) = harness.runner.take() {
        runner.await.unwrap().unwrap();
    }
}
