//! Out-of-band exchange of sampling decisions between peer ingesters.
//!
//! Any node may receive any span of a trace, so locally made "sampled"
//! decisions are published into a shared Elasticsearch datastream and every
//! node subscribes to the decisions of its peers. The subscriber tracks its
//! resume position by `_seq_no` and persists it next to the event storage,
//! so a restarted node continues where it left off instead of replaying the
//! whole stream. Replayed or duplicate decisions are harmless: the decision
//! index is consulted before any forwarding.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::elasticsearch::ElasticsearchClient;
use crate::error::{EsError, SamplingError};

/// File inside the storage directory holding the subscriber position.
pub const SUBSCRIBER_POSITION_FILE: &str = "subscriber_position.json";

/// Maximum decisions carried by one `_bulk` request / returned per search.
const MAX_BATCH_SIZE: usize = 1000;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Addressing for a `type-dataset-namespace` datastream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataStreamConfig {
    pub stream_type: String,
    pub dataset: String,
    pub namespace: String,
}

impl DataStreamConfig {
    /// The sampled-traces datastream for a namespace.
    pub fn sampled_traces(namespace: &str) -> Self {
        DataStreamConfig {
            stream_type: "traces".to_owned(),
            dataset: "apm.sampled".to_owned(),
            namespace: namespace.to_owned(),
        }
    }

    pub fn name(&self) -> String {
        format!("{}-{}-{}", self.stream_type, self.dataset, self.namespace)
    }
}

/// Subscriber resume position, persisted as JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberPosition {
    pub last_seq_no: Option<u64>,
}

impl SubscriberPosition {
    pub fn load(path: &Path) -> Self {
        match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(position) => position,
                Err(err) => {
                    warn!("discarding unreadable subscriber position: {err}");
                    SubscriberPosition::default()
                }
            },
            Err(_) => SubscriberPosition::default(),
        }
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let bytes = serde_json::to_vec(self).map_err(std::io::Error::other)?;
        std::fs::write(path, bytes)
    }
}

/// Configuration for [`Pubsub`].
pub struct PubsubConfig {
    pub client: Arc<ElasticsearchClient>,
    pub data_stream: DataStreamConfig,
    /// This node's stable observer id; its own decisions are filtered out
    /// of the subscription.
    pub beat_id: String,
    /// How often the subscriber polls for new remote decisions.
    pub search_interval: Duration,
    /// How long the publisher may linger before flushing a partial batch.
    pub flush_interval: Duration,
    /// Where the subscriber position file lives.
    pub position_path: PathBuf,
}

/// Publisher and subscriber for the sampled-traces datastream.
pub struct Pubsub {
    client: Arc<ElasticsearchClient>,
    data_stream: DataStreamConfig,
    beat_id: String,
    search_interval: Duration,
    flush_interval: Duration,
    position_path: PathBuf,
}

impl Pubsub {
    pub fn new(config: PubsubConfig) -> Self {
        Pubsub {
            client: config.client,
            data_stream: config.data_stream,
            beat_id: config.beat_id,
            search_interval: config.search_interval,
            flush_interval: config.flush_interval,
            position_path: config.position_path,
        }
    }

    /// Publishes locally sampled trace ids until the channel closes or the
    /// token is cancelled. Failed bulk requests are retried with exponential
    /// backoff; the pending batch is carried across retries and flushed one
    /// last time on shutdown.
    pub async fn publish_sampled_trace_ids(
        &self,
        mut trace_ids: mpsc::Receiver<String>,
        token: CancellationToken,
    ) -> Result<(), SamplingError> {
        let mut pending: Vec<String> = Vec::new();
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            tokio::select! {
                received = trace_ids.recv() => match received {
                    Some(trace_id) => {
                        pending.push(trace_id);
                        if pending.len() >= MAX_BATCH_SIZE {
                            self.flush_pending(&mut pending, &token).await;
                        }
                    }
                    None => {
                        self.flush_pending(&mut pending, &token).await;
                        return Ok(());
                    }
                },
                _ = ticker.tick() => {
                    self.flush_pending(&mut pending, &token).await;
                }
                _ = token.cancelled() => {
                    // Collect anything already queued, then best-effort flush.
                    while let Ok(trace_id) = trace_ids.try_recv() {
                        pending.push(trace_id);
                    }
                    self.flush_pending(&mut pending, &token).await;
                    return Ok(());
                }
            }
        }
    }

    async fn flush_pending(&self, pending: &mut Vec<String>, token: &CancellationToken) {
        if pending.is_empty() {
            return;
        }
        let body = self.bulk_body(pending);
        let index = self.data_stream.name();
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match self.client.bulk(&index, &body).await {
                Ok(()) => {
                    debug!(count = pending.len(), "published sampled trace ids");
                    pending.clear();
                    return;
                }
                Err(err) => {
                    warn!("failed to publish sampled trace ids: {err}");
                    if token.is_cancelled() {
                        // Shutting down; keep nothing, peers will re-derive
                        // from their own observations or the TTL will expire
                        // the buffered events.
                        pending.clear();
                        return;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = token.cancelled() => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    fn bulk_body(&self, trace_ids: &[String]) -> Vec<u8> {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let mut body = Vec::new();
        for trace_id in trace_ids {
            body.extend_from_slice(b"{\"create\":{}}\n");
            let doc = serde_json::json!({
                "@timestamp": timestamp_ms,
                "event": {"dataset": self.data_stream.dataset},
                "observer": {"id": self.beat_id},
                "trace": {"id": trace_id},
                "decision": "sampled",
            });
            body.extend_from_slice(doc.to_string().as_bytes());
            body.push(b'\n');
        }
        body
    }

    /// Polls the datastream for decisions made by peer observers, sending
    /// each discovered trace id into `remote_decisions`. The resume position
    /// is persisted after every batch and on shutdown.
    pub async fn subscribe_sampled_trace_ids(
        &self,
        remote_decisions: mpsc::Sender<String>,
        token: CancellationToken,
    ) -> Result<(), SamplingError> {
        let mut position = SubscriberPosition::load(&self.position_path);
        let mut backoff = INITIAL_BACKOFF;
        let mut ticker = tokio::time::interval(self.search_interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    self.persist_position(&position);
                    return Ok(());
                }
                _ = ticker.tick() => {
                    match self.search_once(&position).await {
                        Ok(hits) => {
                            backoff = INITIAL_BACKOFF;
                            if hits.is_empty() {
                                continue;
                            }
                            for (seq_no, trace_id) in hits {
                                if remote_decisions.send(trace_id).await.is_err() {
                                    self.persist_position(&position);
                                    return Ok(());
                                }
                                position.last_seq_no = Some(
                                    position.last_seq_no.map_or(seq_no, |last| last.max(seq_no)),
                                );
                            }
                            self.persist_position(&position);
                        }
                        Err(err) => {
                            warn!("failed to poll for remote sampling decisions: {err}");
                            tokio::select! {
                                _ = tokio::time::sleep(backoff) => {}
                                _ = token.cancelled() => {}
                            }
                            backoff = (backoff * 2).min(MAX_BACKOFF);
                        }
                    }
                }
            }
        }
    }

    fn persist_position(&self, position: &SubscriberPosition) {
        if let Err(err) = position.save(&self.position_path) {
            warn!("failed to persist subscriber position: {err}");
        }
    }

    async fn search_once(
        &self,
        position: &SubscriberPosition,
    ) -> Result<Vec<(u64, String)>, EsError> {
        let mut bool_query = serde_json::json!({
            "must_not": [{"term": {"observer.id": self.beat_id}}],
        });
        if let Some(seq_no) = position.last_seq_no {
            bool_query["filter"] =
                serde_json::json!([{"range": {"_seq_no": {"gt": seq_no}}}]);
        }
        let body = serde_json::json!({
            "size": MAX_BATCH_SIZE,
            "seq_no_primary_term": true,
            "sort": [{"_seq_no": "asc"}],
            "query": {"bool": bool_query},
        });

        let response = self.client.search(&self.data_stream.name(), &body).await?;
        let mut hits = Vec::new();
        if let Some(raw_hits) = response["hits"]["hits"].as_array() {
            for hit in raw_hits {
                let Some(seq_no) = hit["_seq_no"].as_u64() else {
                    continue;
                };
                let Some(trace_id) = hit["_source"]["trace"]["id"].as_str() else {
                    continue;
                };
                hits.push((seq_no, trace_id.to_owned()));
            }
        }
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elasticsearch::ElasticsearchConfig;
    use httptest::{matchers::*, responders::*, Expectation, Server};

    fn pubsub_for(server: &Server, dir: &Path) -> Pubsub {
        let client = Arc::new(
            ElasticsearchClient::new(&ElasticsearchConfig {
                base_url: server.url_str("/"),
                api_key: None,
                timeout: Duration::from_secs(2),
                compression_level: 5,
            })
            .unwrap(),
        );
        Pubsub::new(PubsubConfig {
            client,
            data_stream: DataStreamConfig::sampled_traces("default"),
            beat_id: "observer-a".to_owned(),
            search_interval: Duration::from_millis(50),
            flush_interval: Duration::from_millis(50),
            position_path: dir.join(SUBSCRIBER_POSITION_FILE),
        })
    }

    #[test]
    fn data_stream_name_follows_the_contract() {
        assert_eq!(
            DataStreamConfig::sampled_traces("default").name(),
            "traces-apm.sampled-default"
        );
    }

    #[test]
    fn position_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SUBSCRIBER_POSITION_FILE);

        assert_eq!(SubscriberPosition::load(&path), SubscriberPosition::default());
        let position = SubscriberPosition {
            last_seq_no: Some(42),
        };
        position.save(&path).unwrap();
        assert_eq!(SubscriberPosition::load(&path), position);
    }

    #[test]
    fn bulk_body_is_create_actions_with_observer_and_trace() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::run();
        let pubsub = pubsub_for(&server, dir.path());

        let body = pubsub.bulk_body(&["t1".to_owned(), "t2".to_owned()]);
        let lines: Vec<&str> = std::str::from_utf8(&body)
            .unwrap()
            .lines()
            .collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "{\"create\":{}}");
        let doc: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(doc["trace"]["id"], "t1");
        assert_eq!(doc["observer"]["id"], "observer-a");
        assert_eq!(doc["decision"], "sampled");
        assert_eq!(doc["event"]["dataset"], "apm.sampled");
    }

    #[tokio::test]
    async fn publisher_flushes_pending_ids_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "POST",
                "/traces-apm.sampled-default/_bulk",
            ))
            .times(1..)
            .respond_with(status_code(200)),
        );
        let pubsub = pubsub_for(&server, dir.path());

        let (tx, rx) = mpsc::channel(16);
        let token = CancellationToken::new();
        tx.send("t1".to_owned()).await.unwrap();
        drop(tx);
        pubsub.publish_sampled_trace_ids(rx, token).await.unwrap();
    }

    #[tokio::test]
    async fn subscriber_forwards_remote_ids_and_advances_position() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "POST",
                "/traces-apm.sampled-default/_search",
            ))
            .times(1..)
            .respond_with(json_encoded(serde_json::json!({
                "hits": {"hits": [
                    {"_seq_no": 7, "_source": {"trace": {"id": "remote-1"},
                                               "observer": {"id": "observer-b"}}},
                    {"_seq_no": 9, "_source": {"trace": {"id": "remote-2"},
                                               "observer": {"id": "observer-b"}}},
                ]}
            }))),
        );
        let pubsub = Arc::new(pubsub_for(&server, dir.path()));

        let (tx, mut rx) = mpsc::channel(16);
        let token = CancellationToken::new();
        let worker = {
            let pubsub = pubsub.clone();
            let token = token.clone();
            tokio::spawn(async move { pubsub.subscribe_sampled_trace_ids(tx, token).await })
        };

        assert_eq!(rx.recv().await.unwrap(), "remote-1");
        assert_eq!(rx.recv().await.unwrap(), "remote-2");
        token.cancel();
        worker.await.unwrap().unwrap();

        let position = SubscriberPosition::load(&dir.path().join(SUBSCRIBER_POSITION_FILE));
        assert_eq!(position.last_seq_no, Some(9));
    }

    #[tokio::test]
    async fn subscriber_resumes_from_persisted_position() {
        let dir = tempfile::tempdir().unwrap();
        let position_path = dir.path().join(SUBSCRIBER_POSITION_FILE);
        SubscriberPosition {
            last_seq_no: Some(41),
        }
        .save(&position_path)
        .unwrap();

        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/traces-apm.sampled-default/_search"),
                request::body(json_decoded(eq(serde_json::json!({
                    "size": 1000,
                    "seq_no_primary_term": true,
                    "sort": [{"_seq_no": "asc"}],
                    "query": {"bool": {
                        "must_not": [{"term": {"observer.id": "observer-a"}}],
                        "filter": [{"range": {"_seq_no": {"gt": 41}}}],
                    }},
                })))),
            ])
            .times(1..)
            .respond_with(json_encoded(serde_json::json!({"hits": {"hits": []}}))),
        );
        let pubsub = Arc::new(pubsub_for(&server, dir.path()));

        let (tx, _rx) = mpsc::channel(16);
        let token = CancellationToken::new();
        let worker = {
            let pubsub = pubsub.clone();
            let token = token.clone();
            tokio::spawn(async move { pubsub.subscribe_sampled_trace_ids(tx, token).await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        token.cancel();
        worker.await.unwrap().unwrap();
    }
}
