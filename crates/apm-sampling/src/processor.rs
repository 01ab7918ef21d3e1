//! The tail-sampling batch processor.
//!
//! Per trace, the processor moves through three states: observed (events
//! buffered in storage, no decision), sampled (decision recorded, buffered
//! events re-injected downstream), and unsampled (decision recorded,
//! buffered events purged). Decisions come from three places: synchronous
//! policy outcomes for boundary sample rates, the periodic reservoir
//! finalize pass, and remote decisions published by peer ingesters. The
//! decision index is always consulted first, which makes every one of those
//! paths idempotent.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use apm_model::monitoring::{self, Counter, Gauge};
use apm_model::{Batch, BatchProcessor, Event, EventKind, ManagedProcessor, ProcessingError};

use crate::elasticsearch::ElasticsearchClient;
use crate::error::{SamplingError, StorageError};
use crate::eventstorage::ShardedReadWriter;
use crate::groups::{AdmitDecision, TraceGroups, TraceGroupsConfig};
use crate::policy::Policy;
use crate::pubsub::{DataStreamConfig, Pubsub, PubsubConfig, SUBSCRIBER_POSITION_FILE};

/// Name of the monitoring registry exposing the sampler's state.
pub const MONITORING_REGISTRY: &str = "apm-server.sampling.tail";

/// Queue depth for locally sampled trace ids awaiting publication.
const PUBLISH_CHANNEL_BUFFER_SIZE: usize = 1024;

/// Queue depth for remote decisions received from the subscriber.
const REMOTE_CHANNEL_BUFFER_SIZE: usize = 1024;

/// Configuration for [`Processor`].
pub struct Config {
    /// Stable per-process observer id, tagged onto published decisions.
    pub beat_id: String,
    /// Interval between reservoir finalize passes.
    pub flush_interval: Duration,
    /// Cap on live (policy, service) sampling groups.
    pub max_dynamic_services: usize,
    /// Ordered sampling policies; first match wins.
    pub policies: Vec<Policy>,
    /// Rate applied when no policy matches.
    pub default_sample_rate: f64,
    /// EWMA weight for new ingest-rate observations, in `(0, 1]`.
    pub ingest_rate_decay_factor: f64,
    /// Event storage shared with the rest of the process.
    pub storage: Arc<ShardedReadWriter>,
    /// Directory holding storage-adjacent state (subscriber position).
    pub storage_dir: PathBuf,
    pub storage_gc_interval: Duration,
    pub elasticsearch: Arc<ElasticsearchClient>,
    pub sampled_traces_data_stream: DataStreamConfig,
    /// Receives both pass-through batches and re-injected trace events.
    pub downstream: Arc<dyn BatchProcessor>,
}

struct TailMetrics {
    events_processed: Counter,
    events_stored: Counter,
    events_dropped: Counter,
    dropped_buffering: Counter,
    traces_sampled: Counter,
    traces_unsampled: Counter,
    remote_decisions_unmatched: Counter,
    dynamic_service_groups: Gauge,
}

/// Tail-based trace sampler.
pub struct Processor {
    flush_interval: Duration,
    storage_gc_interval: Duration,
    storage: Arc<ShardedReadWriter>,
    groups: Mutex<TraceGroups>,
    downstream: Arc<dyn BatchProcessor>,
    pubsub: Arc<Pubsub>,
    publish_tx: mpsc::Sender<String>,
    publish_rx: Mutex<Option<mpsc::Receiver<String>>>,
    stop: CancellationToken,
    stopped_tx: watch::Sender<bool>,
    stopped_rx: watch::Receiver<bool>,
    running: AtomicBool,
    metrics: TailMetrics,
}

impl Processor {
    pub fn new(config: Config) -> Result<Self, SamplingError> {
        if config.beat_id.is_empty() {
            return Err(SamplingError::Config("beat_id must not be empty".to_owned()));
        }
        if config.flush_interval.is_zero() {
            return Err(SamplingError::Config(
                "flush_interval must be greater than zero".to_owned(),
            ));
        }
        if config.storage_gc_interval.is_zero() {
            return Err(SamplingError::Config(
                "storage_gc_interval must be greater than zero".to_owned(),
            ));
        }
        if config.max_dynamic_services == 0 {
            return Err(SamplingError::Config(
                "max_dynamic_services must be greater than zero".to_owned(),
            ));
        }
        if !(0.0..=1.0).contains(&config.default_sample_rate) {
            return Err(SamplingError::Config(
                "default_sample_rate must be within [0, 1]".to_owned(),
            ));
        }
        if !(config.ingest_rate_decay_factor > 0.0 && config.ingest_rate_decay_factor <= 1.0) {
            return Err(SamplingError::Config(
                "ingest_rate_decay_factor must be within (0, 1]".to_owned(),
            ));
        }
        for policy in &config.policies {
            if !(0.0..=1.0).contains(&policy.sample_rate) {
                return Err(SamplingError::Config(format!(
                    "policy sample_rate {} is outside [0, 1]",
                    policy.sample_rate
                )));
            }
        }

        let groups = TraceGroups::new(TraceGroupsConfig {
            policies: config.policies,
            default_sample_rate: config.default_sample_rate,
            max_dynamic_services: config.max_dynamic_services,
            flush_interval: config.flush_interval,
            ingest_rate_decay_factor: config.ingest_rate_decay_factor,
        });
        let pubsub = Pubsub::new(PubsubConfig {
            client: config.elasticsearch,
            data_stream: config.sampled_traces_data_stream,
            beat_id: config.beat_id,
            search_interval: config.flush_interval,
            flush_interval: config.flush_interval,
            position_path: config.storage_dir.join(SUBSCRIBER_POSITION_FILE),
        });
        let (publish_tx, publish_rx) = mpsc::channel(PUBLISH_CHANNEL_BUFFER_SIZE);
        let (stopped_tx, stopped_rx) = watch::channel(false);

        let registry = monitoring::registry(MONITORING_REGISTRY);
        Ok(Processor {
            flush_interval: config.flush_interval,
            storage_gc_interval: config.storage_gc_interval,
            storage: config.storage,
            groups: Mutex::new(groups),
            downstream: config.downstream,
            pubsub: Arc::new(pubsub),
            publish_tx,
            publish_rx: Mutex::new(Some(publish_rx)),
            stop: CancellationToken::new(),
            stopped_tx,
            stopped_rx,
            running: AtomicBool::new(false),
            metrics: TailMetrics {
                events_processed: registry.counter("events_processed"),
                events_stored: registry.counter("events_stored"),
                events_dropped: registry.counter("events_dropped"),
                dropped_buffering: registry.counter("dropped_buffering"),
                traces_sampled: registry.counter("traces_sampled"),
                traces_unsampled: registry.counter("traces_unsampled"),
                remote_decisions_unmatched: registry.counter("remote_decisions_unmatched"),
                dynamic_service_groups: registry.gauge("dynamic_service_groups"),
            },
        })
    }

    /// Buffers an undecided event. Storage pressure fails open: the event is
    /// forwarded raw instead of lost; other write failures drop it.
    async fn buffer(&self, trace_id: &str, event: Event, kept: &mut Vec<Event>) {
        match self.storage.write_event(trace_id, &event).await {
            Ok(()) => {
                self.metrics.events_stored.inc();
            }
            Err(StorageError::LimitReached { .. }) => {
                self.metrics.dropped_buffering.inc();
                kept.push(event);
            }
            Err(err) => {
                warn!(trace_id, "failed to buffer event: {err}");
                self.metrics.events_dropped.inc();
            }
        }
    }

    /// Commits a local keep decision. Returns whether the triggering event
    /// should be forwarded.
    async fn finalize_sampled(&self, trace_id: &str) -> Result<bool, SamplingError> {
        match self.storage.write_decision(trace_id, true).await {
            Ok(()) => {
                self.metrics.traces_sampled.inc();
                if self.publish_tx.try_send(trace_id.to_owned()).is_err() {
                    warn!(trace_id, "publish queue full, peer nodes will not see this decision");
                }
                self.flush_buffered(trace_id).await?;
                Ok(true)
            }
            Err(StorageError::AlreadyDecided { .. }) => {
                // Lost the race against the flush pass or a remote decision;
                // the winner owns the buffered events.
                debug!(trace_id, "trace already decided");
                Ok(self.storage.read_decision(trace_id)? == Some(true))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Commits a local drop decision. Returns whether the triggering event
    /// should be forwarded (only when a concurrent keep decision won).
    async fn finalize_unsampled(&self, trace_id: &str) -> Result<bool, SamplingError> {
        match self.storage.write_decision(trace_id, false).await {
            Ok(()) => {
                self.metrics.traces_unsampled.inc();
                self.storage.delete_trace_events(trace_id).await?;
                Ok(false)
            }
            Err(StorageError::AlreadyDecided { .. }) => {
                debug!(trace_id, "trace already decided");
                Ok(self.storage.read_decision(trace_id)? == Some(true))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Re-injects the buffered events of a sampled trace downstream, then
    /// removes them. Returns how many events were forwarded.
    async fn flush_buffered(&self, trace_id: &str) -> Result<usize, SamplingError> {
        // Drain the owning shard so the scan observes every buffered write.
        self.storage.sync_trace(trace_id).await?;

        let mut stored = Batch::new();
        for item in self.storage.read_events(trace_id) {
            match item {
                Ok(event) => stored.push(event),
                Err(err) => {
                    warn!(trace_id, "aborting storage scan: {err}");
                    break;
                }
            }
        }
        let forwarded = stored.len();
        if forwarded > 0 {
            self.downstream
                .process_batch(&mut stored)
                .await
                .map_err(SamplingError::Downstream)?;
        }
        self.storage.delete_trace_events(trace_id).await?;
        Ok(forwarded)
    }

    /// Drains the reservoirs and commits this interval's decisions.
    async fn flush_decisions(&self) -> Result<(), SamplingError> {
        let finalized = {
            let mut groups = self.groups.lock().expect("sampling groups poisoned");
            let finalized = groups.finalize();
            self.metrics
                .dynamic_service_groups
                .set(groups.dynamic_service_count() as i64);
            finalized
        };

        for trace_id in finalized.sampled {
            match self.storage.write_decision(&trace_id, true).await {
                Ok(()) => {
                    self.metrics.traces_sampled.inc();
                    if self.publish_tx.try_send(trace_id.clone()).is_err() {
                        warn!(
                            trace_id,
                            "publish queue full, peer nodes will not see this decision"
                        );
                    }
                    match self.flush_buffered(&trace_id).await {
                        Ok(_) => {}
                        Err(err @ SamplingError::Downstream(_)) => return Err(err),
                        Err(err) => warn!(trace_id, "failed to flush sampled trace: {err}"),
                    }
                }
                Err(StorageError::AlreadyDecided { .. }) => {}
                Err(err) => warn!(trace_id, "failed to record keep decision: {err}"),
            }
        }
        for trace_id in finalized.unsampled {
            match self.storage.write_decision(&trace_id, false).await {
                Ok(()) => {
                    self.metrics.traces_unsampled.inc();
                    if let Err(err) = self.storage.delete_trace_events(&trace_id).await {
                        warn!(trace_id, "failed to purge unsampled trace: {err}");
                    }
                }
                Err(StorageError::AlreadyDecided { .. }) => {}
                Err(err) => warn!(trace_id, "failed to record drop decision: {err}"),
            }
        }
        Ok(())
    }

    /// Applies a keep decision published by a peer. No local decision entry
    /// is written; the remote observer owns it.
    async fn handle_remote_decision(&self, trace_id: &str) {
        match self.storage.read_decision(trace_id) {
            Ok(Some(_)) => return, // already settled locally
            Ok(None) => {}
            Err(err) => {
                warn!(trace_id, "failed to read decision index: {err}");
                return;
            }
        }
        match self.flush_buffered(trace_id).await {
            Ok(0) => self.metrics.remote_decisions_unmatched.inc(),
            Ok(count) => debug!(trace_id, count, "forwarded trace on remote decision"),
            Err(err) => warn!(trace_id, "failed to apply remote decision: {err}"),
        }
    }

    async fn run_inner(&self) -> Result<(), SamplingError> {
        let publish_rx = self
            .publish_rx
            .lock()
            .expect("publish receiver poisoned")
            .take()
            .ok_or(SamplingError::AlreadyRunning)?;
        let token = self.stop.clone();
        let (remote_tx, mut remote_rx) = mpsc::channel::<String>(REMOTE_CHANNEL_BUFFER_SIZE);

        let mut workers: JoinSet<Result<(), SamplingError>> = JoinSet::new();
        {
            let storage = Arc::clone(&self.storage);
            let gc_interval = self.storage_gc_interval;
            let token = token.child_token();
            workers.spawn(async move {
                storage
                    .run_gc(gc_interval, token)
                    .await
                    .map_err(SamplingError::from)
            });
        }
        {
            let pubsub = Arc::clone(&self.pubsub);
            let token = token.child_token();
            workers
                .spawn(async move { pubsub.publish_sampled_trace_ids(publish_rx, token).await });
        }
        {
            let pubsub = Arc::clone(&self.pubsub);
            let token = token.child_token();
            workers
                .spawn(async move { pubsub.subscribe_sampled_trace_ids(remote_tx, token).await });
        }

        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.tick().await; // first tick fires immediately; skip it
        let mut remote_open = true;
        let result = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.flush_decisions().await {
                        break Err(err);
                    }
                }
                remote = remote_rx.recv(), if remote_open => match remote {
                    Some(trace_id) => self.handle_remote_decision(&trace_id).await,
                    None => remote_open = false,
                },
                joined = workers.join_next() => match joined {
                    None => break Ok(()),
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(err))) => break Err(err),
                    Some(Err(join_err)) => {
                        break Err(SamplingError::WorkerPanic(join_err.to_string()));
                    }
                },
                _ = token.cancelled() => break Ok(()),
            }
        };

        // Drain: commit outstanding decisions and make buffered state
        // durable, regardless of how the loop ended.
        token.cancel();
        if let Err(err) = self.flush_decisions().await {
            warn!("final decision flush failed: {err}");
        }
        if let Err(err) = self.storage.flush_all().await {
            warn!("final storage flush failed: {err}");
        }
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("sampling worker exited with error: {err}"),
                Err(join_err) => warn!("sampling worker panicked: {join_err}"),
            }
        }
        info!("tail sampler stopped");
        result
    }
}

#[async_trait]
impl BatchProcessor for Processor {
    async fn process_batch(&self, batch: &mut Batch) -> Result<(), ProcessingError> {
        if self.stop.is_cancelled() {
            return Err(ProcessingError::Stopped);
        }
        let events = batch.take();
        let mut kept = Vec::with_capacity(events.len());
        for event in events {
            self.metrics.events_processed.inc();
            let Some(trace_id) = event.trace_id.clone() else {
                kept.push(event);
                continue;
            };
            // Aggregator output is never trace-buffered.
            if event.kind == EventKind::Metric {
                kept.push(event);
                continue;
            }

            let decision = match self.storage.read_decision(&trace_id) {
                Ok(decision) => decision,
                Err(err) => {
                    warn!(trace_id, "failed to read decision index: {err}");
                    None
                }
            };
            match decision {
                Some(true) => kept.push(event),
                Some(false) => self.metrics.events_dropped.inc(),
                None if event.is_trace_root() => {
                    let admit = self
                        .groups
                        .lock()
                        .expect("sampling groups poisoned")
                        .observe_root(&event);
                    match admit {
                        AdmitDecision::Sampled => match self.finalize_sampled(&trace_id).await {
                            Ok(true) => kept.push(event),
                            Ok(false) => self.metrics.events_dropped.inc(),
                            Err(err) => {
                                // Decision write failed: still observing, a
                                // later event retries.
                                warn!(trace_id, "failed to commit keep decision: {err}");
                                self.buffer(&trace_id, event, &mut kept).await;
                            }
                        },
                        AdmitDecision::Unsampled => {
                            match self.finalize_unsampled(&trace_id).await {
                                Ok(true) => kept.push(event),
                                Ok(false) => self.metrics.events_dropped.inc(),
                                Err(err) => {
                                    warn!(trace_id, "failed to commit drop decision: {err}");
                                    self.buffer(&trace_id, event, &mut kept).await;
                                }
                            }
                        }
                        AdmitDecision::Pending => {
                            self.buffer(&trace_id, event, &mut kept).await;
                        }
                    }
                }
                None => self.buffer(&trace_id, event, &mut kept).await,
            }
        }
        *batch = Batch::from(kept);
        Ok(())
    }
}

#[async_trait]
impl ManagedProcessor for Processor {
    async fn run(&self) -> Result<(), ProcessingError> {
        self.running.store(true, Ordering::Release);
        let result = self.run_inner().await;
        let _ = self.stopped_tx.send(true);
        result.map_err(ProcessingError::from)
    }

    async fn stop(&self, timeout: Duration) -> Result<(), ProcessingError> {
        self.stop.cancel();
        if !self.running.load(Ordering::Acquire) {
            // run() was never started; flush inline within the deadline.
            let drain = async {
                self.flush_decisions().await?;
                self.storage.flush_all().await.map_err(SamplingError::from)
            };
            return match tokio::time::timeout(timeout, drain).await {
                Ok(result) => result.map_err(ProcessingError::from),
                Err(_) => Err(ProcessingError::ShutdownIncomplete),
            };
        }
        let mut stopped = self.stopped_rx.clone();
        let wait = async {
            while !*stopped.borrow_and_update() {
                if stopped.changed().await.is_err() {
                    break;
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ProcessingError::ShutdownIncomplete)
    }
}
