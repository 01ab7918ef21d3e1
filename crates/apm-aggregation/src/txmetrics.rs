//! Transaction-metrics aggregation.
//!
//! Transactions are grouped by their identity tuple (service, name, type,
//! result, outcome, global labels) and each group accumulates an HDR
//! histogram over `duration_us`, weighted by the inverse of the agent's
//! head sampling rate. A background worker rotates the group table every
//! interval and publishes one `transaction` metricset per group to the
//! downstream processor.
//!
//! Rotation swaps in an empty table under a short lock, so ingest never
//! contends with serialization of the outgoing metricsets. The group table
//! is bounded: once `max_transaction_groups` distinct keys exist, further
//! keys fold into a single overflow group named `"other"`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hdrhistogram::Histogram;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use apm_model::monitoring::{self, Counter, Gauge};
use apm_model::{
    Batch, BatchProcessor, Event, EventKind, ManagedProcessor, MetricSample, MetricValue,
    Metricset, Outcome, ProcessingError, Service,
};

use crate::{epoch_micros, AggregationError};

/// Name of the monitoring registry exposing this aggregator's state.
pub const MONITORING_REGISTRY: &str = "apm-server.aggregation.txmetrics";

/// Transaction name assigned to the overflow group.
const OVERFLOW_TRANSACTION_NAME: &str = "other";

/// Upper bound recorded into histograms: 30 minutes in microseconds.
/// Durations above it are clamped, trading the tail for bounded memory.
const MAX_DURATION_US: u64 = 30 * 60 * 1_000_000;

/// Configuration for [`Aggregator`].
pub struct AggregatorConfig {
    /// Processor receiving the emitted metricsets.
    pub downstream: Arc<dyn BatchProcessor>,
    /// Maximum number of distinct transaction groups held between flushes.
    pub max_transaction_groups: usize,
    /// Interval between metricset publications.
    pub interval: Duration,
    /// HDR histogram precision, in significant figures (1..=5).
    pub significant_figures: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TxKey {
    service_name: String,
    service_environment: String,
    transaction_name: String,
    transaction_type: String,
    result: String,
    outcome: Outcome,
    labels: BTreeMap<String, String>,
}

struct TxGroup {
    histogram: Histogram<u64>,
}

struct Tables {
    groups: HashMap<TxKey, TxGroup>,
    window_start_us: u64,
}

struct Metrics {
    active_groups: Gauge,
    overflowed: Counter,
    flushes: Counter,
}

/// Aggregates transactions into HDR-histogram metricsets.
pub struct Aggregator {
    downstream: Arc<dyn BatchProcessor>,
    max_groups: usize,
    interval: Duration,
    template: Histogram<u64>,
    tables: Mutex<Tables>,
    stop: CancellationToken,
    stopped_tx: watch::Sender<bool>,
    stopped_rx: watch::Receiver<bool>,
    running: AtomicBool,
    metrics: Metrics,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig) -> Result<Self, AggregationError> {
        if config.max_transaction_groups == 0 {
            return Err(AggregationError::Config(
                "max_transaction_groups must be greater than zero".to_owned(),
            ));
        }
        if config.interval.is_zero() {
            return Err(AggregationError::Config(
                "interval must be greater than zero".to_owned(),
            ));
        }
        if !(1..=5).contains(&config.significant_figures) {
            return Err(AggregationError::Config(format!(
                "significant_figures must be between 1 and 5, got {}",
                config.significant_figures
            )));
        }

        let template = Histogram::new_with_bounds(1, MAX_DURATION_US, config.significant_figures)
            .map_err(|err| AggregationError::Config(format!("histogram bounds: {err}")))?;

        let registry = monitoring::registry(MONITORING_REGISTRY);
        let (stopped_tx, stopped_rx) = watch::channel(false);
        Ok(Aggregator {
            downstream: config.downstream,
            max_groups: config.max_transaction_groups,
            interval: config.interval,
            template,
            tables: Mutex::new(Tables {
                groups: HashMap::new(),
                window_start_us: epoch_micros(),
            }),
            stop: CancellationToken::new(),
            stopped_tx,
            stopped_rx,
            running: AtomicBool::new(false),
            metrics: Metrics {
                active_groups: registry.gauge("active_groups"),
                overflowed: registry.counter("overflowed"),
                flushes: registry.counter("flushes"),
            },
        })
    }

    fn record(&self, event: &Event) {
        let Some(tx) = &event.transaction else {
            return;
        };
        let key = TxKey {
            service_name: event.service.name.clone(),
            service_environment: event.service.environment.clone(),
            transaction_name: tx.name.clone(),
            transaction_type: tx.transaction_type.clone(),
            result: tx.result.clone(),
            outcome: tx.outcome,
            labels: event.labels.clone(),
        };
        let weight = sample_rate_weight(tx.sample_rate);
        let duration = tx.duration_us.clamp(1, MAX_DURATION_US);

        let mut tables = self.tables.lock().expect("transaction tables poisoned");
        let at_capacity = tables.groups.len() >= self.max_groups;
        let key = if at_capacity && !tables.groups.contains_key(&key) {
            self.metrics.overflowed.inc();
            overflow_key()
        } else {
            key
        };
        let group = tables.groups.entry(key).or_insert_with(|| TxGroup {
            histogram: self.template.clone(),
        });
        if let Err(err) = group.histogram.record_n(duration, weight) {
            warn!(duration, weight, "failed to record transaction duration: {err}");
        }
        self.metrics.active_groups.set(tables.groups.len() as i64);
    }

    /// Rotates the group table and publishes one metricset per group.
    async fn publish(&self) -> Result<(), AggregationError> {
        let now_us = epoch_micros();
        let (groups, window_start_us) = {
            let mut tables = self.tables.lock().expect("transaction tables poisoned");
            let window_start_us = tables.window_start_us;
            tables.window_start_us = now_us;
            (std::mem::take(&mut tables.groups), window_start_us)
        };
        self.metrics.active_groups.set(0);
        if groups.is_empty() {
            return Ok(());
        }

        let mut batch = Batch::new();
        for (key, group) in groups {
            batch.push(metricset_event(key, &group, window_start_us, now_us));
        }
        debug!(metricsets = batch.len(), "publishing transaction metrics");
        self.downstream
            .process_batch(&mut batch)
            .await
            .map_err(AggregationError::Publish)?;
        self.metrics.flushes.inc();
        Ok(())
    }
}

fn sample_rate_weight(sample_rate: f64) -> u64 {
    if sample_rate > 0.0 && sample_rate < 1.0 {
        (1.0 / sample_rate).round().max(1.0) as u64
    } else {
        1
    }
}

// A single shared bucket so the table never exceeds max_groups + 1 entries,
// whatever mix of services overflows.
fn overflow_key() -> TxKey {
    TxKey {
        service_name: String::new(),
        service_environment: String::new(),
        transaction_name: OVERFLOW_TRANSACTION_NAME.to_owned(),
        transaction_type: String::new(),
        result: String::new(),
        outcome: Outcome::Unknown,
        labels: BTreeMap::new(),
    }
}

fn metricset_event(key: TxKey, group: &TxGroup, start_us: u64, end_us: u64) -> Event {
    let mut values = Vec::new();
    let mut counts = Vec::new();
    let mut sum = 0u64;
    for bucket in group.histogram.iter_recorded() {
        values.push(bucket.value_iterated_to());
        counts.push(bucket.count_at_value());
        sum += bucket.value_iterated_to() * bucket.count_at_value();
    }
    let total = group.histogram.len();

    let mut labels = key.labels;
    labels.insert("transaction.name".to_owned(), key.transaction_name);
    labels.insert("transaction.type".to_owned(), key.transaction_type);
    labels.insert("transaction.result".to_owned(), key.result);
    labels.insert("event.outcome".to_owned(), key.outcome.as_str().to_owned());

    let mut event = Event::from_metricset(
        uuid::Uuid::new_v4().to_string(),
        end_us,
        Service {
            name: key.service_name,
            environment: key.service_environment,
            language: String::new(),
        },
        Metricset {
            name: "transaction".to_owned(),
            interval_start_us: start_us,
            interval_end_us: end_us,
            samples: vec![
                MetricSample {
                    name: "transaction.duration.count".to_owned(),
                    value: MetricValue::Single(total as f64),
                },
                MetricSample {
                    name: "transaction.duration.sum.us".to_owned(),
                    value: MetricValue::Single(sum as f64),
                },
                MetricSample {
                    name: "transaction.duration.histogram".to_owned(),
                    value: MetricValue::Histogram { values, counts },
                },
            ],
        },
    );
    event.labels = labels;
    event
}

#[async_trait]
impl BatchProcessor for Aggregator {
    async fn process_batch(&self, batch: &mut Batch) -> Result<(), ProcessingError> {
        for event in batch.iter() {
            if event.kind == EventKind::Transaction {
                self.record(event);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ManagedProcessor for Aggregator {
    async fn run(&self) -> Result<(), ProcessingError> {
        self.running.store(true, Ordering::Release);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await; // first tick fires immediately; skip it
        let result = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.publish().await {
                        break Err(err);
                    }
                }
                _ = self.stop.cancelled() => {
                    // Final rotation so the last partial interval is not lost.
                    break self.publish().await;
                }
            }
        };
        let _ = self.stopped_tx.send(true);
        result.map_err(ProcessingError::from)
    }

    async fn stop(&self, timeout: Duration) -> Result<(), ProcessingError> {
        self.stop.cancel();
        if !self.running.load(Ordering::Acquire) {
            // run() was never started; flush inline.
            return self.publish().await.map_err(ProcessingError::from);
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

#[cfg(test)]
mod tests {
    use super::*;
    use apm_model::test_support::{transaction_event, SinkProcessor};

    fn new_aggregator(sink: Arc<SinkProcessor>, max_groups: usize) -> Aggregator {
        Aggregator::new(AggregatorConfig {
            downstream: sink,
            max_transaction_groups: max_groups,
            interval: Duration::from_secs(1),
            significant_figures: 2,
        })
        .unwrap()
    }

    fn histogram_sample(event: &Event) -> (Vec<u64>, Vec<u64>) {
        let set = event.metricset.as_ref().unwrap();
        for sample in &set.samples {
            if let MetricValue::Histogram { values, counts } = &sample.value {
                return (values.clone(), counts.clone());
            }
        }
        panic!("no histogram sample in metricset");
    }

    #[test]
    fn rejects_invalid_configuration() {
        let sink = Arc::new(SinkProcessor::default());
        for (groups, interval, figures) in [
            (0, Duration::from_secs(1), 2u8),
            (10, Duration::ZERO, 2),
            (10, Duration::from_secs(1), 0),
            (10, Duration::from_secs(1), 6),
        ] {
            let result = Aggregator::new(AggregatorConfig {
                downstream: sink.clone(),
                max_transaction_groups: groups,
                interval,
                significant_figures: figures,
            });
            assert!(result.is_err());
        }
    }

    #[tokio::test]
    async fn groups_by_transaction_identity() {
        let sink = Arc::new(SinkProcessor::default());
        let agg = new_aggregator(sink.clone(), 100);

        let mut batch = Batch::from(vec![
            transaction_event("t1", "e1", "svc-a", "GET /"),
            transaction_event("t2", "e2", "svc-a", "GET /"),
            transaction_event("t3", "e3", "svc-a", "POST /"),
        ]);
        agg.process_batch(&mut batch).await.unwrap();
        // Input batch passes through untouched.
        assert_eq!(batch.len(), 3);

        agg.publish().await.unwrap();
        let emitted = sink.events();
        assert_eq!(emitted.len(), 2);
        let counts: Vec<f64> = emitted
            .iter()
            .map(|e| match e.metricset.as_ref().unwrap().samples[0].value {
                MetricValue::Single(v) => v,
                _ => panic!("count sample is not scalar"),
            })
            .collect();
        let mut sorted = counts.clone();
        sorted.sort_by(f64::total_cmp);
        assert_eq!(sorted, vec![1.0, 2.0]);
    }

    #[tokio::test]
    async fn sample_rate_extrapolates_counts() {
        let sink = Arc::new(SinkProcessor::default());
        let agg = new_aggregator(sink.clone(), 100);

        let mut event = transaction_event("t1", "e1", "svc", "GET /");
        event.transaction.as_mut().unwrap().sample_rate = 0.25;
        let mut batch = Batch::from(vec![event]);
        agg.process_batch(&mut batch).await.unwrap();

        agg.publish().await.unwrap();
        let emitted = sink.events();
        assert_eq!(emitted.len(), 1);
        let (_, counts) = histogram_sample(&emitted[0]);
        assert_eq!(counts.iter().sum::<u64>(), 4);
    }

    #[tokio::test]
    async fn overflow_folds_into_single_other_group() {
        let sink = Arc::new(SinkProcessor::default());
        let agg = new_aggregator(sink.clone(), 2);

        let mut batch = Batch::from(
            (0..5)
                .map(|i| transaction_event("t", &format!("e{i}"), "svc", &format!("tx-{i}")))
                .collect::<Vec<_>>(),
        );
        agg.process_batch(&mut batch).await.unwrap();

        agg.publish().await.unwrap();
        let emitted = sink.events();
        // Two regular groups plus the shared overflow bucket.
        assert_eq!(emitted.len(), 3);
        let other = emitted
            .iter()
            .find(|e| e.labels.get("transaction.name").map(String::as_str) == Some("other"))
            .expect("overflow metricset missing");
        let (_, counts) = histogram_sample(other);
        assert_eq!(counts.iter().sum::<u64>(), 3);

        let registry = monitoring::registry(MONITORING_REGISTRY);
        assert!(registry.snapshot().get("overflowed").copied().unwrap_or(0) >= 3);
    }

    #[tokio::test]
    async fn overflow_across_services_shares_one_bucket() {
        let sink = Arc::new(SinkProcessor::default());
        let agg = new_aggregator(sink.clone(), 1);

        let mut batch = Batch::from(vec![
            transaction_event("t1", "e1", "svc-a", "GET /"),
            transaction_event("t2", "e2", "svc-b", "GET /"),
            transaction_event("t3", "e3", "svc-c", "GET /"),
        ]);
        agg.process_batch(&mut batch).await.unwrap();

        agg.publish().await.unwrap();
        // One regular group plus exactly one overflow bucket, never more.
        assert_eq!(sink.events().len(), 2);
    }

    #[tokio::test]
    async fn histogram_precision_holds_for_sums() {
        let sink = Arc::new(SinkProcessor::default());
        let agg = new_aggregator(sink.clone(), 100);

        let durations: Vec<u64> = vec![1_000, 5_000, 25_000, 400_000];
        for (i, duration) in durations.iter().enumerate() {
            let mut event = transaction_event("t", &format!("e{i}"), "svc", "GET /");
            event.transaction.as_mut().unwrap().duration_us = *duration;
            let mut batch = Batch::from(vec![event]);
            agg.process_batch(&mut batch).await.unwrap();
        }

        agg.publish().await.unwrap();
        let emitted = sink.events();
        let set = emitted[0].metricset.as_ref().unwrap();
        let sum = match set.samples[1].value {
            MetricValue::Single(v) => v,
            _ => panic!("sum sample is not scalar"),
        };
        let expected: u64 = durations.iter().sum();
        // Two significant figures bound the relative error of each value.
        assert!((sum - expected as f64).abs() / (expected as f64) < 0.02);
    }

    #[tokio::test]
    async fn publish_rotates_without_dropping_new_events() {
        let sink = Arc::new(SinkProcessor::default());
        let agg = new_aggregator(sink.clone(), 100);

        let mut batch = Batch::from(vec![transaction_event("t1", "e1", "svc", "GET /")]);
        agg.process_batch(&mut batch).await.unwrap();
        agg.publish().await.unwrap();
        assert_eq!(sink.events().len(), 1);
        sink.clear();

        // Nothing buffered: the next publish emits nothing.
        agg.publish().await.unwrap();
        assert!(sink.events().is_empty());

        // Events recorded after rotation land in the next window.
        let mut batch = Batch::from(vec![transaction_event("t2", "e2", "svc", "GET /")]);
        agg.process_batch(&mut batch).await.unwrap();
        agg.publish().await.unwrap();
        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test]
    async fn stop_flushes_pending_groups() {
        let sink = Arc::new(SinkProcessor::default());
        let agg = new_aggregator(sink.clone(), 100);

        let mut batch = Batch::from(vec![transaction_event("t1", "e1", "svc", "GET /")]);
        agg.process_batch(&mut batch).await.unwrap();

        agg.stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test]
    async fn run_publishes_on_interval_and_stops_cleanly() {
        let sink = Arc::new(SinkProcessor::default());
        let agg = Arc::new(new_aggregator(sink.clone(), 100));

        let mut batch = Batch::from(vec![transaction_event("t1", "e1", "svc", "GET /")]);
        agg.process_batch(&mut batch).await.unwrap();

        let runner = {
            let agg = agg.clone();
            tokio::spawn(async move { agg.run().await })
        };
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(sink.events().len(), 1);

        agg.stop(Duration::from_secs(1)).await.unwrap();
        runner.await.unwrap().unwrap();
    }
}
