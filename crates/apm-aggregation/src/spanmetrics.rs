//! Service-destination metrics aggregation.
//!
//! For every span carrying a `destination.service.resource`, a counter and a
//! summed duration are kept per (service, destination, outcome) tuple and
//! published as `service_destination` metricsets each interval. Unlike the
//! transaction aggregator there is no distribution, only totals, so groups
//! are cheap and the table simply folds into an `"other"` bucket when full.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use apm_model::monitoring::{self, Counter, Gauge};
use apm_model::{
    Batch, BatchProcessor, Event, EventKind, ManagedProcessor, MetricSample, MetricValue,
    Metricset, Outcome, ProcessingError, Service,
};

use crate::{epoch_micros, AggregationError};

/// Name of the monitoring registry exposing this aggregator's state.
pub const MONITORING_REGISTRY: &str = "apm-server.aggregation.servicedestinations";

/// Destination resource assigned to the overflow group.
const OVERFLOW_RESOURCE: &str = "other";

/// Configuration for [`Aggregator`].
pub struct AggregatorConfig {
    /// Processor receiving the emitted metricsets.
    pub downstream: Arc<dyn BatchProcessor>,
    /// Maximum number of distinct destination groups held between flushes.
    pub max_groups: usize,
    /// Interval between metricset publications.
    pub interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SpanKey {
    service_name: String,
    service_environment: String,
    resource: String,
    outcome: Outcome,
}

#[derive(Debug, Default)]
struct SpanGroup {
    count: f64,
    sum_us: f64,
}

struct Tables {
    groups: HashMap<SpanKey, SpanGroup>,
    window_start_us: u64,
}

struct Metrics {
    active_groups: Gauge,
    overflowed: Counter,
    flushes: Counter,
}

/// Aggregates exit spans into per-destination summary metricsets.
pub struct Aggregator {
    downstream: Arc<dyn BatchProcessor>,
    max_groups: usize,
    interval: Duration,
    tables: Mutex<Tables>,
    stop: CancellationToken,
    stopped_tx: watch::Sender<bool>,
    stopped_rx: watch::Receiver<bool>,
    running: AtomicBool,
    metrics: Metrics,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig) -> Result<Self, AggregationError> {
        if config.max_groups == 0 {
            return Err(AggregationError::Config(
                "max_groups must be greater than zero".to_owned(),
            ));
        }
        if config.interval.is_zero() {
            return Err(AggregationError::Config(
                "interval must be greater than zero".to_owned(),
            ));
        }

        let registry = monitoring::registry(MONITORING_REGISTRY);
        let (stopped_tx, stopped_rx) = watch::channel(false);
        Ok(Aggregator {
            downstream: config.downstream,
            max_groups: config.max_groups,
            interval: config.interval,
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
        let Some(span) = &event.span else { return };
        let Some(resource) = &span.destination_resource else {
            return;
        };
        let key = SpanKey {
            service_name: event.service.name.clone(),
            service_environment: event.service.environment.clone(),
            resource: resource.clone(),
            outcome: span.outcome,
        };
        let weight = if span.sample_rate > 0.0 && span.sample_rate < 1.0 {
            1.0 / span.sample_rate
        } else {
            1.0
        };

        let mut tables = self.tables.lock().expect("span tables poisoned");
        let at_capacity = tables.groups.len() >= self.max_groups;
        let key = if at_capacity && !tables.groups.contains_key(&key) {
            self.metrics.overflowed.inc();
            // A single shared bucket keeps the table at max_groups + 1.
            SpanKey {
                service_name: String::new(),
                service_environment: String::new(),
                resource: OVERFLOW_RESOURCE.to_owned(),
                outcome: Outcome::Unknown,
            }
        } else {
            key
        };
        let group = tables.groups.entry(key).or_default();
        group.count += weight;
        group.sum_us += span.duration_us as f64 * weight;
        self.metrics.active_groups.set(tables.groups.len() as i64);
    }

    async fn publish(&self) -> Result<(), AggregationError> {
        let now_us = epoch_micros();
        let (groups, window_start_us) = {
            let mut tables = self.tables.lock().expect("span tables poisoned");
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
        debug!(metricsets = batch.len(), "publishing service destination metrics");
        self.downstream
            .process_batch(&mut batch)
            .await
            .map_err(AggregationError::Publish)?;
        self.metrics.flushes.inc();
        Ok(())
    }
}

fn metricset_event(key: SpanKey, group: &SpanGroup, start_us: u64, end_us: u64) -> Event {
    let mut event = Event::from_metricset(
        uuid::Uuid::new_v4().to_string(),
        end_us,
        Service {
            name: key.service_name,
            environment: key.service_environment,
            language: String::new(),
        },
        Metricset {
            name: "service_destination".to_owned(),
            interval_start_us: start_us,
            interval_end_us: end_us,
            samples: vec![
                MetricSample {
                    name: "destination.service.response_time.count".to_owned(),
                    value: MetricValue::Single(group.count),
                },
                MetricSample {
                    name: "destination.service.response_time.sum.us".to_owned(),
                    value: MetricValue::Single(group.sum_us),
                },
            ],
        },
    );
    event
        .labels
        .insert("destination.service.resource".to_owned(), key.resource);
    event.labels.insert(
        "event.outcome".to_owned(),
        key.outcome.as_str().to_owned(),
    );
    event
}

#[async_trait]
impl BatchProcessor for Aggregator {
    async fn process_batch(&self, batch: &mut Batch) -> Result<(), ProcessingError> {
        for event in batch.iter() {
            if event.kind == EventKind::Span {
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
    use apm_model::test_support::{span_event, SinkProcessor};

    fn exit_span(trace: &str, id: &str, resource: &str, duration_us: u64) -> Event {
        let mut event = span_event(trace, id, "svc", "SELECT");
        let span = event.span.as_mut().unwrap();
        span.destination_resource = Some(resource.to_owned());
        span.duration_us = duration_us;
        event
    }

    fn sample_value(event: &Event, index: usize) -> f64 {
        match event.metricset.as_ref().unwrap().samples[index].value {
            MetricValue::Single(v) => v,
            _ => panic!("expected scalar sample"),
        }
    }

    fn new_aggregator(sink: Arc<SinkProcessor>, max_groups: usize) -> Aggregator {
        Aggregator::new(AggregatorConfig {
            downstream: sink,
            max_groups,
            interval: Duration::from_secs(1),
        })
        .unwrap()
    }

    #[test]
    fn rejects_invalid_configuration() {
        let sink = Arc::new(SinkProcessor::default());
        assert!(Aggregator::new(AggregatorConfig {
            downstream: sink.clone(),
            max_groups: 0,
            interval: Duration::from_secs(1),
        })
        .is_err());
        assert!(Aggregator::new(AggregatorConfig {
            downstream: sink,
            max_groups: 10,
            interval: Duration::ZERO,
        })
        .is_err());
    }

    #[tokio::test]
    async fn aggregates_counts_and_durations_per_destination() {
        let sink = Arc::new(SinkProcessor::default());
        let agg = new_aggregator(sink.clone(), 100);

        let mut batch = Batch::from(vec![
            exit_span("t1", "s1", "postgres", 1_000),
            exit_span("t1", "s2", "postgres", 3_000),
            exit_span("t2", "s3", "elasticsearch", 10_000),
        ]);
        agg.process_batch(&mut batch).await.unwrap();
        assert_eq!(batch.len(), 3);

        agg.publish().await.unwrap();
        let emitted = sink.events();
        assert_eq!(emitted.len(), 2);
        let postgres = emitted
            .iter()
            .find(|e| {
                e.labels.get("destination.service.resource").map(String::as_str)
                    == Some("postgres")
            })
            .unwrap();
        assert_eq!(sample_value(postgres, 0), 2.0);
        assert_eq!(sample_value(postgres, 1), 4_000.0);
    }

    #[tokio::test]
    async fn spans_without_destination_are_ignored() {
        let sink = Arc::new(SinkProcessor::default());
        let agg = new_aggregator(sink.clone(), 100);

        let mut batch = Batch::from(vec![span_event("t1", "s1", "svc", "local work")]);
        agg.process_batch(&mut batch).await.unwrap();
        agg.publish().await.unwrap();
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn sample_rate_weights_counts() {
        let sink = Arc::new(SinkProcessor::default());
        let agg = new_aggregator(sink.clone(), 100);

        let mut event = exit_span("t1", "s1", "postgres", 1_000);
        event.span.as_mut().unwrap().sample_rate = 0.5;
        let mut batch = Batch::from(vec![event]);
        agg.process_batch(&mut batch).await.unwrap();

        agg.publish().await.unwrap();
        let emitted = sink.events();
        assert_eq!(sample_value(&emitted[0], 0), 2.0);
        assert_eq!(sample_value(&emitted[0], 1), 2_000.0);
    }

    #[tokio::test]
    async fn overflow_folds_into_other_bucket() {
        let sink = Arc::new(SinkProcessor::default());
        let agg = new_aggregator(sink.clone(), 1);

        let mut batch = Batch::from(vec![
            exit_span("t1", "s1", "postgres", 1_000),
            exit_span("t1", "s2", "redis", 2_000),
            exit_span("t1", "s3", "kafka", 3_000),
        ]);
        agg.process_batch(&mut batch).await.unwrap();

        agg.publish().await.unwrap();
        let emitted = sink.events();
        assert_eq!(emitted.len(), 2);
        let other = emitted
            .iter()
            .find(|e| {
                e.labels.get("destination.service.resource").map(String::as_str) == Some("other")
            })
            .expect("overflow metricset missing");
        assert_eq!(sample_value(other, 0), 2.0);
    }

    #[tokio::test]
    async fn stop_flushes_pending_groups() {
        let sink = Arc::new(SinkProcessor::default());
        let agg = new_aggregator(sink.clone(), 100);

        let mut batch = Batch::from(vec![exit_span("t1", "s1", "postgres", 1_000)]);
        agg.process_batch(&mut batch).await.unwrap();

        agg.stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(sink.events().len(), 1);
    }
}
