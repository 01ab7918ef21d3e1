//! Processor construction and lifecycle supervision.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use apm_model::{BatchProcessor, Chained, ManagedProcessor, ProcessingError};
use apm_sampling::elasticsearch::ElasticsearchClient;
use apm_sampling::eventstorage::{JsonCodec, ShardedReadWriter, StorageManager};
use apm_sampling::pubsub::DataStreamConfig;
use apm_sampling::{Policy, PolicyCriteria};

use crate::config::{Config, ConfigError};

/// Cap on dynamic per-service sampling groups.
const MAX_DYNAMIC_SERVICES: usize = 1000;

/// Errors raised while assembling or supervising the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("error creating {name}: {source}")]
    CreateProcessor {
        name: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("{name} aborted: {source}")]
    Worker {
        name: &'static str,
        #[source]
        source: ProcessingError,
    },

    #[error("pipeline worker panicked in {0}")]
    WorkerPanic(&'static str),
}

/// Everything the embedder provides to build the pipeline.
pub struct ServerParams {
    pub config: Config,
    /// The downstream publisher terminating the chain.
    pub batch_processor: Arc<dyn BatchProcessor>,
    /// Data directory; tail-sampling state lives underneath it.
    pub storage_dir: PathBuf,
}

/// A processor with the name it is logged and supervised under.
pub struct NamedProcessor {
    pub name: &'static str,
    pub processor: Arc<dyn ManagedProcessor>,
}

/// Builds the processor list in start order: aggregators first, then the
/// tail sampler when enabled. Each processor emits directly to the
/// downstream publisher.
pub fn new_processors(params: &ServerParams) -> Result<Vec<NamedProcessor>, PipelineError> {
    params.config.validate()?;
    let mut processors = Vec::with_capacity(3);

    const TX_NAME: &str = "transaction metrics aggregation";
    let transactions = &params.config.aggregation.transactions;
    info!(
        max_groups = transactions.max_transaction_groups,
        interval_secs = transactions.interval.as_secs(),
        "creating {TX_NAME}"
    );
    let tx_aggregator = apm_aggregation::txmetrics::Aggregator::new(
        apm_aggregation::txmetrics::AggregatorConfig {
            downstream: Arc::clone(&params.batch_processor),
            max_transaction_groups: transactions.max_transaction_groups,
            interval: transactions.interval,
            significant_figures: transactions.hdr_histogram_significant_figures,
        },
    )
    .map_err(|err| PipelineError::CreateProcessor {
        name: TX_NAME,
        source: Box::new(err),
    })?;
    processors.push(NamedProcessor {
        name: TX_NAME,
        processor: Arc::new(tx_aggregator),
    });

    const SPAN_NAME: &str = "service destinations aggregation";
    let destinations = &params.config.aggregation.service_destinations;
    info!(
        max_groups = destinations.max_groups,
        interval_secs = destinations.interval.as_secs(),
        "creating {SPAN_NAME}"
    );
    let span_aggregator = apm_aggregation::spanmetrics::Aggregator::new(
        apm_aggregation::spanmetrics::AggregatorConfig {
            downstream: Arc::clone(&params.batch_processor),
            max_groups: destinations.max_groups,
            interval: destinations.interval,
        },
    )
    .map_err(|err| PipelineError::CreateProcessor {
        name: SPAN_NAME,
        source: Box::new(err),
    })?;
    processors.push(NamedProcessor {
        name: SPAN_NAME,
        processor: Arc::new(span_aggregator),
    });

    if params.config.sampling.tail.enabled {
        const TAIL_NAME: &str = "tail sampler";
        let sampler = new_tail_sampler(params).map_err(|err| PipelineError::CreateProcessor {
            name: TAIL_NAME,
            source: err,
        })?;
        processors.push(NamedProcessor {
            name: TAIL_NAME,
            processor: sampler,
        });
    }
    Ok(processors)
}

fn new_tail_sampler(
    params: &ServerParams,
) -> Result<Arc<dyn ManagedProcessor>, Box<dyn std::error::Error + Send + Sync + 'static>> {
    let tail = &params.config.sampling.tail;
    let elasticsearch = Arc::new(ElasticsearchClient::new(&tail.elasticsearch)?);

    let manager = StorageManager::open(
        &params.storage_dir,
        Arc::new(JsonCodec),
        tail.ttl,
        tail.storage_limit_bytes,
    )?;
    let storage = ShardedReadWriter::new(manager, 0);

    let policies = tail
        .policies
        .iter()
        .map(|policy| Policy {
            criteria: PolicyCriteria {
                service_name: policy.service_name.clone(),
                service_environment: policy.service_environment.clone(),
                trace_name: policy.trace_name.clone(),
                trace_outcome: policy.trace_outcome,
            },
            sample_rate: policy.sample_rate,
        })
        .collect();

    let sampler = apm_sampling::Processor::new(apm_sampling::Config {
        beat_id: params.config.beat_id.clone(),
        flush_interval: tail.interval,
        max_dynamic_services: MAX_DYNAMIC_SERVICES,
        policies,
        default_sample_rate: 1.0,
        ingest_rate_decay_factor: tail.ingest_rate_decay_factor,
        storage,
        storage_dir: params.storage_dir.clone(),
        storage_gc_interval: tail.storage_gc_interval,
        elasticsearch,
        sampled_traces_data_stream: DataStreamConfig::sampled_traces(&params.config.namespace),
        downstream: Arc::clone(&params.batch_processor),
    })?;
    Ok(Arc::new(sampler))
}

/// Assembles the chain the intake layer drives: every processor in order,
/// then the downstream publisher.
pub fn chain(processors: &[NamedProcessor], tail: Arc<dyn BatchProcessor>) -> Chained {
    let mut links: Vec<Arc<dyn BatchProcessor>> = processors
        .iter()
        .map(|named| Arc::clone(&named.processor) as Arc<dyn BatchProcessor>)
        .collect();
    links.push(tail);
    Chained(links)
}

/// Supervises the processors' background workers.
pub struct Pipeline {
    processors: Vec<NamedProcessor>,
    shutdown_timeout: Duration,
}

impl Pipeline {
    pub fn new(processors: Vec<NamedProcessor>, shutdown_timeout: Duration) -> Self {
        Pipeline {
            processors,
            shutdown_timeout,
        }
    }

    pub fn processors(&self) -> &[NamedProcessor] {
        &self.processors
    }

    /// Runs every processor until `shutdown` is cancelled or one of them
    /// fails, then stops them in reverse order within the shutdown budget so
    /// in-flight work is flushed rather than dropped.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), PipelineError> {
        let mut workers: JoinSet<(&'static str, Result<(), ProcessingError>)> = JoinSet::new();
        for named in &self.processors {
            let processor = Arc::clone(&named.processor);
            let name = named.name;
            workers.spawn(async move { (name, processor.run().await) });
        }

        let mut first_error = None;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                joined = workers.join_next() => match joined {
                    None => break,
                    Some(Ok((_, Ok(())))) => {}
                    Some(Ok((name, Err(err)))) => {
                        error!("{name} aborted: {err}");
                        first_error = Some(PipelineError::Worker { name, source: err });
                        break;
                    }
                    Some(Err(join_err)) => {
                        error!("pipeline worker panicked: {join_err}");
                        first_error = Some(PipelineError::WorkerPanic("pipeline"));
                        break;
                    }
                },
            }
        }

        // Stop in reverse start order, sharing one deadline across all
        // processors.
        let deadline = Instant::now() + self.shutdown_timeout;
        for named in self.processors.iter().rev() {
            let remaining = deadline
                .saturating_duration_since(Instant::now())
                .max(Duration::from_millis(1));
            match named.processor.stop(remaining).await {
                Ok(()) => info!("{} stopped", named.name),
                Err(ProcessingError::ShutdownIncomplete) => {
                    warn!("{} did not finish flushing before the deadline", named.name);
                }
                Err(err) => warn!("{} failed to stop cleanly: {err}", named.name),
            }
        }

        // Reap the run() workers within what is left of the budget.
        let remaining = deadline
            .saturating_duration_since(Instant::now())
            .max(Duration::from_millis(1));
        let drained = tokio::time::timeout(remaining, async {
            while let Some(joined) = workers.join_next().await {
                if let Ok((name, Err(err))) = joined {
                    warn!("{name} exited with error during shutdown: {err}");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("aborting pipeline workers that outlived the shutdown budget");
            workers.abort_all();
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apm_model::test_support::SinkProcessor;

    fn params(config: Config) -> (ServerParams, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (
            ServerParams {
                config,
                batch_processor: Arc::new(SinkProcessor::default()),
                storage_dir: dir.path().to_path_buf(),
            },
            dir,
        )
    }

    #[tokio::test]
    async fn builds_aggregators_when_tail_sampling_is_disabled() {
        let (params, _dir) = params(Config::default());
        let processors = new_processors(&params).unwrap();
        let names: Vec<&str> = processors.iter().map(|p| p.name).collect();
        assert_eq!(
            names,
            vec![
                "transaction metrics aggregation",
                "service destinations aggregation"
            ]
        );
    }

    #[tokio::test]
    async fn invalid_configuration_fails_construction() {
        let mut config = Config::default();
        config.aggregation.transactions.max_transaction_groups = 0;
        let (params, _dir) = params(config);
        assert!(matches!(
            new_processors(&params),
            Err(PipelineError::Config(_))
        ));
    }

    #[tokio::test]
    async fn chain_ends_with_the_downstream_publisher() {
        let (params, _dir) = params(Config::default());
        let processors = new_processors(&params).unwrap();
        let chained = chain(&processors, Arc::clone(&params.batch_processor));
        assert_eq!(chained.0.len(), processors.len() + 1);
    }
}
