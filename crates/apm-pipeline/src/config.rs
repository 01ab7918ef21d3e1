//! Programmatic configuration surface of the pipeline.
//!
//! Loading (files, environment, CLI) is the embedder's concern; this module
//! only defines the typed structure, defaults, and validation.

use std::time::Duration;

use apm_model::Outcome;
use apm_sampling::elasticsearch::ElasticsearchConfig;

/// Rejected configuration values.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("sampling policy {index}: sample_rate {rate} is outside [0, 1]")]
    PolicySampleRate { index: usize, rate: f64 },

    #[error("{name} must be greater than zero")]
    NonPositive { name: &'static str },

    #[error("{name} must not be empty")]
    Empty { name: &'static str },

    #[error("hdr_histogram_significant_figures must be between 1 and 5, got {0}")]
    SignificantFigures(u8),

    #[error("ingest_rate_decay_factor must be within (0, 1], got {0}")]
    DecayFactor(f64),
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub sampling: SamplingConfig,
    pub aggregation: AggregationConfig,
    /// Budget for the ordered shutdown of all processors.
    pub shutdown_timeout: Duration,
    /// Datastream namespace decisions are published under.
    pub namespace: String,
    /// Stable per-process UUID used as the sampling observer tag.
    pub beat_id: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            sampling: SamplingConfig::default(),
            aggregation: AggregationConfig::default(),
            shutdown_timeout: Duration::from_secs(5),
            namespace: "default".to_owned(),
            beat_id: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SamplingConfig {
    pub tail: TailSamplingConfig,
}

#[derive(Debug, Clone)]
pub struct TailSamplingConfig {
    pub enabled: bool,
    /// Interval between local sampling decisions (reservoir finalization).
    pub interval: Duration,
    pub policies: Vec<PolicyConfig>,
    pub ingest_rate_decay_factor: f64,
    pub storage_gc_interval: Duration,
    /// Cap on the on-disk event buffer; zero disables the limit.
    pub storage_limit_bytes: u64,
    /// How long undecided trace state is retained.
    pub ttl: Duration,
    pub elasticsearch: ElasticsearchConfig,
}

impl Default for TailSamplingConfig {
    fn default() -> Self {
        TailSamplingConfig {
            enabled: false,
            interval: Duration::from_secs(60),
            policies: Vec::new(),
            ingest_rate_decay_factor: 0.25,
            storage_gc_interval: Duration::from_secs(300),
            storage_limit_bytes: 3_000_000_000,
            ttl: Duration::from_secs(30 * 60),
            elasticsearch: ElasticsearchConfig::default(),
        }
    }
}

/// One ordered tail-sampling policy.
#[derive(Debug, Clone, Default)]
pub struct PolicyConfig {
    pub service_name: Option<String>,
    pub service_environment: Option<String>,
    pub trace_name: Option<String>,
    pub trace_outcome: Option<Outcome>,
    pub sample_rate: f64,
}

#[derive(Debug, Clone, Default)]
pub struct AggregationConfig {
    pub transactions: TransactionAggregationConfig,
    pub service_destinations: ServiceDestinationAggregationConfig,
}

#[derive(Debug, Clone)]
pub struct TransactionAggregationConfig {
    pub max_transaction_groups: usize,
    pub interval: Duration,
    pub hdr_histogram_significant_figures: u8,
}

impl Default for TransactionAggregationConfig {
    fn default() -> Self {
        TransactionAggregationConfig {
            max_transaction_groups: 10_000,
            interval: Duration::from_secs(60),
            hdr_histogram_significant_figures: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceDestinationAggregationConfig {
    pub max_groups: usize,
    pub interval: Duration,
}

impl Default for ServiceDestinationAggregationConfig {
    fn default() -> Self {
        ServiceDestinationAggregationConfig {
            max_groups: 10_000,
            interval: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Validates the whole configuration; the server must not start on error.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let transactions = &self.aggregation.transactions;
        if transactions.max_transaction_groups == 0 {
            return Err(ConfigError::NonPositive {
                name: "aggregation.transactions.max_transaction_groups",
            });
        }
        if transactions.interval.is_zero() {
            return Err(ConfigError::NonPositive {
                name: "aggregation.transactions.interval",
            });
        }
        if !(1..=5).contains(&transactions.hdr_histogram_significant_figures) {
            return Err(ConfigError::SignificantFigures(
                transactions.hdr_histogram_significant_figures,
            ));
        }

        let destinations = &self.aggregation.service_destinations;
        if destinations.max_groups == 0 {
            return Err(ConfigError::NonPositive {
                name: "aggregation.service_destinations.max_groups",
            });
        }
        if destinations.interval.is_zero() {
            return Err(ConfigError::NonPositive {
                name: "aggregation.service_destinations.interval",
            });
        }

        let tail = &self.sampling.tail;
        if tail.enabled {
            if self.beat_id.is_empty() {
                return Err(ConfigError::Empty { name: "beat_id" });
            }
            if self.namespace.is_empty() {
                return Err(ConfigError::Empty { name: "namespace" });
            }
            if tail.interval.is_zero() {
                return Err(ConfigError::NonPositive {
                    name: "sampling.tail.interval",
                });
            }
            if tail.storage_gc_interval.is_zero() {
                return Err(ConfigError::NonPositive {
                    name: "sampling.tail.storage_gc_interval",
                });
            }
            if tail.ttl.is_zero() {
                return Err(ConfigError::NonPositive {
                    name: "sampling.tail.ttl",
                });
            }
            if !(tail.ingest_rate_decay_factor > 0.0 && tail.ingest_rate_decay_factor <= 1.0) {
                return Err(ConfigError::DecayFactor(tail.ingest_rate_decay_factor));
            }
            for (index, policy) in tail.policies.iter().enumerate() {
                if !(0.0..=1.0).contains(&policy.sample_rate) {
                    return Err(ConfigError::PolicySampleRate {
                        index,
                        rate: policy.sample_rate,
                    });
                }
            }
        }
        Ok(())
    }
}
