//! Pipeline assembly and lifecycle.
//!
//! The intake layer hands every batch to a [`Chained`](apm_model::Chained)
//! processor built here: transaction metrics, then service-destination
//! metrics, then (when enabled) the tail sampler, then the downstream
//! publisher. [`Pipeline::run`] supervises the processors' background
//! workers and drives the ordered shutdown that flushes in-flight work
//! instead of dropping it.

pub mod config;
pub mod pipeline;

pub use config::{
    AggregationConfig, Config, ConfigError, PolicyConfig, SamplingConfig,
    ServiceDestinationAggregationConfig, TailSamplingConfig, TransactionAggregationConfig,
};
pub use pipeline::{chain, new_processors, NamedProcessor, Pipeline, PipelineError, ServerParams};
