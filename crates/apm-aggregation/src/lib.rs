//! Metrics aggregation processors.
//!
//! Two batch processors that sit in front of the tail sampler: the
//! transaction-metrics aggregator ([`txmetrics`]) maintains HDR histograms
//! over transaction groups, and the service-destination aggregator
//! ([`spanmetrics`]) keeps counters and summed durations per outgoing-span
//! destination. Both forward the incoming batch unchanged and emit derived
//! metricset events to the downstream publisher on a fixed interval.

pub mod spanmetrics;
pub mod txmetrics;

/// Errors raised by aggregator construction and publishing.
#[derive(Debug, thiserror::Error)]
pub enum AggregationError {
    #[error("invalid aggregation configuration: {0}")]
    Config(String),

    #[error("failed to publish metricsets downstream: {0}")]
    Publish(#[source] apm_model::ProcessingError),

    #[error("shutdown deadline exceeded before the aggregator finished flushing")]
    ShutdownIncomplete,
}

impl From<AggregationError> for apm_model::ProcessingError {
    fn from(err: AggregationError) -> Self {
        match err {
            AggregationError::ShutdownIncomplete => apm_model::ProcessingError::ShutdownIncomplete,
            other => apm_model::ProcessingError::Other(Box::new(other)),
        }
    }
}

pub(crate) fn epoch_micros() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
