//! Shared data model and processing contracts for the APM ingest pipeline.
//!
//! This crate defines the value types that flow through the pipeline
//! ([`Event`], [`Batch`]), the polymorphic [`BatchProcessor`] contract that
//! every pipeline stage implements, and the process-wide [`monitoring`]
//! registries used to expose internal counters and gauges.

pub mod event;
pub mod monitoring;
pub mod processor;
pub mod test_support;

pub use event::{
    Event, EventKind, MetricSample, MetricValue, Metricset, Outcome, Service, Span, Transaction,
};
pub use processor::{Batch, BatchProcessor, Chained, ManagedProcessor, ProcessingError};
