//! The batch-processor contract and processor composition.
//!
//! Every pipeline stage implements [`BatchProcessor`]: it receives a mutable
//! [`Batch`], may mutate, drop, or append events, and may hand derived events
//! to a downstream processor it holds. [`Chained`] composes an ordered list
//! of processors into one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::event::Event;

/// An ordered collection of events carried through the processor chain.
///
/// Processors mutate batches in place; within one batch the relative order
/// of surviving events is preserved by every well-behaved processor.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Batch(pub Vec<Event>);

impl Batch {
    pub fn new() -> Self {
        Batch(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, event: Event) {
        self.0.push(event);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.0.iter()
    }

    /// Removes and returns all events, leaving the batch empty.
    pub fn take(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.0)
    }
}

impl From<Vec<Event>> for Batch {
    fn from(events: Vec<Event>) -> Self {
        Batch(events)
    }
}

impl IntoIterator for Batch {
    type Item = Event;
    type IntoIter = std::vec::IntoIter<Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Errors surfaced by batch processing and processor lifecycles.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    /// The processor has been stopped and no longer accepts batches.
    #[error("processor is stopped")]
    Stopped,

    /// A processor did not finish flushing within its stop deadline.
    #[error("shutdown deadline exceeded before the processor finished flushing")]
    ShutdownIncomplete,

    /// A subsystem-specific failure, boxed to keep the contract narrow.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// The single polymorphic operation every pipeline stage implements.
#[async_trait]
pub trait BatchProcessor: Send + Sync {
    async fn process_batch(&self, batch: &mut Batch) -> Result<(), ProcessingError>;
}

/// A processor with a managed lifecycle: background workers started by
/// `run` and stopped, with a final flush, by `stop`.
#[async_trait]
pub trait ManagedProcessor: BatchProcessor {
    /// Runs the processor's background workers until `stop` is called.
    /// Returning an error aborts the whole pipeline.
    async fn run(&self) -> Result<(), ProcessingError>;

    /// Stops the processor, completing any outbound flush before returning.
    /// `timeout` bounds the wait; exceeding it yields
    /// [`ProcessingError::ShutdownIncomplete`].
    async fn stop(&self, timeout: Duration) -> Result<(), ProcessingError>;
}

/// Forwards a batch through an ordered list of processors; each processor
/// sees the batch after earlier processors mutated it.
#[derive(Clone, Default)]
pub struct Chained(pub Vec<Arc<dyn BatchProcessor>>);

#[async_trait]
impl BatchProcessor for Chained {
    async fn process_batch(&self, batch: &mut Batch) -> Result<(), ProcessingError> {
        for processor in &self.0 {
            processor.process_batch(batch).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{transaction_event, SinkProcessor};

    struct DropAll;

    #[async_trait]
    impl BatchProcessor for DropAll {
        async fn process_batch(&self, batch: &mut Batch) -> Result<(), ProcessingError> {
            batch.0.clear();
            Ok(())
        }
    }

    #[tokio::test]
    async fn chain_runs_processors_in_order() {
        let sink = Arc::new(SinkProcessor::default());
        let chain = Chained(vec![Arc::new(DropAll), sink.clone()]);

        let mut batch = Batch::from(vec![transaction_event("t1", "tx1", "svc", "GET /")]);
        chain.process_batch(&mut batch).await.unwrap();

        // DropAll ran before the sink, so the sink observed nothing.
        assert!(batch.is_empty());
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn chain_is_a_no_op_on_empty_batches() {
        let sink = Arc::new(SinkProcessor::default());
        let chain = Chained(vec![sink.clone()]);

        let mut batch = Batch::new();
        chain.process_batch(&mut batch).await.unwrap();

        assert!(batch.is_empty());
        assert!(sink.events().is_empty());
        assert_eq!(sink.batches(), 1);
    }
}
