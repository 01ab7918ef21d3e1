//! Helpers shared by the test suites of the pipeline crates.
//!
//! Production code must not depend on anything in this module.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::event::{Event, EventKind, Outcome, Service, Span, Transaction};
use crate::processor::{Batch, BatchProcessor, ProcessingError};

/// A terminal processor that records every event it receives.
#[derive(Debug, Default)]
pub struct SinkProcessor {
    events: Mutex<Vec<Event>>,
    batches: AtomicUsize,
}

impl SinkProcessor {
    /// All events observed so far, in arrival order.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("sink poisoned").clone()
    }

    /// Number of `process_batch` calls observed, including empty batches.
    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::Relaxed)
    }

    /// Drops all recorded events.
    pub fn clear(&self) {
        self.events.lock().expect("sink poisoned").clear();
    }
}

#[async_trait]
impl BatchProcessor for SinkProcessor {
    async fn process_batch(&self, batch: &mut Batch) -> Result<(), ProcessingError> {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.events
            .lock()
            .expect("sink poisoned")
            .extend(batch.iter().cloned());
        Ok(())
    }
}

/// A root transaction event with the given ids and service.
pub fn transaction_event(trace_id: &str, event_id: &str, service: &str, name: &str) -> Event {
    Event {
        trace_id: Some(trace_id.to_owned()),
        id: event_id.to_owned(),
        parent_id: None,
        kind: EventKind::Transaction,
        timestamp: 1_700_000_000_000_000,
        service: Service {
            name: service.to_owned(),
            environment: "production".to_owned(),
            language: "go".to_owned(),
        },
        transaction: Some(Transaction {
            name: name.to_owned(),
            transaction_type: "request".to_owned(),
            result: "HTTP 2xx".to_owned(),
            outcome: Outcome::Success,
            duration_us: 42_000,
            sample_rate: 1.0,
        }),
        span: None,
        labels: Default::default(),
        metricset: None,
    }
}

/// A child span event belonging to `trace_id`.
pub fn span_event(trace_id: &str, event_id: &str, service: &str, name: &str) -> Event {
    Event {
        trace_id: Some(trace_id.to_owned()),
        id: event_id.to_owned(),
        parent_id: Some(format!("{trace_id}-root")),
        kind: EventKind::Span,
        timestamp: 1_700_000_000_100_000,
        service: Service {
            name: service.to_owned(),
            environment: "production".to_owned(),
            language: "go".to_owned(),
        },
        transaction: None,
        span: Some(Span {
            name: name.to_owned(),
            destination_resource: None,
            outcome: Outcome::Success,
            duration_us: 7_000,
            sample_rate: 1.0,
        }),
        labels: Default::default(),
        metricset: None,
    }
}
