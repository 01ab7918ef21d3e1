//! Telemetry event value types.
//!
//! Events are plain owned values: the intake layer produces them, pipeline
//! stages mutate or consume them, and ownership ends at the downstream
//! publisher. Only the fields the pipeline itself inspects are modeled here;
//! everything else the agents send is the intake layer's concern.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The category of a telemetry event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Transaction,
    Span,
    Error,
    Metric,
    Log,
}

impl EventKind {
    /// Stable single-byte tag used when events are keyed in storage.
    pub fn as_key_byte(self) -> u8 {
        match self {
            EventKind::Transaction => b't',
            EventKind::Span => b's',
            EventKind::Error => b'e',
            EventKind::Metric => b'm',
            EventKind::Log => b'l',
        }
    }
}

/// Outcome of a transaction or span, as reported by the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
    #[default]
    Unknown,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Unknown => "unknown",
        }
    }
}

/// The service an event was reported from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub environment: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub language: String,
}

/// Transaction-specific fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub name: String,
    #[serde(rename = "type")]
    pub transaction_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub result: String,
    #[serde(default)]
    pub outcome: Outcome,
    pub duration_us: u64,
    /// Head-based sampling rate the agent applied (1/p); used as an
    /// extrapolation weight by the aggregators. Zero means unknown.
    #[serde(default)]
    pub sample_rate: f64,
}

/// Span-specific fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub name: String,
    /// `destination.service.resource` for exit spans; absent otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_resource: Option<String>,
    #[serde(default)]
    pub outcome: Outcome,
    pub duration_us: u64,
    #[serde(default)]
    pub sample_rate: f64,
}

/// A single aggregated metric sample inside a metricset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub value: MetricValue,
}

/// Value shapes a metric sample may carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Single(f64),
    /// Histogram serialized as parallel arrays; `values` is sorted ascending.
    Histogram {
        values: Vec<u64>,
        counts: Vec<u64>,
    },
}

/// A point-in-time aggregation emitted by one of the aggregators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metricset {
    pub name: String,
    /// Start of the aggregation window, microseconds since the Unix epoch.
    pub interval_start_us: u64,
    /// End of the aggregation window, microseconds since the Unix epoch.
    pub interval_end_us: u64,
    pub samples: Vec<MetricSample>,
}

/// A telemetry event flowing through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Trace the event belongs to. Absent on events that are not
    /// trace-bearing (standalone metrics, logs without correlation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub id: String,
    /// Absent on trace roots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub kind: EventKind,
    /// Microseconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(default)]
    pub service: Service,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<Transaction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<Span>,
    /// Global labels attached by the agent; part of the transaction-metrics
    /// group identity.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metricset: Option<Metricset>,
}

impl Event {
    /// Builds a metricset event, the only event shape the pipeline itself
    /// originates.
    pub fn from_metricset(id: String, timestamp: u64, service: Service, set: Metricset) -> Self {
        Event {
            trace_id: None,
            id,
            parent_id: None,
            kind: EventKind::Metric,
            timestamp,
            service,
            transaction: None,
            span: None,
            labels: BTreeMap::new(),
            metricset: Some(set),
        }
    }

    /// True for transactions that start a trace: they carry the attributes
    /// tail-sampling policies match against.
    pub fn is_trace_root(&self) -> bool {
        self.kind == EventKind::Transaction && self.trace_id.is_some() && self.parent_id.is_none()
    }
}
