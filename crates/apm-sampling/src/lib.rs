//! Tail-based trace sampling.
//!
//! The [`Processor`] buffers trace events in persistent storage until a
//! keep/drop decision is made for their trace, either locally (policy
//! reservoirs drained on a flush interval) or remotely (decisions published
//! by peer ingesters into an Elasticsearch datastream). Sampled traces are
//! re-injected downstream exactly once; unsampled traces are purged.
//!
//! Module map:
//! - [`eventstorage`]: sled-backed per-trace event buffer with TTL, a
//!   write-once decision index, and a sharded single-writer facade.
//! - [`policy`] / [`reservoir`] / [`ewma`] / [`groups`]: local sampling —
//!   ordered policy matching and per-service weighted reservoirs sized from
//!   a smoothed ingest-rate estimate.
//! - [`elasticsearch`] / [`pubsub`]: the out-of-band decision channel shared
//!   with peer ingesters.
//! - [`processor`]: the batch processor tying it all together.

pub mod elasticsearch;
mod error;
pub mod eventstorage;
pub mod ewma;
pub mod groups;
pub mod policy;
pub mod processor;
pub mod pubsub;
pub mod reservoir;

pub use error::{EsError, SamplingError, StorageError};
pub use policy::{Policy, PolicyCriteria};
pub use processor::{Config, Processor};
pub use pubsub::DataStreamConfig;
