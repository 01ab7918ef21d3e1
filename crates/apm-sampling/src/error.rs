//! Error types for the sampling crate.

use std::path::PathBuf;

/// Errors emitted by the event storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to open storage at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: sled::Error,
    },

    #[error("storage at {path} uses format version {found}, expected {expected}")]
    Incompatible {
        path: PathBuf,
        found: u64,
        expected: u64,
    },

    #[error("storage limit of {limit} bytes reached")]
    LimitReached { limit: u64 },

    #[error("trace {trace_id} already has a sampling decision")]
    AlreadyDecided { trace_id: String },

    #[error("database error: {0}")]
    Db(#[from] sled::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("storage writer is closed")]
    WriterClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors emitted by the Elasticsearch client used for remote decisions.
#[derive(Debug, thiserror::Error)]
pub enum EsError {
    #[error("elasticsearch request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("elasticsearch responded with status {0}")]
    Status(reqwest::StatusCode),

    #[error("malformed elasticsearch response: {0}")]
    Body(#[from] serde_json::Error),

    #[error("failed to compress request body: {0}")]
    Compress(#[source] std::io::Error),
}

/// Errors emitted by the tail-sampling processor.
#[derive(Debug, thiserror::Error)]
pub enum SamplingError {
    #[error("invalid sampling configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Elasticsearch(#[from] EsError),

    #[error("failed to forward events downstream: {0}")]
    Downstream(#[source] apm_model::ProcessingError),

    #[error("shutdown deadline exceeded before the sampler finished flushing")]
    ShutdownIncomplete,

    #[error("sampler is already running")]
    AlreadyRunning,

    #[error("sampling worker panicked: {0}")]
    WorkerPanic(String),
}

impl From<SamplingError> for apm_model::ProcessingError {
    fn from(err: SamplingError) -> Self {
        match err {
            SamplingError::ShutdownIncomplete => apm_model::ProcessingError::ShutdownIncomplete,
            other => apm_model::ProcessingError::Other(Box::new(other)),
        }
    }
}
