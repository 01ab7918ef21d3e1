//! Pluggable event encoding for storage values.

use apm_model::Event;

use crate::error::StorageError;

/// Encodes events into storage values and back.
///
/// The byte layout is private to the storage directory: entries are written
/// and read by the same process generation, so codecs only need to be
/// self-consistent, not cross-version stable.
pub trait EventCodec: Send + Sync + 'static {
    fn encode(&self, event: &Event) -> Result<Vec<u8>, StorageError>;
    fn decode(&self, bytes: &[u8]) -> Result<Event, StorageError>;
}

/// The default self-describing JSON codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl EventCodec for JsonCodec {
    fn encode(&self, event: &Event) -> Result<Vec<u8>, StorageError> {
        Ok(serde_json::to_vec(event)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Event, StorageError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
