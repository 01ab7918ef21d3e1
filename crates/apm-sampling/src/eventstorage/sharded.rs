//! Sharded single-writer facade over the storage manager.
//!
//! Trace ids are hashed onto a power-of-two number of shards; each shard owns
//! one background writer task. All mutations for a trace flow through its
//! shard in submission order, so event writes, the decision write, and the
//! eventual delete cannot be reordered against each other. The writer applies
//! mutations immediately (readers observe them as soon as the command is
//! processed) and batches fsyncs within a short flush window; a barrier
//! command forces a flush for callers that need durability.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use apm_model::Event;

use super::StorageManager;
use crate::error::StorageError;

/// Queue depth per shard before writers push back on callers.
const SHARD_CHANNEL_BUFFER_SIZE: usize = 1024;

/// How long applied writes may sit in the page cache before an fsync.
const DEFAULT_FLUSH_WINDOW: Duration = Duration::from_secs(1);

enum WriteCommand {
    Event {
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Decision {
        trace_id: String,
        sampled: bool,
        reply: oneshot::Sender<Result<(), StorageError>>,
    },
    DeleteTrace {
        trace_id: String,
    },
    Barrier {
        reply: oneshot::Sender<Result<(), StorageError>>,
    },
}

/// Sharded read/write facade over a [`StorageManager`].
pub struct ShardedReadWriter {
    manager: Arc<StorageManager>,
    shards: Vec<mpsc::Sender<WriteCommand>>,
    mask: u64,
}

impl ShardedReadWriter {
    /// Creates the facade with one writer task per shard. `shard_count` is
    /// rounded up to a power of two; zero selects the number of CPUs.
    /// Must be called from within a tokio runtime.
    pub fn new(manager: Arc<StorageManager>, shard_count: usize) -> Arc<Self> {
        Self::with_flush_window(manager, shard_count, DEFAULT_FLUSH_WINDOW)
    }

    pub fn with_flush_window(
        manager: Arc<StorageManager>,
        shard_count: usize,
        flush_window: Duration,
    ) -> Arc<Self> {
        let requested = if shard_count == 0 {
            std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1)
        } else {
            shard_count
        };
        let count = requested.next_power_of_two();

        let mut shards = Vec::with_capacity(count);
        for _ in 0..count {
            let (tx, rx) = mpsc::channel(SHARD_CHANNEL_BUFFER_SIZE);
            tokio::spawn(run_shard(Arc::clone(&manager), rx, flush_window));
            shards.push(tx);
        }
        Arc::new(ShardedReadWriter {
            manager,
            shards,
            mask: (count - 1) as u64,
        })
    }

    pub fn manager(&self) -> &Arc<StorageManager> {
        &self.manager
    }

    fn shard_for(&self, trace_id: &str) -> &mpsc::Sender<WriteCommand> {
        &self.shards[(fnv1a(trace_id.as_bytes()) & self.mask) as usize]
    }

    /// Buffers an event under its trace, idempotent on
    /// (trace id, event id, kind). Fails synchronously when the storage
    /// limit would be exceeded or the event cannot be encoded; database
    /// errors inside the shard are logged and dropped.
    pub async fn write_event(&self, trace_id: &str, event: &Event) -> Result<(), StorageError> {
        let (key, value) = self.manager.encode_event(trace_id, event)?;
        self.manager.check_limit(value.len() as u64)?;
        self.manager.note_pending(value.len() as u64);
        self.shard_for(trace_id)
            .send(WriteCommand::Event { key, value })
            .await
            .map_err(|_| StorageError::WriterClosed)
    }

    /// Records the sampling decision for a trace; write-once per TTL.
    pub async fn write_decision(&self, trace_id: &str, sampled: bool) -> Result<(), StorageError> {
        let (reply, response) = oneshot::channel();
        self.shard_for(trace_id)
            .send(WriteCommand::Decision {
                trace_id: trace_id.to_owned(),
                sampled,
                reply,
            })
            .await
            .map_err(|_| StorageError::WriterClosed)?;
        response.await.map_err(|_| StorageError::WriterClosed)?
    }

    pub fn read_decision(&self, trace_id: &str) -> Result<Option<bool>, StorageError> {
        self.manager.read_decision(trace_id)
    }

    pub fn read_events(&self, trace_id: &str) -> super::EventScan {
        self.manager.read_events(trace_id)
    }

    /// Removes the buffered events of a trace; its decision entry survives.
    pub async fn delete_trace_events(&self, trace_id: &str) -> Result<(), StorageError> {
        self.shard_for(trace_id)
            .send(WriteCommand::DeleteTrace {
                trace_id: trace_id.to_owned(),
            })
            .await
            .map_err(|_| StorageError::WriterClosed)
    }

    /// Waits until every write previously submitted for this trace has been
    /// applied and flushed.
    pub async fn sync_trace(&self, trace_id: &str) -> Result<(), StorageError> {
        self.barrier(self.shard_for(trace_id)).await
    }

    /// Flush barrier across all shards.
    pub async fn flush_all(&self) -> Result<(), StorageError> {
        for shard in &self.shards {
            self.barrier(shard).await?;
        }
        Ok(())
    }

    async fn barrier(&self, shard: &mpsc::Sender<WriteCommand>) -> Result<(), StorageError> {
        let (reply, response) = oneshot::channel();
        shard
            .send(WriteCommand::Barrier { reply })
            .await
            .map_err(|_| StorageError::WriterClosed)?;
        response.await.map_err(|_| StorageError::WriterClosed)?
    }

    /// Periodically compacts the store until the token is cancelled.
    pub async fn run_gc(
        &self,
        interval: Duration,
        token: tokio_util::sync::CancellationToken,
    ) -> Result<(), StorageError> {
        self.manager.run_gc(interval, token).await
    }
}

async fn run_shard(
    manager: Arc<StorageManager>,
    mut rx: mpsc::Receiver<WriteCommand>,
    flush_window: Duration,
) {
    let mut ticker = tokio::time::interval(flush_window);
    ticker.tick().await; // first tick fires immediately; skip it
    let mut dirty: u64 = 0;

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(WriteCommand::Event { key, value }) => {
                    let len = value.len() as u64;
                    if let Err(err) = manager.insert_event_raw(key, value) {
                        warn!("dropping event write: {err}");
                    }
                    dirty += len;
                }
                Some(WriteCommand::Decision { trace_id, sampled, reply }) => {
                    let result = manager.write_decision_direct(&trace_id, sampled);
                    dirty += 9;
                    let _ = reply.send(result);
                }
                Some(WriteCommand::DeleteTrace { trace_id }) => {
                    if let Err(err) = manager.delete_trace_events_direct(&trace_id) {
                        warn!(trace_id, "failed to delete buffered trace events: {err}");
                    }
                }
                Some(WriteCommand::Barrier { reply }) => {
                    let result = manager.flush().await;
                    manager.note_committed(dirty);
                    dirty = 0;
                    let _ = reply.send(result);
                }
                None => {
                    if let Err(err) = manager.flush().await {
                        warn!("final storage flush failed: {err}");
                    }
                    manager.note_committed(dirty);
                    return;
                }
            },
            _ = ticker.tick() => {
                if dirty > 0 {
                    if let Err(err) = manager.flush().await {
                        warn!("periodic storage flush failed: {err}");
                    }
                    manager.note_committed(dirty);
                    dirty = 0;
                }
            }
        }
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
