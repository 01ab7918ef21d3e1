//! Persistent per-trace event storage.
//!
//! A single embedded sled database holds two trees: `trace_events` buffers
//! codec-encoded events keyed by `trace_id:event_id:kind`, and
//! `trace_decisions` holds at most one write-once sampling decision per
//! trace id. Every value carries a logical TTL; expired entries are invisible
//! to readers and reclaimed by the garbage-collection loop.
//!
//! Writers go through the [`ShardedReadWriter`] facade, which funnels all
//! mutations for a trace through a single background writer so per-trace
//! ordering holds and fsyncs are batched. Reads bypass the facade and see
//! applied writes immediately.

mod codec;
mod sharded;

pub use codec::{EventCodec, JsonCodec};
pub use sharded::ShardedReadWriter;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use apm_model::monitoring::{self, Gauge};
use apm_model::{Event, EventKind};

use crate::error::StorageError;

/// Subdirectory of the server's data path holding the sled database.
pub const STORAGE_SUBDIR: &str = "tail_sampling";

/// On-disk format version; bumped when the key or value layout changes.
const FORMAT_VERSION: u64 = 1;

const META_TREE: &str = "__meta";
const META_VERSION_KEY: &[u8] = b"format_version";
const EVENTS_TREE: &str = "trace_events";
const DECISIONS_TREE: &str = "trace_decisions";

const DECISION_SAMPLED: u8 = b's';
const DECISION_UNSAMPLED: u8 = b'u';

/// Registry carrying the storage gauges.
const MONITORING_REGISTRY: &str = "apm-server.sampling.tail";

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Owner of the sled database and the low-level entry operations.
///
/// Construct once per storage directory and share behind an [`Arc`]; wrap in
/// a [`ShardedReadWriter`] for writing.
pub struct StorageManager {
    db: sled::Db,
    events: sled::Tree,
    decisions: sled::Tree,
    codec: Arc<dyn EventCodec>,
    ttl: Duration,
    storage_limit: u64,
    /// Estimated bytes of live event values.
    value_bytes: AtomicU64,
    /// Bytes accepted by the facade but not yet flushed to disk.
    pending_bytes: AtomicU64,
    read_errors: AtomicU64,
    write_errors: AtomicU64,
    lsm_size: Gauge,
    value_log_size: Gauge,
}

impl std::fmt::Debug for StorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageManager").finish_non_exhaustive()
    }
}

impl StorageManager {
    /// Opens (or creates) the store under `<dir>/tail_sampling`.
    ///
    /// A format-version record is written on creation and validated on every
    /// subsequent open; a mismatch fails with [`StorageError::Incompatible`]
    /// rather than touching the existing data.
    pub fn open(
        dir: &Path,
        codec: Arc<dyn EventCodec>,
        ttl: Duration,
        storage_limit: u64,
    ) -> Result<Arc<Self>, StorageError> {
        let path = dir.join(STORAGE_SUBDIR);
        std::fs::create_dir_all(&path)?;
        let db = sled::Config::new()
            .path(&path)
            .open()
            .map_err(|source| StorageError::Open {
                path: path.clone(),
                source,
            })?;

        let meta = db.open_tree(META_TREE)?;
        match meta.get(META_VERSION_KEY)? {
            None => {
                meta.insert(META_VERSION_KEY, &FORMAT_VERSION.to_be_bytes())?;
            }
            Some(raw) => {
                let found = decode_u64(&raw);
                if found != FORMAT_VERSION {
                    return Err(StorageError::Incompatible {
                        path,
                        found,
                        expected: FORMAT_VERSION,
                    });
                }
            }
        }

        let events = db.open_tree(EVENTS_TREE)?;
        let decisions = db.open_tree(DECISIONS_TREE)?;

        // Rebuild the live-bytes estimate; the store may carry entries from
        // a previous process generation.
        let mut value_bytes = 0u64;
        for entry in events.iter() {
            let (_, value) = entry?;
            value_bytes += value.len() as u64;
        }

        let registry = monitoring::registry(MONITORING_REGISTRY);
        let manager = Arc::new(StorageManager {
            db,
            events,
            decisions,
            codec,
            ttl,
            storage_limit,
            value_bytes: AtomicU64::new(value_bytes),
            pending_bytes: AtomicU64::new(0),
            read_errors: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
            lsm_size: registry.gauge("storage_lsm_size"),
            value_log_size: registry.gauge("storage_value_log_size"),
        });
        manager.update_size_gauges();
        Ok(manager)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Count of entries skipped because they could not be decoded.
    pub fn read_errors(&self) -> u64 {
        self.read_errors.load(Ordering::Relaxed)
    }

    /// Count of writes dropped because the database rejected them.
    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }

    fn expiry(&self) -> u64 {
        now_secs() + self.ttl.as_secs()
    }

    /// Fails when the estimated total (on-disk plus unflushed) would exceed
    /// the configured limit. A zero limit disables the check.
    fn check_limit(&self, incoming: u64) -> Result<(), StorageError> {
        if self.storage_limit == 0 {
            return Ok(());
        }
        let on_disk = self.db.size_on_disk()?;
        let pending = self.pending_bytes.load(Ordering::Relaxed);
        if on_disk + pending + incoming > self.storage_limit {
            return Err(StorageError::LimitReached {
                limit: self.storage_limit,
            });
        }
        Ok(())
    }

    fn note_pending(&self, bytes: u64) {
        self.pending_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn note_committed(&self, bytes: u64) {
        let _ = self
            .pending_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    fn sub_value_bytes(&self, bytes: u64) {
        let _ = self
            .value_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    fn encode_event(&self, trace_id: &str, event: &Event) -> Result<(Vec<u8>, Vec<u8>), StorageError> {
        let encoded = self.codec.encode(event)?;
        let mut value = Vec::with_capacity(8 + encoded.len());
        value.extend_from_slice(&self.expiry().to_be_bytes());
        value.extend_from_slice(&encoded);
        Ok((event_key(trace_id, &event.id, event.kind), value))
    }

    fn insert_event_raw(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), StorageError> {
        let len = value.len() as u64;
        match self.events.insert(key, value) {
            Ok(previous) => {
                // Idempotent overwrite of the same logical entry: account for
                // the replaced bytes.
                if let Some(previous) = previous {
                    self.sub_value_bytes(previous.len() as u64);
                }
                self.value_bytes.fetch_add(len, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                self.write_errors.fetch_add(1, Ordering::Relaxed);
                Err(StorageError::Db(err))
            }
        }
    }

    /// Writes the decision entry for a trace. The entry is create-only: an
    /// existing unexpired decision fails with [`StorageError::AlreadyDecided`],
    /// an expired one is replaced.
    fn write_decision_direct(&self, trace_id: &str, sampled: bool) -> Result<(), StorageError> {
        let flag = if sampled {
            DECISION_SAMPLED
        } else {
            DECISION_UNSAMPLED
        };
        let mut value = Vec::with_capacity(9);
        value.push(flag);
        value.extend_from_slice(&self.expiry().to_be_bytes());

        loop {
            let current = self.decisions.get(trace_id.as_bytes())?;
            if let Some(existing) = &current {
                if decision_expiry(existing) > now_secs() {
                    return Err(StorageError::AlreadyDecided {
                        trace_id: trace_id.to_owned(),
                    });
                }
            }
            match self.decisions.compare_and_swap(
                trace_id.as_bytes(),
                current,
                Some(value.clone()),
            )? {
                Ok(()) => return Ok(()),
                // Lost a race against a concurrent writer; re-read and let
                // the next iteration report AlreadyDecided.
                Err(_) => continue,
            }
        }
    }

    /// Reads the decision for a trace: `None` while undecided or expired,
    /// otherwise `Some(sampled)`.
    pub fn read_decision(&self, trace_id: &str) -> Result<Option<bool>, StorageError> {
        match self.decisions.get(trace_id.as_bytes())? {
            None => Ok(None),
            Some(value) => {
                if value.is_empty() || decision_expiry(&value) <= now_secs() {
                    return Ok(None);
                }
                Ok(Some(value[0] == DECISION_SAMPLED))
            }
        }
    }

    /// Returns a scan over the buffered events of a trace, in key order.
    /// Corrupt entries are skipped and counted; expired entries are skipped
    /// silently.
    pub fn read_events(self: &Arc<Self>, trace_id: &str) -> EventScan {
        let mut prefix = Vec::with_capacity(trace_id.len() + 1);
        prefix.extend_from_slice(trace_id.as_bytes());
        prefix.push(b':');
        EventScan {
            inner: self.events.scan_prefix(prefix),
            manager: Arc::clone(self),
            now: now_secs(),
        }
    }

    fn delete_trace_events_direct(&self, trace_id: &str) -> Result<(), StorageError> {
        let mut prefix = Vec::with_capacity(trace_id.len() + 1);
        prefix.extend_from_slice(trace_id.as_bytes());
        prefix.push(b':');
        for entry in self.events.scan_prefix(prefix) {
            let (key, value) = entry?;
            self.events.remove(&key)?;
            self.sub_value_bytes(value.len() as u64);
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), StorageError> {
        self.db.flush_async().await?;
        self.update_size_gauges();
        Ok(())
    }

    fn update_size_gauges(&self) {
        if let Ok(size) = self.db.size_on_disk() {
            self.lsm_size.set(size as i64);
        }
        self.value_log_size
            .set(self.value_bytes.load(Ordering::Relaxed) as i64);
    }

    /// Removes TTL-expired entries from both trees. Returns the number of
    /// event and decision entries reclaimed.
    fn sweep_expired(&self) -> Result<(u64, u64), StorageError> {
        let now = now_secs();
        let mut removed_events = 0u64;
        let mut removed_decisions = 0u64;

        for entry in self.events.iter() {
            let (key, value) = entry?;
            if value_expiry(&value) <= now {
                self.events.remove(&key)?;
                self.sub_value_bytes(value.len() as u64);
                removed_events += 1;
            }
        }
        for entry in self.decisions.iter() {
            let (key, value) = entry?;
            if value.is_empty() || decision_expiry(&value) <= now {
                self.decisions.remove(&key)?;
                removed_decisions += 1;
            }
        }
        Ok((removed_events, removed_decisions))
    }

    /// Periodically compacts the store until the token is cancelled.
    pub async fn run_gc(
        &self,
        interval: Duration,
        token: CancellationToken,
    ) -> Result<(), StorageError> {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let (events, decisions) = self.sweep_expired()?;
                    if events > 0 || decisions > 0 {
                        debug!(events, decisions, "storage gc reclaimed expired entries");
                    }
                    self.flush().await?;
                }
                _ = token.cancelled() => {
                    self.flush().await?;
                    return Ok(());
                }
            }
        }
    }
}

/// Iterator over a trace's buffered events.
pub struct EventScan {
    inner: sled::Iter,
    manager: Arc<StorageManager>,
    now: u64,
}

impl Iterator for EventScan {
    type Item = Result<Event, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next()? {
                Err(err) => return Some(Err(StorageError::Db(err))),
                Ok((_, value)) => {
                    if value.len() < 8 || value_expiry(&value) <= self.now {
                        continue;
                    }
                    match self.manager.codec.decode(&value[8..]) {
                        Ok(event) => return Some(Ok(event)),
                        Err(err) => {
                            self.manager.read_errors.fetch_add(1, Ordering::Relaxed);
                            warn!("skipping undecodable storage entry: {err}");
                            continue;
                        }
                    }
                }
            }
        }
    }
}

fn event_key(trace_id: &str, event_id: &str, kind: EventKind) -> Vec<u8> {
    let mut key = Vec::with_capacity(trace_id.len() + event_id.len() + 3);
    key.extend_from_slice(trace_id.as_bytes());
    key.push(b':');
    key.extend_from_slice(event_id.as_bytes());
    key.push(b':');
    key.push(kind.as_key_byte());
    key
}

fn decode_u64(raw: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let len = raw.len().min(8);
    buf[..len].copy_from_slice(&raw[..len]);
    u64::from_be_bytes(buf)
}

fn value_expiry(value: &[u8]) -> u64 {
    if value.len() < 8 {
        return 0;
    }
    decode_u64(&value[..8])
}

fn decision_expiry(value: &[u8]) -> u64 {
    if value.len() < 9 {
        return 0;
    }
    decode_u64(&value[1..9])
}
