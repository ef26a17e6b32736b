//! # Write Coordinator
//!
//! The thin glue over the log and the memtable: a [`Db`] handle whose
//! mutations are appended to the WAL first, optionally fsynced, then
//! applied to the sharded memtable; when the memtable crosses its byte
//! budget the coordinator seals it, hands the snapshot to the flush
//! sink, swaps in a fresh table, trims the log, and retries the write
//! once.
//!
//! ## Ordering Guarantees
//!
//! - WAL append happens before the memtable mutation of the same
//!   operation; a reader that sees a value is guaranteed the record is
//!   appended (not necessarily synced).
//! - A WAL failure aborts the mutation before the memtable is touched.
//! - Log trimming never outruns the slowest in-flight writer: a
//!   sequence that is appended but not yet applied anywhere is tracked,
//!   and retention stops below the smallest such sequence.
//!
//! ## Recovery
//!
//! [`Db::open`] replays the log into a fresh memtable through a path
//! that neither re-logs records nor enforces the byte budget — replay
//! must reproduce the pre-crash state exactly. A corrupted log aborts
//! the open without touching the memtable.
//!
//! ## Flush lifecycle
//!
//! Under the flush lock:
//! `MUTABLE → SEALING` (writes start failing), in-flight writers drain,
//! `→ IMMUTABLE → FLUSHING` (snapshot handed to the sink), fresh table
//! swapped in, WAL retained up to the flushed boundary, `→ RETIRED`.
//! Readers proceed in every state except `RETIRED`; they always hold
//! the table they started with.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::memtable::{Memtable, MemtableConfig, MemtableState};
use crate::sync::SyncConfig;
use crate::wal::segment::{RECORD_HEADER_SIZE, SEGMENT_HEADER_SIZE};
use crate::wal::{BatchOp, RecordType, Wal, WalConfig};

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Open-time settings for a [`Db`].
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Byte cap per log segment; must exceed the largest possible
    /// record (`RECORD_HEADER_SIZE + max_key_size + max_value_size`).
    pub segment_size: usize,

    /// Log segments retained before rollover forces out the oldest
    /// sealed ones; 0 means unlimited.
    pub max_segments: usize,

    /// Fsync before every mutation returns.
    pub sync_on_write: bool,

    /// Memtable byte budget before a flush is triggered.
    pub memtable_budget: usize,

    /// Memtable shard count; must be at least 1.
    pub shard_count: usize,

    /// Largest accepted key.
    pub max_key_size: usize,

    /// Largest accepted value.
    pub max_value_size: usize,

    /// Lock variant, lock-free mode, and retry discipline.
    pub sync: SyncConfig,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            segment_size: 64 * 1024 * 1024,
            max_segments: 0,
            sync_on_write: true,
            memtable_budget: 64 * 1024 * 1024,
            shard_count: 16,
            max_key_size: 64 * 1024,
            max_value_size: 1024 * 1024,
            sync: SyncConfig::default(),
        }
    }
}

impl DbConfig {
    fn validate(&self) -> Result<()> {
        if self.shard_count == 0 {
            return Err(Error::InvalidArg("shard_count must be at least 1".into()));
        }
        if self.max_key_size == 0 || self.max_value_size == 0 {
            return Err(Error::InvalidArg("size bounds must be non-zero".into()));
        }
        let max_record = SEGMENT_HEADER_SIZE + RECORD_HEADER_SIZE + self.max_key_size + self.max_value_size;
        if self.segment_size <= max_record {
            return Err(Error::InvalidArg(format!(
                "segment_size {} cannot hold a maximum-size record of {} bytes",
                self.segment_size, max_record
            )));
        }
        Ok(())
    }

    fn memtable_config(&self) -> MemtableConfig {
        MemtableConfig {
            budget: self.memtable_budget,
            shard_count: self.shard_count,
            sync: self.sync,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Flush sink
// ------------------------------------------------------------------------------------------------

/// Destination of sealed memtables: an opaque immutable store.
///
/// The coordinator hands over the live entries of a sealed table in
/// ascending key order, exactly once per flush. What the sink does
/// with them (tables, files, nothing) is outside the core's contract.
pub trait FlushSink: Send + Sync {
    /// Consumes one sealed memtable's entries.
    fn flush(&self, entries: &mut dyn Iterator<Item = (Vec<u8>, Vec<u8>)>) -> Result<()>;
}

/// Drops every flushed entry; the default sink when none is wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

impl FlushSink for DiscardSink {
    fn flush(&self, entries: &mut dyn Iterator<Item = (Vec<u8>, Vec<u8>)>) -> Result<()> {
        let dropped = entries.count();
        debug!(entries = dropped, "discard sink consumed flush");
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Statistics
// ------------------------------------------------------------------------------------------------

/// Snapshot of engine counters returned by [`Db::stats`].
#[derive(Debug, Clone)]
pub struct DbStats {
    /// Bytes charged to the active memtable.
    pub memtable_bytes: usize,
    /// Configured memtable budget.
    pub memtable_budget: usize,
    /// Live entries in the active memtable.
    pub memtable_entries: usize,
    /// Lifecycle state of the active memtable.
    pub memtable_state: MemtableState,
    /// Memtable shard count.
    pub shard_count: usize,
    /// Log segment files currently tracked.
    pub wal_segments: usize,
    /// Sequence the next mutation will receive.
    pub next_sequence: u64,
}

// ------------------------------------------------------------------------------------------------
// Write operations
// ------------------------------------------------------------------------------------------------

/// One operation of a [`Db::write_batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Insert or update a key.
    Put { key: Vec<u8>, value: Vec<u8> },
    /// Remove a key.
    Delete { key: Vec<u8> },
}

/// Borrowed view of a mutation, shared by the apply paths.
enum ApplyOp<'a> {
    Put { key: &'a [u8], value: &'a [u8] },
    Delete { key: &'a [u8] },
}

// ------------------------------------------------------------------------------------------------
// Db Core
// ------------------------------------------------------------------------------------------------

/// The embedded store handle.
///
/// Thread-safe and cheaply cloneable; all clones share one engine.
/// See the [module-level documentation](self) for ordering and flush
/// semantics.
#[derive(Clone)]
pub struct Db {
    inner: Arc<DbInner>,
}

struct DbInner {
    config: DbConfig,
    wal: Wal,
    memtable: RwLock<Arc<Memtable>>,
    flush_lock: Mutex<()>,
    sink: Box<dyn FlushSink>,
    closed: AtomicBool,

    /// Highest sequence applied to any live memtable.
    last_applied: AtomicU64,

    /// Writers currently between WAL append and settling (applied, or
    /// registered in `unapplied`). The flush path drains this before
    /// fixing the retention boundary.
    pending: AtomicUsize,

    /// Sequences appended to the log but not yet applied to a live
    /// table; log retention never crosses the smallest of them.
    unapplied: Mutex<BTreeSet<u64>>,
}

impl Db {
    /// Opens (or creates) a database in `dir` with a discarding flush
    /// sink: flushed entries leave the core and go nowhere.
    pub fn open(dir: impl AsRef<Path>, config: DbConfig) -> Result<Self> {
        Self::open_with_sink(dir, config, Box::new(DiscardSink))
    }

    /// Opens (or creates) a database in `dir`, handing sealed
    /// memtables to `sink`.
    ///
    /// Recovery replays the log into a fresh memtable; a corrupted log
    /// aborts the open.
    pub fn open_with_sink(
        dir: impl AsRef<Path>,
        config: DbConfig,
        sink: Box<dyn FlushSink>,
    ) -> Result<Self> {
        config.validate()?;

        let wal = Wal::open(WalConfig {
            dir: dir.as_ref().to_path_buf(),
            segment_size: config.segment_size,
            max_segments: config.max_segments,
            sync_on_write: config.sync_on_write,
            buffer_size: 64 * 1024,
        })?;

        let memtable = Memtable::new(&config.memtable_config())?;
        let mut replayed = 0u64;
        wal.recover(|record| {
            match record.record_type {
                RecordType::Put => memtable.replay_put(&record.key, &record.value)?,
                RecordType::Delete => memtable.replay_delete(&record.key)?,
            }
            replayed += 1;
            Ok(())
        })?;
        let last_applied = wal.next_sequence()?.saturating_sub(1);

        info!(
            dir = %dir.as_ref().display(),
            replayed,
            entries = memtable.len(),
            "db opened"
        );

        Ok(Self {
            inner: Arc::new(DbInner {
                config,
                wal,
                memtable: RwLock::new(Arc::new(memtable)),
                flush_lock: Mutex::new(()),
                sink,
                closed: AtomicBool::new(false),
                last_applied: AtomicU64::new(last_applied),
                pending: AtomicUsize::new(0),
                unapplied: Mutex::new(BTreeSet::new()),
            }),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn memtable(&self) -> Arc<Memtable> {
        self.inner
            .memtable
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn unapplied(&self) -> Result<MutexGuard<'_, BTreeSet<u64>>> {
        self.inner
            .unapplied
            .lock()
            .map_err(|_| Error::Internal("unapplied-set lock poisoned".into()))
    }

    fn validate_key(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidArg("empty key".into()));
        }
        if key.len() > self.inner.config.max_key_size {
            return Err(Error::TooLarge(format!(
                "key of {} bytes exceeds bound of {}",
                key.len(),
                self.inner.config.max_key_size
            )));
        }
        Ok(())
    }

    fn validate_value(&self, value: &[u8]) -> Result<()> {
        if value.is_empty() {
            return Err(Error::InvalidArg("empty value".into()));
        }
        if value.len() > self.inner.config.max_value_size {
            return Err(Error::TooLarge(format!(
                "value of {} bytes exceeds bound of {}",
                value.len(),
                self.inner.config.max_value_size
            )));
        }
        Ok(())
    }

    /// Inserts or updates a key.
    ///
    /// The record is logged (and fsynced when configured) before the
    /// memtable is touched. A full memtable triggers a flush and one
    /// retry.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.validate_key(key)?;
        self.validate_value(value)?;

        let seq = self.log_one(RecordType::Put, key, value)?;
        self.settle(seq, &ApplyOp::Put { key, value })
    }

    /// Removes a key.
    ///
    /// The tombstone is durable in the log even when the key is absent
    /// from the memtable (older state may live beyond the sink), so a
    /// missing key is not an error here.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.validate_key(key)?;

        let seq = self.log_one(RecordType::Delete, key, b"")?;
        self.settle(seq, &ApplyOp::Delete { key })
    }

    /// Returns a copy of the current value for `key`.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.validate_key(key)?;
        self.memtable().lookup(key)
    }

    /// Applies a batch of mutations whose records land in one log
    /// segment. Returns the first sequence of the batch.
    pub fn write_batch(&self, ops: &[WriteOp]) -> Result<u64> {
        self.ensure_open()?;
        for op in ops {
            match op {
                WriteOp::Put { key, value } => {
                    self.validate_key(key)?;
                    self.validate_value(value)?;
                }
                WriteOp::Delete { key } => self.validate_key(key)?,
            }
        }

        let batch: Vec<BatchOp<'_>> = ops
            .iter()
            .map(|op| match op {
                WriteOp::Put { key, value } => BatchOp {
                    record_type: RecordType::Put,
                    key,
                    value,
                },
                WriteOp::Delete { key } => BatchOp {
                    record_type: RecordType::Delete,
                    key,
                    value: b"",
                },
            })
            .collect();

        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        let first = match self.inner.wal.append_batch(&batch) {
            Ok(first) => first,
            Err(e) => {
                self.inner.pending.fetch_sub(1, Ordering::SeqCst);
                return Err(e);
            }
        };
        {
            let mut unapplied = self.unapplied()?;
            for offset in 0..ops.len() as u64 {
                unapplied.insert(first + offset);
            }
        }
        self.inner.pending.fetch_sub(1, Ordering::SeqCst);

        let mut result = Ok(());
        for (index, op) in ops.iter().enumerate() {
            let seq = first + index as u64;
            let apply = match op {
                WriteOp::Put { key, value } => ApplyOp::Put { key, value },
                WriteOp::Delete { key } => ApplyOp::Delete { key },
            };
            result = self.apply_registered(seq, &apply);
            if result.is_err() {
                // Unregister the rest so retention is not pinned by a
                // failed batch; their records replay on the next open.
                let mut unapplied = self.unapplied()?;
                for offset in index as u64..ops.len() as u64 {
                    unapplied.remove(&(first + offset));
                }
                break;
            }
        }
        result.map(|()| first)
    }

    /// A point-in-time snapshot of the live entries, ascending by key.
    pub fn iter(&self) -> Result<DbIter> {
        self.ensure_open()?;
        let table = self.memtable();
        let entries: Vec<(Vec<u8>, Vec<u8>)> = table.iter().collect();
        Ok(DbIter {
            entries: entries.into_iter(),
        })
    }

    /// Forces buffered log records to storage.
    pub fn sync(&self) -> Result<()> {
        self.ensure_open()?;
        self.inner.wal.sync()
    }

    /// Counter snapshot for diagnostics.
    pub fn stats(&self) -> Result<DbStats> {
        self.ensure_open()?;
        let table = self.memtable();
        Ok(DbStats {
            memtable_bytes: table.used_bytes(),
            memtable_budget: table.budget(),
            memtable_entries: table.len(),
            memtable_state: table.state(),
            shard_count: table.shard_count(),
            wal_segments: self.inner.wal.segment_count()?,
            next_sequence: self.inner.wal.next_sequence()?,
        })
    }

    /// Closes the store: the log is flushed, fsynced, and sealed.
    /// Idempotent; every later operation fails with `Closed`.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self
            .inner
            .flush_lock
            .lock()
            .map_err(|_| Error::Internal("flush lock poisoned".into()))?;
        self.inner.wal.close()?;
        info!("db closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Write plumbing
    // --------------------------------------------------------------------------------------------

    /// Appends one record and registers its sequence as in-flight.
    fn log_one(&self, record_type: RecordType, key: &[u8], value: &[u8]) -> Result<u64> {
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        let seq = match self.inner.wal.append(record_type, key, value) {
            Ok(seq) => seq,
            Err(e) => {
                self.inner.pending.fetch_sub(1, Ordering::SeqCst);
                return Err(e);
            }
        };
        let registered = self.unapplied().map(|mut set| {
            set.insert(seq);
        });
        self.inner.pending.fetch_sub(1, Ordering::SeqCst);
        registered.map(|()| seq)
    }

    /// Applies a registered sequence, flushing and retrying once when
    /// the table is full or sealed.
    fn settle(&self, seq: u64, op: &ApplyOp<'_>) -> Result<()> {
        let result = self.apply_registered(seq, op);
        if result.is_err() {
            let _ = self.unapplied().map(|mut set| set.remove(&seq));
        }
        result
    }

    fn apply_registered(&self, seq: u64, op: &ApplyOp<'_>) -> Result<()> {
        let table = self.memtable();
        let applied = match Self::apply_to(&table, op) {
            Ok(()) => Ok(()),
            Err(Error::Full(_)) | Err(Error::Immutable) => {
                debug!(seq, "memtable rejected write, triggering flush");
                self.flush_and_swap(&table)
                    .and_then(|()| Self::apply_to(&self.memtable(), op))
            }
            Err(e) => Err(e),
        };
        applied.map(|()| {
            self.inner.last_applied.fetch_max(seq, Ordering::SeqCst);
            if let Ok(mut set) = self.unapplied() {
                set.remove(&seq);
            }
        })
    }

    fn apply_to(table: &Memtable, op: &ApplyOp<'_>) -> Result<()> {
        match op {
            ApplyOp::Put { key, value } => table.apply_put(key, value),
            ApplyOp::Delete { key } => match table.apply_delete(key) {
                // Absent keys are fine: the tombstone lives in the log.
                Ok(()) | Err(Error::NotFound) => Ok(()),
                Err(e) => Err(e),
            },
        }
    }

    // --------------------------------------------------------------------------------------------
    // Flush path
    // --------------------------------------------------------------------------------------------

    /// Seals the given table, hands it to the sink, swaps in a fresh
    /// one, and trims the log up to the flushed boundary.
    ///
    /// Callers race here: whoever loses the flush lock finds the swap
    /// already done and returns immediately.
    fn flush_and_swap(&self, sealed: &Arc<Memtable>) -> Result<()> {
        let _guard = self
            .inner
            .flush_lock
            .lock()
            .map_err(|_| Error::Internal("flush lock poisoned".into()))?;

        let current = self.memtable();
        if !Arc::ptr_eq(&current, sealed) {
            return Ok(());
        }

        current.transition(MemtableState::Mutable, MemtableState::Sealing)?;

        // Drain writers still between log append and settle, so every
        // sequence is either applied to `current` or registered.
        while self.inner.pending.load(Ordering::SeqCst) != 0 {
            thread::yield_now();
        }

        current.transition(MemtableState::Sealing, MemtableState::Immutable)?;

        let retain_up_to = {
            let floor = self
                .unapplied()?
                .iter()
                .next()
                .copied()
                .unwrap_or(u64::MAX);
            let applied_boundary = self.inner.last_applied.load(Ordering::SeqCst) + 1;
            applied_boundary.min(floor)
        };

        current.transition(MemtableState::Immutable, MemtableState::Flushing)?;
        let entries = current.len();
        self.inner.sink.flush(&mut current.iter())?;

        let fresh = Arc::new(Memtable::new(&self.inner.config.memtable_config())?);
        *self
            .inner
            .memtable
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = fresh;

        if let Err(e) = self.inner.wal.retain(retain_up_to) {
            warn!(error = %e, "log retention after flush failed");
        }
        current.transition(MemtableState::Flushing, MemtableState::Retired)?;

        info!(entries, retain_up_to, "memtable flushed and swapped");
        Ok(())
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("dir", &self.inner.wal.dir())
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// Iterator
// ------------------------------------------------------------------------------------------------

/// Owning iterator over a point-in-time snapshot of the store.
#[derive(Debug)]
pub struct DbIter {
    entries: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
}

impl Iterator for DbIter {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }
}

impl ExactSizeIterator for DbIter {
    fn len(&self) -> usize {
        self.entries.len()
    }
}
