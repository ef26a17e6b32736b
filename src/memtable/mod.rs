//! # Sharded Memtable
//!
//! The mutable, in-memory write buffer of the storage engine: a fixed
//! array of independent skiplist shards selected by a stable hash of
//! the key, so writes to different shards never contend on a single
//! ordered-map lock.
//!
//! ## Design Invariants
//!
//! - The shard for a key is `fnv1a32(key) % shard_count` and never
//!   changes for the lifetime of the table.
//! - Every write charges `NODE_OVERHEAD + key + value` bytes to its
//!   shard and to the global counter; updates charge only the value
//!   delta and deletes refund. The sum of per-shard counters tracks
//!   the global budget view to within one in-flight record.
//! - A write that would push the global counter past the budget fails
//!   with `Full`; the write coordinator owns the sealing transition.
//!
//! ## Lifecycle
//!
//! `MUTABLE → SEALING → IMMUTABLE → FLUSHING → RETIRED`, driven by the
//! coordinator under its flush lock. Writes succeed only in `MUTABLE`
//! (anything later fails `Immutable`); reads and iteration proceed in
//! every state except `RETIRED`.
//!
//! ## Concurrency
//!
//! In the default locked mode, writers hold their shard's lock
//! exclusively and readers take it shared, so the configured lock kind
//! is directly observable per shard. In lock-free mode both sides go
//! straight to the skiplist's CAS paths.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::skiplist::{InsertOutcome, NODE_OVERHEAD, SkipList, SkipListIter};
use crate::sync::{RawSync, SyncConfig};

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Sizing and synchronization knobs for a [`Memtable`].
#[derive(Debug, Clone, Copy)]
pub struct MemtableConfig {
    /// Byte budget across all shards before writes fail with `Full`.
    pub budget: usize,

    /// Number of independent shards; must be at least 1.
    pub shard_count: usize,

    /// Lock variant and retry discipline for the shards.
    pub sync: SyncConfig,
}

impl Default for MemtableConfig {
    fn default() -> Self {
        Self {
            budget: 64 * 1024 * 1024,
            shard_count: 16,
            sync: SyncConfig::default(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// State machine
// ------------------------------------------------------------------------------------------------

/// Lifecycle state of a [`Memtable`] during its flush cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemtableState {
    /// Accepting writes.
    Mutable = 0,
    /// The coordinator is sealing; writes already fail.
    Sealing = 1,
    /// Sealed; serving reads while awaiting flush.
    Immutable = 2,
    /// Being handed to the flush sink; reads continue.
    Flushing = 3,
    /// Fully flushed; no further access.
    Retired = 4,
}

impl MemtableState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => MemtableState::Mutable,
            1 => MemtableState::Sealing,
            2 => MemtableState::Immutable,
            3 => MemtableState::Flushing,
            _ => MemtableState::Retired,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Shard
// ------------------------------------------------------------------------------------------------

/// One partition of the key space: a skiplist, its byte counter, and
/// its own lock.
struct Shard {
    list: SkipList,
    used: AtomicUsize,
    sync: RawSync,
}

impl Shard {
    fn new(sync: &SyncConfig) -> Self {
        Self {
            list: SkipList::new(sync),
            used: AtomicUsize::new(0),
            sync: RawSync::new(sync),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Memtable Core
// ------------------------------------------------------------------------------------------------

/// A write-scalable in-memory store partitioned across skiplist shards.
///
/// See the [module-level documentation](self) for invariants and the
/// lifecycle model.
pub struct Memtable {
    shards: Box<[Shard]>,
    budget: usize,
    used: AtomicUsize,
    state: AtomicU8,
    lock_free: bool,
}

impl Memtable {
    /// Creates an empty, mutable table.
    pub fn new(config: &MemtableConfig) -> Result<Self> {
        if config.shard_count == 0 {
            return Err(Error::InvalidArg("shard_count must be at least 1".into()));
        }
        let shards = (0..config.shard_count)
            .map(|_| Shard::new(&config.sync))
            .collect();
        debug!(
            shard_count = config.shard_count,
            budget = config.budget,
            lock_free = config.sync.lock_free,
            "memtable created"
        );
        Ok(Self {
            shards,
            budget: config.budget,
            used: AtomicUsize::new(0),
            state: AtomicU8::new(MemtableState::Mutable as u8),
            lock_free: config.sync.lock_free,
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> MemtableState {
        MemtableState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Advances the state machine by one step; fails with `Internal`
    /// when the table is not in `from`. Driven by the coordinator
    /// under its flush lock.
    pub fn transition(&self, from: MemtableState, to: MemtableState) -> Result<()> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| {
                debug!(from = ?from, to = ?to, "memtable state transition");
            })
            .map_err(|actual| {
                Error::Internal(format!(
                    "memtable transition {from:?} -> {to:?} found state {:?}",
                    MemtableState::from_u8(actual)
                ))
            })
    }

    /// Total bytes charged across all shards.
    pub fn used_bytes(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Configured byte budget.
    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Number of live entries across all shards (best-effort).
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.list.len()).sum()
    }

    /// True when no shard holds an entry (best-effort).
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.list.is_empty())
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Bytes charged to one shard; for accounting checks.
    pub fn shard_used_bytes(&self, index: usize) -> usize {
        self.shards[index].used.load(Ordering::Acquire)
    }

    fn shard(&self, key: &[u8]) -> &Shard {
        let index = fnv1a32(key) as usize % self.shards.len();
        &self.shards[index]
    }

    /// Inserts or updates `key → value`, enforcing state and budget.
    pub fn apply_put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        match self.state() {
            MemtableState::Mutable => {}
            MemtableState::Retired => return Err(Error::Closed),
            _ => return Err(Error::Immutable),
        }

        let charge = NODE_OVERHEAD + key.len() + value.len();
        let previous = self.used.fetch_add(charge, Ordering::AcqRel);
        if previous + charge > self.budget {
            saturating_sub(&self.used, charge);
            trace!(used = previous, charge, budget = self.budget, "memtable budget exceeded");
            return Err(Error::Full("memtable budget exceeded".into()));
        }

        self.put_to_shard(key, value, charge)
    }

    /// Recovery-path insert: no state or budget enforcement, because
    /// replay must reproduce the pre-crash state exactly.
    pub fn replay_put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let charge = NODE_OVERHEAD + key.len() + value.len();
        self.used.fetch_add(charge, Ordering::AcqRel);
        self.put_to_shard(key, value, charge)
    }

    fn put_to_shard(&self, key: &[u8], value: &[u8], charge: usize) -> Result<()> {
        let shard = self.shard(key);
        shard.used.fetch_add(charge, Ordering::AcqRel);

        let outcome = if self.lock_free {
            shard.list.insert(key, value)
        } else {
            let _guard = shard.sync.exclusive();
            shard.list.insert(key, value)
        };

        match outcome {
            Ok(InsertOutcome::Inserted) => Ok(()),
            Ok(InsertOutcome::Updated { old_value_len }) => {
                // The node already existed: give back everything but
                // the value delta.
                let refund = NODE_OVERHEAD + key.len() + old_value_len;
                saturating_sub(&self.used, refund);
                saturating_sub(&shard.used, refund);
                Ok(())
            }
            Err(e) => {
                saturating_sub(&self.used, charge);
                saturating_sub(&shard.used, charge);
                Err(e)
            }
        }
    }

    /// Removes `key`, refunding its bytes. `NotFound` when absent.
    pub fn apply_delete(&self, key: &[u8]) -> Result<()> {
        match self.state() {
            MemtableState::Mutable => {}
            MemtableState::Retired => return Err(Error::Closed),
            _ => return Err(Error::Immutable),
        }
        self.delete_from_shard(key)
    }

    /// Recovery-path delete: tolerates keys the replayed log removes
    /// that were never replayed into this table (already flushed).
    pub fn replay_delete(&self, key: &[u8]) -> Result<()> {
        match self.delete_from_shard(key) {
            Ok(()) | Err(Error::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn delete_from_shard(&self, key: &[u8]) -> Result<()> {
        let shard = self.shard(key);
        let removed = if self.lock_free {
            shard.list.delete(key)?
        } else {
            let _guard = shard.sync.exclusive();
            shard.list.delete(key)?
        };

        let refund = NODE_OVERHEAD + key.len() + removed;
        saturating_sub(&self.used, refund);
        saturating_sub(&shard.used, refund);
        Ok(())
    }

    /// Returns a copy of the current value for `key`.
    ///
    /// Reads are served in every state except `RETIRED`.
    pub fn lookup(&self, key: &[u8]) -> Result<Vec<u8>> {
        if self.state() == MemtableState::Retired {
            return Err(Error::Closed);
        }
        let shard = self.shard(key);
        if self.lock_free {
            shard.list.get(key)
        } else {
            let _guard = shard.sync.shared();
            shard.list.get(key)
        }
    }

    /// A merging iterator over all shards in ascending key order.
    ///
    /// Keys never cross shards, so ties cannot arise; the heap breaks
    /// hypothetical ties by shard index for determinism.
    pub fn iter(&self) -> MemtableIter<'_> {
        MemtableIter::new(self.shards.iter().map(|s| s.list.iter()).collect())
    }
}

impl std::fmt::Debug for Memtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memtable")
            .field("shard_count", &self.shards.len())
            .field("used_bytes", &self.used_bytes())
            .field("budget", &self.budget)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Lowers a usage counter without wrapping below zero; removal races
/// against in-place updates can over-refund by a value delta.
fn saturating_sub(counter: &AtomicUsize, amount: usize) {
    let mut current = counter.load(Ordering::Acquire);
    loop {
        let next = current.saturating_sub(amount);
        match counter.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Shard routing hash
// ------------------------------------------------------------------------------------------------

/// FNV-1a over the key bytes; stable for the database lifetime, which
/// is what keeps shard routing consistent.
fn fnv1a32(key: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811C_9DC5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET_BASIS;
    for &byte in key {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

// ------------------------------------------------------------------------------------------------
// MemtableIter — heap-based k-way merge over shard iterators
// ------------------------------------------------------------------------------------------------

/// Merges the per-shard iterators into a single ascending stream.
pub struct MemtableIter<'a> {
    sources: Vec<SkipListIter<'a>>,
    heap: BinaryHeap<MergeHeapEntry>,
}

struct MergeHeapEntry {
    key: Vec<u8>,
    value: Vec<u8>,
    shard: usize,
}

impl Ord for MergeHeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Min-heap: reverse so the smallest (key, shard) pops first.
        (&self.key, self.shard).cmp(&(&other.key, other.shard)).reverse()
    }
}

impl PartialOrd for MergeHeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for MergeHeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.shard == other.shard
    }
}

impl Eq for MergeHeapEntry {}

impl<'a> MemtableIter<'a> {
    fn new(mut sources: Vec<SkipListIter<'a>>) -> Self {
        let mut heap = BinaryHeap::new();
        for (shard, source) in sources.iter_mut().enumerate() {
            if let Some((key, value)) = source.next() {
                heap.push(MergeHeapEntry { key, value, shard });
            }
        }
        Self { sources, heap }
    }
}

impl Iterator for MemtableIter<'_> {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.heap.pop()?;
        if let Some((key, value)) = self.sources[entry.shard].next() {
            self.heap.push(MergeHeapEntry {
                key,
                value,
                shard: entry.shard,
            });
        }
        Some((entry.key, entry.value))
    }
}

impl std::fmt::Debug for MemtableIter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemtableIter")
            .field("pending_sources", &self.sources.len())
            .finish_non_exhaustive()
    }
}
