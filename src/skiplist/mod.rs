//! # Concurrent Skiplist
//!
//! An ordered map from opaque byte keys to opaque byte values with
//! probabilistic multi-level indexing. This is the structure backing
//! every memtable shard.
//!
//! ## Design Invariants
//!
//! - A forward pointer at level `L` points to a node whose key is
//!   strictly greater; every level-`L` link is backed by a chain of
//!   level-0 links.
//! - The head sentinel has the maximum height, carries no key, and is
//!   never deleted.
//! - A node is published (state `VALID`) only after it is linked at
//!   every level of its height; it is retired only after it is marked
//!   `DELETED` and unlinked from every level, and freed only once no
//!   reader can still hold a reference to it.
//!
//! ## Concurrency Model
//!
//! All pointer updates are CAS; readers never block writers. Memory
//! reclamation is epoch-based (`crossbeam::epoch`): readers pin a guard
//! for the duration of a traversal, deleted nodes are handed to
//! `defer_destroy` only once unreachable, and the epoch machinery
//! guarantees no node is freed while a pinned reader can still see it.
//!
//! Deletion freezes a node's outgoing pointers by tagging them; a CAS
//! that expects an untagged pointer can therefore never relink past a
//! node that is being removed. Traversals help: they mark and unlink
//! any logically deleted node they encounter, so one completed search
//! pass leaves the target unreachable at every level.
//!
//! Per single key, operations are linearizable. Iteration is live and
//! makes no snapshot promise beyond never yielding deleted entries or
//! freed memory.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};

use crossbeam::epoch::{self, Atomic, Guard, Owned, Shared};
use rand::Rng;
use tracing::trace;

use crate::error::{Error, Result};
use crate::sync::{Attempt, RetryPolicy, SyncConfig};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Tallest tower a node can carry.
pub const MAX_HEIGHT: usize = 32;

/// Estimated per-node bookkeeping charged to memory accounting, on top
/// of key and value bytes.
pub const NODE_OVERHEAD: usize = 64;

/// Tag bit marking a frozen (being-deleted) forward pointer.
const TAG_REMOVED: usize = 1;

// Node lifecycle: created INSERTING, published VALID, logically removed
// DELETED. The "garbage" stage is the epoch deferral after unlinking.
const STATE_INSERTING: u8 = 0;
const STATE_VALID: u8 = 1;
const STATE_DELETED: u8 = 2;

// ------------------------------------------------------------------------------------------------
// Node
// ------------------------------------------------------------------------------------------------

struct Node {
    /// Immutable key bytes; empty only for the head sentinel.
    key: Box<[u8]>,

    /// Current value; replaced by pointer swap on update so readers
    /// never observe a freed value. Null only for the head sentinel.
    value: Atomic<Vec<u8>>,

    /// Lifecycle state (`STATE_*`).
    state: AtomicU8,

    /// Forward pointers, one per level; the vector length is the
    /// node's immutable height.
    next: Box<[Atomic<Node>]>,
}

impl Node {
    fn new(key: &[u8], value: Vec<u8>, height: usize) -> Self {
        let next = (0..height).map(|_| Atomic::null()).collect();
        Self {
            key: key.into(),
            value: Atomic::new(value),
            state: AtomicU8::new(STATE_INSERTING),
            next,
        }
    }

    fn sentinel() -> Self {
        let next = (0..MAX_HEIGHT).map(|_| Atomic::null()).collect();
        Self {
            key: Box::default(),
            value: Atomic::null(),
            state: AtomicU8::new(STATE_VALID),
            next,
        }
    }

    fn height(&self) -> usize {
        self.next.len()
    }

    fn is_deleted(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_DELETED
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        // The node owns its current value allocation; values replaced
        // earlier were retired through the epoch at swap time.
        let value = std::mem::replace(&mut self.value, Atomic::null());
        unsafe {
            let guard = epoch::unprotected();
            if !value.load(Ordering::Relaxed, guard).is_null() {
                drop(value.into_owned());
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Search frame
// ------------------------------------------------------------------------------------------------

/// The rightmost valid predecessor and its successor at every level,
/// as recorded by [`SkipList::find`]. Deleted nodes are never recorded
/// as predecessors.
struct SearchFrame<'g> {
    preds: [&'g Node; MAX_HEIGHT],
    succs: [Shared<'g, Node>; MAX_HEIGHT],
    /// Level-0 successor matching the key exactly, if any.
    found: Option<Shared<'g, Node>>,
}

// ------------------------------------------------------------------------------------------------
// Insert outcome
// ------------------------------------------------------------------------------------------------

/// What [`SkipList::insert`] did, so callers can account byte deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new node was linked.
    Inserted,
    /// An existing node's value was replaced in place.
    Updated {
        /// Byte length of the replaced value.
        old_value_len: usize,
    },
}

// ------------------------------------------------------------------------------------------------
// SkipList Core
// ------------------------------------------------------------------------------------------------

/// A concurrent ordered byte-key map.
///
/// See the [module-level documentation](self) for the concurrency and
/// reclamation model.
pub struct SkipList {
    head: Box<Node>,
    len: AtomicUsize,
    memory: AtomicUsize,
    retry: RetryPolicy,
    hint: Option<SearchHint>,
}

// All interior mutability is through atomics and epoch pointers.
unsafe impl Send for SkipList {}
unsafe impl Sync for SkipList {}

impl SkipList {
    /// Creates an empty list tuned by `config`.
    pub fn new(config: &SyncConfig) -> Self {
        Self::with_hint(config, false)
    }

    /// Creates an empty list, optionally with the last-position search
    /// hint enabled.
    pub fn with_hint(config: &SyncConfig, enable_hint: bool) -> Self {
        Self {
            head: Box::new(Node::sentinel()),
            len: AtomicUsize::new(0),
            memory: AtomicUsize::new(0),
            retry: config.retry_policy(),
            hint: enable_hint.then(SearchHint::default),
        }
    }

    /// Number of live entries (best-effort under concurrency).
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// True when no live entry exists (best-effort under concurrency).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate bytes held: key + value + per-node overhead.
    pub fn memory_usage(&self) -> usize {
        self.memory.load(Ordering::Acquire)
    }

    /// Draws a tower height with `P(h ≥ k) = (1/4)^(k-1)`, clamped to
    /// [`MAX_HEIGHT`]. The RNG is the per-thread generator, so draws
    /// never contend.
    fn random_height() -> usize {
        let mut rng = rand::rng();
        let mut height = 1;
        while height < MAX_HEIGHT && rng.random_ratio(1, 4) {
            height += 1;
        }
        height
    }

    /// Locates `key`: records the rightmost non-deleted predecessor and
    /// its successor at every level.
    ///
    /// Traversal helps removal along the way: any node in state
    /// `DELETED` has its forward pointers tagged (frozen) and is
    /// unlinked from the levels on the search path. A completed pass
    /// therefore leaves every logically deleted node for this key
    /// unreachable — which is what lets the deleting thread retire it.
    fn find<'g>(&'g self, key: &[u8], guard: &'g Guard) -> SearchFrame<'g> {
        'search: loop {
            let head: &Node = &self.head;
            let mut preds: [&'g Node; MAX_HEIGHT] = [head; MAX_HEIGHT];
            let mut succs: [Shared<'g, Node>; MAX_HEIGHT] = [Shared::null(); MAX_HEIGHT];

            let mut pred: &'g Node = head;
            for level in (0..MAX_HEIGHT).rev() {
                let mut curr = pred.next[level].load(Ordering::SeqCst, guard);
                loop {
                    let Some(c) = (unsafe { curr.as_ref() }) else {
                        break;
                    };

                    if c.is_deleted() {
                        // Freeze the outgoing pointer, then splice the
                        // node out of this level.
                        let succ = c.next[level].load(Ordering::SeqCst, guard);
                        if succ.tag() != TAG_REMOVED {
                            let _ = c.next[level].compare_exchange(
                                succ,
                                succ.with_tag(TAG_REMOVED),
                                Ordering::SeqCst,
                                Ordering::SeqCst,
                                guard,
                            );
                            continue;
                        }
                        match pred.next[level].compare_exchange(
                            curr,
                            succ.with_tag(0),
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                            guard,
                        ) {
                            Ok(_) => {
                                curr = succ.with_tag(0);
                                continue;
                            }
                            Err(_) => continue 'search,
                        }
                    }

                    if c.key.as_ref() < key {
                        pred = c;
                        curr = c.next[level].load(Ordering::SeqCst, guard);
                    } else {
                        break;
                    }
                }
                preds[level] = pred;
                succs[level] = curr.with_tag(0);
            }

            let found = match unsafe { succs[0].as_ref() } {
                Some(c) if c.key.as_ref() == key => Some(succs[0]),
                _ => None,
            };
            return SearchFrame { preds, succs, found };
        }
    }

    /// Inserts `key → value`, replacing any existing value.
    ///
    /// On update the replaced value is retired through the epoch, so a
    /// reader that obtained it keeps a valid reference until its guard
    /// drops. Fails with `InvalidArg` on empty key or value and with
    /// `Timeout` once the retry budget is exhausted under contention.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<InsertOutcome> {
        if key.is_empty() {
            return Err(Error::InvalidArg("empty key".into()));
        }
        if value.is_empty() {
            return Err(Error::InvalidArg("empty value".into()));
        }

        let guard = epoch::pin();
        let height = Self::random_height();
        let mut pending: Option<Owned<Node>> = None;

        self.retry.run(|| {
            let frame = self.find(key, &guard);

            if let Some(found) = frame.found {
                let node = unsafe { found.deref() };
                if node.is_deleted() {
                    // Its remover is still splicing; retry until the
                    // tower disappears from the search path.
                    return Attempt::Retry;
                }
                let old = node.value.swap(
                    Owned::new(value.to_vec()),
                    Ordering::SeqCst,
                    &guard,
                );
                let old_len = unsafe { old.deref().len() };
                unsafe { guard.defer_destroy(old) };
                if value.len() >= old_len {
                    self.memory.fetch_add(value.len() - old_len, Ordering::AcqRel);
                } else {
                    saturating_sub(&self.memory, old_len - value.len());
                }
                self.hint_publish(found, &guard);
                trace!(key_len = key.len(), value_len = value.len(), "skiplist value replaced");
                return Attempt::Done(InsertOutcome::Updated { old_value_len: old_len });
            }

            let owned = pending
                .take()
                .unwrap_or_else(|| Owned::new(Node::new(key, value.to_vec(), height)));

            // Wire the tower to its successors before exposing it.
            for level in 0..height {
                owned.next[level].store(frame.succs[level], Ordering::Relaxed);
            }

            let inserted = match frame.preds[0].next[0].compare_exchange(
                frame.succs[0],
                owned,
                Ordering::SeqCst,
                Ordering::SeqCst,
                &guard,
            ) {
                Ok(shared) => shared,
                Err(e) => {
                    // Keep the allocation for the next attempt.
                    pending = Some(e.new);
                    return Attempt::Retry;
                }
            };
            let node = unsafe { inserted.deref() };

            // Link the upper levels; a level that no longer fits the
            // recorded frame is re-searched.
            let mut frame = frame;
            'levels: for level in 1..height {
                loop {
                    let expected = node.next[level].load(Ordering::SeqCst, &guard);
                    let succ = frame.succs[level];
                    if expected != succ
                        && node.next[level]
                            .compare_exchange(
                                expected,
                                succ,
                                Ordering::SeqCst,
                                Ordering::SeqCst,
                                &guard,
                            )
                            .is_err()
                    {
                        continue;
                    }
                    match frame.preds[level].next[level].compare_exchange(
                        succ,
                        inserted,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                        &guard,
                    ) {
                        Ok(_) => continue 'levels,
                        Err(_) => {
                            frame = self.find(key, &guard);
                            if frame.found != Some(inserted) {
                                // The node vanished mid-link; its
                                // remover owns the rest of its life.
                                break 'levels;
                            }
                        }
                    }
                }
            }

            node.state.store(STATE_VALID, Ordering::SeqCst);
            self.len.fetch_add(1, Ordering::AcqRel);
            self.memory
                .fetch_add(NODE_OVERHEAD + key.len() + value.len(), Ordering::AcqRel);
            self.hint_publish(inserted, &guard);
            trace!(key_len = key.len(), value_len = value.len(), height, "skiplist node inserted");
            Attempt::Done(InsertOutcome::Inserted)
        })
    }

    /// Returns a freshly owned copy of the current value for `key`.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        if key.is_empty() {
            return Err(Error::InvalidArg("empty key".into()));
        }
        let guard = epoch::pin();

        let node = match self.hint_lookup(key, &guard) {
            Some(node) => Some(node),
            None => self.read_search(key, &guard),
        };

        match node {
            Some(shared) => {
                let node = unsafe { shared.deref() };
                if node.is_deleted() {
                    return Err(Error::NotFound);
                }
                let value = node.value.load(Ordering::SeqCst, &guard);
                let copy = unsafe { value.deref() }.clone();
                self.hint_publish(shared, &guard);
                Ok(copy)
            }
            None => Err(Error::NotFound),
        }
    }

    /// Read-only descent: never helps, never CASes; deleted nodes are
    /// stepped over as if their keys compared greater.
    fn read_search<'g>(&'g self, key: &[u8], guard: &'g Guard) -> Option<Shared<'g, Node>> {
        let mut pred: &Node = &self.head;
        let mut candidate = Shared::null();
        for level in (0..MAX_HEIGHT).rev() {
            let mut curr = pred.next[level].load(Ordering::SeqCst, guard).with_tag(0);
            while let Some(c) = unsafe { curr.as_ref() } {
                if c.key.as_ref() < key || c.is_deleted() && c.key.as_ref() == key {
                    if !c.is_deleted() {
                        pred = c;
                    }
                    let next = c.next[level].load(Ordering::SeqCst, guard).with_tag(0);
                    curr = next;
                    continue;
                }
                break;
            }
            if level == 0 {
                candidate = curr;
            }
        }
        match unsafe { candidate.as_ref() } {
            Some(c) if c.key.as_ref() == key && !c.is_deleted() => Some(candidate),
            _ => None,
        }
    }

    /// Logically removes `key`, then splices the node out of every
    /// level and retires it through the epoch.
    ///
    /// Exactly one caller wins for a given live node. Returns the
    /// removed value's byte length for the caller's accounting.
    pub fn delete(&self, key: &[u8]) -> Result<usize> {
        if key.is_empty() {
            return Err(Error::InvalidArg("empty key".into()));
        }
        let guard = epoch::pin();

        let frame = self.find(key, &guard);
        let Some(found) = frame.found else {
            return Err(Error::NotFound);
        };
        let node = unsafe { found.deref() };

        // Exactly one remover wins; a node still being inserted or
        // already deleted reads as absent.
        if node
            .state
            .compare_exchange(STATE_VALID, STATE_DELETED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::NotFound);
        }

        let value_len = unsafe { node.value.load(Ordering::SeqCst, &guard).deref().len() };

        // Freeze the tower: once a forward pointer is tagged it can no
        // longer be redirected, so no traversal can relink past us.
        for level in (0..node.height()).rev() {
            loop {
                let succ = node.next[level].load(Ordering::SeqCst, &guard);
                if succ.tag() == TAG_REMOVED {
                    break;
                }
                if node.next[level]
                    .compare_exchange(
                        succ,
                        succ.with_tag(TAG_REMOVED),
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                        &guard,
                    )
                    .is_ok()
                {
                    break;
                }
            }
        }

        // One completed search pass splices the node out of every level
        // it still occupies; only then is retirement safe.
        let _ = self.find(key, &guard);

        self.hint_invalidate(found);
        self.len.fetch_sub(1, Ordering::AcqRel);
        // A racing updater may have swapped the value after the length
        // read above; saturate rather than let the counter wrap.
        saturating_sub(&self.memory, NODE_OVERHEAD + key.len() + value_len);
        unsafe { guard.defer_destroy(found) };
        trace!(key_len = key.len(), "skiplist node deleted");
        Ok(value_len)
    }

    /// A live iterator over all non-deleted entries in ascending key
    /// order. Concurrent mutations may or may not be reflected; the
    /// iterator never yields a deleted entry or freed memory.
    pub fn iter(&self) -> SkipListIter<'_> {
        SkipListIter {
            _list: self,
            guard: epoch::pin(),
            current: std::ptr::from_ref::<Node>(&self.head),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Search hint
    // --------------------------------------------------------------------------------------------

    /// Consults the hint: on an 8-byte prefix match, a validated
    /// last-hit node with `key ≤ target` seeds a level-0 walk.
    fn hint_lookup<'g>(&'g self, key: &[u8], guard: &'g Guard) -> Option<Shared<'g, Node>> {
        let hint = self.hint.as_ref()?;
        let prefix = key_prefix(key);
        if prefix == 0 || hint.prefix.load(Ordering::SeqCst) != prefix {
            return None;
        }
        let start = hint.node.load(Ordering::SeqCst, guard);
        let node = unsafe { start.as_ref() }?;
        if node.is_deleted() || node.key.as_ref() > key {
            return None;
        }

        let mut curr = start.with_tag(0);
        while let Some(c) = unsafe { curr.as_ref() } {
            if c.key.as_ref() == key && !c.is_deleted() {
                return Some(curr);
            }
            if c.key.as_ref() > key {
                return None;
            }
            curr = c.next[0].load(Ordering::SeqCst, guard).with_tag(0);
        }
        None
    }

    /// Publishes `node` as the last hit.
    ///
    /// Protocol keeping the hint safe against reclamation: the store is
    /// followed by a state re-check, and a remover clears the hint
    /// after unlinking and before retiring. Whichever side runs second
    /// empties the hint, so a retired node is never reachable through it.
    fn hint_publish(&self, node: Shared<'_, Node>, _guard: &Guard) {
        let Some(hint) = self.hint.as_ref() else {
            return;
        };
        let node_ref = unsafe { node.deref() };
        let prefix = key_prefix(&node_ref.key);
        if prefix == 0 {
            return;
        }
        hint.node.store(node.with_tag(0), Ordering::SeqCst);
        hint.prefix.store(prefix, Ordering::SeqCst);
        if node_ref.is_deleted() {
            self.hint_invalidate(node);
        }
    }

    /// Clears the hint when it points at `node`.
    fn hint_invalidate(&self, node: Shared<'_, Node>) {
        let Some(hint) = self.hint.as_ref() else {
            return;
        };
        let guard = epoch::pin();
        let current = hint.node.load(Ordering::SeqCst, &guard);
        if current.as_raw() == node.as_raw() {
            hint.prefix.store(0, Ordering::SeqCst);
            let _ = hint.node.compare_exchange(
                current,
                Shared::null(),
                Ordering::SeqCst,
                Ordering::SeqCst,
                &guard,
            );
        }
    }
}

impl Drop for SkipList {
    fn drop(&mut self) {
        // Exclusive access: free the level-0 chain directly. Nodes
        // already unlinked are owned by the epoch collector.
        unsafe {
            let guard = epoch::unprotected();
            let mut curr = self.head.next[0].load(Ordering::Relaxed, guard).with_tag(0);
            while !curr.is_null() {
                let next = curr
                    .deref()
                    .next[0]
                    .load(Ordering::Relaxed, guard)
                    .with_tag(0);
                drop(curr.into_owned());
                curr = next;
            }
        }
    }
}

impl std::fmt::Debug for SkipList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkipList")
            .field("len", &self.len())
            .field("memory_usage", &self.memory_usage())
            .finish_non_exhaustive()
    }
}

/// Per-list advisory cache of the last successful lookup position.
#[derive(Default)]
struct SearchHint {
    /// First eight key bytes, little-endian packed; 0 means empty.
    prefix: AtomicU64,
    node: Atomic<Node>,
}

/// Lowers a best-effort usage counter without wrapping below zero.
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

/// Packs up to eight leading key bytes into a non-zero gate value.
fn key_prefix(key: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    let n = key.len().min(8);
    bytes[..n].copy_from_slice(&key[..n]);
    u64::from_le_bytes(bytes)
}

// ------------------------------------------------------------------------------------------------
// Iterator
// ------------------------------------------------------------------------------------------------

/// Live forward iterator over a [`SkipList`].
///
/// Holds an epoch guard for its whole lifetime, so every node it can
/// reach stays allocated until the iterator is dropped.
pub struct SkipListIter<'a> {
    _list: &'a SkipList,
    guard: Guard,
    /// The most recently yielded position (starts at the sentinel).
    current: *const Node,
}

impl Iterator for SkipListIter<'_> {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let current = unsafe { self.current.as_ref()? };
            let next = current.next[0].load(Ordering::SeqCst, &self.guard).with_tag(0);
            let node = unsafe { next.as_ref() }?;
            self.current = next.as_raw();
            if node.is_deleted() {
                continue;
            }
            let value = node.value.load(Ordering::SeqCst, &self.guard);
            let value = unsafe { value.deref() }.clone();
            return Some((node.key.to_vec(), value));
        }
    }
}

impl std::fmt::Debug for SkipListIter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkipListIter").finish_non_exhaustive()
    }
}
