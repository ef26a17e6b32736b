//! # Synchronization Primitives
//!
//! A uniform lock abstraction with three variants — mutex, spinlock, and
//! reader/writer — plus atomic counters and a bounded retry loop. Every
//! synchronized structure in the crate (skiplist shards, the WAL, the
//! flush path) is tuned through a single [`SyncConfig`].
//!
//! ## Variants
//!
//! - [`SyncKind::Mutex`] — `std::sync::Mutex`, blocking, OS-assisted.
//! - [`SyncKind::Spinlock`] — atomic flag with `spin_count` spins before
//!   sleeping `backoff_us` microseconds.
//! - [`SyncKind::Rwlock`] — multiple readers xor one writer, with a
//!   `max_readers` cap. When `fair` is set, readers defer to waiting
//!   writers, bounding writer starvation (no hard fairness guarantee).
//!
//! Locks hand out RAII guards; `try_*` acquisitions fail with
//! [`Error::Busy`] instead of blocking. For the mutex and spinlock
//! variants, shared acquisition degrades to exclusive.
//!
//! ## Lock-free mode
//!
//! The `lock_free` knob does not change the locks themselves — it tells
//! the enclosing structure to prefer atomic CAS fast paths bounded by a
//! [`RetryPolicy`]: every lock-free operation is the fixed point of an
//! `attempt() -> Attempt<T>` function retried with exponential backoff
//! (capped at one second), surfacing [`Error::Timeout`] once the budget
//! is exhausted.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::sync::{
    Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
};
use std::thread;
use std::time::Duration;

use crossbeam::utils::Backoff;

use crate::error::{Error, Result};

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Which implementation backs a [`RawSync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncKind {
    /// OS-assisted blocking mutex.
    #[default]
    Mutex,
    /// Spin-then-sleep lock for short critical sections.
    Spinlock,
    /// Reader/writer lock for read-heavy structures.
    Rwlock,
}

/// Tuning knobs shared by every synchronized structure in the crate.
#[derive(Debug, Clone, Copy)]
pub struct SyncConfig {
    /// Lock variant for shard-level synchronization.
    pub kind: SyncKind,

    /// Prefer CAS fast paths with bounded retry over lock acquisition.
    pub lock_free: bool,

    /// Spins before a spinlock falls back to sleeping.
    pub spin_count: u32,

    /// Base backoff sleep in microseconds.
    pub backoff_us: u64,

    /// Attempts before a lock-free operation gives up with `Timeout`.
    pub max_retries: u32,

    /// Cap on concurrently admitted readers for the rwlock variant.
    pub max_readers: u32,

    /// Readers defer to waiting writers (ticketed admission bias).
    pub fair: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            kind: SyncKind::Mutex,
            lock_free: false,
            spin_count: 1000,
            backoff_us: 1,
            max_retries: 100,
            max_readers: 32,
            fair: true,
        }
    }
}

impl SyncConfig {
    /// The retry discipline derived from this configuration.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_us: self.backoff_us,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// RawSync — the lock sum type
// ------------------------------------------------------------------------------------------------

/// A lock constructed from a [`SyncConfig`], dispatching to the chosen
/// variant at runtime.
///
/// The variant is fixed at construction; callers only see guards.
#[derive(Debug)]
pub struct RawSync {
    inner: Inner,
}

#[derive(Debug)]
enum Inner {
    Mutex(Mutex<()>),
    Spin(SpinLock),
    Rw(RawRwLock),
}

impl RawSync {
    /// Builds a lock of the configured kind.
    pub fn new(config: &SyncConfig) -> Self {
        let inner = match config.kind {
            SyncKind::Mutex => Inner::Mutex(Mutex::new(())),
            SyncKind::Spinlock => Inner::Spin(SpinLock::new(config.spin_count, config.backoff_us)),
            SyncKind::Rwlock => Inner::Rw(RawRwLock::new(config.max_readers, config.fair)),
        };
        Self { inner }
    }

    /// Acquires the lock exclusively, blocking until admitted.
    pub fn exclusive(&self) -> ExclusiveGuard<'_> {
        match &self.inner {
            Inner::Mutex(m) => {
                ExclusiveGuard(GuardInner::Mutex(m.lock().unwrap_or_else(PoisonError::into_inner)))
            }
            Inner::Spin(s) => {
                s.lock();
                ExclusiveGuard(GuardInner::Spin(s))
            }
            Inner::Rw(rw) => {
                rw.lock_exclusive();
                ExclusiveGuard(GuardInner::Rw(rw))
            }
        }
    }

    /// Attempts exclusive acquisition once; fails with [`Error::Busy`].
    pub fn try_exclusive(&self) -> Result<ExclusiveGuard<'_>> {
        match &self.inner {
            Inner::Mutex(m) => match m.try_lock() {
                Ok(g) => Ok(ExclusiveGuard(GuardInner::Mutex(g))),
                Err(std::sync::TryLockError::Poisoned(p)) => {
                    Ok(ExclusiveGuard(GuardInner::Mutex(p.into_inner())))
                }
                Err(std::sync::TryLockError::WouldBlock) => Err(Error::Busy),
            },
            Inner::Spin(s) => {
                if s.try_lock() {
                    Ok(ExclusiveGuard(GuardInner::Spin(s)))
                } else {
                    Err(Error::Busy)
                }
            }
            Inner::Rw(rw) => {
                if rw.try_lock_exclusive() {
                    Ok(ExclusiveGuard(GuardInner::Rw(rw)))
                } else {
                    Err(Error::Busy)
                }
            }
        }
    }

    /// Acquires the lock for shared access.
    ///
    /// Only the rwlock variant admits concurrent holders; the mutex and
    /// spinlock variants serialize readers with writers.
    pub fn shared(&self) -> SharedGuard<'_> {
        match &self.inner {
            Inner::Mutex(m) => {
                SharedGuard(SharedInner::Mutex(m.lock().unwrap_or_else(PoisonError::into_inner)))
            }
            Inner::Spin(s) => {
                s.lock();
                SharedGuard(SharedInner::Spin(s))
            }
            Inner::Rw(rw) => {
                rw.lock_shared();
                SharedGuard(SharedInner::Rw(rw))
            }
        }
    }

    /// Attempts shared acquisition once; fails with [`Error::Busy`].
    pub fn try_shared(&self) -> Result<SharedGuard<'_>> {
        match &self.inner {
            Inner::Mutex(m) => match m.try_lock() {
                Ok(g) => Ok(SharedGuard(SharedInner::Mutex(g))),
                Err(std::sync::TryLockError::Poisoned(p)) => {
                    Ok(SharedGuard(SharedInner::Mutex(p.into_inner())))
                }
                Err(std::sync::TryLockError::WouldBlock) => Err(Error::Busy),
            },
            Inner::Spin(s) => {
                if s.try_lock() {
                    Ok(SharedGuard(SharedInner::Spin(s)))
                } else {
                    Err(Error::Busy)
                }
            }
            Inner::Rw(rw) => {
                if rw.try_lock_shared() {
                    Ok(SharedGuard(SharedInner::Rw(rw)))
                } else {
                    Err(Error::Busy)
                }
            }
        }
    }
}

/// RAII guard for exclusive access; releases on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ExclusiveGuard<'a>(GuardInner<'a>);

#[derive(Debug)]
enum GuardInner<'a> {
    Mutex(MutexGuard<'a, ()>),
    Spin(&'a SpinLock),
    Rw(&'a RawRwLock),
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        match &self.0 {
            GuardInner::Mutex(_) => {} // MutexGuard unlocks itself
            GuardInner::Spin(s) => s.unlock(),
            GuardInner::Rw(rw) => rw.unlock_exclusive(),
        }
    }
}

/// RAII guard for shared access; releases on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct SharedGuard<'a>(SharedInner<'a>);

#[derive(Debug)]
enum SharedInner<'a> {
    Mutex(MutexGuard<'a, ()>),
    Spin(&'a SpinLock),
    Rw(&'a RawRwLock),
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        match &self.0 {
            SharedInner::Mutex(_) => {}
            SharedInner::Spin(s) => s.unlock(),
            SharedInner::Rw(rw) => rw.unlock_shared(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Spinlock
// ------------------------------------------------------------------------------------------------

/// Test-and-test-and-set lock: spin `spin_count` times, then sleep
/// `backoff_us` between probes.
#[derive(Debug)]
struct SpinLock {
    locked: AtomicBool,
    spin_count: u32,
    backoff_us: u64,
}

impl SpinLock {
    fn new(spin_count: u32, backoff_us: u64) -> Self {
        Self {
            locked: AtomicBool::new(false),
            spin_count,
            backoff_us: backoff_us.max(1),
        }
    }

    fn lock(&self) {
        loop {
            if self.try_lock() {
                return;
            }
            let backoff = Backoff::new();
            let mut spins = 0u32;
            while self.locked.load(Ordering::Relaxed) {
                if spins < self.spin_count {
                    backoff.spin();
                    spins += 1;
                } else {
                    thread::sleep(Duration::from_micros(self.backoff_us));
                }
            }
        }
    }

    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

// ------------------------------------------------------------------------------------------------
// Reader/writer lock
// ------------------------------------------------------------------------------------------------

/// Atomic reader/writer lock: a reader count, a writer flag, and a
/// waiting-writer count used for the fairness bias.
///
/// Admission rules:
/// - A reader enters only while no writer holds the lock, the reader
///   cap is not hit, and (in fair mode) no writer is waiting.
/// - A writer first claims the writer flag, then drains readers.
#[derive(Debug)]
struct RawRwLock {
    readers: AtomicU32,
    writer: AtomicBool,
    waiting_writers: AtomicU32,
    max_readers: u32,
    fair: bool,
}

impl RawRwLock {
    fn new(max_readers: u32, fair: bool) -> Self {
        Self {
            readers: AtomicU32::new(0),
            writer: AtomicBool::new(false),
            waiting_writers: AtomicU32::new(0),
            max_readers: max_readers.max(1),
            fair,
        }
    }

    fn lock_shared(&self) {
        let backoff = Backoff::new();
        loop {
            if self.try_lock_shared() {
                return;
            }
            backoff.snooze();
        }
    }

    fn try_lock_shared(&self) -> bool {
        if self.writer.load(Ordering::Acquire) {
            return false;
        }
        if self.fair && self.waiting_writers.load(Ordering::Acquire) > 0 {
            return false;
        }
        let prev = self.readers.fetch_add(1, Ordering::Acquire);
        if prev + 1 > self.max_readers {
            self.readers.fetch_sub(1, Ordering::Release);
            return false;
        }
        // A writer may have claimed the flag between the check and the
        // increment; back out so it can drain.
        if self.writer.load(Ordering::Acquire) {
            self.readers.fetch_sub(1, Ordering::Release);
            return false;
        }
        true
    }

    fn unlock_shared(&self) {
        self.readers.fetch_sub(1, Ordering::Release);
    }

    fn lock_exclusive(&self) {
        self.waiting_writers.fetch_add(1, Ordering::AcqRel);
        let backoff = Backoff::new();
        while self
            .writer
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }
        self.waiting_writers.fetch_sub(1, Ordering::AcqRel);
        while self.readers.load(Ordering::Acquire) != 0 {
            backoff.snooze();
        }
    }

    fn try_lock_exclusive(&self) -> bool {
        if self
            .writer
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        if self.readers.load(Ordering::Acquire) != 0 {
            self.writer.store(false, Ordering::Release);
            return false;
        }
        true
    }

    fn unlock_exclusive(&self) {
        self.writer.store(false, Ordering::Release);
    }
}

// ------------------------------------------------------------------------------------------------
// Atomic counter
// ------------------------------------------------------------------------------------------------

/// Atomic 64-bit counter with load / store / add / sub / cas.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Creates a counter holding `value`.
    pub fn new(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    /// Reads the current value (acquire).
    pub fn load(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Overwrites the value (release).
    pub fn store(&self, value: u64) {
        self.0.store(value, Ordering::Release);
    }

    /// Adds `delta`, returning the previous value.
    pub fn add(&self, delta: u64) -> u64 {
        self.0.fetch_add(delta, Ordering::AcqRel)
    }

    /// Subtracts `delta`, returning the previous value.
    pub fn sub(&self, delta: u64) -> u64 {
        self.0.fetch_sub(delta, Ordering::AcqRel)
    }

    /// Compare-and-swap; true when `current` was replaced by `new`.
    pub fn cas(&self, current: u64, new: u64) -> bool {
        self.0
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

// ------------------------------------------------------------------------------------------------
// Retry policy
// ------------------------------------------------------------------------------------------------

/// Outcome of one attempt of a lock-free operation.
#[derive(Debug)]
pub enum Attempt<T> {
    /// The operation finished with this result.
    Done(T),
    /// Transient interference; try again.
    Retry,
}

/// Backoff ceiling for the retry loop.
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Bounded retry with exponential backoff.
///
/// `run` drives an `attempt` closure to its fixed point: each `Retry`
/// sleeps the current backoff (doubling, capped at one second) and tries
/// again, up to `max_retries` retries. Exhaustion surfaces
/// [`Error::Timeout`]. Callers with `try_` semantics use [`RetryPolicy::once`],
/// which maps the first `Retry` to [`Error::Busy`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries before giving up.
    pub max_retries: u32,

    /// Base backoff sleep in microseconds.
    pub backoff_us: u64,
}

impl RetryPolicy {
    /// Runs `attempt` to completion or retry exhaustion.
    pub fn run<T>(&self, mut attempt: impl FnMut() -> Attempt<T>) -> Result<T> {
        let mut delay = Duration::from_micros(self.backoff_us.max(1));
        for _ in 0..=self.max_retries {
            if let Attempt::Done(value) = attempt() {
                return Ok(value);
            }
            thread::sleep(delay);
            delay = (delay * 2).min(MAX_BACKOFF);
        }
        Err(Error::Timeout)
    }

    /// Runs `attempt` once, mapping `Retry` to [`Error::Busy`].
    pub fn once<T>(&self, mut attempt: impl FnMut() -> Attempt<T>) -> Result<T> {
        match attempt() {
            Attempt::Done(value) => Ok(value),
            Attempt::Retry => Err(Error::Busy),
        }
    }
}
