//! # PPDB
//!
//! An embeddable key-value store core built around an LSM-style write
//! path: a **concurrent skiplist** backing a **sharded memtable**, made
//! durable by a **segmented write-ahead log**, glued together by a thin
//! write coordinator.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                        Db                              │
//! │                                                        │
//! │  put/delete ──► WAL.append ──► (fsync?) ──► Memtable   │
//! │                                               │        │
//! │  ┌─────────────┐   ┌──────────────────────────┴─────┐  │
//! │  │ WAL         │   │ Sharded memtable               │  │
//! │  │ segments,   │   │ shard = fnv1a(key) % S         │  │
//! │  │ CRC, seqs   │   │ each shard: skiplist + lock    │  │
//! │  └─────┬───────┘   └──────────────┬─────────────────┘  │
//! │        │ replay on open           │ flush on budget    │
//! │        ▼                          ▼                    │
//! │   fresh memtable            FlushSink (opaque)         │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | The `Db` handle — open, read, write, batch, flush, recover |
//! | [`memtable`] | Sharded in-memory write buffer with a byte budget |
//! | [`skiplist`] | Concurrent ordered map with epoch-based reclamation |
//! | [`wal`] | Segmented, CRC-protected write-ahead log |
//! | [`sync`] | Lock variants, atomic counters, bounded retry |
//! | [`error`] | The crate-wide error and result types |
//!
//! ## Key Guarantees
//!
//! - **Write-ahead logging** — every mutation is persisted to the log
//!   before it becomes visible, and fsynced before acknowledgement by
//!   default.
//! - **Per-key linearizability** — operations on a single key observe
//!   a total order consistent with real time.
//! - **Crash recovery** — reopening replays every durable record; a
//!   torn tail on the open segment is truncated, any other damage
//!   aborts the open instead of guessing.
//! - **Bounded memory** — the memtable enforces a byte budget across
//!   shards; crossing it hands the sealed table to a flush sink and
//!   swaps in a fresh one.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ppdb::{Db, DbConfig};
//!
//! let db = Db::open("/tmp/my_db", DbConfig::default()).unwrap();
//!
//! db.put(b"hello", b"world").unwrap();
//! assert_eq!(db.get(b"hello").unwrap(), b"world".to_vec());
//!
//! db.delete(b"hello").unwrap();
//! assert!(db.get(b"hello").is_err());
//!
//! for (key, value) in db.iter().unwrap() {
//!     println!("{key:?} = {value:?}");
//! }
//!
//! db.close().unwrap();
//! ```

pub mod engine;
pub mod error;
pub mod memtable;
pub mod skiplist;
pub mod sync;
pub mod wal;

pub use engine::{Db, DbConfig, DbIter, DbStats, DiscardSink, FlushSink, WriteOp};
pub use error::{Error, ErrorKind, Result};
pub use sync::{SyncConfig, SyncKind};
pub use wal::RecordType;
