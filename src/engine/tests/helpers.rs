use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::Level;
use tracing_subscriber::fmt::Subscriber;

use crate::engine::{Db, DbConfig, FlushSink};
use crate::error::Result;

/// Installs a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = Subscriber::builder()
        .with_max_level(Level::TRACE)
        .try_init();
}

/// Opens a database with default config.
pub fn open_db(dir: &Path) -> Db {
    Db::open(dir, DbConfig::default()).expect("open db")
}

/// A config with a small memtable budget so flushes trigger quickly.
pub fn small_budget_config(budget: usize) -> DbConfig {
    DbConfig {
        memtable_budget: budget,
        shard_count: 4,
        ..DbConfig::default()
    }
}

/// Simulates a crash: the handle is leaked, so neither the log seal
/// nor any buffered flush runs.
pub fn crash(db: Db) {
    std::mem::forget(db);
}

/// Segment files under `dir`, sorted by id.
pub fn segment_files(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("seg"))
        .collect();
    files.sort();
    files
}

/// Flush sink that records every batch it is handed, for assertions.
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    flushes: Arc<Mutex<Vec<Vec<(Vec<u8>, Vec<u8>)>>>>,
}

impl CollectingSink {
    pub fn flush_count(&self) -> usize {
        self.flushes.lock().unwrap().len()
    }

    pub fn total_entries(&self) -> usize {
        self.flushes.lock().unwrap().iter().map(Vec::len).sum()
    }

    pub fn all_entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.flushes.lock().unwrap().iter().flatten().cloned().collect()
    }

    pub fn batches(&self) -> Vec<Vec<(Vec<u8>, Vec<u8>)>> {
        self.flushes.lock().unwrap().clone()
    }
}

impl FlushSink for CollectingSink {
    fn flush(&self, entries: &mut dyn Iterator<Item = (Vec<u8>, Vec<u8>)>) -> Result<()> {
        self.flushes.lock().unwrap().push(entries.collect());
        Ok(())
    }
}
