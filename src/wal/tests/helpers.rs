use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use tracing::Level;
use tracing_subscriber::fmt::Subscriber;

use crate::wal::{Record, RecordType, Wal, WalConfig};

/// Installs a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = Subscriber::builder()
        .with_max_level(Level::TRACE)
        .try_init();
}

/// A config with a small segment cap so tests roll over quickly.
pub fn small_segment_config(dir: &Path, segment_size: usize) -> WalConfig {
    WalConfig {
        segment_size,
        ..WalConfig::new(dir)
    }
}

/// Opens a WAL with default config rooted at `dir`.
pub fn open_wal(dir: &Path) -> Wal {
    Wal::open(WalConfig::new(dir)).expect("open wal")
}

/// Appends `count` puts shaped `key-NNN → value-NNN` and returns their
/// sequences.
pub fn append_puts(wal: &Wal, count: u32) -> Vec<u64> {
    (0..count)
        .map(|i| {
            let key = format!("key-{i:03}").into_bytes();
            let value = format!("value-{i:03}").into_bytes();
            wal.append(RecordType::Put, &key, &value).expect("append")
        })
        .collect()
}

/// Collects every record from sequence `from` upward.
pub fn collect_from(wal: &Wal, from: u64) -> Vec<Record> {
    wal.iterate_from(from)
        .expect("iterate")
        .collect::<Result<Vec<_>, _>>()
        .expect("replay")
}

/// Overwrites `len` bytes at `offset` from the end of `path`.
pub fn corrupt_tail(path: &Path, len: usize) {
    let mut file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    file.seek(SeekFrom::End(-(len as i64))).unwrap();
    file.write_all(&vec![0xAA; len]).unwrap();
    file.sync_all().unwrap();
}

/// Overwrites `bytes` at an absolute `offset` of `path`.
pub fn corrupt_at(path: &Path, offset: u64, bytes: &[u8]) {
    let mut file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(bytes).unwrap();
    file.sync_all().unwrap();
}

/// Simulates a crash: the handle is leaked so no seal or flush runs.
pub fn crash(wal: Wal) {
    std::mem::forget(wal);
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
