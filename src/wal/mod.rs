//! # Segmented Write-Ahead Log
//!
//! An append-only sequence of CRC-protected records grouped into
//! size-bounded segment files. Every mutation of the store lands here
//! before it touches the memtable, which is what makes it recoverable.
//!
//! ## On-disk layout
//!
//! One directory per database; segment files named
//! `wal-<16-hex-segment-id>.seg`, each a fixed header followed by a
//! contiguous record stream (see [`segment`] for the bit-exact
//! formats). At most one segment is open for appends; all earlier
//! segments are sealed, their terminal header fields finalized in
//! place.
//!
//! ## Guarantees
//!
//! - **Sequencing:** every record carries a strictly monotonic
//!   sequence number; segment `k+1` starts at segment `k`'s
//!   `last_sequence + 1`.
//! - **Durability:** after [`Wal::sync`] returns, every record
//!   appended before the call survives a crash. Without it, up to one
//!   write buffer of records may be lost. `sync_on_write` makes every
//!   append durable before it returns.
//! - **Batch atomicity:** a batch never straddles a segment boundary —
//!   either the whole batch lands in the current segment, or the log
//!   rolls over before the batch's first record.
//! - **Recovery:** a torn tail is tolerated (and truncated) only on
//!   the open segment; a bad record anywhere else is corruption, and
//!   replay never skips past a bad record.
//!
//! ## Concurrency model
//!
//! The current segment's file descriptor, the buffer pair, and both
//! counters live under a single write lock. Appends copy into the
//! active buffer; when a record does not fit, the buffers are swapped
//! and the frozen one is written out, so a record is never split
//! across buffers or segments. Records larger than a buffer bypass
//! the pair entirely. Iterators never touch the write-side state:
//! they open their own read-only file handles.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Submodules
// ------------------------------------------------------------------------------------------------

mod iter;
pub mod segment;

pub use iter::WalIter;
pub use segment::{Record, RecordType};

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use iter::IterSegment;
use segment::{
    SEGMENT_HEADER_SIZE, SegmentHeader, encode_record, encoded_record_len,
    parse_segment_file_name, read_record, segment_path,
};

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Open-time settings for a [`Wal`].
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory holding the segment files; created if missing.
    pub dir: PathBuf,

    /// Byte cap per segment; must exceed the largest possible record.
    pub segment_size: usize,

    /// Segments retained before rollover forces out the oldest sealed
    /// ones; 0 means unlimited.
    pub max_segments: usize,

    /// Fsync before every append returns.
    pub sync_on_write: bool,

    /// Size of each of the two write buffers.
    pub buffer_size: usize,
}

impl WalConfig {
    /// Defaults rooted at `dir`: 64 MiB segments, unlimited retention,
    /// fsync on write, 64 KiB buffers.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            segment_size: 64 * 1024 * 1024,
            max_segments: 0,
            sync_on_write: true,
            buffer_size: 64 * 1024,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Batch operations
// ------------------------------------------------------------------------------------------------

/// One operation of an atomic batch append.
#[derive(Debug, Clone, Copy)]
pub struct BatchOp<'a> {
    /// Mutation kind.
    pub record_type: RecordType,
    /// Key bytes.
    pub key: &'a [u8],
    /// Value bytes; empty exactly for deletes.
    pub value: &'a [u8],
}

// ------------------------------------------------------------------------------------------------
// Internal state
// ------------------------------------------------------------------------------------------------

/// Metadata of a sealed, immutable segment.
#[derive(Debug, Clone)]
struct SealedSegment {
    id: u64,
    path: PathBuf,
    first_sequence: u64,
    last_sequence: u64,
    record_count: u32,
}

/// The one segment currently accepting appends.
#[derive(Debug)]
struct OpenSegment {
    id: u64,
    path: PathBuf,
    file: File,
    first_sequence: u64,
    /// Highest sequence written; `first_sequence - 1` while empty.
    last_sequence: u64,
    record_count: u32,
    /// Total segment bytes including the header and buffered records.
    size: u64,
}

/// The two fixed-size write buffers; exactly one is active.
#[derive(Debug)]
struct DoubleBuffer {
    bufs: [Vec<u8>; 2],
    active: usize,
}

impl DoubleBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            bufs: [Vec::with_capacity(capacity), Vec::with_capacity(capacity)],
            active: 0,
        }
    }

    fn active_len(&self) -> usize {
        self.bufs[self.active].len()
    }

    fn active_mut(&mut self) -> &mut Vec<u8> {
        &mut self.bufs[self.active]
    }
}

#[derive(Debug)]
struct WalInner {
    sealed: Vec<SealedSegment>,
    current: OpenSegment,
    buffers: DoubleBuffer,
    next_sequence: u64,
    next_segment_id: u64,
}

// ------------------------------------------------------------------------------------------------
// WAL Core
// ------------------------------------------------------------------------------------------------

/// A segmented, CRC-protected write-ahead log.
///
/// See the [module-level documentation](self) for format, guarantees,
/// and the concurrency model.
#[derive(Debug)]
pub struct Wal {
    config: WalConfig,
    inner: Mutex<WalInner>,
    closed: AtomicBool,
}

impl Wal {
    /// Opens (or creates) the log rooted at `config.dir`.
    ///
    /// Existing segments are discovered, validated (magic, version,
    /// id and sequence contiguity, sealed-header checksums), and the
    /// last unsealed segment is reopened for appends with any torn
    /// tail truncated to the last good record.
    pub fn open(config: WalConfig) -> Result<Self> {
        if config.segment_size <= SEGMENT_HEADER_SIZE + segment::RECORD_HEADER_SIZE {
            return Err(Error::InvalidArg(format!(
                "segment_size {} cannot hold a single record",
                config.segment_size
            )));
        }
        if config.buffer_size == 0 {
            return Err(Error::InvalidArg("buffer_size must be non-zero".into()));
        }

        fs::create_dir_all(&config.dir)?;

        let mut ids = Vec::new();
        for entry in fs::read_dir(&config.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(parse_segment_file_name) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        for pair in ids.windows(2) {
            if pair[1] != pair[0] + 1 {
                warn!(after = pair[0], missing = pair[0] + 1, "segment file missing mid-list");
                return Err(Error::NotFound);
            }
        }

        let mut sealed = Vec::new();
        let mut current = None;
        let mut prev_last: Option<u64> = None;
        let mut next_sequence: u64 = 1;

        let count = ids.len();
        for (index, &id) in ids.iter().enumerate() {
            let is_last = index == count - 1;
            let path = segment_path(&config.dir, id);
            let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
            let file_len = file.metadata()?.len();

            if is_last && file_len < SEGMENT_HEADER_SIZE as u64 {
                // Crash during segment creation: the header never made
                // it to disk and no record was acknowledged into it.
                warn!(segment = id, "recreating segment with torn header");
                file.set_len(0)?;
                let first_sequence = prev_last.map_or(1, |last| last + 1);
                file.write_all(
                    &SegmentHeader {
                        segment_id: id,
                        first_sequence,
                        last_sequence: first_sequence.saturating_sub(1),
                        record_count: 0,
                        sealed: false,
                    }
                    .encode(),
                )?;
                file.sync_all()?;
                next_sequence = first_sequence;
                current = Some(OpenSegment {
                    id,
                    path,
                    file,
                    first_sequence,
                    last_sequence: first_sequence.saturating_sub(1),
                    record_count: 0,
                    size: SEGMENT_HEADER_SIZE as u64,
                });
                continue;
            }

            file.seek(SeekFrom::Start(0))?;
            let header = SegmentHeader::read_from(&mut file)?;
            if header.segment_id != id {
                return Err(Error::Corrupted(format!(
                    "segment file {} carries id {}",
                    path.display(),
                    header.segment_id
                )));
            }
            if let Some(prev) = prev_last
                && header.first_sequence != prev + 1
            {
                return Err(Error::Corrupted(format!(
                    "segment {} starts at {} but predecessor ended at {}",
                    id, header.first_sequence, prev
                )));
            }

            if header.sealed {
                debug!(segment = id, first = header.first_sequence, last = header.last_sequence, "sealed segment loaded");
                next_sequence = header.last_sequence + 1;
                prev_last = Some(header.last_sequence);
                sealed.push(SealedSegment {
                    id,
                    path,
                    first_sequence: header.first_sequence,
                    last_sequence: header.last_sequence,
                    record_count: header.record_count,
                });
            } else if !is_last {
                return Err(Error::Corrupted(format!(
                    "unsealed segment {id} precedes later segments"
                )));
            } else {
                let (last_sequence, record_count, good_end) =
                    Self::scan_open_segment(&mut file, &header, config.segment_size)?;
                if file_len > good_end {
                    warn!(
                        segment = id,
                        torn_bytes = file_len - good_end,
                        "truncating torn tail of open segment"
                    );
                    file.set_len(good_end)?;
                    file.sync_all()?;
                }
                file.seek(SeekFrom::End(0))?;
                next_sequence = last_sequence + 1;
                prev_last = Some(last_sequence);
                info!(segment = id, records = record_count, "open segment recovered");
                current = Some(OpenSegment {
                    id,
                    path,
                    file,
                    first_sequence: header.first_sequence,
                    last_sequence,
                    record_count,
                    size: good_end,
                });
            }
        }

        let mut next_segment_id = ids.last().map_or(0, |last| last + 1);
        let current = match current {
            Some(segment) => segment,
            None => {
                let segment = Self::create_segment(&config.dir, next_segment_id, next_sequence)?;
                next_segment_id += 1;
                segment
            }
        };

        info!(
            dir = %config.dir.display(),
            segments = sealed.len() + 1,
            next_sequence,
            "wal opened"
        );

        Ok(Self {
            inner: Mutex::new(WalInner {
                sealed,
                current,
                buffers: DoubleBuffer::new(config.buffer_size),
                next_sequence,
                next_segment_id,
            }),
            config,
            closed: AtomicBool::new(false),
        })
    }

    /// Walks an unsealed segment's records, reconstructing the header's
    /// terminal fields and the end offset of the last good record.
    ///
    /// A torn or out-of-order record marks the end of the good prefix;
    /// the caller truncates past it.
    fn scan_open_segment(
        file: &mut File,
        header: &SegmentHeader,
        max_record_len: usize,
    ) -> Result<(u64, u32, u64)> {
        let mut expected = header.first_sequence;
        let mut record_count = 0u32;
        let mut good_end = SEGMENT_HEADER_SIZE as u64;

        loop {
            match read_record(file, max_record_len) {
                Ok(Some(record)) => {
                    if record.sequence != expected {
                        warn!(
                            segment = header.segment_id,
                            expected,
                            found = record.sequence,
                            "sequence discontinuity treated as torn tail"
                        );
                        break;
                    }
                    good_end += encoded_record_len(record.key.len(), record.value.len()) as u64;
                    expected += 1;
                    record_count += 1;
                }
                Ok(None) => break,
                Err(Error::Corrupted(reason)) => {
                    warn!(segment = header.segment_id, reason, "torn record at open segment tail");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok((expected.saturating_sub(1), record_count, good_end))
    }

    fn create_segment(dir: &Path, id: u64, first_sequence: u64) -> Result<OpenSegment> {
        let path = segment_path(dir, id);
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let header = SegmentHeader {
            segment_id: id,
            first_sequence,
            last_sequence: first_sequence.saturating_sub(1),
            record_count: 0,
            sealed: false,
        };
        file.write_all(&header.encode())?;
        file.sync_all()?;
        info!(segment = id, first_sequence, "segment created");
        Ok(OpenSegment {
            id,
            path,
            file,
            first_sequence,
            last_sequence: first_sequence.saturating_sub(1),
            record_count: 0,
            size: SEGMENT_HEADER_SIZE as u64,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn lock_inner(&self) -> Result<MutexGuard<'_, WalInner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Internal("wal lock poisoned".into()))
    }

    fn validate_payload(record_type: RecordType, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidArg("empty key".into()));
        }
        if u32::try_from(key.len()).is_err() {
            return Err(Error::TooLarge(format!("key of {} bytes", key.len())));
        }
        if u32::try_from(value.len()).is_err() {
            return Err(Error::TooLarge(format!("value of {} bytes", value.len())));
        }
        match record_type {
            RecordType::Put => {
                if value.is_empty() {
                    return Err(Error::InvalidArg("empty value".into()));
                }
            }
            RecordType::Delete => {
                if !value.is_empty() {
                    return Err(Error::InvalidArg("delete must not carry a value".into()));
                }
            }
        }
        Ok(())
    }

    /// Appends one record and returns its sequence number.
    ///
    /// May roll the segment first. With `sync_on_write` the record is
    /// durable when this returns; otherwise durability waits for the
    /// next [`Wal::sync`] (or [`Wal::close`]).
    pub fn append(&self, record_type: RecordType, key: &[u8], value: &[u8]) -> Result<u64> {
        self.ensure_open()?;
        Self::validate_payload(record_type, key, value)?;

        let record_len = encoded_record_len(key.len(), value.len());
        if SEGMENT_HEADER_SIZE + record_len > self.config.segment_size {
            return Err(Error::Full(format!(
                "record of {record_len} bytes exceeds segment capacity"
            )));
        }

        let mut inner = self.lock_inner()?;
        if inner.current.size as usize + record_len > self.config.segment_size {
            self.roll_segment(&mut inner)?;
        }

        let sequence = inner.next_sequence;
        self.buffer_record(&mut inner, sequence, record_type, key, value)?;
        inner.next_sequence += 1;
        inner.current.last_sequence = sequence;
        inner.current.record_count += 1;
        inner.current.size += record_len as u64;

        if self.config.sync_on_write {
            Self::flush_buffers(&mut inner)?;
            inner.current.file.sync_all()?;
        }

        trace!(sequence, ?record_type, key_len = key.len(), value_len = value.len(), "wal record appended");
        Ok(sequence)
    }

    /// Appends a batch atomically with respect to rollover: the whole
    /// batch lands in one segment, or the log rolls before its first
    /// record. Returns the first sequence number.
    pub fn append_batch(&self, ops: &[BatchOp<'_>]) -> Result<u64> {
        self.ensure_open()?;
        if ops.is_empty() {
            return Err(Error::Empty);
        }
        for op in ops {
            Self::validate_payload(op.record_type, op.key, op.value)?;
        }

        let total: usize = ops
            .iter()
            .map(|op| encoded_record_len(op.key.len(), op.value.len()))
            .sum();
        if SEGMENT_HEADER_SIZE + total > self.config.segment_size {
            return Err(Error::Full(format!(
                "batch of {total} bytes exceeds segment capacity"
            )));
        }

        let mut inner = self.lock_inner()?;
        if inner.current.size as usize + total > self.config.segment_size {
            self.roll_segment(&mut inner)?;
        }

        let first_sequence = inner.next_sequence;
        for op in ops {
            let record_len = encoded_record_len(op.key.len(), op.value.len());
            let sequence = inner.next_sequence;
            self.buffer_record(&mut inner, sequence, op.record_type, op.key, op.value)?;
            inner.next_sequence += 1;
            inner.current.last_sequence = sequence;
            inner.current.record_count += 1;
            inner.current.size += record_len as u64;
        }

        if self.config.sync_on_write {
            Self::flush_buffers(&mut inner)?;
            inner.current.file.sync_all()?;
        }

        trace!(first_sequence, count = ops.len(), "wal batch appended");
        Ok(first_sequence)
    }

    /// Copies one encoded record into the pipeline: through the active
    /// buffer when it fits, directly to the file when it never could.
    fn buffer_record(
        &self,
        inner: &mut WalInner,
        sequence: u64,
        record_type: RecordType,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let record_len = encoded_record_len(key.len(), value.len());

        if record_len > self.config.buffer_size {
            // Oversize record: drain buffered bytes first to keep file
            // order, then bypass the buffers.
            Self::flush_buffers(inner)?;
            let mut bytes = Vec::with_capacity(record_len);
            encode_record(&mut bytes, sequence, record_type, key, value);
            inner.current.file.write_all(&bytes)?;
            return Ok(());
        }

        if inner.buffers.active_len() + record_len > self.config.buffer_size {
            Self::flush_buffers(inner)?;
        }
        encode_record(inner.buffers.active_mut(), sequence, record_type, key, value);
        Ok(())
    }

    /// Swaps the buffer pair and writes the frozen buffer's bytes out.
    ///
    /// On a write failure the swap is undone, so the unwritten bytes
    /// stay in the active buffer and a later sync retries them in
    /// order.
    fn flush_buffers(inner: &mut WalInner) -> Result<()> {
        if inner.buffers.active_len() == 0 {
            return Ok(());
        }
        let frozen = inner.buffers.active;
        inner.buffers.active = 1 - frozen;

        let WalInner { buffers, current, .. } = inner;
        match current.file.write_all(&buffers.bufs[frozen]) {
            Ok(()) => {
                buffers.bufs[frozen].clear();
                Ok(())
            }
            Err(e) => {
                buffers.active = frozen;
                Err(Error::Io(e))
            }
        }
    }

    /// Seals the current segment in place: final `last_sequence`,
    /// `record_count`, the sealed flag, and the header checksum.
    fn seal_current(inner: &mut WalInner) -> Result<()> {
        let current = &mut inner.current;
        let header = SegmentHeader {
            segment_id: current.id,
            first_sequence: current.first_sequence,
            last_sequence: current.last_sequence,
            record_count: current.record_count,
            sealed: true,
        };
        current.file.seek(SeekFrom::Start(0))?;
        current.file.write_all(&header.encode())?;
        current.file.sync_all()?;
        debug!(segment = current.id, last_sequence = current.last_sequence, records = current.record_count, "segment sealed");
        Ok(())
    }

    /// Flush, seal, and replace the current segment with a fresh one.
    fn roll_segment(&self, inner: &mut WalInner) -> Result<()> {
        Self::flush_buffers(inner)?;
        Self::seal_current(inner)?;

        let retired = SealedSegment {
            id: inner.current.id,
            path: inner.current.path.clone(),
            first_sequence: inner.current.first_sequence,
            last_sequence: inner.current.last_sequence,
            record_count: inner.current.record_count,
        };
        inner.sealed.push(retired);

        if self.config.max_segments > 0 {
            while inner.sealed.len() + 1 > self.config.max_segments {
                let oldest = inner.sealed.remove(0);
                warn!(
                    segment = oldest.id,
                    last_sequence = oldest.last_sequence,
                    "retention cap reached, dropping oldest sealed segment"
                );
                fs::remove_file(&oldest.path)?;
            }
        }

        let id = inner.next_segment_id;
        inner.next_segment_id += 1;
        inner.current = Self::create_segment(&self.config.dir, id, inner.next_sequence)?;
        Ok(())
    }

    /// Flushes the active buffer and fsyncs the current segment.
    ///
    /// The log stays usable after a failure; recovery policy belongs
    /// to the caller.
    pub fn sync(&self) -> Result<()> {
        self.ensure_open()?;
        let mut inner = self.lock_inner()?;
        Self::flush_buffers(&mut inner)?;
        inner.current.file.sync_all()?;
        Ok(())
    }

    /// Deletes every sealed segment whose `last_sequence` is below
    /// `min_sequence`. The open segment is never touched.
    pub fn retain(&self, min_sequence: u64) -> Result<()> {
        self.ensure_open()?;
        let mut inner = self.lock_inner()?;
        let segments = std::mem::take(&mut inner.sealed);
        let mut result = Ok(());
        for segment in segments {
            if result.is_ok() && segment.last_sequence < min_sequence {
                match fs::remove_file(&segment.path) {
                    Ok(()) => {
                        info!(
                            segment = segment.id,
                            last_sequence = segment.last_sequence,
                            min_sequence,
                            "removed sealed segment below retention threshold"
                        );
                        continue;
                    }
                    Err(e) => {
                        // Keep this segment and everything after it.
                        result = Err(Error::Io(e));
                    }
                }
            }
            inner.sealed.push(segment);
        }
        result
    }

    /// A restartable forward iterator over every record with
    /// `sequence ≥ min_sequence`, in sequence order.
    ///
    /// The active buffer is drained first so the iterator observes all
    /// appended records; it then reads through its own read-only file
    /// handles without contending with writers.
    pub fn iterate_from(&self, min_sequence: u64) -> Result<WalIter> {
        self.ensure_open()?;
        let mut inner = self.lock_inner()?;
        Self::flush_buffers(&mut inner)?;

        let mut plan: Vec<IterSegment> = inner
            .sealed
            .iter()
            .map(|s| IterSegment {
                path: s.path.clone(),
                last_sequence: s.last_sequence,
                end_offset: None,
                is_last: false,
            })
            .collect();
        plan.push(IterSegment {
            path: inner.current.path.clone(),
            last_sequence: inner.current.last_sequence,
            end_offset: Some(inner.current.size),
            is_last: true,
        });
        Ok(WalIter::new(plan, min_sequence, self.config.segment_size))
    }

    /// Replays every valid record from the beginning through `apply`.
    pub fn recover<F>(&self, mut apply: F) -> Result<()>
    where
        F: FnMut(&Record) -> Result<()>,
    {
        debug!(dir = %self.config.dir.display(), "wal replay started");
        let mut replayed = 0u64;
        for record in self.iterate_from(0)? {
            let record = record?;
            apply(&record)?;
            replayed += 1;
        }
        info!(records = replayed, "wal replay finished");
        Ok(())
    }

    /// Flushes, fsyncs, and seals the current segment. Idempotent;
    /// every later operation fails with `Closed`.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut inner = self.lock_inner()?;
        Self::flush_buffers(&mut inner)?;
        Self::seal_current(&mut inner)?;
        info!(dir = %self.config.dir.display(), "wal closed");
        Ok(())
    }

    /// The sequence the next append will receive.
    pub fn next_sequence(&self) -> Result<u64> {
        Ok(self.lock_inner()?.next_sequence)
    }

    /// Number of segment files currently tracked (sealed + open).
    pub fn segment_count(&self) -> Result<usize> {
        Ok(self.lock_inner()?.sealed.len() + 1)
    }

    /// The log directory.
    pub fn dir(&self) -> &Path {
        &self.config.dir
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst)
            && let Err(e) = self.close()
        {
            error!(dir = %self.config.dir.display(), error = %e, "wal close failed on drop");
        }
    }
}
