//! Streaming replay iterator over the segment files.
//!
//! A [`WalIter`] walks the segments captured at creation time in id
//! order, reading each through its own read-only file handle so it
//! never contends with the appender. Records below the requested
//! start sequence are skipped; segments entirely below it are never
//! opened.
//!
//! Corruption policy follows recovery: a torn record on the last
//! (open) segment ends iteration quietly; a bad record in any sealed
//! segment surfaces as `Corrupted` and the iterator refuses to skip
//! past it.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Take};
use std::path::PathBuf;

use tracing::warn;

use crate::error::{Error, Result};
use super::segment::{Record, SEGMENT_HEADER_SIZE, SegmentHeader, read_record};

/// One planned segment visit.
#[derive(Debug)]
pub(crate) struct IterSegment {
    pub(crate) path: PathBuf,
    /// Highest sequence the segment held when the plan was captured.
    pub(crate) last_sequence: u64,
    /// Byte limit for the open segment, so the reader never races the
    /// appender into a half-written tail. `None` reads to end of file.
    pub(crate) end_offset: Option<u64>,
    pub(crate) is_last: bool,
}

struct SegmentCursor {
    reader: Take<File>,
    is_last: bool,
}

/// Restartable forward iterator yielding records in sequence order.
pub struct WalIter {
    plan: VecDeque<IterSegment>,
    cursor: Option<SegmentCursor>,
    min_sequence: u64,
    /// Plausibility bound for claimed record lengths.
    max_record_len: usize,
}

impl WalIter {
    pub(crate) fn new(plan: Vec<IterSegment>, min_sequence: u64, max_record_len: usize) -> Self {
        Self {
            plan: plan.into(),
            cursor: None,
            min_sequence,
            max_record_len,
        }
    }

    fn open_next_segment(&mut self) -> Result<bool> {
        loop {
            let Some(segment) = self.plan.pop_front() else {
                return Ok(false);
            };
            if segment.last_sequence < self.min_sequence {
                continue;
            }

            let mut file = File::open(&segment.path)?;
            // Validates magic and version, and positions the stream at
            // the record area.
            let _ = SegmentHeader::read_from(&mut file)?;

            let limit = segment
                .end_offset
                .map_or(u64::MAX, |end| end.saturating_sub(SEGMENT_HEADER_SIZE as u64));
            self.cursor = Some(SegmentCursor {
                reader: file.take(limit),
                is_last: segment.is_last,
            });
            return Ok(true);
        }
    }

    fn abort(&mut self) {
        self.plan.clear();
        self.cursor = None;
    }
}

impl Iterator for WalIter {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.cursor.is_none() {
                match self.open_next_segment() {
                    Ok(true) => {}
                    Ok(false) => return None,
                    Err(e) => {
                        self.abort();
                        return Some(Err(e));
                    }
                }
            }

            let max_record_len = self.max_record_len;
            let cursor = self.cursor.as_mut()?;
            match read_record(&mut cursor.reader, max_record_len) {
                Ok(Some(record)) => {
                    if record.sequence < self.min_sequence {
                        continue;
                    }
                    return Some(Ok(record));
                }
                Ok(None) => {
                    self.cursor = None;
                }
                Err(Error::Corrupted(reason)) => {
                    if cursor.is_last {
                        // Torn tail on the open segment is tolerated.
                        warn!(reason, "stopping replay at torn open-segment tail");
                        self.abort();
                        return None;
                    }
                    self.abort();
                    return Some(Err(Error::Corrupted(reason)));
                }
                Err(e) => {
                    self.abort();
                    return Some(Err(e));
                }
            }
        }
    }
}

impl std::fmt::Debug for WalIter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalIter")
            .field("pending_segments", &self.plan.len())
            .field("min_sequence", &self.min_sequence)
            .finish_non_exhaustive()
    }
}
