//! On-disk layout of log segments and records.
//!
//! Everything here is little-endian and bit-exact:
//!
//! ```text
//! segment header (44 bytes)
//! offset  size  field
//! 0       4     magic = 0x4C415750           ("PWAL")
//! 4       4     version = 1
//! 8       8     segment_id
//! 16      8     first_sequence
//! 24      8     last_sequence                (valid iff sealed)
//! 32      4     record_count                 (valid iff sealed)
//! 36      4     sealed                       (0 or 1)
//! 40      4     header_checksum              (CRC32 over bytes [0,40))
//!
//! record (28-byte header + payload)
//! offset  size  field
//! 0       4     magic = 0x50524543           ("PREC")
//! 4       1     type                         (1=PUT, 2=DELETE)
//! 5       3     reserved (zero)
//! 8       4     key_size
//! 12      4     value_size                   (0 iff type=DELETE)
//! 16      8     sequence
//! 24      4     checksum                     (CRC32, checksum field zeroed)
//! 28      ...   key bytes, then value bytes
//! ```
//!
//! The record checksum covers the header with its checksum field
//! zeroed, then the key, then the value.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crc32fast::Hasher as Crc32;

use crate::error::{Error, Result};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Segment file magic, "PWAL".
pub const SEGMENT_MAGIC: u32 = 0x4C41_5750;

/// Current segment format version.
pub const SEGMENT_VERSION: u32 = 1;

/// Encoded segment header size.
pub const SEGMENT_HEADER_SIZE: usize = 44;

/// Record magic, "PREC".
pub const RECORD_MAGIC: u32 = 0x5052_4543;

/// Encoded record header size.
pub const RECORD_HEADER_SIZE: usize = 28;

/// Segment file extension.
const SEGMENT_EXT: &str = "seg";

// ------------------------------------------------------------------------------------------------
// Record type
// ------------------------------------------------------------------------------------------------

/// The two mutations a log record can carry. Deletions are a record
/// type, never an empty value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Insert or update a key.
    Put = 1,
    /// Remove a key (tombstone).
    Delete = 2,
}

impl RecordType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(RecordType::Put),
            2 => Some(RecordType::Delete),
            _ => None,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Record
// ------------------------------------------------------------------------------------------------

/// One decoded log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Strictly monotonic sequence number assigned at append time.
    pub sequence: u64,

    /// Mutation kind.
    pub record_type: RecordType,

    /// Key bytes.
    pub key: Vec<u8>,

    /// Value bytes; empty exactly for [`RecordType::Delete`].
    pub value: Vec<u8>,
}

/// Encoded byte length of a record with the given payload sizes.
pub fn encoded_record_len(key_len: usize, value_len: usize) -> usize {
    RECORD_HEADER_SIZE + key_len + value_len
}

/// Appends one encoded record to `buf`.
pub fn encode_record(buf: &mut Vec<u8>, sequence: u64, record_type: RecordType, key: &[u8], value: &[u8]) {
    let start = buf.len();
    buf.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
    buf.push(record_type as u8);
    buf.extend_from_slice(&[0u8; 3]);
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(&sequence.to_le_bytes());
    buf.extend_from_slice(&[0u8; 4]); // checksum patched below
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);

    let mut hasher = Crc32::new();
    hasher.update(&buf[start..]);
    let checksum = hasher.finalize();
    buf[start + 24..start + 28].copy_from_slice(&checksum.to_le_bytes());
}

/// Reads the next record from `reader`.
///
/// `max_record_len` bounds the total encoded length a header may
/// claim, so a garbled header cannot drive a huge allocation.
///
/// - `Ok(Some(record))` — a fully valid record.
/// - `Ok(None)` — clean end of stream (no header byte present).
/// - `Err(Corrupted)` — torn or damaged record (partial header or
///   payload, bad magic, bad type, implausible length, bad CRC). The
///   caller decides the tail policy.
/// - `Err(Io)` — any other read failure.
pub fn read_record<R: Read>(reader: &mut R, max_record_len: usize) -> Result<Option<Record>> {
    let mut header = [0u8; RECORD_HEADER_SIZE];
    match read_exact_or_eof(reader, &mut header)? {
        ReadOutcome::Empty => return Ok(None),
        ReadOutcome::Partial => {
            return Err(Error::Corrupted("torn record header".into()));
        }
        ReadOutcome::Full => {}
    }

    let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
    if magic != RECORD_MAGIC {
        return Err(Error::Corrupted(format!("bad record magic {magic:#010x}")));
    }
    let Some(record_type) = RecordType::from_u8(header[4]) else {
        return Err(Error::Corrupted(format!("bad record type {}", header[4])));
    };
    let key_size = u32::from_le_bytes(header[8..12].try_into().unwrap()) as usize;
    let value_size = u32::from_le_bytes(header[12..16].try_into().unwrap()) as usize;
    if RECORD_HEADER_SIZE + key_size + value_size > max_record_len {
        return Err(Error::Corrupted(format!(
            "record claims {} payload bytes",
            key_size + value_size
        )));
    }
    let sequence = u64::from_le_bytes(header[16..24].try_into().unwrap());
    let stored_checksum = u32::from_le_bytes(header[24..28].try_into().unwrap());

    let mut key = vec![0u8; key_size];
    if !matches!(read_exact_or_eof(reader, &mut key)?, ReadOutcome::Full) && key_size > 0 {
        return Err(Error::Corrupted("torn record key".into()));
    }
    let mut value = vec![0u8; value_size];
    if !matches!(read_exact_or_eof(reader, &mut value)?, ReadOutcome::Full) && value_size > 0 {
        return Err(Error::Corrupted("torn record value".into()));
    }

    let mut hasher = Crc32::new();
    hasher.update(&header[0..24]);
    hasher.update(&[0u8; 4]);
    hasher.update(&key);
    hasher.update(&value);
    if hasher.finalize() != stored_checksum {
        return Err(Error::Corrupted(format!(
            "record checksum mismatch at sequence {sequence}"
        )));
    }

    Ok(Some(Record {
        sequence,
        record_type,
        key,
        value,
    }))
}

enum ReadOutcome {
    Full,
    Partial,
    Empty,
}

/// `read_exact` that distinguishes a clean EOF (zero bytes) from a
/// torn read (some bytes).
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Ok(if filled == 0 { ReadOutcome::Empty } else { ReadOutcome::Partial });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(ReadOutcome::Full)
}

// ------------------------------------------------------------------------------------------------
// Segment header
// ------------------------------------------------------------------------------------------------

/// Decoded segment header. `last_sequence` and `record_count` are
/// authoritative only once `sealed` is set; readers of an unsealed
/// segment reconstruct them by walking records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub segment_id: u64,
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub record_count: u32,
    pub sealed: bool,
}

impl SegmentHeader {
    /// Encodes the header, computing the trailing checksum.
    pub fn encode(&self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut bytes = [0u8; SEGMENT_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&SEGMENT_MAGIC.to_le_bytes());
        bytes[4..8].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.segment_id.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.first_sequence.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.last_sequence.to_le_bytes());
        bytes[32..36].copy_from_slice(&self.record_count.to_le_bytes());
        bytes[36..40].copy_from_slice(&u32::from(self.sealed).to_le_bytes());

        let mut hasher = Crc32::new();
        hasher.update(&bytes[0..40]);
        let checksum = hasher.finalize();
        bytes[40..44].copy_from_slice(&checksum.to_le_bytes());
        bytes
    }

    /// Decodes and validates a header.
    ///
    /// Magic and version are always checked; the header checksum is
    /// enforced only for sealed segments, whose terminal fields are
    /// final.
    pub fn decode(bytes: &[u8; SEGMENT_HEADER_SIZE]) -> Result<Self> {
        let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if magic != SEGMENT_MAGIC {
            return Err(Error::Corrupted(format!("bad segment magic {magic:#010x}")));
        }
        let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        if version != SEGMENT_VERSION {
            return Err(Error::Corrupted(format!("unsupported segment version {version}")));
        }

        let header = Self {
            segment_id: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            first_sequence: u64::from_le_bytes(bytes[16..24].try_into().unwrap()),
            last_sequence: u64::from_le_bytes(bytes[24..32].try_into().unwrap()),
            record_count: u32::from_le_bytes(bytes[32..36].try_into().unwrap()),
            sealed: u32::from_le_bytes(bytes[36..40].try_into().unwrap()) != 0,
        };

        if header.sealed {
            let stored = u32::from_le_bytes(bytes[40..44].try_into().unwrap());
            let mut hasher = Crc32::new();
            hasher.update(&bytes[0..40]);
            if hasher.finalize() != stored {
                return Err(Error::Corrupted(format!(
                    "segment {} header checksum mismatch",
                    header.segment_id
                )));
            }
        }

        Ok(header)
    }

    /// Reads and decodes a header from the start of `file`'s stream
    /// position.
    pub fn read_from(file: &mut File) -> Result<Self> {
        let mut bytes = [0u8; SEGMENT_HEADER_SIZE];
        file.read_exact(&mut bytes).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::Corrupted("segment header truncated".into())
            } else {
                Error::Io(e)
            }
        })?;
        Self::decode(&bytes)
    }
}

// ------------------------------------------------------------------------------------------------
// Segment naming
// ------------------------------------------------------------------------------------------------

/// File name for a segment id: `wal-<16-hex-id>.seg`.
pub fn segment_file_name(segment_id: u64) -> String {
    format!("wal-{segment_id:016x}.{SEGMENT_EXT}")
}

/// Full path of a segment within `dir`.
pub fn segment_path(dir: &Path, segment_id: u64) -> PathBuf {
    dir.join(segment_file_name(segment_id))
}

/// Parses a segment id back out of a file name, ignoring foreign files.
pub fn parse_segment_file_name(name: &str) -> Option<u64> {
    let hex = name.strip_prefix("wal-")?.strip_suffix(".seg")?;
    if hex.len() != 16 {
        return None;
    }
    u64::from_str_radix(hex, 16).ok()
}
