#[cfg(test)]
mod batch_tests {
    use crate::error::Error;
    use crate::wal::segment::{SEGMENT_HEADER_SIZE, SegmentHeader};
    use crate::wal::tests::helpers::{collect_from, init_tracing, open_wal, segment_files, small_segment_config};
    use crate::wal::{BatchOp, RecordType, Wal};
    use tempfile::TempDir;

    fn put_op<'a>(key: &'a [u8], value: &'a [u8]) -> BatchOp<'a> {
        BatchOp {
            record_type: RecordType::Put,
            key,
            value,
        }
    }

    #[test]
    fn test_batch_returns_first_sequence() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let wal = open_wal(tmp.path());

        wal.append(RecordType::Put, b"warmup", b"v").unwrap();
        let first = wal
            .append_batch(&[put_op(b"a", b"1"), put_op(b"b", b"2"), put_op(b"c", b"3")])
            .unwrap();
        assert_eq!(first, 2);

        let records = collect_from(&wal, 0);
        assert_eq!(records.len(), 4);
        assert_eq!(records[3].sequence, 4);
    }

    #[test]
    fn test_empty_batch_rejected() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let wal = open_wal(tmp.path());
        assert!(matches!(wal.append_batch(&[]).unwrap_err(), Error::Empty));
    }

    #[test]
    fn test_batch_with_mixed_ops() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let wal = open_wal(tmp.path());

        let ops = [
            put_op(b"k1", b"v1"),
            BatchOp {
                record_type: RecordType::Delete,
                key: b"k1",
                value: b"",
            },
            put_op(b"k2", b"v2"),
        ];
        wal.append_batch(&ops).unwrap();

        let records = collect_from(&wal, 0);
        assert_eq!(records[1].record_type, RecordType::Delete);
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn test_batch_never_straddles_rollover() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        // Room for ~9 of our 100-byte records per segment.
        let wal = Wal::open(small_segment_config(tmp.path(), 1024)).unwrap();

        let value = vec![b'x'; 64]; // 28 + 8 + 64 = 100 bytes per record
        // Fill most of the first segment.
        for i in 0..7u32 {
            let key = format!("pre-{i:04}");
            wal.append(RecordType::Put, key.as_bytes(), &value).unwrap();
        }

        // A 5-record batch no longer fits; it must land whole in the
        // next segment.
        let keys: Vec<Vec<u8>> = (0..5u32).map(|i| format!("bat-{i:04}").into_bytes()).collect();
        let ops: Vec<BatchOp<'_>> = keys.iter().map(|k| put_op(k, &value)).collect();
        wal.append_batch(&ops).unwrap();
        wal.close().unwrap();

        let files = segment_files(tmp.path());
        assert_eq!(files.len(), 2);

        // All five batch records sit in the second segment.
        let mut file = std::fs::File::open(&files[1]).unwrap();
        let header = SegmentHeader::read_from(&mut file).unwrap();
        assert_eq!(header.record_count, 5);
        assert_eq!(header.first_sequence, 8);
        assert_eq!(header.last_sequence, 12);
    }

    #[test]
    fn test_batch_larger_than_any_segment_fails_full() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let wal = Wal::open(small_segment_config(tmp.path(), 512)).unwrap();

        let value = vec![b'x'; 100];
        let keys: Vec<Vec<u8>> = (0..5u32).map(|i| format!("key-{i:04}").into_bytes()).collect();
        let ops: Vec<BatchOp<'_>> = keys.iter().map(|k| put_op(k, &value)).collect();

        let err = wal.append_batch(&ops).unwrap_err();
        assert!(matches!(err, Error::Full(_)));
        // Nothing from the failed batch is visible.
        assert_eq!(collect_from(&wal, 0).len(), 0);
        assert_eq!(SEGMENT_HEADER_SIZE as u64, std::fs::metadata(&segment_files(tmp.path())[0]).unwrap().len());
    }

    #[test]
    fn test_invalid_op_fails_whole_batch() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let wal = open_wal(tmp.path());

        let ops = [put_op(b"good", b"v"), put_op(b"", b"v")];
        assert!(matches!(wal.append_batch(&ops).unwrap_err(), Error::InvalidArg(_)));
        assert_eq!(collect_from(&wal, 0).len(), 0);
    }
}
