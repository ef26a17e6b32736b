#[cfg(test)]
mod batch_tests {
    use crate::engine::tests::helpers::{init_tracing, open_db};
    use crate::engine::WriteOp;
    use crate::error::Error;
    use tempfile::TempDir;

    fn put(key: &str, value: &str) -> WriteOp {
        WriteOp::Put {
            key: key.as_bytes().to_vec(),
            value: value.as_bytes().to_vec(),
        }
    }

    fn delete(key: &str) -> WriteOp {
        WriteOp::Delete {
            key: key.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_batch_applies_all_ops() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let db = open_db(tmp.path());

        let first = db
            .write_batch(&[put("a", "1"), put("b", "2"), put("c", "3")])
            .unwrap();
        assert_eq!(first, 1);

        assert_eq!(db.get(b"a").unwrap(), b"1".to_vec());
        assert_eq!(db.get(b"b").unwrap(), b"2".to_vec());
        assert_eq!(db.get(b"c").unwrap(), b"3".to_vec());
    }

    #[test]
    fn test_batch_mixed_put_delete() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let db = open_db(tmp.path());
        db.put(b"old", b"v").unwrap();

        db.write_batch(&[put("new", "n"), delete("old"), put("other", "o")]).unwrap();

        assert_eq!(db.get(b"new").unwrap(), b"n".to_vec());
        assert_eq!(db.get(b"other").unwrap(), b"o".to_vec());
        assert!(matches!(db.get(b"old").unwrap_err(), Error::NotFound));
    }

    #[test]
    fn test_batch_survives_crash() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let db = open_db(tmp.path());
        db.write_batch(&[put("a", "1"), put("b", "2"), delete("a")]).unwrap();
        crate::engine::tests::helpers::crash(db);

        let db = open_db(tmp.path());
        assert!(matches!(db.get(b"a").unwrap_err(), Error::NotFound));
        assert_eq!(db.get(b"b").unwrap(), b"2".to_vec());
    }

    #[test]
    fn test_batch_sequences_are_contiguous() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let db = open_db(tmp.path());

        db.put(b"warmup", b"v").unwrap();
        let first = db.write_batch(&[put("a", "1"), put("b", "2")]).unwrap();
        assert_eq!(first, 2);
        assert_eq!(db.stats().unwrap().next_sequence, 4);
    }

    #[test]
    fn test_invalid_op_rejects_whole_batch() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let db = open_db(tmp.path());

        let err = db
            .write_batch(&[put("good", "v"), put("", "v")])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArg(_)));
        assert!(matches!(db.get(b"good").unwrap_err(), Error::NotFound));
    }

    #[test]
    fn test_empty_batch_rejected() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let db = open_db(tmp.path());
        assert!(matches!(db.write_batch(&[]).unwrap_err(), Error::Empty));
    }
}
