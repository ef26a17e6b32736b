#[cfg(test)]
mod sealed_tests {
    use crate::error::Error;
    use crate::memtable::{Memtable, MemtableConfig, MemtableState};

    fn sealed_table() -> Memtable {
        let table = Memtable::new(&MemtableConfig::default()).unwrap();
        table.apply_put(b"existing", b"value").unwrap();
        table.transition(MemtableState::Mutable, MemtableState::Sealing).unwrap();
        table.transition(MemtableState::Sealing, MemtableState::Immutable).unwrap();
        table
    }

    #[test]
    fn test_writes_fail_immutable() {
        let table = sealed_table();
        assert!(matches!(table.apply_put(b"k", b"v").unwrap_err(), Error::Immutable));
        assert!(matches!(table.apply_delete(b"existing").unwrap_err(), Error::Immutable));
    }

    #[test]
    fn test_reads_proceed_while_immutable() {
        let table = sealed_table();
        assert_eq!(table.lookup(b"existing").unwrap(), b"value".to_vec());
        assert_eq!(table.iter().count(), 1);
    }

    #[test]
    fn test_reads_proceed_while_flushing() {
        let table = sealed_table();
        table.transition(MemtableState::Immutable, MemtableState::Flushing).unwrap();
        assert_eq!(table.lookup(b"existing").unwrap(), b"value".to_vec());
        assert_eq!(table.iter().count(), 1);
    }

    #[test]
    fn test_retired_rejects_reads() {
        let table = sealed_table();
        table.transition(MemtableState::Immutable, MemtableState::Flushing).unwrap();
        table.transition(MemtableState::Flushing, MemtableState::Retired).unwrap();
        assert!(matches!(table.lookup(b"existing").unwrap_err(), Error::Closed));
    }

    #[test]
    fn test_writes_fail_while_sealing() {
        let table = Memtable::new(&MemtableConfig::default()).unwrap();
        table.transition(MemtableState::Mutable, MemtableState::Sealing).unwrap();
        assert!(matches!(table.apply_put(b"k", b"v").unwrap_err(), Error::Immutable));
    }

    #[test]
    fn test_concurrent_reads_during_seal() {
        use std::sync::Arc;
        use std::thread;

        let table = Arc::new(Memtable::new(&MemtableConfig::default()).unwrap());
        for i in 0..200u32 {
            let key = format!("k{i:03}").into_bytes();
            table.apply_put(&key, b"v").unwrap();
        }

        let sealer = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                table.transition(MemtableState::Mutable, MemtableState::Sealing).unwrap();
                table.transition(MemtableState::Sealing, MemtableState::Immutable).unwrap();
            })
        };

        let mut readers = Vec::new();
        for _ in 0..4 {
            let table = Arc::clone(&table);
            readers.push(thread::spawn(move || {
                for i in 0..200u32 {
                    let key = format!("k{i:03}").into_bytes();
                    assert_eq!(table.lookup(&key).unwrap(), b"v".to_vec());
                }
            }));
        }

        sealer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
