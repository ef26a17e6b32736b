#[cfg(test)]
mod budget_tests {
    use crate::error::Error;
    use crate::memtable::{Memtable, MemtableConfig};
    use crate::skiplist::NODE_OVERHEAD;

    fn small_table(budget: usize) -> Memtable {
        let config = MemtableConfig {
            budget,
            shard_count: 4,
            ..MemtableConfig::default()
        };
        Memtable::new(&config).unwrap()
    }

    #[test]
    fn test_write_over_budget_fails_full() {
        let table = small_table(2 * (NODE_OVERHEAD + 8));
        table.apply_put(b"key-0001", b"").unwrap_err(); // empty value is invalid, not a charge
        table.apply_put(b"key-0001", b"!").unwrap();
        table.apply_put(b"key-0002", b"!").unwrap_err(); // 2nd record exceeds: overhead+8+1 > remaining
    }

    #[test]
    fn test_full_error_kind() {
        let table = small_table(NODE_OVERHEAD + 16);
        table.apply_put(b"a", b"1").unwrap();
        let err = table.apply_put(b"b", b"2").unwrap_err();
        assert!(matches!(err, Error::Full(_)));
    }

    #[test]
    fn test_rejected_write_does_not_leak_bytes() {
        let table = small_table(NODE_OVERHEAD + 16);
        table.apply_put(b"a", b"1").unwrap();
        let used_before = table.used_bytes();
        for _ in 0..10 {
            let _ = table.apply_put(b"bigger-key", b"payload");
        }
        assert_eq!(table.used_bytes(), used_before);
    }

    #[test]
    fn test_shard_counters_sum_to_global() {
        let table = small_table(1024 * 1024);
        for i in 0..300u32 {
            let key = format!("key-{i:04}").into_bytes();
            let value = vec![b'x'; (i % 50) as usize + 1];
            table.apply_put(&key, &value).unwrap();
        }
        let shard_sum: usize = (0..table.shard_count())
            .map(|i| table.shard_used_bytes(i))
            .sum();
        assert_eq!(shard_sum, table.used_bytes());
        assert!(table.used_bytes() <= table.budget());
    }

    #[test]
    fn test_update_charges_value_delta_only() {
        let table = small_table(1024 * 1024);
        table.apply_put(b"k", b"short").unwrap();
        let base = table.used_bytes();
        assert_eq!(base, NODE_OVERHEAD + 1 + 5);

        table.apply_put(b"k", b"a-much-longer-value").unwrap();
        assert_eq!(table.used_bytes(), NODE_OVERHEAD + 1 + 19);

        table.apply_put(b"k", b"x").unwrap();
        assert_eq!(table.used_bytes(), NODE_OVERHEAD + 1 + 1);
    }

    #[test]
    fn test_delete_refunds_bytes_allowing_new_writes() {
        let table = small_table(NODE_OVERHEAD + 32);
        table.apply_put(b"first", b"payload").unwrap();
        assert!(matches!(table.apply_put(b"second", b"payload").unwrap_err(), Error::Full(_)));

        table.apply_delete(b"first").unwrap();
        assert_eq!(table.used_bytes(), 0);
        table.apply_put(b"second", b"payload").unwrap();
    }

    #[test]
    fn test_replay_put_bypasses_budget() {
        let table = small_table(NODE_OVERHEAD + 16);
        table.replay_put(b"a", b"1").unwrap();
        table.replay_put(b"b", b"2").unwrap();
        table.replay_put(b"c", b"3").unwrap();
        assert_eq!(table.len(), 3);
        assert!(table.used_bytes() > table.budget());
    }

    #[test]
    fn test_concurrent_writes_respect_budget() {
        use std::sync::Arc;
        use std::thread;

        let budget = 50 * (NODE_OVERHEAD + 16);
        let table = Arc::new(small_table(budget));
        let mut handles = Vec::new();
        for thread_id in 0..8u32 {
            let table = Arc::clone(&table);
            handles.push(thread::spawn(move || {
                let mut accepted = 0u32;
                for i in 0..100u32 {
                    let key = format!("t{thread_id}-{i:03}").into_bytes();
                    match table.apply_put(&key, b"12345678") {
                        Ok(()) => accepted += 1,
                        Err(Error::Full(_)) => {}
                        Err(other) => panic!("unexpected error: {other}"),
                    }
                }
                accepted
            }));
        }
        let total_accepted: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert!(total_accepted > 0);
        assert!(table.used_bytes() <= budget, "accepted writes exceed the byte budget");
        assert_eq!(table.len() as u32, total_accepted);
    }
}
