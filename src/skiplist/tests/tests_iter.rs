#[cfg(test)]
mod iter_tests {
    use crate::skiplist::SkipList;
    use crate::sync::SyncConfig;

    fn list() -> SkipList {
        SkipList::new(&SyncConfig::default())
    }

    #[test]
    fn test_iter_empty_list() {
        let list = list();
        assert_eq!(list.iter().count(), 0);
    }

    #[test]
    fn test_iter_yields_ascending_keys() {
        let list = list();
        // Insert out of order.
        for key in [b"m".as_slice(), b"a", b"z", b"c", b"q"] {
            list.insert(key, b"v").unwrap();
        }

        let keys: Vec<Vec<u8>> = list.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"c".to_vec(), b"m".to_vec(), b"q".to_vec(), b"z".to_vec()]);
    }

    #[test]
    fn test_iter_strictly_ascending_no_deleted() {
        let list = list();
        for i in 0..500u32 {
            let key = format!("key-{i:04}").into_bytes();
            list.insert(&key, b"v").unwrap();
        }
        // Remove every third key.
        for i in (0..500u32).step_by(3) {
            let key = format!("key-{i:04}").into_bytes();
            list.delete(&key).unwrap();
        }

        let mut previous: Option<Vec<u8>> = None;
        let mut count = 0;
        for (key, _) in list.iter() {
            if let Some(prev) = &previous {
                assert!(key > *prev, "level-0 walk must ascend strictly");
            }
            let index: u32 = String::from_utf8_lossy(&key[4..]).parse().unwrap();
            assert_ne!(index % 3, 0, "deleted key {index} must not be yielded");
            previous = Some(key);
            count += 1;
        }
        assert_eq!(count, 500 - 167);
    }

    #[test]
    fn test_iter_yields_current_values() {
        let list = list();
        list.insert(b"k", b"old").unwrap();
        list.insert(b"k", b"new").unwrap();
        let entries: Vec<_> = list.iter().collect();
        assert_eq!(entries, vec![(b"k".to_vec(), b"new".to_vec())]);
    }

    #[test]
    fn test_iter_survives_concurrent_mutation() {
        use std::sync::Arc;
        use std::thread;

        let list = Arc::new(list());
        for i in 0..200u32 {
            let key = format!("key-{i:04}").into_bytes();
            list.insert(&key, b"v").unwrap();
        }

        let mutator = {
            let list = Arc::clone(&list);
            thread::spawn(move || {
                for i in 0..200u32 {
                    let key = format!("key-{i:04}").into_bytes();
                    if i % 2 == 0 {
                        let _ = list.delete(&key);
                    } else {
                        let _ = list.insert(&key, b"w");
                    }
                }
            })
        };

        // The iterator must stay well-formed while the list churns:
        // ascending keys, no panic, no torn entries.
        let mut previous: Option<Vec<u8>> = None;
        for (key, value) in list.iter() {
            if let Some(prev) = &previous {
                assert!(key > *prev);
            }
            assert!(!value.is_empty());
            previous = Some(key);
        }

        mutator.join().unwrap();
    }
}
