#[cfg(test)]
mod counter_tests {
    use crate::sync::Counter;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_load_store() {
        let counter = Counter::new(5);
        assert_eq!(counter.load(), 5);
        counter.store(42);
        assert_eq!(counter.load(), 42);
    }

    #[test]
    fn test_add_sub_return_previous() {
        let counter = Counter::new(10);
        assert_eq!(counter.add(5), 10);
        assert_eq!(counter.load(), 15);
        assert_eq!(counter.sub(3), 15);
        assert_eq!(counter.load(), 12);
    }

    #[test]
    fn test_cas() {
        let counter = Counter::new(1);
        assert!(counter.cas(1, 2));
        assert!(!counter.cas(1, 3));
        assert_eq!(counter.load(), 2);
    }

    #[test]
    fn test_concurrent_adds_do_not_lose_updates() {
        let counter = Arc::new(Counter::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    counter.add(1);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(), 80_000);
    }
}
