#[cfg(test)]
mod retry_tests {
    use crate::error::Error;
    use crate::sync::{Attempt, RetryPolicy};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff_us: 1,
        }
    }

    #[test]
    fn test_immediate_success() {
        let result = policy(0).run(|| Attempt::Done(7u32)).unwrap();
        assert_eq!(result, 7);
    }

    #[test]
    fn test_succeeds_after_retries() {
        let mut calls = 0;
        let result = policy(10)
            .run(|| {
                calls += 1;
                if calls < 4 { Attempt::Retry } else { Attempt::Done(calls) }
            })
            .unwrap();
        assert_eq!(result, 4);
    }

    #[test]
    fn test_timeout_after_exhaustion() {
        let mut calls = 0u32;
        let err = policy(5)
            .run::<()>(|| {
                calls += 1;
                Attempt::Retry
            })
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
        // max_retries retries on top of the initial attempt.
        assert_eq!(calls, 6);
    }

    #[test]
    fn test_once_maps_retry_to_busy() {
        let err = policy(100).once::<()>(|| Attempt::Retry).unwrap_err();
        assert!(matches!(err, Error::Busy));

        let value = policy(100).once(|| Attempt::Done(1)).unwrap();
        assert_eq!(value, 1);
    }
}
