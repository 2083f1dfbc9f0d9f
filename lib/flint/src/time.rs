use lazy_static::lazy_static;
use std::cmp;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use crate::Tid;

/// Returns the current unix timestamp in milliseconds.
#[inline]
pub fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_millis() as u64
}

lazy_static! {
    static ref TID_COUNTER: AtomicU64 = AtomicU64::new(timestamp_millis());
}

/// Allocates the next transaction id. Ids are seeded from the wall clock and
/// strictly increase for the lifetime of the process, even when the clock
/// stalls or steps backwards.
pub fn next_tid() -> Tid {
    let mut prev = TID_COUNTER.load(Ordering::Relaxed);
    loop {
        let next = cmp::max(prev + 1, timestamp_millis());
        match TID_COUNTER.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(observed) => prev = observed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_tids_strictly_increase() {
        let mut prev = next_tid();
        for _ in 0..1000 {
            let tid = next_tid();
            assert!(tid > prev);
            prev = tid;
        }
    }

    #[test]
    fn test_tids_unique_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| thread::spawn(|| (0..1000).map(|_| next_tid()).collect::<Vec<_>>()))
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for tid in handle.join().unwrap() {
                assert!(seen.insert(tid), "duplicate tid {}", tid);
            }
        }
    }

    #[test]
    fn test_tid_at_least_clock() {
        let before = timestamp_millis();
        let tid = next_tid();
        assert!(tid >= before);
    }
}
