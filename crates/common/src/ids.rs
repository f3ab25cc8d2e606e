//! Typed identifiers and the process-wide job id allocator.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cluster job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(
    /// Raw numeric id value.
    pub u64,
);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Issues unique, strictly increasing [`JobId`]s.
///
/// One allocator is constructed per process and shared (behind an `Arc`) by
/// every dispatcher. Ids are not persisted: the counter restarts with the
/// process, and no job outlives the process that issued its id.
#[derive(Debug, Default)]
pub struct JobIdAllocator {
    last: AtomicU64,
}

impl JobIdAllocator {
    /// Allocator whose first id is `1`.
    pub fn new() -> Self {
        Self::starting_after(0)
    }

    /// Allocator whose first id is `last + 1`.
    pub fn starting_after(last: u64) -> Self {
        Self {
            last: AtomicU64::new(last),
        }
    }

    /// Atomically increment the counter and return the new value.
    pub fn next(&self) -> JobId {
        JobId(self.last.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Most recently issued id value, or the starting value if none was issued.
    pub fn last_issued(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::{JobId, JobIdAllocator};

    #[test]
    fn first_id_is_one_and_ids_increase() {
        let ids = JobIdAllocator::new();
        assert_eq!(ids.next(), JobId(1));
        assert_eq!(ids.next(), JobId(2));
        assert_eq!(ids.last_issued(), 2);
    }

    #[test]
    fn starting_after_offsets_sequence() {
        let ids = JobIdAllocator::starting_after(41);
        assert_eq!(ids.last_issued(), 41);
        assert_eq!(ids.next().0, 42);
    }

    #[test]
    fn concurrent_calls_are_distinct_and_ordered_per_thread() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 2_000;

        let ids = Arc::new(JobIdAllocator::new());
        let barrier = Arc::new(Barrier::new(THREADS));
        let handles = (0..THREADS)
            .map(|_| {
                let ids = Arc::clone(&ids);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    (0..PER_THREAD).map(|_| ids.next().0).collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();

        let mut all = HashSet::new();
        for handle in handles {
            let seen = handle.join().expect("allocator thread");
            assert!(seen.windows(2).all(|w| w[0] < w[1]));
            all.extend(seen);
        }
        assert_eq!(all.len(), THREADS * PER_THREAD);
        assert_eq!(ids.last_issued(), (THREADS * PER_THREAD) as u64);
        assert_eq!(all.iter().max().copied(), Some((THREADS * PER_THREAD) as u64));
    }

    #[test]
    fn displays_raw_value() {
        assert_eq!(JobId(7).to_string(), "7");
    }
}
