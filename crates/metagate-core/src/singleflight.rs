//! Per-key build coalescing.
//!
//! Concurrent callers asking for the same key share one computation; the
//! result, success or failure, is handed to every one of them.

use std::hash::Hash;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

use crate::error::Result;

type Slot<V> = Arc<OnceLock<Result<V>>>;

/// Coalesces concurrent builds per key.
pub struct SingleFlight<K, V> {
    slots: DashMap<K, Slot<V>>,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create an empty group.
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    /// Run `build` for `key`, or wait for the build already in flight.
    ///
    /// `build` runs on the calling thread with no map guard held.
    pub fn run<F>(&self, key: &K, build: F) -> Result<V>
    where
        F: FnOnce() -> Result<V>,
    {
        let slot: Slot<V> = self
            .slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceLock::new()))
            .clone();

        let result = slot.get_or_init(build).clone();
        self.slots.remove_if(key, |_, current| Arc::ptr_eq(current, &slot));
        result
    }

    /// Detach every in-flight build so later callers start a fresh one.
    pub fn forget_all(&self) {
        self.slots.clear();
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.slots.len()
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_concurrent_builds_coalesce() {
        let group: Arc<SingleFlight<String, u64>> = Arc::new(SingleFlight::new());
        let builds = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let group = group.clone();
                let builds = builds.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    group.run(&"viewer/invoice".to_string(), || {
                        builds.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(100));
                        Ok(42)
                    })
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap(), 42);
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(group.in_flight(), 0);
    }

    #[test]
    fn test_failure_is_shared_then_retried() {
        let group: SingleFlight<&str, u64> = SingleFlight::new();
        let err = group
            .run(&"k", || Err(Error::InvalidQuery("boom".into())))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidQuery(_)));

        assert_eq!(group.run(&"k", || Ok(7)).unwrap(), 7);
    }
}
