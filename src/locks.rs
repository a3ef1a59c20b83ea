//! Key-partitioned lock table.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

/// One mutex per key, created on first use. Holders of different keys
/// never contend.
pub struct KeyLocks<K> {
    locks: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K> Default for KeyLocks<K> {
    fn default() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `key`.
    ///
    /// The table entry is dropped again once no caller holds or waits on
    /// it, so the table only grows with the number of keys in use.
    pub fn with<R>(&self, key: &K, f: impl FnOnce() -> R) -> R {
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let result = {
            let _guard = lock.lock();
            f()
        };
        self.release(key, &lock);
        result
    }

    fn release(&self, key: &K, lock: &Arc<Mutex<()>>) {
        let mut locks = self.locks.lock();
        // One reference in the table, one held here.
        if Arc::strong_count(lock) == 2 {
            locks.remove(key);
        }
    }

    /// Number of keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_same_key_is_exclusive() {
        let locks = Arc::new(KeyLocks::<u32>::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                thread::spawn(move || {
                    locks.with(&1, || {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(2));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[test]
    fn test_distinct_keys_do_not_block() {
        let locks = KeyLocks::<u32>::new();
        let value = locks.with(&1, || {
            locks.with(&2, || {
                assert_eq!(locks.len(), 2);
                42
            })
        });
        assert_eq!(value, 42);
    }

    #[test]
    fn test_released_keys_are_pruned() {
        let locks = KeyLocks::<(u32, u8)>::new();
        for user in 0..100 {
            locks.with(&(user, 0), || ());
        }
        assert!(locks.is_empty());

        // A waiter keeps the entry alive until it is done too.
        let locks = Arc::new(KeyLocks::<u32>::new());
        let waiter = locks.with(&7, || {
            let handle = {
                let locks = Arc::clone(&locks);
                thread::spawn(move || locks.with(&7, || ()))
            };
            // Table, this caller and the waiter.
            while Arc::strong_count(&locks.locks.lock()[&7]) < 3 {
                thread::yield_now();
            }
            handle
        });
        waiter.join().unwrap();
        assert!(locks.is_empty());
    }
}
