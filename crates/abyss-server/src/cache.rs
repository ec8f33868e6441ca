//! In-process expiring cache for challenges and session tokens.
//!
//! Entries carry a monotonic deadline ([`Instant`]), so system clock jumps
//! never invalidate or revive them. Expiry is lazy: an expired entry is
//! removed by the read that finds it; a periodic sweep catches entries
//! nobody reads again.

use std::hash::Hash;
use std::time::{Duration, Instant};

use dashmap::DashMap;

struct Entry<V> {
    value: V,
    deadline: Instant,
}

pub struct ExpiringCache<K: Eq + Hash, V: Clone> {
    map: DashMap<K, Entry<V>>,
}

impl<K: Eq + Hash, V: Clone> ExpiringCache<K, V> {
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    /// Insert, replacing any previous entry and its deadline.
    pub fn put(&self, key: K, value: V, ttl: Duration) {
        self.map.insert(
            key,
            Entry {
                value,
                deadline: Instant::now() + ttl,
            },
        );
    }

    /// Fetch a live value. An expired hit is removed and reported absent.
    pub fn get(&self, key: &K) -> Option<V> {
        let expired = {
            match self.map.get(key) {
                Some(entry) if entry.deadline > Instant::now() => {
                    return Some(entry.value.clone())
                }
                Some(_) => true,
                None => false,
            }
        };
        if expired {
            self.map.remove_if(key, |_, entry| entry.deadline <= Instant::now());
        }
        None
    }

    /// Replace the value of a live entry, keeping its deadline. Returns
    /// false if the entry is absent or expired.
    pub fn mutate(&self, key: &K, f: impl FnOnce(&mut V)) -> bool {
        match self.map.get_mut(key) {
            Some(mut entry) if entry.deadline > Instant::now() => {
                f(&mut entry.value);
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, key: &K) {
        self.map.remove(key);
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.map.len();
        self.map.retain(|_, entry| entry.deadline > now);
        before - self.map.len()
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl<K: Eq + Hash, V: Clone> Default for ExpiringCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_remove() {
        let cache: ExpiringCache<&str, i32> = ExpiringCache::new();
        cache.put("a", 1, Duration::from_secs(60));
        assert_eq!(cache.get(&"a"), Some(1));

        cache.remove(&"a");
        assert_eq!(cache.get(&"a"), None);
    }

    #[test]
    fn replace_resets_value_and_deadline() {
        let cache: ExpiringCache<&str, i32> = ExpiringCache::new();
        cache.put("a", 1, Duration::from_millis(1));
        cache.put("a", 2, Duration::from_secs(60));
        assert_eq!(cache.get(&"a"), Some(2));
    }

    #[test]
    fn expired_read_removes() {
        let cache: ExpiringCache<&str, i32> = ExpiringCache::new();
        cache.put("a", 1, Duration::from_nanos(1));
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(cache.get(&"a"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn mutate_keeps_deadline() {
        let cache: ExpiringCache<&str, String> = ExpiringCache::new();
        cache.put("a", "original".into(), Duration::from_secs(60));
        assert!(cache.mutate(&"a", |v| *v = "poisoned".into()));
        assert_eq!(cache.get(&"a").as_deref(), Some("poisoned"));

        assert!(!cache.mutate(&"missing", |_| {}));
    }

    #[test]
    fn purge_counts_expired() {
        let cache: ExpiringCache<u32, u32> = ExpiringCache::new();
        cache.put(1, 1, Duration::from_nanos(1));
        cache.put(2, 2, Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn concurrent_disjoint_keys() {
        use std::sync::Arc;

        let cache: Arc<ExpiringCache<u32, u32>> = Arc::new(ExpiringCache::new());
        let mut handles = Vec::new();
        for t in 0..8u32 {
            let cache = cache.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    let key = t * 1000 + i;
                    cache.put(key, i, Duration::from_secs(60));
                    assert_eq!(cache.get(&key), Some(i));
                    cache.remove(&key);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(cache.is_empty());
    }
}
