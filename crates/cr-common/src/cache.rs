//! Caller-owned TTL cache.
//!
//! No module-level mutable state: the cache is constructed with an explicit
//! TTL and clock, owned by whoever needs it, and dies with its owner.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub struct TtlCache<K, V> {
    ttl: Duration,
    clock: Box<dyn Clock>,
    entries: Mutex<HashMap<K, (DateTime<Utc>, V)>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration, clock: Box<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_system_clock(ttl: Duration) -> Self {
        Self::new(ttl, Box::new(SystemClock))
    }

    /// Returns the cached value unless its entry has expired. Expired
    /// entries are removed on access.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some((inserted_at, value)) if self.clock.now() - *inserted_at < self.ttl => {
                Some(value.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key, (self.clock.now(), value));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    /// Clock that only moves when told to.
    struct ManualClock {
        seconds: Arc<AtomicI64>,
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            DateTime::<Utc>::from_timestamp(self.seconds.load(Ordering::SeqCst), 0).unwrap()
        }
    }

    fn manual_cache(ttl_secs: i64) -> (TtlCache<i64, String>, Arc<AtomicI64>) {
        let seconds = Arc::new(AtomicI64::new(0));
        let cache = TtlCache::new(
            Duration::seconds(ttl_secs),
            Box::new(ManualClock {
                seconds: seconds.clone(),
            }),
        );
        (cache, seconds)
    }

    #[test]
    fn returns_values_within_ttl() {
        let (cache, clock) = manual_cache(60);
        cache.insert(1, "terms".into());

        clock.store(59, Ordering::SeqCst);
        assert_eq!(cache.get(&1), Some("terms".to_string()));
    }

    #[test]
    fn expires_values_after_ttl() {
        let (cache, clock) = manual_cache(60);
        cache.insert(1, "terms".into());

        clock.store(60, Ordering::SeqCst);
        assert_eq!(cache.get(&1), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn reinsert_refreshes_the_entry() {
        let (cache, clock) = manual_cache(60);
        cache.insert(1, "old".into());

        clock.store(50, Ordering::SeqCst);
        cache.insert(1, "new".into());

        clock.store(100, Ordering::SeqCst);
        assert_eq!(cache.get(&1), Some("new".to_string()));
    }

    #[test]
    fn missing_keys_are_none() {
        let (cache, _) = manual_cache(60);
        assert_eq!(cache.get(&42), None);
    }
}
