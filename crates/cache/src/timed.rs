//! Time-based eviction map
//!
//! Entries expire a fixed age after their **last write**, never their last
//! read. Expiration is observed lazily by the access that encounters a stale
//! entry, and exhaustively by [`Cleanable::clean_up`].

use crate::removal::{RemovalCause, RemovalListener, RemovalNotifier};
use crate::Cleanable;
use dashmap::DashMap;
use rustc_hash::FxHasher;
use std::hash::{BuildHasherDefault, Hash};
use std::sync::Arc;
use std::time::{Duration, Instant};

type FxBuildHasher = BuildHasherDefault<FxHasher>;

#[derive(Debug, Clone)]
struct TimedEntry<V> {
    value: V,
    written_at: Instant,
    /// Bookkeeping only. Never consulted for expiry decisions.
    last_accessed: Instant,
}

impl<V> TimedEntry<V> {
    fn new(value: V) -> Self {
        let now = Instant::now();
        TimedEntry {
            value,
            written_at: now,
            last_accessed: now,
        }
    }

    fn is_stale(&self, ttl: Duration, now: Instant) -> bool {
        now.duration_since(self.written_at) >= ttl
    }
}

/// Concurrent map with expire-after-write semantics
///
/// Reads and writes are safe from any number of threads without external
/// locking. A stale entry encountered by `get` is removed on the spot and
/// reported to listeners with [`RemovalCause::Expired`]; `clean_up` sweeps
/// every stale entry synchronously.
pub struct TimedEvictionMap<K, V> {
    inner: DashMap<K, TimedEntry<V>, FxBuildHasher>,
    ttl: Duration,
    notifier: RemovalNotifier<K, V>,
}

impl<K, V> TimedEvictionMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a map whose entries expire `ttl` after their last write
    pub fn new(ttl: Duration) -> Self {
        TimedEvictionMap {
            inner: DashMap::with_hasher(FxBuildHasher::default()),
            ttl,
            notifier: RemovalNotifier::new(),
        }
    }

    /// Register a removal listener
    pub fn add_removal_listener(&self, listener: Arc<dyn RemovalListener<K, V>>) {
        self.notifier.register(listener);
    }

    /// The configured expire-after-write age
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up a live entry
    ///
    /// A stale entry is removed, reported as `Expired`, and `None` returned.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        {
            let mut entry = self.inner.get_mut(key)?;
            if !entry.is_stale(self.ttl, now) {
                entry.last_accessed = now;
                return Some(entry.value.clone());
            }
        }
        // Stale: guard dropped above, safe to remove. remove_if re-checks
        // staleness so a concurrent fresh overwrite is not discarded.
        self.expire_entry(key, now);
        None
    }

    /// Insert or overwrite, resetting the entry's write clock
    ///
    /// Returns the live value that was replaced, if any. Overwriting an
    /// already-stale entry reports `Expired` (the old value had logically
    /// left the map) and returns `None`; overwriting a live one reports
    /// `Replaced`.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let now = Instant::now();
        let old = self.inner.insert(key.clone(), TimedEntry::new(value))?;
        if old.is_stale(self.ttl, now) {
            self.notifier
                .notify(Some(&key), Some(&old.value), RemovalCause::Expired);
            None
        } else {
            self.notifier
                .notify(Some(&key), Some(&old.value), RemovalCause::Replaced);
            Some(old.value)
        }
    }

    /// Explicitly remove an entry
    ///
    /// Returns the value only if it was still live; a stale entry is
    /// reported as `Expired` instead.
    pub fn invalidate(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let (key, entry) = self.inner.remove(key)?;
        if entry.is_stale(self.ttl, now) {
            self.notifier
                .notify(Some(&key), Some(&entry.value), RemovalCause::Expired);
            None
        } else {
            self.notifier
                .notify(Some(&key), Some(&entry.value), RemovalCause::Explicit);
            Some(entry.value)
        }
    }

    /// True when the key maps to a live entry
    pub fn contains_key(&self, key: &K) -> bool {
        let now = Instant::now();
        self.inner
            .get(key)
            .map(|e| !e.is_stale(self.ttl, now))
            .unwrap_or(false)
    }

    /// Point-in-time snapshot of the live entries
    pub fn entries(&self) -> Vec<(K, V)> {
        let now = Instant::now();
        self.inner
            .iter()
            .filter(|e| !e.value().is_stale(self.ttl, now))
            .map(|e| (e.key().clone(), e.value().value.clone()))
            .collect()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .iter()
            .filter(|e| !e.value().is_stale(self.ttl, now))
            .count()
    }

    /// True when no live entries remain
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove one entry iff it is still stale, notifying `Expired`
    fn expire_entry(&self, key: &K, now: Instant) {
        if let Some((key, entry)) = self
            .inner
            .remove_if(key, |_, e| e.is_stale(self.ttl, now))
        {
            self.notifier
                .notify(Some(&key), Some(&entry.value), RemovalCause::Expired);
        }
    }
}

impl<K, V> Cleanable for TimedEvictionMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn clean_up(&self) {
        let now = Instant::now();
        // Collect first: removing while iterating would hold shard locks
        // across the removal path.
        let stale: Vec<K> = self
            .inner
            .iter()
            .filter(|e| e.value().is_stale(self.ttl, now))
            .map(|e| e.key().clone())
            .collect();
        for key in stale {
            self.expire_entry(&key, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::thread;

    const TTL: Duration = Duration::from_millis(120);

    #[test]
    fn test_present_before_ttl() {
        let map = TimedEvictionMap::new(TTL);
        map.insert("a", 1);
        assert_eq!(map.get(&"a"), Some(1));
        assert!(map.contains_key(&"a"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_lazy_expiry_on_get() {
        let map = TimedEvictionMap::new(TTL);
        map.insert("a", 1);
        thread::sleep(TTL + Duration::from_millis(30));
        assert_eq!(map.get(&"a"), None);
        assert!(map.is_empty());
    }

    #[test]
    fn test_age_counts_from_write_not_read() {
        let map = TimedEvictionMap::new(TTL);
        map.insert("a", 1);
        // Repeated reads must not extend the entry's life
        thread::sleep(TTL / 2);
        assert_eq!(map.get(&"a"), Some(1));
        thread::sleep(TTL / 2 + Duration::from_millis(30));
        assert_eq!(map.get(&"a"), None);
    }

    #[test]
    fn test_write_resets_clock() {
        let map = TimedEvictionMap::new(TTL);
        map.insert("a", 1);
        thread::sleep(TTL / 2);
        map.insert("a", 2);
        thread::sleep(TTL / 2 + Duration::from_millis(20));
        // Still alive: the second write restarted the clock
        assert_eq!(map.get(&"a"), Some(2));
    }

    #[test]
    fn test_cleanup_delivers_expired() {
        let map: TimedEvictionMap<&str, i32> = TimedEvictionMap::new(TTL);
        let seen: Arc<Mutex<Vec<(String, i32, RemovalCause)>>> = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        map.add_removal_listener(Arc::new(
            move |k: Option<&&str>, v: Option<&i32>, cause: RemovalCause| {
                s.lock()
                    .push((k.unwrap().to_string(), *v.unwrap(), cause));
            },
        ));

        map.insert("a", 1);
        thread::sleep(TTL + Duration::from_millis(30));
        map.clean_up();

        let events = seen.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0], ("a".to_string(), 1, RemovalCause::Expired));
    }

    #[test]
    fn test_replace_notifies_replaced() {
        let map: TimedEvictionMap<&str, i32> = TimedEvictionMap::new(TTL);
        let seen: Arc<Mutex<Vec<RemovalCause>>> = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        map.add_removal_listener(Arc::new(
            move |_: Option<&&str>, _: Option<&i32>, cause: RemovalCause| {
                s.lock().push(cause);
            },
        ));

        map.insert("a", 1);
        let old = map.insert("a", 2);
        assert_eq!(old, Some(1));
        assert_eq!(*seen.lock(), vec![RemovalCause::Replaced]);
    }

    #[test]
    fn test_invalidate_notifies_explicit() {
        let map: TimedEvictionMap<&str, i32> = TimedEvictionMap::new(TTL);
        let seen: Arc<Mutex<Vec<RemovalCause>>> = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        map.add_removal_listener(Arc::new(
            move |_: Option<&&str>, _: Option<&i32>, cause: RemovalCause| {
                s.lock().push(cause);
            },
        ));

        map.insert("a", 1);
        assert_eq!(map.invalidate(&"a"), Some(1));
        assert_eq!(map.invalidate(&"a"), None);
        assert_eq!(*seen.lock(), vec![RemovalCause::Explicit]);
    }

    #[test]
    fn test_invalidate_stale_entry_reports_expired() {
        let map: TimedEvictionMap<&str, i32> = TimedEvictionMap::new(TTL);
        let seen: Arc<Mutex<Vec<RemovalCause>>> = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        map.add_removal_listener(Arc::new(
            move |_: Option<&&str>, _: Option<&i32>, cause: RemovalCause| {
                s.lock().push(cause);
            },
        ));

        map.insert("a", 1);
        thread::sleep(TTL + Duration::from_millis(30));
        assert_eq!(map.invalidate(&"a"), None);
        assert_eq!(*seen.lock(), vec![RemovalCause::Expired]);
    }

    #[test]
    fn test_entries_snapshot_skips_stale() {
        let map = TimedEvictionMap::new(TTL);
        map.insert("old", 1);
        thread::sleep(TTL + Duration::from_millis(30));
        map.insert("new", 2);
        let entries = map.entries();
        assert_eq!(entries, vec![("new", 2)]);
    }
}
