//! Weak-keyed concurrent map
//!
//! Keys are `Arc<K>` held weakly and matched by identity (pointer), never by
//! value. Once the caller drops its last strong reference to a key, the
//! entry becomes eligible for removal with no explicit action; the timing is
//! unspecified. Used where correlation data must not outlive the object it
//! is attached to.

use crate::removal::{RemovalCause, RemovalListener, RemovalNotifier};
use crate::Cleanable;
use dashmap::DashMap;
use rustc_hash::FxHasher;
use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

type FxBuildHasher = BuildHasherDefault<FxHasher>;

/// Purge dead entries once per this many writes
const PURGE_EVERY: usize = 64;

struct WeakSlot<K, V> {
    key: Weak<K>,
    value: V,
}

/// Concurrent map whose keys are weakly-held `Arc`s, matched by identity
///
/// A key reclaimed mid-operation is a normal absence of the entry, not an
/// error. Dead entries are purged amortized on writes and exhaustively by
/// [`Cleanable::clean_up`], delivering [`RemovalCause::Collected`] with
/// `key: None`.
pub struct WeakKeyedMap<K, V> {
    inner: DashMap<usize, WeakSlot<K, V>, FxBuildHasher>,
    notifier: RemovalNotifier<K, V>,
    writes: AtomicUsize,
}

impl<K, V> Default for WeakKeyedMap<K, V>
where
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> WeakKeyedMap<K, V>
where
    V: Clone,
{
    /// Create an empty map
    pub fn new() -> Self {
        WeakKeyedMap {
            inner: DashMap::with_hasher(FxBuildHasher::default()),
            notifier: RemovalNotifier::new(),
            writes: AtomicUsize::new(0),
        }
    }

    /// Register a removal listener
    pub fn add_removal_listener(&self, listener: Arc<dyn RemovalListener<K, V>>) {
        self.notifier.register(listener);
    }

    fn address(key: &Arc<K>) -> usize {
        Arc::as_ptr(key) as usize
    }

    /// Insert or overwrite the entry for this key
    ///
    /// Returns the previous value if the same key (identity) was present and
    /// still alive. The map keeps only a weak reference to `key`.
    pub fn insert(&self, key: &Arc<K>, value: V) -> Option<V> {
        if self.writes.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY == PURGE_EVERY - 1 {
            self.clean_up();
        }

        let slot = WeakSlot {
            key: Arc::downgrade(key),
            value,
        };
        let old = self.inner.insert(Self::address(key), slot)?;
        if old.key.upgrade().is_some() {
            self.notifier
                .notify(Some(key), Some(&old.value), RemovalCause::Replaced);
            Some(old.value)
        } else {
            // Address reuse: a dead entry from a previously collected key
            // happened to share the allocation address.
            self.notifier
                .notify(None, Some(&old.value), RemovalCause::Collected);
            None
        }
    }

    /// Look up the value for this key, if the entry is still alive
    pub fn get(&self, key: &Arc<K>) -> Option<V> {
        let slot = self.inner.get(&Self::address(key))?;
        // An upgradeable weak at this address is necessarily this key's
        // allocation, so identity holds.
        slot.key.upgrade().map(|_| slot.value.clone())
    }

    /// Explicitly remove the entry for this key
    pub fn remove(&self, key: &Arc<K>) -> Option<V> {
        let (_, slot) = self.inner.remove(&Self::address(key))?;
        if slot.key.upgrade().is_some() {
            self.notifier
                .notify(Some(key), Some(&slot.value), RemovalCause::Explicit);
            Some(slot.value)
        } else {
            self.notifier
                .notify(None, Some(&slot.value), RemovalCause::Collected);
            None
        }
    }

    /// Number of entries whose key is still alive
    pub fn len(&self) -> usize {
        self.inner
            .iter()
            .filter(|e| e.value().key.upgrade().is_some())
            .count()
    }

    /// True when no live entries remain
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Cleanable for WeakKeyedMap<K, V>
where
    V: Clone,
{
    fn clean_up(&self) {
        let dead: Vec<usize> = self
            .inner
            .iter()
            .filter(|e| e.value().key.upgrade().is_none())
            .map(|e| *e.key())
            .collect();
        for address in dead {
            // Re-check liveness under the removal: the address may have been
            // reused by a fresh insert since the scan.
            if let Some((_, slot)) = self
                .inner
                .remove_if(&address, |_, s| s.key.upgrade().is_none())
            {
                self.notifier
                    .notify(None, Some(&slot.value), RemovalCause::Collected);
            }
        }
    }
}
