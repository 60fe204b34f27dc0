//! Single-flight memoization
//!
//! Wraps a deterministic, side-effect-free loader. For a given key the
//! loader runs at most once concurrently: callers that miss while another
//! thread is computing block on that computation instead of recomputing,
//! bounded by the loader's own execution time. A loader failure is
//! broadcast to every waiter and never cached.

use crate::removal::{RemovalCause, RemovalListener, RemovalNotifier};
use crate::Cleanable;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHasher;
use std::hash::{BuildHasherDefault, Hash};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracelink_core::{Error, Result};

type FxBuildHasher = BuildHasherDefault<FxHasher>;

enum SlotState<V> {
    /// The computation is running on some thread
    InFlight,
    /// The loader succeeded; the value stays cached
    Ready(V),
    /// The loader failed; broadcast to current waiters, then the slot is
    /// removed so later calls retry
    Failed(String),
}

struct SlotInner<V> {
    state: Mutex<SlotState<V>>,
    ready: Condvar,
}

struct Slot<V> {
    inner: Arc<SlotInner<V>>,
}

impl<V> Clone for Slot<V> {
    fn clone(&self) -> Self {
        Slot {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Clone> Slot<V> {
    fn in_flight() -> Self {
        Slot {
            inner: Arc::new(SlotInner {
                state: Mutex::new(SlotState::InFlight),
                ready: Condvar::new(),
            }),
        }
    }

    fn fulfill(&self, value: V) {
        let mut state = self.inner.state.lock();
        *state = SlotState::Ready(value);
        self.inner.ready.notify_all();
    }

    fn fail(&self, message: String) {
        let mut state = self.inner.state.lock();
        *state = SlotState::Failed(message);
        self.inner.ready.notify_all();
    }

    /// Block until the in-flight computation settles
    fn await_settled(&self) -> Result<V> {
        let mut state = self.inner.state.lock();
        while matches!(*state, SlotState::InFlight) {
            self.inner.ready.wait(&mut state);
        }
        match &*state {
            SlotState::Ready(value) => Ok(value.clone()),
            SlotState::Failed(message) => Err(Error::Loader {
                message: message.clone(),
            }),
            SlotState::InFlight => unreachable!("settled slot cannot be in flight"),
        }
    }

    fn is_ready(&self) -> bool {
        matches!(*self.inner.state.lock(), SlotState::Ready(_))
    }

    fn ready_value(&self) -> Option<V> {
        match &*self.inner.state.lock() {
            SlotState::Ready(value) => Some(value.clone()),
            _ => None,
        }
    }

    fn same_slot(&self, other: &Slot<V>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Size-bounded, single-flight memoizing cache around a loader
///
/// Capacity is enforced after each successful load: when resident entries
/// exceed `max_size`, one **arbitrary** ready entry is evicted with
/// [`RemovalCause::Size`]. The candidate is whatever shard iteration yields
/// first, deliberately NOT strict LRU; do not tighten it to LRU.
pub struct Memoizer<K, V> {
    slots: DashMap<K, Slot<V>, FxBuildHasher>,
    loader: Box<dyn Fn(&K) -> Result<V> + Send + Sync>,
    max_size: usize,
    notifier: RemovalNotifier<K, V>,
}

impl<K, V> Memoizer<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Wrap `loader` with memoization, keeping at most `max_size` entries
    pub fn new(
        loader: impl Fn(&K) -> Result<V> + Send + Sync + 'static,
        max_size: usize,
    ) -> Self {
        Memoizer {
            slots: DashMap::with_hasher(FxBuildHasher::default()),
            loader: Box::new(loader),
            max_size,
            notifier: RemovalNotifier::new(),
        }
    }

    /// Register a removal listener
    pub fn add_removal_listener(&self, listener: Arc<dyn RemovalListener<K, V>>) {
        self.notifier.register(listener);
    }

    /// The configured capacity bound
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Look up `key`, running the loader on a miss
    ///
    /// Exactly one caller runs the loader for a missing key; concurrent
    /// callers for the same key wait for that computation. A loader error
    /// reaches the runner as-is and every waiter as [`Error::Loader`]; the
    /// entry is removed so a later call retries.
    pub fn get(&self, key: &K) -> Result<V> {
        let (slot, is_runner) = match self.slots.entry(key.clone()) {
            Entry::Occupied(occupied) => (occupied.get().clone(), false),
            Entry::Vacant(vacant) => {
                let slot = Slot::in_flight();
                vacant.insert(slot.clone());
                (slot, true)
            }
        };

        if is_runner {
            self.run_loader(key, slot)
        } else {
            slot.await_settled()
        }
    }

    /// Value for `key` if already resident, without invoking the loader
    pub fn get_if_present(&self, key: &K) -> Option<V> {
        self.slots.get(key).and_then(|slot| slot.ready_value())
    }

    /// Explicitly drop the entry for `key`
    pub fn invalidate(&self, key: &K) {
        if let Some((key, slot)) = self.slots.remove(key) {
            if let Some(value) = slot.ready_value() {
                self.notifier
                    .notify(Some(&key), Some(&value), RemovalCause::Explicit);
            }
            // An in-flight computation keeps running; its waiters settle
            // through the slot they already hold.
        }
    }

    /// Number of resident entries (ready and in flight)
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when nothing is resident
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn run_loader(&self, key: &K, slot: Slot<V>) -> Result<V> {
        // The entry guard is already dropped: the loader must not run under
        // any map lock, or waiters on other shards could stall behind it.
        let outcome = catch_unwind(AssertUnwindSafe(|| (self.loader)(key)));

        match outcome {
            Ok(Ok(value)) => {
                slot.fulfill(value.clone());
                self.enforce_capacity(key);
                Ok(value)
            }
            Ok(Err(err)) => {
                slot.fail(err.to_string());
                self.remove_slot(key, &slot);
                Err(err)
            }
            Err(panic) => {
                // Settle waiters before propagating, or they would block forever
                slot.fail("loader panicked".to_string());
                self.remove_slot(key, &slot);
                resume_unwind(panic);
            }
        }
    }

    /// Remove the map entry only if it still holds this computation's slot
    fn remove_slot(&self, key: &K, slot: &Slot<V>) {
        self.slots.remove_if(key, |_, s| s.same_slot(slot));
    }

    /// Evict arbitrary ready entries until the size bound holds
    fn enforce_capacity(&self, protect: &K) {
        while self.slots.len() > self.max_size {
            let victim = self.slots.iter().find_map(|entry| {
                if entry.key() != protect && entry.value().is_ready() {
                    Some(entry.key().clone())
                } else {
                    None
                }
            });
            let Some(victim) = victim else {
                // Everything else is in flight; nothing evictable right now
                break;
            };
            if let Some((key, slot)) = self.slots.remove_if(&victim, |_, s| s.is_ready()) {
                if let Some(value) = slot.ready_value() {
                    self.notifier
                        .notify(Some(&key), Some(&value), RemovalCause::Size);
                }
            }
        }
    }
}

impl<K, V> Cleanable for Memoizer<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Re-assert the size bound (eviction normally happens on load)
    fn clean_up(&self) {
        while self.slots.len() > self.max_size {
            let victim = self
                .slots
                .iter()
                .find_map(|entry| entry.value().is_ready().then(|| entry.key().clone()));
            let Some(victim) = victim else { break };
            if let Some((key, slot)) = self.slots.remove_if(&victim, |_, s| s.is_ready()) {
                if let Some(value) = slot.ready_value() {
                    self.notifier
                        .notify(Some(&key), Some(&value), RemovalCause::Size);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_memoizes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let memo = Memoizer::new(
            move |key: &u32| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(key * 2)
            },
            8,
        );

        assert_eq!(memo.get(&21).unwrap(), 42);
        assert_eq!(memo.get(&21).unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_error_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let memo = Memoizer::new(
            move |_: &u32| {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::loader("first call fails"))
                } else {
                    Ok(7)
                }
            },
            8,
        );

        assert!(memo.get(&1).is_err());
        assert!(memo.is_empty());
        // Retry hits the loader again and succeeds
        assert_eq!(memo.get(&1).unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_size_bound_evicts_arbitrary_entry() {
        let memo = Memoizer::new(|key: &u32| Ok(*key), 3);
        for key in 0..5 {
            memo.get(&key).unwrap();
        }
        // The bound holds; which entries survive is unspecified
        assert_eq!(memo.len(), 3);
    }

    #[test]
    fn test_size_eviction_notifies() {
        let memo: Memoizer<u32, u32> = Memoizer::new(|key: &u32| Ok(*key), 1);
        let evictions = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&evictions);
        memo.add_removal_listener(Arc::new(
            move |_: Option<&u32>, _: Option<&u32>, cause: RemovalCause| {
                assert_eq!(cause, RemovalCause::Size);
                e.fetch_add(1, Ordering::SeqCst);
            },
        ));

        memo.get(&1).unwrap();
        memo.get(&2).unwrap();
        assert_eq!(memo.len(), 1);
        assert_eq!(evictions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_get_if_present() {
        let memo = Memoizer::new(|key: &u32| Ok(*key + 1), 8);
        assert_eq!(memo.get_if_present(&1), None);
        memo.get(&1).unwrap();
        assert_eq!(memo.get_if_present(&1), Some(2));
    }

    proptest::proptest! {
        /// For any access sequence that fits the bound, the loader runs
        /// once per distinct key and every hit returns the loaded value
        #[test]
        fn prop_loader_runs_once_per_key(keys in proptest::collection::vec(0u32..20, 1..60)) {
            let calls = Arc::new(AtomicUsize::new(0));
            let c = Arc::clone(&calls);
            let memo = Memoizer::new(
                move |key: &u32| {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(key * 3)
                },
                64,
            );

            for key in &keys {
                proptest::prop_assert_eq!(memo.get(key).unwrap(), key * 3);
            }

            let distinct: std::collections::HashSet<_> = keys.iter().collect();
            proptest::prop_assert_eq!(calls.load(Ordering::SeqCst), distinct.len());
            proptest::prop_assert_eq!(memo.len(), distinct.len());
        }
    }

    #[test]
    fn test_invalidate() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let memo = Memoizer::new(
            move |key: &u32| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(*key)
            },
            8,
        );
        memo.get(&1).unwrap();
        memo.invalidate(&1);
        memo.get(&1).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
