//! Container constructors
//!
//! The surface the instrumentation layer consumes: three container kinds
//! with pluggable eviction semantics. Everything returned here is safe for
//! concurrent use without caller-side locking.

use crate::memo::Memoizer;
use crate::timed::TimedEvictionMap;
use crate::weak::WeakKeyedMap;
use std::hash::Hash;
use std::time::Duration;
use tracelink_core::Result;

/// Produces concurrency-safe map-like containers
pub struct CacheFactory;

impl CacheFactory {
    /// A concurrent map whose keys are weakly held and matched by identity
    ///
    /// Entries become eligible for removal once their key is otherwise
    /// unreachable; no manual cleanup is required.
    pub fn concurrent_weak_keyed_map<K, V: Clone>() -> WeakKeyedMap<K, V> {
        WeakKeyedMap::new()
    }

    /// Memoize a deterministic, side-effect-free computation
    ///
    /// Single-flight per key; at most `max_size` resident entries, evicting
    /// an arbitrary entry on overflow (see [`Memoizer`] for the policy).
    pub fn memoize<K, V>(
        loader: impl Fn(&K) -> Result<V> + Send + Sync + 'static,
        max_size: usize,
    ) -> Memoizer<K, V>
    where
        K: Eq + Hash + Clone,
        V: Clone,
    {
        Memoizer::new(loader, max_size)
    }

    /// A concurrent map whose entries expire `age` after their last write
    pub fn concurrent_time_based_eviction_map<K, V>(age: Duration) -> TimedEvictionMap<K, V>
    where
        K: Eq + Hash + Clone,
        V: Clone,
    {
        TimedEvictionMap::new(age)
    }
}
