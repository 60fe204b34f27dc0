//! Removal reasons and listener delivery
//!
//! Any evicting container can be observed through a [`RemovalListener`].
//! Delivery happens on whichever thread performed the removal (an access
//! that noticed a stale entry, an explicit invalidation, or a `clean_up`
//! sweep); callers that need determinism force it with
//! [`crate::Cleanable::clean_up`].

use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

/// Why an entry left its container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalCause {
    /// The entry's age since last write exceeded the container's limit
    Expired,
    /// The entry was removed by an explicit invalidation
    Explicit,
    /// The entry was evicted to respect a size bound
    Size,
    /// The entry's value was overwritten by a newer write
    Replaced,
    /// The entry's weakly-held key was reclaimed
    Collected,
}

impl RemovalCause {
    /// True when the container removed the entry on its own (anything other
    /// than an explicit invalidation or an overwrite)
    pub fn was_evicted(&self) -> bool {
        !matches!(self, RemovalCause::Explicit | RemovalCause::Replaced)
    }
}

/// Callback invoked when an entry is removed from an evicting container
///
/// Key and value are `Option` because a weakly-held key may already have
/// been reclaimed by the time the removal is observed.
pub trait RemovalListener<K, V>: Send + Sync {
    /// Observe one removal
    fn on_removal(&self, key: Option<&K>, value: Option<&V>, cause: RemovalCause);
}

/// Blanket impl so plain closures can be registered as listeners
impl<K, V, F> RemovalListener<K, V> for F
where
    F: Fn(Option<&K>, Option<&V>, RemovalCause) + Send + Sync,
{
    fn on_removal(&self, key: Option<&K>, value: Option<&V>, cause: RemovalCause) {
        self(key, value, cause)
    }
}

/// Fans removal events out to registered listeners
///
/// Each listener invocation is isolated: a panicking listener is caught and
/// logged, and delivery continues with the remaining listeners. One
/// misbehaving observer must never disable eviction bookkeeping (the
/// correlation reaper rides on this path).
pub struct RemovalNotifier<K, V> {
    listeners: RwLock<Vec<Arc<dyn RemovalListener<K, V>>>>,
}

impl<K, V> Default for RemovalNotifier<K, V> {
    fn default() -> Self {
        RemovalNotifier {
            listeners: RwLock::new(Vec::new()),
        }
    }
}

impl<K, V> RemovalNotifier<K, V> {
    /// Create a notifier with no listeners
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; it receives every subsequent removal
    pub fn register(&self, listener: Arc<dyn RemovalListener<K, V>>) {
        self.listeners.write().push(listener);
    }

    /// True when no listeners are registered
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Deliver one removal to every listener
    pub fn notify(&self, key: Option<&K>, value: Option<&V>, cause: RemovalCause) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                listener.on_removal(key, value, cause);
            }));
            if let Err(panic) = outcome {
                error!(
                    ?cause,
                    "removal listener panicked: {:?}",
                    panic.downcast_ref::<&str>().copied().unwrap_or("(non-string panic)")
                );
            }
        }
    }
}
