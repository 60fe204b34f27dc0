//! Legacy async-activity registration
//!
//! The older correlation API registers a future unit of work under an
//! opaque application object before any worker thread exists, then starts
//! or abandons it later. The key is the application object itself,
//! compared by identity: two equal-by-value objects name two different
//! activities.

use std::any::Any;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use crate::transaction::TransactionContext;

/// Identity-keyed handle naming a registered async activity
///
/// Wraps the application's own object; equality and hashing follow the
/// allocation address, not the value. Cloning the key (or the underlying
/// `Arc`) names the same activity.
#[derive(Clone)]
pub struct ActivityKey(Arc<dyn Any + Send + Sync>);

impl ActivityKey {
    /// Wrap an application object as an activity key
    pub fn new<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self(value)
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl PartialEq for ActivityKey {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for ActivityKey {}

impl Hash for ActivityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl std::fmt::Debug for ActivityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ActivityKey({:#x})", self.addr())
    }
}

/// A registered-but-not-started activity
///
/// Holds one outstanding-work share on its transaction; the share either
/// transfers to the token minted at start or is released when the
/// registration is ignored or times out.
#[derive(Clone)]
pub(crate) struct AsyncActivityRegistration {
    pub(crate) transaction: Arc<TransactionContext>,
    pub(crate) registered_at: Instant,
}

impl AsyncActivityRegistration {
    pub(crate) fn new(transaction: Arc<TransactionContext>) -> Self {
        Self {
            transaction,
            registered_at: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(key: &ActivityKey) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn identity_not_value_equality() {
        let a = Arc::new(String::from("job"));
        let b = Arc::new(String::from("job"));
        let key_a = ActivityKey::new(a);
        let key_b = ActivityKey::new(b);
        assert_ne!(key_a, key_b);
        assert_ne!(hash_of(&key_a), hash_of(&key_b));
    }

    #[test]
    fn clones_name_the_same_activity() {
        let obj = Arc::new(42u32);
        let key = ActivityKey::new(Arc::clone(&obj));
        let again = ActivityKey::new(obj);
        assert_eq!(key, key.clone());
        assert_eq!(key, again);
        assert_eq!(hash_of(&key), hash_of(&again));
    }
}
