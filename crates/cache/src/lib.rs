//! Bounded / evicting cache subsystem for tracelink
//!
//! This crate provides the concurrency-safe containers the correlation core
//! and the instrumentation layer build on:
//! - TimedEvictionMap: entries expire a fixed age after their last write
//! - WeakKeyedMap: identity-keyed map whose keys are held weakly
//! - Memoizer: single-flight, size-bounded memoization of a loader
//! - RemovalListener / RemovalNotifier: removal-reason callbacks
//!
//! All containers are internally thread-safe; callers never wrap them in
//! external locks. Maintenance (expiration, listener delivery, size
//! eviction) may run lazily; [`Cleanable::clean_up`] forces it to
//! completion synchronously for deterministic tests and harvest cycles.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod factory;
pub mod memo;
pub mod removal;
pub mod timed;
pub mod weak;

pub use factory::CacheFactory;
pub use memo::Memoizer;
pub use removal::{RemovalCause, RemovalListener, RemovalNotifier};
pub use timed::TimedEvictionMap;
pub use weak::WeakKeyedMap;

/// A container with deferrable maintenance
///
/// Expiration sweeps, size-based eviction, and listener delivery are allowed
/// to happen lazily on later accesses. `clean_up` runs all pending
/// maintenance to completion before returning.
pub trait Cleanable {
    /// Force pending expirations, evictions, and listener notifications
    fn clean_up(&self);
}
