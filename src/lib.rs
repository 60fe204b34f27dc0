//! Tracelink - cross-thread transaction correlation
//!
//! Tracelink ties asynchronous work spread across threads back to the
//! transaction that spawned it. A dispatcher thread opens a transaction,
//! mints tokens for the work it fans out, and finishes; the transaction
//! closes once every token has been expired by the thread that carried
//! it, or force-expired by the timeout reaper.
//!
//! # Quick Start
//!
//! ```ignore
//! use tracelink::{CorrelationConfig, CorrelationRuntime, ExecutionContext};
//!
//! let runtime = CorrelationRuntime::start(CorrelationConfig::new())?;
//! let registry = runtime.registry();
//!
//! let txn = registry.begin_transaction();
//! let token = registry.create_token(&txn);
//!
//! std::thread::spawn(move || {
//!     let mut ctx = ExecutionContext::detached();
//!     token.link(&mut ctx);
//!     // ... do the work under ctx ...
//!     token.expire();
//! });
//!
//! txn.finish_dispatch();
//! runtime.shutdown();
//! ```
//!
//! # Architecture
//!
//! The correlation layer ([`TokenRegistry`], [`Token`],
//! [`TransactionContext`]) sits on top of a small caching layer
//! ([`CacheFactory`] and friends) that supplies the timed, bounded, and
//! weak-keyed maps the registry tracks its state in. Both layers are
//! re-exported here; hosts that only correlate work never need to touch
//! the cache crates directly.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::Arc;
use std::thread::JoinHandle;

pub use tracelink_cache::{
    CacheFactory, Cleanable, Memoizer, RemovalCause, RemovalListener, RemovalNotifier,
    TimedEvictionMap, WeakKeyedMap,
};
pub use tracelink_core::{
    names, CorrelationConfig, CountingMetricsSink, Error, MetricsSink, NoOpMetricsSink, Result,
    TimeoutCause, TracerHandle, TransactionId, TransactionState,
};
pub use tracelink_correlation::{
    ActivityKey, ExecutionContext, TimeoutReaper, Token, TokenRegistry, TransactionContext,
    TransactionListener,
};

/// A registry with its timeout reaper wired up and running
///
/// This is the assembled system most hosts want: build one at startup,
/// hand its registry around, and shut it down when the host exits.
pub struct CorrelationRuntime {
    registry: TokenRegistry,
    reaper: TimeoutReaper,
    reaper_handle: Option<JoinHandle<()>>,
}

impl CorrelationRuntime {
    /// Validate `config`, build the registry, and start the reaper
    pub fn start(config: CorrelationConfig) -> Result<Self> {
        Self::start_with_metrics(config, Arc::new(NoOpMetricsSink))
    }

    /// As [`start`](Self::start), reporting supportability counters to
    /// `metrics`
    pub fn start_with_metrics(
        config: CorrelationConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        let interval = config.reaper_interval;
        let registry = TokenRegistry::with_metrics(config, metrics)?;
        let reaper = TimeoutReaper::new(registry.clone(), interval);
        let reaper_handle = Some(reaper.start());
        Ok(Self {
            registry,
            reaper,
            reaper_handle,
        })
    }

    /// The registry this runtime sweeps
    pub fn registry(&self) -> &TokenRegistry {
        &self.registry
    }

    /// Stop the reaper and wait for it to exit
    ///
    /// Outstanding tokens survive a shutdown; they just stop being swept.
    /// Dropping the runtime without calling this detaches the reaper
    /// thread instead of joining it.
    pub fn shutdown(mut self) {
        self.reaper.shutdown();
        if let Some(handle) = self.reaper_handle.take() {
            // The reaper owns no locks at shutdown; a join error only
            // means it panicked and was already logged
            let _ = handle.join();
        }
    }
}

impl Drop for CorrelationRuntime {
    fn drop(&mut self) {
        self.reaper.shutdown();
    }
}
