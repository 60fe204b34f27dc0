//! Supportability metrics abstraction
//!
//! The correlation core reports counters (token lifecycle, forced timeouts,
//! activity registrations) through a sink owned by the host. Aggregation and
//! harvest are external concerns; this module only names the counters and
//! defines the delivery trait.

use parking_lot::Mutex;
use std::collections::HashMap;

/// Supportability counter names
pub mod names {
    /// A token was created
    pub const TOKEN_CREATE: &str = "Supportability/Async/Token/Create";
    /// A token was explicitly expired by the application
    pub const TOKEN_EXPIRE: &str = "Supportability/Async/Token/Expire";
    /// A token passed its deadline and was force-expired
    pub const TOKEN_TIMEOUT: &str = "Supportability/Async/Token/Timeout";
    /// A link attached the calling context to a transaction
    pub const TOKEN_LINK_SUCCESS: &str = "Supportability/Async/Token/Link/Success";
    /// A link was ignored (expired token, closed transaction, or reentrant)
    pub const TOKEN_LINK_IGNORE: &str = "Supportability/Async/Token/Link/Ignore";
    /// An async activity was registered by key
    pub const ACTIVITY_REGISTER: &str = "Supportability/Async/Activity/Register";
    /// A registered activity was started
    pub const ACTIVITY_START: &str = "Supportability/Async/Activity/Start";
    /// A registered activity was explicitly ignored before starting
    pub const ACTIVITY_IGNORE: &str = "Supportability/Async/Activity/Ignore";
    /// A registered activity passed its deadline unstarted
    pub const ACTIVITY_TIMEOUT: &str = "Supportability/Async/Activity/Timeout";
}

/// Destination for supportability counters
///
/// Implementations must be cheap and non-blocking; they are called from the
/// instrumented application's request path.
pub trait MetricsSink: Send + Sync {
    /// Increment a counter by one
    fn increment(&self, counter: &str) {
        self.increment_by(counter, 1);
    }

    /// Increment a counter by `delta`
    fn increment_by(&self, counter: &str, delta: u64);
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpMetricsSink;

impl MetricsSink for NoOpMetricsSink {
    fn increment_by(&self, _counter: &str, _delta: u64) {}
}

/// In-memory counting sink
///
/// Useful in tests and for hosts that harvest counters periodically.
#[derive(Debug, Default)]
pub struct CountingMetricsSink {
    counts: Mutex<HashMap<String, u64>>,
}

impl CountingMetricsSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter (0 if never incremented)
    pub fn count(&self, counter: &str) -> u64 {
        self.counts.lock().get(counter).copied().unwrap_or(0)
    }

    /// Drain all counters, leaving the sink empty
    pub fn drain(&self) -> HashMap<String, u64> {
        std::mem::take(&mut *self.counts.lock())
    }
}

impl MetricsSink for CountingMetricsSink {
    fn increment_by(&self, counter: &str, delta: u64) {
        *self.counts.lock().entry(counter.to_string()).or_insert(0) += delta;
    }
}
