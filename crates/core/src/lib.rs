//! Core types for tracelink
//!
//! This crate defines the foundational pieces shared by the cache and
//! correlation layers:
//! - TransactionId: unique identifier for a logical transaction
//! - TransactionState: Active / Finishing / Closed lifecycle
//! - TimeoutCause: why a transaction was force-finished
//! - TracerHandle: opaque handle naming the host's tracer
//! - CorrelationConfig: timeouts, sweep interval, token cap
//! - Error / Result: error type hierarchy
//! - MetricsSink: supportability counter abstraction

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod metrics;
pub mod types;

// Re-export commonly used types at the crate root
pub use config::CorrelationConfig;
pub use error::{Error, Result};
pub use metrics::{names, CountingMetricsSink, MetricsSink, NoOpMetricsSink};
pub use types::{TimeoutCause, TracerHandle, TransactionId, TransactionState};
