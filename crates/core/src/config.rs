//! Correlation configuration
//!
//! The library is handed a fully-formed config by its host; loading values
//! from files or the environment is the host's concern.

use crate::error::{Error, Result};
use std::time::Duration;

/// Tunables for the correlation core
///
/// # Defaults
///
/// - `token_timeout`: 180s, how long a token may stay outstanding before
///   the reaper force-expires it. A zero timeout is legal and makes every
///   token reapable on the next sweep.
/// - `activity_timeout`: 300s, deadline for registered-but-unstarted async
///   activities (the deprecated register-by-key mode).
/// - `reaper_interval`: 30s, period of the background sweep.
/// - `max_tokens_per_transaction`: 3000, cap on tokens created by a single
///   transaction; creation beyond the cap yields no-op tokens.
#[derive(Debug, Clone)]
pub struct CorrelationConfig {
    /// Deadline applied to each token at creation (and refresh)
    pub token_timeout: Duration,
    /// Deadline applied to pending async activity registrations
    pub activity_timeout: Duration,
    /// How often the reaper sweeps for passed deadlines
    pub reaper_interval: Duration,
    /// Maximum tokens a single transaction may create
    pub max_tokens_per_transaction: usize,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        CorrelationConfig {
            token_timeout: Duration::from_secs(180),
            activity_timeout: Duration::from_secs(300),
            reaper_interval: Duration::from_secs(30),
            max_tokens_per_transaction: 3000,
        }
    }
}

impl CorrelationConfig {
    /// Default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the token deadline
    pub fn with_token_timeout(mut self, timeout: Duration) -> Self {
        self.token_timeout = timeout;
        self
    }

    /// Set the deadline for pending activity registrations
    pub fn with_activity_timeout(mut self, timeout: Duration) -> Self {
        self.activity_timeout = timeout;
        self
    }

    /// Set the reaper sweep period
    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    /// Set the per-transaction token cap
    pub fn with_max_tokens_per_transaction(mut self, max: usize) -> Self {
        self.max_tokens_per_transaction = max;
        self
    }

    /// Check the configuration for values that would disable the system
    ///
    /// A zero `token_timeout` is allowed (it means "reap on next sweep");
    /// a zero sweep interval or token cap is not.
    pub fn validate(&self) -> Result<()> {
        if self.reaper_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "reaper_interval must be non-zero".to_string(),
            ));
        }
        if self.max_tokens_per_transaction == 0 {
            return Err(Error::InvalidConfig(
                "max_tokens_per_transaction must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
