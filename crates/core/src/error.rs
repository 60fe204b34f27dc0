//! Error types for tracelink
//!
//! Token and cache read/write operations communicate late or illegal calls
//! with `false`/`None` returns, never errors. The error type exists for the
//! two places that genuinely fail: memoizer loaders and configuration.

use thiserror::Error;

/// Result type alias for tracelink operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for tracelink
#[derive(Debug, Error)]
pub enum Error {
    /// A memoizer loader failed
    ///
    /// Delivered to every caller waiting on the same in-flight computation.
    /// The failed entry is never cached; a subsequent call retries the
    /// loader.
    #[error("loader failed: {message}")]
    Loader {
        /// Rendered message of the underlying loader failure
        message: String,
    },

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Build a loader error from any displayable failure
    pub fn loader(err: impl std::fmt::Display) -> Self {
        Error::Loader {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_loader() {
        let err = Error::loader("backing computation exploded");
        let msg = err.to_string();
        assert!(msg.contains("loader failed"));
        assert!(msg.contains("backing computation exploded"));
    }

    #[test]
    fn test_error_display_invalid_config() {
        let err = Error::InvalidConfig("reaper_interval must be non-zero".to_string());
        let msg = err.to_string();
        assert!(msg.contains("invalid configuration"));
        assert!(msg.contains("reaper_interval"));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_result() -> Result<i32> {
            Ok(42)
        }

        assert_eq!(returns_result().unwrap(), 42);
    }
}
