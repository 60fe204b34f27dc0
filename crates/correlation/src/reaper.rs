//! Background reaping of abandoned work
//!
//! Tokens whose holders crashed, deadlocked, or simply never called
//! expire would hold their transactions open forever. The reaper is the
//! backstop: on its interval it asks the registry to force-expire every
//! token and registration that has aged past its timeout. Forced expiry
//! runs the same counter and listener bookkeeping as an explicit one, so
//! a reaped transaction still closes cleanly, just with a recorded
//! timeout cause.
//!
//! One reaper thread serves a whole registry; a panic inside a sweep is
//! logged and the next interval proceeds as usual.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::error;

use crate::registry::TokenRegistry;

/// Periodically force-expires whatever has outlived its timeout
///
/// Construct one per registry, [`start`](Self::start) it, and signal
/// [`shutdown`](Self::shutdown) when tearing the host down:
///
/// ```ignore
/// use std::time::Duration;
/// use tracelink_correlation::{TimeoutReaper, TokenRegistry};
/// use tracelink_core::CorrelationConfig;
///
/// let registry = TokenRegistry::new(CorrelationConfig::new())?;
/// let reaper = TimeoutReaper::new(registry.clone(), Duration::from_secs(30));
/// let handle = reaper.start();
///
/// // ... issue and expire tokens ...
///
/// reaper.shutdown();
/// handle.join().unwrap();
/// ```
pub struct TimeoutReaper {
    registry: TokenRegistry,
    sweep_interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl TimeoutReaper {
    /// Create a reaper sweeping `registry` every `sweep_interval`
    pub fn new(registry: TokenRegistry, sweep_interval: Duration) -> Self {
        Self {
            registry,
            sweep_interval,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn the sweep thread
    ///
    /// The thread sweeps once per interval until
    /// [`shutdown`](Self::shutdown); join the returned handle to wait for
    /// it to wind down.
    pub fn start(&self) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let sweep_interval = self.sweep_interval;

        thread::spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                // Wait the interval out in short slices so a shutdown
                // request is noticed quickly; the first sweep lands one
                // interval after start.
                let sleep_increment = Duration::from_millis(100).min(sweep_interval);
                let mut elapsed = Duration::ZERO;
                while elapsed < sweep_interval {
                    if shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                    thread::sleep(sleep_increment);
                    elapsed += sleep_increment;
                }

                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    registry.sweep();
                }));
                if result.is_err() {
                    error!("timeout sweep panicked");
                }
            }
        })
    }

    /// Ask the sweep thread to stop
    ///
    /// The thread notices within one sleep increment; nothing already
    /// swept is undone.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// True once [`shutdown`](Self::shutdown) has been requested
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}
