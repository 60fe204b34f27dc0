//! Per-transaction lifecycle state machine
//!
//! A TransactionContext moves Active -> Finishing -> Closed exactly once.
//! The close is gated on two conditions that may be satisfied in either
//! order, on different threads:
//! - the dispatcher thread has called `finish_dispatch()`
//! - the outstanding-work counter has dropped back to zero
//!
//! Whichever thread observes both conditions wins the state CAS and runs
//! the close path; every other thread sees the CAS fail and backs off.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Weak;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use tracelink_core::{TimeoutCause, TransactionId, TransactionState};

/// Callback fired when a transaction reaches Closed
///
/// Listeners run on whichever thread satisfied the last close condition,
/// which is usually not the dispatcher thread. Query
/// [`TransactionContext::timeout_cause`] to distinguish a clean finish
/// from a forced one.
pub trait TransactionListener: Send + Sync {
    /// Called once, after the state CAS into Finishing and before Closed
    /// becomes observable.
    fn on_transaction_finished(&self, transaction: &TransactionContext);
}

/// Internal hook through which a closing transaction reaches back to the
/// registry that created it. Kept separate from [`TransactionListener`] so
/// the registry can fan out to its listeners without the transaction
/// holding a strong cycle.
pub(crate) trait CloseObserver: Send + Sync {
    fn transaction_closed(&self, transaction: &TransactionContext);
}

/// State for one logical transaction
///
/// Shared via `Arc` between the dispatcher thread, every token minted for
/// the transaction, and the registry's timeout bookkeeping.
pub struct TransactionContext {
    id: TransactionId,
    /// Encodes [`TransactionState`]; transitions only via CAS
    state: AtomicU8,
    /// Tokens and activity registrations not yet expired
    outstanding: AtomicUsize,
    /// Cumulative tokens minted, never decremented; enforces the per-
    /// transaction token cap
    tokens_created: AtomicUsize,
    ignored: AtomicBool,
    dispatch_done: AtomicBool,
    /// First timeout to force work on this transaction wins; later ones
    /// are dropped
    timeout_cause: Mutex<Option<TimeoutCause>>,
    created_at: Instant,
    observer: Weak<dyn CloseObserver>,
}

impl TransactionContext {
    pub(crate) fn new(observer: Weak<dyn CloseObserver>) -> Self {
        Self {
            id: TransactionId::new(),
            state: AtomicU8::new(TransactionState::Active.as_u8()),
            outstanding: AtomicUsize::new(0),
            tokens_created: AtomicUsize::new(0),
            ignored: AtomicBool::new(false),
            dispatch_done: AtomicBool::new(false),
            timeout_cause: Mutex::new(None),
            created_at: Instant::now(),
            observer,
        }
    }

    /// Unique identifier for this transaction
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> TransactionState {
        TransactionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// True while the transaction accepts new tokens
    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    /// Mark the transaction ignored
    ///
    /// Token creation and linking against an ignored transaction become
    /// no-ops; tokens already outstanding still have to be expired for the
    /// transaction to close.
    pub fn ignore(&self) {
        self.ignored.store(true, Ordering::SeqCst);
    }

    /// True once [`ignore`](Self::ignore) has been called
    pub fn is_ignored(&self) -> bool {
        self.ignored.load(Ordering::SeqCst)
    }

    /// Signal that the dispatcher thread is done with this transaction
    ///
    /// The transaction closes immediately if no work is outstanding;
    /// otherwise the last expiry closes it.
    pub fn finish_dispatch(&self) {
        self.dispatch_done.store(true, Ordering::SeqCst);
        self.maybe_close();
    }

    /// True once the dispatcher thread has signalled completion
    pub fn dispatch_finished(&self) -> bool {
        self.dispatch_done.load(Ordering::SeqCst)
    }

    /// Tokens and activity registrations not yet expired
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Cumulative tokens minted for this transaction
    pub fn tokens_created(&self) -> usize {
        self.tokens_created.load(Ordering::SeqCst)
    }

    /// Why the transaction was force-finished, if it was
    pub fn timeout_cause(&self) -> Option<TimeoutCause> {
        *self.timeout_cause.lock()
    }

    /// Time since the transaction began
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// First writer wins; later causes are dropped
    pub(crate) fn record_timeout_cause(&self, cause: TimeoutCause) {
        let mut slot = self.timeout_cause.lock();
        if slot.is_none() {
            *slot = Some(cause);
        }
    }

    /// Reserve one outstanding-work share for a new token
    ///
    /// Returns false if the transaction is ignored, past the token cap, or
    /// no longer Active. The increment-then-recheck closes the race with a
    /// concurrent close: a share acquired against a transaction that just
    /// left Active is handed straight back.
    pub(crate) fn try_acquire_share(&self, token_cap: usize) -> bool {
        if !self.is_active() || self.is_ignored() {
            return false;
        }
        if self.tokens_created.fetch_add(1, Ordering::SeqCst) >= token_cap {
            return false;
        }
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        if !self.is_active() {
            self.undo_acquire();
            return false;
        }
        true
    }

    /// Reserve a share for an activity registration
    ///
    /// Registrations hold the transaction open like tokens do but are not
    /// counted against the token cap; the share transfers to the token
    /// minted when the activity starts.
    pub(crate) fn try_acquire_activity_share(&self) -> bool {
        if !self.is_active() || self.is_ignored() {
            return false;
        }
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        if !self.is_active() {
            self.undo_acquire();
            return false;
        }
        true
    }

    /// Hand back a share whose acquisition lost the race with a close
    ///
    /// A closer that saw our increment may have bailed out and left the
    /// transaction Active, so the decrement has to re-attempt the close.
    fn undo_acquire(&self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.maybe_close();
    }

    /// Return one outstanding-work share, closing the transaction if it
    /// was the last and the dispatcher is already done
    pub(crate) fn release_share(&self) {
        let prev = self.outstanding.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "outstanding counter underflow");
        self.maybe_close();
    }

    /// Attempt the Active -> Finishing -> Closed transition
    ///
    /// The CAS into Finishing is the single arbiter: exactly one caller
    /// runs the close path no matter how many threads race here. The
    /// counter is re-read after the CAS because a creator can increment it
    /// between our check and the CAS and still observe Active in its own
    /// recheck; when that happens the share is legitimately held, so we
    /// hand the transaction back and go around again.
    fn maybe_close(&self) {
        loop {
            if self.outstanding.load(Ordering::SeqCst) != 0 || !self.dispatch_finished() {
                return;
            }
            if self
                .state
                .compare_exchange(
                    TransactionState::Active.as_u8(),
                    TransactionState::Finishing.as_u8(),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_err()
            {
                return;
            }
            if self.outstanding.load(Ordering::SeqCst) != 0 {
                self.state
                    .store(TransactionState::Active.as_u8(), Ordering::SeqCst);
                continue;
            }
            debug!(transaction = %self.id, "transaction closing");
            if let Some(observer) = self.observer.upgrade() {
                observer.transaction_closed(self);
            }
            self.state
                .store(TransactionState::Closed.as_u8(), Ordering::SeqCst);
            return;
        }
    }
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("outstanding", &self.outstanding())
            .field("ignored", &self.is_ignored())
            .field("dispatch_done", &self.dispatch_finished())
            .finish()
    }
}

/// Helper for building a context without a registry, used by unit tests
/// in this crate
#[cfg(test)]
pub(crate) fn detached_transaction() -> std::sync::Arc<TransactionContext> {
    use std::sync::Arc;

    struct Nobody;
    impl CloseObserver for Nobody {
        fn transaction_closed(&self, _: &TransactionContext) {}
    }
    // A Weak that can never upgrade
    let observer: Weak<dyn CloseObserver> = {
        let arc: Arc<dyn CloseObserver> = Arc::new(Nobody);
        Arc::downgrade(&arc)
    };
    Arc::new(TransactionContext::new(observer))
}
