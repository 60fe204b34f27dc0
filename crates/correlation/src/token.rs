//! Transferable correlation tokens
//!
//! A token is created on the dispatcher thread, handed (cloned freely) to
//! other threads, linked there to attribute work to the transaction, and
//! expired exactly once when that work is done. Expiry is a CAS on the
//! token's active flag: however many clones race, one caller wins, returns
//! the outstanding-work share, and everyone else observes a dead token.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;

use tracelink_core::{names, TracerHandle};

use crate::context::ExecutionContext;
use crate::registry::RegistryCore;
use crate::transaction::TransactionContext;

pub(crate) struct TokenInner {
    pub(crate) id: u64,
    pub(crate) transaction: Arc<TransactionContext>,
    active: AtomicBool,
    /// 0 means no tracer; last write wins
    tracer: AtomicU64,
    created_at: Instant,
    /// Pushed out by refresh; informational, the registry's timed map is
    /// what the reaper actually consults
    deadline: Mutex<Instant>,
    registry: Weak<RegistryCore>,
}

/// Handle tying work on another thread back to its transaction
///
/// Cheap to clone; clones share one identity and one active flag. A no-op
/// token (from [`Token::noop`] or a refused creation) ignores every
/// operation, so call sites never need to branch on whether creation
/// succeeded.
#[derive(Clone)]
pub struct Token {
    inner: Option<Arc<TokenInner>>,
}

impl Token {
    pub(crate) fn real(
        id: u64,
        transaction: Arc<TransactionContext>,
        deadline: Instant,
        registry: Weak<RegistryCore>,
    ) -> Self {
        Self {
            inner: Some(Arc::new(TokenInner {
                id,
                transaction,
                active: AtomicBool::new(true),
                tracer: AtomicU64::new(0),
                created_at: Instant::now(),
                deadline: Mutex::new(deadline),
                registry,
            })),
        }
    }

    /// A token that ignores every operation
    pub fn noop() -> Self {
        Self { inner: None }
    }

    /// True for tokens returned when creation was refused
    pub fn is_noop(&self) -> bool {
        self.inner.is_none()
    }

    /// True until the first successful [`expire`](Self::expire)
    pub fn is_active(&self) -> bool {
        match &self.inner {
            Some(inner) => inner.active.load(Ordering::SeqCst),
            None => false,
        }
    }

    /// The transaction this token belongs to
    pub fn transaction(&self) -> Option<&Arc<TransactionContext>> {
        self.inner.as_ref().map(|inner| &inner.transaction)
    }

    /// Time since the token was minted
    pub fn age(&self) -> Option<std::time::Duration> {
        self.inner.as_ref().map(|inner| inner.created_at.elapsed())
    }

    /// When the reaper will consider this token abandoned
    ///
    /// Pushed out by [`refresh_token`](crate::registry::TokenRegistry::refresh_token).
    /// `None` for no-op tokens.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.as_ref().map(|inner| *inner.deadline.lock())
    }

    pub(crate) fn push_deadline(&self, deadline: Instant) {
        if let Some(inner) = &self.inner {
            *inner.deadline.lock() = deadline;
        }
    }

    /// Attach the given context to this token's transaction
    ///
    /// Returns false without touching the context when the token is dead,
    /// the transaction is ignored, or the context already carries this
    /// same transaction (re-linking from inside the transaction is a
    /// no-op, not an error).
    pub fn link(&self, ctx: &mut ExecutionContext) -> bool {
        let Some(inner) = &self.inner else {
            return false;
        };
        let registry = inner.registry.upgrade();
        if !inner.active.load(Ordering::SeqCst) || inner.transaction.is_ignored() {
            if let Some(core) = &registry {
                core.metrics().increment(names::TOKEN_LINK_IGNORE);
            }
            return false;
        }
        if let Some(current) = ctx.current_transaction() {
            if Arc::ptr_eq(current, &inner.transaction) {
                if let Some(core) = &registry {
                    core.metrics().increment(names::TOKEN_LINK_IGNORE);
                }
                return false;
            }
        }
        ctx.attach(Arc::clone(&inner.transaction));
        if let Some(core) = &registry {
            core.metrics().increment(names::TOKEN_LINK_SUCCESS);
        }
        true
    }

    /// Expire this token, returning its outstanding-work share
    ///
    /// Returns true for exactly one caller per token; the winner may end
    /// up closing the transaction. Safe to call any number of times from
    /// any thread.
    pub fn expire(&self) -> bool {
        let Some(inner) = &self.inner else {
            return false;
        };
        if !self.deactivate() {
            return false;
        }
        if let Some(core) = inner.registry.upgrade() {
            core.forget_token(inner.id);
            core.metrics().increment(names::TOKEN_EXPIRE);
        }
        inner.transaction.release_share();
        true
    }

    /// Link, then expire, in one call
    ///
    /// The expiry is attempted even when the link is refused. Returns true
    /// only when both the link and this call's own expiry succeeded; a
    /// clone racing [`expire`](Self::expire) in between makes this return
    /// false.
    pub fn link_and_expire(&self, ctx: &mut ExecutionContext) -> bool {
        let linked = self.link(ctx);
        self.expire() && linked
    }

    /// Record the host tracer that finished under this token; last write
    /// wins
    pub fn set_tracer(&self, tracer: TracerHandle) {
        if let Some(inner) = &self.inner {
            inner.tracer.store(tracer.get(), Ordering::SeqCst);
        }
    }

    /// The last tracer recorded on this token
    pub fn tracer(&self) -> Option<TracerHandle> {
        let inner = self.inner.as_ref()?;
        TracerHandle::new(inner.tracer.load(Ordering::SeqCst))
    }

    /// CAS the active flag down without registry bookkeeping
    ///
    /// Used by the timeout path, where the map entry is already gone.
    pub(crate) fn deactivate(&self) -> bool {
        match &self.inner {
            Some(inner) => inner
                .active
                .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok(),
            None => false,
        }
    }

    pub(crate) fn inner(&self) -> Option<&Arc<TokenInner>> {
        self.inner.as_ref()
    }
}

/// Tokens compare by identity: a clone equals its source, two separately
/// minted tokens never compare equal. No-op tokens all compare equal.
impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        match (&self.inner, &other.inner) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl Eq for Token {}

impl std::hash::Hash for Token {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match &self.inner {
            Some(inner) => (Arc::as_ptr(inner) as usize).hash(state),
            None => 0usize.hash(state),
        }
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            Some(inner) => f
                .debug_struct("Token")
                .field("id", &inner.id)
                .field("transaction", &inner.transaction.id())
                .field("active", &self.is_active())
                .finish(),
            None => f.write_str("Token(noop)"),
        }
    }
}
