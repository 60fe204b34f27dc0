//! Token issuance and timeout bookkeeping
//!
//! The registry owns the two timed maps that keep abandoned work from
//! holding transactions open forever:
//! - live tokens, aged against the token timeout from their last refresh
//! - activity registrations, aged against the activity timeout
//!
//! Aging out of either map force-expires the work: the registry wins (or
//! loses) the same CAS an explicit expiry would, so the outstanding-work
//! counter moves exactly once per token no matter which path runs first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::RwLock;
use tracing::{debug, error, warn};

use tracelink_cache::{CacheFactory, Cleanable, RemovalCause, TimedEvictionMap};
use tracelink_core::{names, CorrelationConfig, MetricsSink, NoOpMetricsSink, Result, TimeoutCause};

use crate::activity::{ActivityKey, AsyncActivityRegistration};
use crate::context::ExecutionContext;
use crate::token::Token;
use crate::transaction::{CloseObserver, TransactionContext, TransactionListener};

pub(crate) struct RegistryCore {
    config: CorrelationConfig,
    metrics: Arc<dyn MetricsSink>,
    next_token_id: AtomicU64,
    /// Every active token, aged from its last refresh
    live_tokens: TimedEvictionMap<u64, Token>,
    /// Registered-but-not-started activities, aged from registration
    activities: TimedEvictionMap<ActivityKey, AsyncActivityRegistration>,
    listeners: RwLock<Vec<Arc<dyn TransactionListener>>>,
}

impl RegistryCore {
    pub(crate) fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    /// Drop the map entry for an explicitly expired token
    pub(crate) fn forget_token(&self, id: u64) {
        self.live_tokens.invalidate(&id);
    }

    /// Timeout path: the map entry is already gone, only the token's own
    /// state and the counter remain to be settled. Losing the CAS means an
    /// explicit expiry got there first, and there is nothing left to do.
    fn force_expire_token(&self, token: &Token) {
        if !token.deactivate() {
            return;
        }
        let Some(inner) = token.inner() else {
            return;
        };
        warn!(
            transaction = %inner.transaction.id(),
            token = inner.id,
            "token timed out without being expired"
        );
        inner.transaction.record_timeout_cause(TimeoutCause::Token);
        self.metrics.increment(names::TOKEN_TIMEOUT);
        inner.transaction.release_share();
    }

    /// Timeout path for a registration that was never started
    fn force_expire_activity(&self, registration: &AsyncActivityRegistration) {
        warn!(
            transaction = %registration.transaction.id(),
            age = ?registration.registered_at.elapsed(),
            "async activity timed out without being started"
        );
        registration
            .transaction
            .record_timeout_cause(TimeoutCause::Activity);
        self.metrics.increment(names::ACTIVITY_TIMEOUT);
        registration.transaction.release_share();
    }
}

impl CloseObserver for RegistryCore {
    fn transaction_closed(&self, transaction: &TransactionContext) {
        let listeners: Vec<_> = self.listeners.read().iter().cloned().collect();
        for listener in listeners {
            // One panicking listener must not take down the closer thread
            // or starve the remaining listeners
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener.on_transaction_finished(transaction);
            }));
            if result.is_err() {
                error!(transaction = %transaction.id(), "transaction listener panicked");
            }
        }
    }
}

/// Issues tokens and closes transactions once all work has reported in
///
/// Cloning is cheap and every clone works against the same state; the
/// registry is the unit a [`TimeoutReaper`](crate::reaper::TimeoutReaper)
/// sweeps.
#[derive(Clone)]
pub struct TokenRegistry {
    core: Arc<RegistryCore>,
}

impl TokenRegistry {
    /// Build a registry with the given configuration and no metrics
    pub fn new(config: CorrelationConfig) -> Result<Self> {
        Self::with_metrics(config, Arc::new(NoOpMetricsSink))
    }

    /// Build a registry reporting supportability counters to `metrics`
    pub fn with_metrics(config: CorrelationConfig, metrics: Arc<dyn MetricsSink>) -> Result<Self> {
        config.validate()?;
        let core = Arc::new_cyclic(|weak: &Weak<RegistryCore>| {
            let live_tokens = CacheFactory::concurrent_time_based_eviction_map(config.token_timeout);
            let on_token = Weak::clone(weak);
            live_tokens.add_removal_listener(Arc::new(
                move |_key: Option<&u64>, token: Option<&Token>, cause: RemovalCause| {
                    if cause != RemovalCause::Expired {
                        return;
                    }
                    if let (Some(token), Some(core)) = (token, on_token.upgrade()) {
                        core.force_expire_token(token);
                    }
                },
            ));

            let activities =
                CacheFactory::concurrent_time_based_eviction_map(config.activity_timeout);
            let on_activity = Weak::clone(weak);
            activities.add_removal_listener(Arc::new(
                move |_key: Option<&ActivityKey>,
                      reg: Option<&AsyncActivityRegistration>,
                      cause: RemovalCause| {
                    if cause != RemovalCause::Expired {
                        return;
                    }
                    if let (Some(reg), Some(core)) = (reg, on_activity.upgrade()) {
                        core.force_expire_activity(reg);
                    }
                },
            ));

            RegistryCore {
                config,
                metrics,
                next_token_id: AtomicU64::new(1),
                live_tokens,
                activities,
                listeners: RwLock::new(Vec::new()),
            }
        });
        Ok(Self { core })
    }

    /// The configuration this registry was built with
    pub fn config(&self) -> &CorrelationConfig {
        &self.core.config
    }

    /// Open a transaction
    ///
    /// The dispatcher usually pairs this with
    /// [`ExecutionContext::origin`] for its own context.
    pub fn begin_transaction(&self) -> Arc<TransactionContext> {
        let weak = Arc::downgrade(&self.core);
        let observer: Weak<dyn CloseObserver> = weak;
        let transaction = Arc::new(TransactionContext::new(observer));
        debug!(transaction = %transaction.id(), "transaction opened");
        transaction
    }

    /// Mint a token against `transaction`
    ///
    /// Returns a no-op token when the transaction is ignored, no longer
    /// active, or already at its token cap. A real token holds the
    /// transaction open until expired or timed out.
    pub fn create_token(&self, transaction: &Arc<TransactionContext>) -> Token {
        if !transaction.try_acquire_share(self.core.config.max_tokens_per_transaction) {
            debug!(transaction = %transaction.id(), "token creation refused");
            return Token::noop();
        }
        self.mint(Arc::clone(transaction))
    }

    /// Reset a token's timeout clock
    ///
    /// Long-running work calls this to avoid being force-expired. Returns
    /// false for no-op and already-dead tokens.
    pub fn refresh_token(&self, token: &Token) -> bool {
        let Some(inner) = token.inner() else {
            return false;
        };
        if !token.is_active() {
            return false;
        }
        token.push_deadline(Instant::now() + self.core.config.token_timeout);
        self.core.live_tokens.insert(inner.id, token.clone());
        // Re-inserting a token whose old entry had already gone stale
        // force-expires it through the removal listener; report that.
        token.is_active()
    }

    /// Expire every live token belonging to `transaction`
    ///
    /// Returns the number of tokens this call expired. Used by hosts that
    /// abort a transaction and want its async work cut loose immediately.
    pub fn expire_all_tokens(&self, transaction: &Arc<TransactionContext>) -> usize {
        let mut expired = 0;
        for (_, token) in self.core.live_tokens.entries() {
            let belongs = token
                .transaction()
                .map(|txn| Arc::ptr_eq(txn, transaction))
                .unwrap_or(false);
            if belongs && token.expire() {
                expired += 1;
            }
        }
        expired
    }

    /// Register future async work under an identity key
    ///
    /// Holds the transaction open like a token would, without minting one
    /// yet. Returns false when the transaction refuses (ignored or no
    /// longer active) or the key is already registered.
    pub fn register_async_activity(
        &self,
        key: ActivityKey,
        transaction: &Arc<TransactionContext>,
    ) -> bool {
        if self.core.activities.contains_key(&key) {
            return false;
        }
        if !transaction.try_acquire_activity_share() {
            return false;
        }
        let registration = AsyncActivityRegistration::new(Arc::clone(transaction));
        if let Some(previous) = self.core.activities.insert(key, registration) {
            // Lost a race on the same key; hand back the share we just
            // took and keep the other registration's
            previous.transaction.release_share();
        }
        self.core.metrics.increment(names::ACTIVITY_REGISTER);
        true
    }

    /// Start a registered activity, converting it into a live token
    ///
    /// Links `ctx` to the registration's transaction and hands back the
    /// token the caller expires on completion. The registration's
    /// outstanding share transfers to the token, so the counter does not
    /// move. Returns `None` when the key was never registered or has
    /// already started, been ignored, or timed out.
    pub fn start_async_activity(
        &self,
        key: &ActivityKey,
        ctx: &mut ExecutionContext,
    ) -> Option<Token> {
        let registration = self.core.activities.invalidate(key)?;
        self.core.metrics.increment(names::ACTIVITY_START);
        let token = self.mint(registration.transaction);
        token.link(ctx);
        Some(token)
    }

    /// Drop a registration that never started, releasing its share
    ///
    /// Returns true if this call removed the registration.
    pub fn ignore_if_unstarted_async_context(&self, key: &ActivityKey) -> bool {
        match self.core.activities.invalidate(key) {
            Some(registration) => {
                registration.transaction.release_share();
                self.core.metrics.increment(names::ACTIVITY_IGNORE);
                true
            }
            None => false,
        }
    }

    /// Force-expire everything that has aged past its timeout
    ///
    /// The [`TimeoutReaper`](crate::reaper::TimeoutReaper) calls this on
    /// its interval; hosts may also call it directly.
    pub fn sweep(&self) {
        self.core.live_tokens.clean_up();
        self.core.activities.clean_up();
    }

    /// Register a callback for transactions closing
    pub fn add_transaction_listener(&self, listener: Arc<dyn TransactionListener>) {
        self.core.listeners.write().push(listener);
    }

    /// Live tokens currently tracked against the timeout
    pub fn live_token_count(&self) -> usize {
        self.core.live_tokens.len()
    }

    /// Registrations currently tracked against the timeout
    pub fn pending_activity_count(&self) -> usize {
        self.core.activities.len()
    }

    /// Mint against a share the caller already holds
    fn mint(&self, transaction: Arc<TransactionContext>) -> Token {
        let id = self.core.next_token_id.fetch_add(1, Ordering::SeqCst);
        let deadline = Instant::now() + self.core.config.token_timeout;
        let token = Token::real(id, transaction, deadline, Arc::downgrade(&self.core));
        self.core.live_tokens.insert(id, token.clone());
        self.core.metrics.increment(names::TOKEN_CREATE);
        token
    }
}

impl std::fmt::Debug for TokenRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRegistry")
            .field("live_tokens", &self.core.live_tokens.len())
            .field("pending_activities", &self.core.activities.len())
            .finish()
    }
}
