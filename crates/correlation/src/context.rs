//! Per-unit-of-work attachment point
//!
//! An ExecutionContext is what a worker thread presents when it wants its
//! work attributed to a transaction. Attachment is explicit: nothing here
//! touches thread-local state, so a context can be handed across threads,
//! pooled, or reused freely.

use std::sync::Arc;

use crate::transaction::TransactionContext;

/// The attachment point a unit of work carries
///
/// The origin context is the one created alongside the transaction on the
/// dispatcher thread; every other context starts detached and joins a
/// transaction through [`Token::link`](crate::token::Token::link).
#[derive(Clone)]
pub struct ExecutionContext {
    transaction: Option<Arc<TransactionContext>>,
    origin: bool,
}

impl ExecutionContext {
    /// The dispatcher-side context, attached from birth
    pub fn origin(transaction: Arc<TransactionContext>) -> Self {
        Self {
            transaction: Some(transaction),
            origin: true,
        }
    }

    /// A context not attached to any transaction
    pub fn detached() -> Self {
        Self {
            transaction: None,
            origin: false,
        }
    }

    /// The transaction this context currently works on behalf of
    pub fn current_transaction(&self) -> Option<&Arc<TransactionContext>> {
        self.transaction.as_ref()
    }

    /// True only for the context created with the transaction
    pub fn is_origin(&self) -> bool {
        self.origin
    }

    /// Detach from the current transaction, if any
    pub fn clear(&mut self) {
        self.transaction = None;
        self.origin = false;
    }

    /// Linking replaces whatever was attached before; the context stops
    /// being an origin once it has been linked.
    pub(crate) fn attach(&mut self, transaction: Arc<TransactionContext>) {
        self.transaction = Some(transaction);
        self.origin = false;
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("transaction", &self.transaction.as_ref().map(|t| t.id()))
            .field("origin", &self.origin)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::detached_transaction;

    #[test]
    fn detached_context_carries_nothing() {
        let ctx = ExecutionContext::detached();
        assert!(ctx.current_transaction().is_none());
        assert!(!ctx.is_origin());
    }

    #[test]
    fn origin_context_is_attached_from_birth() {
        let txn = detached_transaction();
        let ctx = ExecutionContext::origin(Arc::clone(&txn));
        assert!(ctx.is_origin());
        assert_eq!(ctx.current_transaction().unwrap().id(), txn.id());
    }

    #[test]
    fn attach_replaces_and_demotes_origin() {
        let first = detached_transaction();
        let second = detached_transaction();
        let mut ctx = ExecutionContext::origin(Arc::clone(&first));
        ctx.attach(Arc::clone(&second));
        assert!(!ctx.is_origin());
        assert_eq!(ctx.current_transaction().unwrap().id(), second.id());
    }

    #[test]
    fn clear_detaches() {
        let txn = detached_transaction();
        let mut ctx = ExecutionContext::origin(txn);
        ctx.clear();
        assert!(ctx.current_transaction().is_none());
        assert!(!ctx.is_origin());
    }
}
