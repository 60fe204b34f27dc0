//! Cross-thread transaction correlation
//!
//! This crate implements the asynchronous work correlation layer:
//! - TransactionContext: per-transaction lifecycle state machine
//! - Token: transferable handle that ties work on another thread back to
//!   the transaction that spawned it
//! - ExecutionContext: explicit per-unit-of-work attachment point
//! - TokenRegistry: issues tokens, tracks them against timeouts, and
//!   closes transactions once all outstanding work has reported in
//! - TimeoutReaper: background thread that force-expires abandoned work
//!
//! A transaction stays open while any token or registered activity is
//! outstanding. Expiring the last token after the dispatcher thread has
//! finished closes the transaction exactly once.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod activity;
pub mod context;
pub mod reaper;
pub mod registry;
pub mod token;
pub mod transaction;

pub use activity::ActivityKey;
pub use context::ExecutionContext;
pub use reaper::TimeoutReaper;
pub use registry::TokenRegistry;
pub use token::Token;
pub use transaction::{TransactionContext, TransactionListener};
