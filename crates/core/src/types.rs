//! Identity and lifecycle types shared across the workspace

use std::fmt;
use std::num::NonZeroU64;
use uuid::Uuid;

/// Unique identifier for a logical transaction
///
/// Opaque, created once per unit of work. Backed by a v4 UUID so ids are
/// unique across processes without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Generate a fresh transaction id
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        TransactionId(Uuid::new_v4())
    }

    /// Access the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a transaction
///
/// State transitions:
/// - `Active` → `Finishing` (last outstanding unit of work completed)
/// - `Finishing` → `Closed` (finish notifications delivered)
///
/// `Closed` is terminal: a closed transaction is immutable and unreachable
/// for new token creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Transaction is executing; tokens may be created and linked
    Active,
    /// Closability observed; finish notifications in flight
    Finishing,
    /// Terminal. No further mutation
    Closed,
}

impl TransactionState {
    /// Encode for storage in an atomic u8
    pub fn as_u8(self) -> u8 {
        match self {
            TransactionState::Active => 0,
            TransactionState::Finishing => 1,
            TransactionState::Closed => 2,
        }
    }

    /// Decode from an atomic u8
    ///
    /// # Panics
    /// Panics on values never produced by `as_u8` (state words are written
    /// exclusively through that encoding).
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TransactionState::Active,
            1 => TransactionState::Finishing,
            2 => TransactionState::Closed,
            _ => unreachable!("invalid transaction state encoding: {raw}"),
        }
    }
}

/// Why a transaction was finished by the timeout path rather than by the
/// application expiring its own work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutCause {
    /// A token passed its deadline and was force-expired by the reaper
    Token,
    /// A registered-but-unstarted async activity passed its deadline
    Activity,
}

impl fmt::Display for TimeoutCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutCause::Token => write!(f, "token"),
            TimeoutCause::Activity => write!(f, "activity"),
        }
    }
}

/// Opaque handle naming a tracer owned by the host
///
/// The correlation core never interprets the value; it only stores the most
/// recently associated handle on a token, last-write-wins. Non-zero so the
/// token can pack "no tracer" into a single atomic word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TracerHandle(NonZeroU64);

impl TracerHandle {
    /// Wrap a host tracer id. Returns `None` for zero, which is reserved.
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(TracerHandle)
    }

    /// The raw id
    pub fn get(&self) -> u64 {
        self.0.get()
    }
}
