//! Storage errors and the error classification shared by every service.

use thiserror::Error;

/// How an error should be treated by its caller.
///
/// Business outcomes are expected and surfaced verbatim. Transient errors may
/// be retried by the caller. Invariant violations mean stored state is wrong
/// and must never be confused with a business outcome such as "sold out".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Expected, non-retryable outcome (sold out, queue full, ...)
    Business,
    /// Race or contention; the whole request may be retried
    Transient,
    /// Data corruption or a programming defect; fail closed
    Invariant,
    /// Storage, network or delivery failure
    Infrastructure,
}

impl ErrorKind {
    /// Whether the caller may retry the whole request.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Whether repeating the same operation later may succeed.
    ///
    /// True for contention and for storage or delivery failures; background
    /// work such as waitlist advancement retries on these.
    #[must_use]
    pub const fn is_temporary(self) -> bool {
        matches!(self, Self::Transient | Self::Infrastructure)
    }
}

/// Uniqueness constraints the storage layer enforces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UniqueConstraint {
    /// One inventory record per event
    EventInventory,
    /// One booking per idempotency key
    IdempotencyKey,
    /// One confirmed booking per (user, event)
    ActiveBooking,
    /// One `WAITING`/`NOTIFIED` entry per (user, event)
    ActiveWaitlistEntry,
}

impl std::fmt::Display for UniqueConstraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::EventInventory => "event inventory",
            Self::IdempotencyKey => "idempotency key",
            Self::ActiveBooking => "active booking",
            Self::ActiveWaitlistEntry => "active waitlist entry",
        };
        f.write_str(name)
    }
}

/// Errors that can occur during storage operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Record not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A uniqueness constraint rejected the write.
    #[error("Duplicate {0}")]
    Duplicate(UniqueConstraint),

    /// A conditional status update found a different status.
    #[error("Status mismatch for {id}: expected {expected}, found {actual}")]
    StatusMismatch {
        /// Record identifier
        id: String,
        /// Status the update required
        expected: &'static str,
        /// Status actually stored
        actual: &'static str,
    },

    /// Stored data violates an invariant.
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// Database connection or query error.
    #[error("Database error: {0}")]
    Database(String),
}

impl StoreError {
    /// Classify this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::Duplicate(_) | Self::StatusMismatch { .. } => {
                ErrorKind::Business
            },
            Self::Invariant(_) => ErrorKind::Invariant,
            Self::Database(_) => ErrorKind::Infrastructure,
        }
    }
}
