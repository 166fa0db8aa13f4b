//! Error types for the box office services.
//!
//! Each service has its own enum. Every variant is classified with
//! [`ErrorKind`] so callers can tell a business outcome ("sold out") from a
//! transient race ("try again") and from corrupted state.

use boxoffice_core::error::{ErrorKind, StoreError};
use boxoffice_core::types::{BookingId, EventId, WaitlistEntry, WaitlistId, WaitlistStatus};
use thiserror::Error;

/// Seat ledger errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Not enough seats remain.
    #[error("Insufficient seats for event {event_id}: requested {requested}, available {available}")]
    Insufficient {
        /// Event
        event_id: EventId,
        /// Seats asked for
        requested: u32,
        /// Seats left at read time
        available: u32,
    },

    /// The inventory version changed between read and write.
    #[error("Version conflict on event {event_id}")]
    Conflict {
        /// Event
        event_id: EventId,
    },

    /// The event has no inventory record.
    #[error("No inventory for event {0}")]
    NotFound(EventId),

    /// A release would push `available` above `capacity`.
    #[error(
        "Release of {released} seats on event {event_id} would exceed capacity {capacity} (available {available})"
    )]
    CapacityExceeded {
        /// Event
        event_id: EventId,
        /// Event capacity
        capacity: u32,
        /// Seats available before the release
        available: u32,
        /// Seats the caller tried to return
        released: u32,
    },

    /// Version conflicts persisted through every retry.
    #[error("Gave up on event {event_id} after {attempts} conflicting attempts")]
    Exhausted {
        /// Event
        event_id: EventId,
        /// Attempts made
        attempts: usize,
    },

    /// Storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LedgerError {
    /// Classify this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Insufficient { .. } | Self::NotFound(_) => ErrorKind::Business,
            Self::Conflict { .. } | Self::Exhausted { .. } => ErrorKind::Transient,
            Self::CapacityExceeded { .. } => ErrorKind::Invariant,
            Self::Store(e) => e.kind(),
        }
    }
}

/// Booking orchestrator errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BookingError {
    /// Not enough seats; the caller may join the waitlist.
    #[error("Event {event_id} is sold out: requested {requested}, available {available}")]
    SoldOut {
        /// Event
        event_id: EventId,
        /// Seats asked for
        requested: u32,
        /// Seats left
        available: u32,
    },

    /// The user already holds a confirmed booking for the event.
    #[error("User already has booking {existing} for this event")]
    Duplicate {
        /// The existing confirmed booking
        existing: BookingId,
    },

    /// Quantity must be at least one.
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(u32),

    /// The event has no inventory record.
    #[error("Event not found: {0}")]
    EventNotFound(EventId),

    /// No such booking.
    #[error("Booking not found: {0}")]
    NotFound(BookingId),

    /// The booking was already cancelled.
    #[error("Booking already cancelled: {0}")]
    AlreadyCancelled(BookingId),

    /// Contention outlasted the retry limit; the whole request may be retried.
    #[error("Event {event_id} is under heavy contention, try again ({attempts} attempts)")]
    TryAgain {
        /// Event
        event_id: EventId,
        /// Ledger attempts made
        attempts: usize,
    },

    /// Stored state is inconsistent.
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// Storage failure.
    #[error(transparent)]
    Store(StoreError),
}

impl BookingError {
    /// Classify this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::SoldOut { .. }
            | Self::Duplicate { .. }
            | Self::InvalidQuantity(_)
            | Self::EventNotFound(_)
            | Self::NotFound(_)
            | Self::AlreadyCancelled(_) => ErrorKind::Business,
            Self::TryAgain { .. } => ErrorKind::Transient,
            Self::Invariant(_) => ErrorKind::Invariant,
            Self::Store(e) => e.kind(),
        }
    }
}

impl From<LedgerError> for BookingError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Insufficient {
                event_id,
                requested,
                available,
            } => Self::SoldOut {
                event_id,
                requested,
                available,
            },
            LedgerError::NotFound(event_id) => Self::EventNotFound(event_id),
            LedgerError::Conflict { event_id } => Self::TryAgain {
                event_id,
                attempts: 1,
            },
            LedgerError::Exhausted { event_id, attempts } => Self::TryAgain { event_id, attempts },
            err @ LedgerError::CapacityExceeded { .. } => Self::Invariant(err.to_string()),
            LedgerError::Store(StoreError::Invariant(msg)) => Self::Invariant(msg),
            LedgerError::Store(e) => Self::Store(e),
        }
    }
}

impl From<StoreError> for BookingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Invariant(msg) => Self::Invariant(msg),
            other => Self::Store(other),
        }
    }
}

/// Waitlist and notification errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WaitlistError {
    /// Seats are available; the caller should book directly.
    #[error("Event {event_id} has {available} seats available")]
    SeatsAvailable {
        /// Event
        event_id: EventId,
        /// Seats left
        available: u32,
    },

    /// The user already has an active entry; carries it with its live position.
    #[error("Already on the waitlist at position {}", .entry.position)]
    AlreadyWaiting {
        /// Existing entry, `position` recomputed at read time
        entry: Box<WaitlistEntry>,
    },

    /// The queue holds the maximum number of waiting entries.
    #[error("Waitlist for event {event_id} is full ({max} entries)")]
    QueueFull {
        /// Event
        event_id: EventId,
        /// Configured ceiling
        max: u32,
    },

    /// The event has already started.
    #[error("Event {0} has already started")]
    EventStarted(EventId),

    /// The event has no inventory record.
    #[error("Event not found: {0}")]
    EventNotFound(EventId),

    /// No such entry.
    #[error("Waitlist entry not found: {0}")]
    NotFound(WaitlistId),

    /// The entry is no longer `WAITING`.
    #[error("Waitlist entry {waitlist_id} is {status}, not WAITING")]
    NotWaiting {
        /// Entry
        waitlist_id: WaitlistId,
        /// Its current status
        status: WaitlistStatus,
    },

    /// The state machine has no such edge from the entry's current status.
    #[error("Invalid transition for {waitlist_id}: {from} -> {to}")]
    InvalidTransition {
        /// Entry
        waitlist_id: WaitlistId,
        /// Current status
        from: WaitlistStatus,
        /// Requested status
        to: WaitlistStatus,
    },

    /// Stored state is inconsistent.
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// Storage failure.
    #[error(transparent)]
    Store(StoreError),
}

impl WaitlistError {
    /// Classify this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::SeatsAvailable { .. }
            | Self::AlreadyWaiting { .. }
            | Self::QueueFull { .. }
            | Self::EventStarted(_)
            | Self::EventNotFound(_)
            | Self::NotFound(_)
            | Self::NotWaiting { .. } => ErrorKind::Business,
            Self::InvalidTransition { .. } | Self::Invariant(_) => ErrorKind::Invariant,
            Self::Store(e) => e.kind(),
        }
    }
}

impl From<StoreError> for WaitlistError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Invariant(msg) => Self::Invariant(msg),
            other => Self::Store(other),
        }
    }
}
