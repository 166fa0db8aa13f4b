//! Domain types for the ticket inventory core.
//!
//! Identifiers, the per-event inventory record, bookings, waitlist entries and
//! the outbound seat notification payload.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Creates a new random `", stringify!($name), "`")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[doc = concat!("Create a `", stringify!($name), "` from a `Uuid`")]
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a ticketed event
    EventId
);
uuid_id!(
    /// Unique identifier for a user
    UserId
);
uuid_id!(
    /// Unique identifier for a booking
    BookingId
);
uuid_id!(
    /// Unique identifier for a waitlist entry
    WaitlistId
);

/// Caller-supplied token giving a booking request at-most-once effect.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Wrap a caller-supplied key.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Borrow the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdempotencyKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

// ============================================================================
// Event inventory
// ============================================================================

/// Seat counters for one event.
///
/// `0 <= available <= capacity` always holds. `version` increments on every
/// successful mutation and is the optimistic concurrency token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventInventory {
    /// Event these counters belong to
    pub event_id: EventId,
    /// Total sellable seats
    pub capacity: u32,
    /// Seats not currently held by a confirmed booking
    pub available: u32,
    /// Optimistic concurrency token
    pub version: u64,
    /// When the event starts; waitlist joins are refused from this point on
    pub starts_at: DateTime<Utc>,
}

impl EventInventory {
    /// Fresh inventory with every seat available at version 0.
    #[must_use]
    pub const fn new(event_id: EventId, capacity: u32, starts_at: DateTime<Utc>) -> Self {
        Self {
            event_id,
            capacity,
            available: capacity,
            version: 0,
            starts_at,
        }
    }

    /// Seats currently taken.
    #[must_use]
    pub const fn taken(&self) -> u32 {
        self.capacity.saturating_sub(self.available)
    }

    /// Whether no seats remain.
    #[must_use]
    pub const fn is_sold_out(&self) -> bool {
        self.available == 0
    }

    /// Whether the event has started as of `now`.
    #[must_use]
    pub fn has_started(&self, now: DateTime<Utc>) -> bool {
        now >= self.starts_at
    }
}

// ============================================================================
// Bookings
// ============================================================================

/// Lifecycle of a booking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    /// Seats are held by this booking
    Confirmed,
    /// Seats were returned to the ledger
    Cancelled,
}

impl BookingStatus {
    /// Convert status to its storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Confirmed => "CONFIRMED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Parse status from its storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CONFIRMED" => Some(Self::Confirmed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A claim on `quantity` seats of one event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    /// Booking identifier
    pub booking_id: BookingId,
    /// Who booked
    pub user_id: UserId,
    /// Which event
    pub event_id: EventId,
    /// Number of seats
    pub quantity: u32,
    /// Current status
    pub status: BookingStatus,
    /// Unique per booking
    pub idempotency_key: IdempotencyKey,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl Booking {
    /// A new confirmed booking.
    #[must_use]
    pub fn confirmed(
        user_id: UserId,
        event_id: EventId,
        quantity: u32,
        idempotency_key: IdempotencyKey,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            booking_id: BookingId::new(),
            user_id,
            event_id,
            quantity,
            status: BookingStatus::Confirmed,
            idempotency_key,
            created_at,
        }
    }

    /// Whether the booking still holds seats.
    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        self.status == BookingStatus::Confirmed
    }
}

// ============================================================================
// Waitlist
// ============================================================================

/// Waitlist entry state machine.
///
/// ```text
/// WAITING ──► NOTIFIED ──► EXPIRED
///                     └──► CONVERTED
/// ```
///
/// `EXPIRED` and `CONVERTED` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WaitlistStatus {
    /// Queued, holds a dense position
    Waiting,
    /// Head of the queue was told a seat is free; booking window open
    Notified,
    /// Booking window lapsed
    Expired,
    /// User booked within the window
    Converted,
}

impl WaitlistStatus {
    /// Convert status to its storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "WAITING",
            Self::Notified => "NOTIFIED",
            Self::Expired => "EXPIRED",
            Self::Converted => "CONVERTED",
        }
    }

    /// Parse status from its storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "WAITING" => Some(Self::Waiting),
            "NOTIFIED" => Some(Self::Notified),
            "EXPIRED" => Some(Self::Expired),
            "CONVERTED" => Some(Self::Converted),
            _ => None,
        }
    }

    /// `WAITING` or `NOTIFIED`.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Waiting | Self::Notified)
    }

    /// `EXPIRED` or `CONVERTED`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Expired | Self::Converted)
    }

    /// Whether the state machine has an edge from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Waiting, Self::Notified)
                | (Self::Notified, Self::Expired)
                | (Self::Notified, Self::Converted)
        )
    }
}

impl fmt::Display for WaitlistStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One user's place in one event's waitlist.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    /// Entry identifier
    pub waitlist_id: WaitlistId,
    /// Waiting user
    pub user_id: UserId,
    /// Event waited on
    pub event_id: EventId,
    /// 1-based rank among `WAITING` entries; last held rank once the entry leaves `WAITING`
    pub position: u32,
    /// Current status
    pub status: WaitlistStatus,
    /// Join time
    pub created_at: DateTime<Utc>,
    /// Set when the entry becomes `NOTIFIED`
    pub notified_at: Option<DateTime<Utc>>,
    /// `notified_at + booking window`, set together with `notified_at`
    pub expires_at: Option<DateTime<Utc>>,
}

impl WaitlistEntry {
    /// A new `WAITING` entry at `position`.
    #[must_use]
    pub fn waiting(
        user_id: UserId,
        event_id: EventId,
        position: u32,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            waitlist_id: WaitlistId::new(),
            user_id,
            event_id,
            position,
            status: WaitlistStatus::Waiting,
            created_at,
            notified_at: None,
            expires_at: None,
        }
    }

    /// Move this entry to `NOTIFIED`, opening a booking window of `window`.
    pub fn mark_notified(&mut self, now: DateTime<Utc>, window: Duration) {
        self.status = WaitlistStatus::Notified;
        self.notified_at = Some(now);
        self.expires_at = Some(now + window);
    }

    /// Whether this entry is `NOTIFIED` and its window closed before `now`.
    #[must_use]
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == WaitlistStatus::Notified && self.expires_at.is_some_and(|at| at < now)
    }
}

/// Payload handed to the external notification collaborator.
///
/// Not persisted by the core beyond the entry's own timestamps.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatNotification {
    /// Entry that was notified
    pub waitlist_id: WaitlistId,
    /// Recipient
    pub user_id: UserId,
    /// Event with a freed seat
    pub event_id: EventId,
    /// Seats available at notification time
    pub available_seats: u32,
    /// End of the booking window
    pub expires_at: DateTime<Utc>,
    /// Where the user can claim the seat
    pub booking_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_inventory_is_fully_available() {
        let inventory = EventInventory::new(EventId::new(), 25, Utc::now());
        assert_eq!(inventory.available, 25);
        assert_eq!(inventory.taken(), 0);
        assert_eq!(inventory.version, 0);
        assert!(!inventory.is_sold_out());
    }

    #[test]
    fn waitlist_state_machine_edges() {
        use WaitlistStatus::{Converted, Expired, Notified, Waiting};

        assert!(Waiting.can_transition_to(Notified));
        assert!(Notified.can_transition_to(Expired));
        assert!(Notified.can_transition_to(Converted));

        assert!(!Waiting.can_transition_to(Converted));
        assert!(!Waiting.can_transition_to(Expired));
        assert!(!Expired.can_transition_to(Notified));
        assert!(!Converted.can_transition_to(Expired));
        assert!(!Notified.can_transition_to(Waiting));
    }

    #[test]
    fn status_strings_parse_back() {
        for status in [
            WaitlistStatus::Waiting,
            WaitlistStatus::Notified,
            WaitlistStatus::Expired,
            WaitlistStatus::Converted,
        ] {
            assert_eq!(WaitlistStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(BookingStatus::parse("CANCELLED"), Some(BookingStatus::Cancelled));
        assert_eq!(BookingStatus::parse("cancelled"), None);
    }

    #[test]
    fn mark_notified_sets_window() {
        let now = Utc::now();
        let mut entry = WaitlistEntry::waiting(UserId::new(), EventId::new(), 1, now);
        entry.mark_notified(now, Duration::minutes(10));

        assert_eq!(entry.status, WaitlistStatus::Notified);
        assert_eq!(entry.notified_at, Some(now));
        assert_eq!(entry.expires_at, Some(now + Duration::minutes(10)));
        assert!(!entry.is_overdue(now));
        assert!(entry.is_overdue(now + Duration::minutes(11)));
    }
}
