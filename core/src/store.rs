//! Storage traits for inventory counters, bookings and waitlist entries.
//!
//! Each trait exposes exactly the atomic units the services need. Anything
//! that must be linearizable per event (the compare-and-set on the counters,
//! position assignment, gap closing) is a single trait method so an
//! implementation can back it with one lock or one transaction.
//!
//! # Implementations
//!
//! - In-memory stores in the `boxoffice` crate: single-process deployments and tests
//! - `Pg*Store` in `boxoffice-postgres`: production, consistent across nodes
//!
//! # Dyn Compatibility
//!
//! Methods return [`StoreFuture`] instead of using `async fn` so the traits
//! can be used as `Arc<dyn InventoryStore>` inside the services.

use crate::error::StoreError;
use crate::types::{
    Booking, BookingId, EventId, EventInventory, IdempotencyKey, UserId, WaitlistEntry,
    WaitlistId, WaitlistStatus,
};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by every storage method.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

// ============================================================================
// Inventory
// ============================================================================

/// Result of a compare-and-set on an inventory record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write was applied; carries the record after the write.
    Applied(EventInventory),
    /// The expected version was stale; carries the current record.
    Stale(EventInventory),
}

/// Per-event seat counters with optimistic concurrency.
pub trait InventoryStore: Send + Sync {
    /// Insert a new inventory record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Duplicate`] if the event already has one.
    fn insert(&self, inventory: EventInventory) -> StoreFuture<'_, ()>;

    /// Load the current record for an event.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on storage failure.
    fn load(&self, event_id: EventId) -> StoreFuture<'_, Option<EventInventory>>;

    /// Set `available` and bump `version`, only if the stored version equals
    /// `expected_version`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the event has no record.
    fn compare_and_set(
        &self,
        event_id: EventId,
        expected_version: u64,
        available: u32,
    ) -> StoreFuture<'_, CasOutcome>;
}

// ============================================================================
// Bookings
// ============================================================================

/// Booking rows.
///
/// Implementations enforce two uniqueness constraints: one booking per
/// idempotency key, and one `CONFIRMED` booking per (user, event).
pub trait BookingStore: Send + Sync {
    /// Persist a new booking.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Duplicate`] naming the violated constraint.
    fn insert(&self, booking: Booking) -> StoreFuture<'_, ()>;

    /// Load a booking by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on storage failure.
    fn get(&self, booking_id: BookingId) -> StoreFuture<'_, Option<Booking>>;

    /// Load the booking created with `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on storage failure.
    fn find_by_idempotency_key<'a>(
        &'a self,
        key: &'a IdempotencyKey,
    ) -> StoreFuture<'a, Option<Booking>>;

    /// Load the user's `CONFIRMED` booking for an event, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on storage failure.
    fn find_active(&self, user_id: UserId, event_id: EventId)
    -> StoreFuture<'_, Option<Booking>>;

    /// Move a booking from `CONFIRMED` to `CANCELLED`.
    ///
    /// Exactly one concurrent caller can succeed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] or [`StoreError::StatusMismatch`].
    fn cancel(&self, booking_id: BookingId) -> StoreFuture<'_, Booking>;

    /// Move a booking from `CANCELLED` back to `CONFIRMED`.
    ///
    /// Undoes a [`cancel`](Self::cancel) whose seats could not be returned
    /// to the ledger.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`], [`StoreError::StatusMismatch`] if the
    /// booking is not `CANCELLED`, or [`StoreError::Duplicate`] if the user
    /// holds another confirmed booking for the event.
    fn restore(&self, booking_id: BookingId) -> StoreFuture<'_, Booking>;
}

// ============================================================================
// Waitlist
// ============================================================================

/// Result of an enqueue attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Enqueued {
    /// A fresh `WAITING` entry at the tail.
    Created(WaitlistEntry),
    /// The user already has an active entry; `position` is its live rank.
    Existing(WaitlistEntry),
    /// The queue already holds the maximum number of `WAITING` entries.
    Full,
}

/// Waitlist entries.
///
/// Positions of `WAITING` entries for one event are always `1..=N`. Every
/// method that changes which entries are `WAITING` closes the gap in the same
/// atomic unit, so no two users ever observe the same position.
pub trait WaitlistStore: Send + Sync {
    /// Append a `WAITING` entry for the user unless they already have an
    /// active one or the queue holds `max_waiting` entries.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on storage failure.
    fn enqueue(
        &self,
        user_id: UserId,
        event_id: EventId,
        now: DateTime<Utc>,
        max_waiting: u32,
    ) -> StoreFuture<'_, Enqueued>;

    /// Load an entry by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on storage failure.
    fn get(&self, waitlist_id: WaitlistId) -> StoreFuture<'_, Option<WaitlistEntry>>;

    /// The user's `WAITING` or `NOTIFIED` entry for an event, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on storage failure.
    fn find_active(
        &self,
        user_id: UserId,
        event_id: EventId,
    ) -> StoreFuture<'_, Option<WaitlistEntry>>;

    /// Live rank of a `WAITING` entry: `count(WAITING with lower position) + 1`.
    ///
    /// `None` if the entry is no longer `WAITING`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the entry does not exist.
    fn live_position(&self, waitlist_id: WaitlistId) -> StoreFuture<'_, Option<u32>>;

    /// Delete a `WAITING` entry and shift every later `WAITING` entry of the
    /// same event down by one.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`], or [`StoreError::StatusMismatch`] if
    /// the entry is not `WAITING`.
    fn remove_waiting(&self, waitlist_id: WaitlistId) -> StoreFuture<'_, WaitlistEntry>;

    /// `WAITING` entries of an event ordered by position.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on storage failure.
    fn waiting(&self, event_id: EventId) -> StoreFuture<'_, Vec<WaitlistEntry>>;

    /// Every entry of a user, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on storage failure.
    fn for_user(&self, user_id: UserId) -> StoreFuture<'_, Vec<WaitlistEntry>>;

    /// Lowest-position `WAITING` entry of an event.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on storage failure.
    fn head(&self, event_id: EventId) -> StoreFuture<'_, Option<WaitlistEntry>>;

    /// Atomically move the head `WAITING` entry to `NOTIFIED` with the given
    /// timestamps and close the gap it leaves.
    ///
    /// Returns `None` when the queue is empty.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on storage failure.
    fn promote_head(
        &self,
        event_id: EventId,
        notified_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<WaitlistEntry>>;

    /// Conditionally move an entry from `from` to `to`.
    ///
    /// Only `NOTIFIED → EXPIRED` and `NOTIFIED → CONVERTED` go through here;
    /// `WAITING → NOTIFIED` is [`WaitlistStore::promote_head`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`], [`StoreError::StatusMismatch`] if the
    /// stored status is not `from`, or [`StoreError::Invariant`] for an edge
    /// the state machine does not have.
    fn transition(
        &self,
        waitlist_id: WaitlistId,
        from: WaitlistStatus,
        to: WaitlistStatus,
    ) -> StoreFuture<'_, WaitlistEntry>;

    /// `NOTIFIED` entries whose window closed before `now`, oldest deadline first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on storage failure.
    fn overdue(&self, now: DateTime<Utc>) -> StoreFuture<'_, Vec<WaitlistEntry>>;
}

/// Reject a transition the state machine does not allow.
///
/// Shared by storage implementations so they fail closed the same way.
///
/// # Errors
///
/// Returns [`StoreError::Invariant`] for a missing edge.
pub fn check_transition(from: WaitlistStatus, to: WaitlistStatus) -> Result<(), StoreError> {
    if from.can_transition_to(to) && from != WaitlistStatus::Waiting {
        Ok(())
    } else {
        Err(StoreError::Invariant(format!(
            "no waitlist transition {from} -> {to}"
        )))
    }
}
