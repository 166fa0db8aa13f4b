//! Booking orchestrator: turns a booking request into a ledger reservation
//! plus a durable booking record, at most once per idempotency key.
//!
//! ```text
//! create_booking(user, event, qty, key)
//!     │
//!     ├─► key already used?         ──► return the original booking (replayed)
//!     ├─► user already booked?      ──► Duplicate
//!     ├─► ledger.reserve_with_retry ──► SoldOut / TryAgain
//!     ├─► persist CONFIRMED booking ──► on failure: release (compensation)
//!     └─► settle the user's waitlist entry (convert or leave)
//!
//! cancel_booking(id)
//!     ├─► CONFIRMED → CANCELLED (exactly one caller wins)
//!     ├─► ledger.release_with_retry
//!     └─► publish SeatsFreed        // never waits on the coordinator
//! ```

use crate::coordinator::NotificationCoordinator;
use crate::error::BookingError;
use crate::ledger::SeatLedger;
use crate::waitlist::WaitlistQueue;
use boxoffice_core::environment::Clock;
use boxoffice_core::error::{StoreError, UniqueConstraint};
use boxoffice_core::event::{SEATS_FREED_TOPIC, SeatsFreed, SerializedEvent};
use boxoffice_core::event_bus::EventBus;
use boxoffice_core::store::BookingStore;
use boxoffice_core::types::{
    Booking, BookingId, EventId, IdempotencyKey, UserId, WaitlistStatus,
};
use metrics::counter;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

/// Outcome of [`BookingOrchestrator::create_booking`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BookingResult {
    /// The booking created for this idempotency key
    pub booking: Booking,
    /// `true` when the key had already been used and no seats were reserved
    pub replayed: bool,
}

type KeyLock = Arc<tokio::sync::Mutex<()>>;

/// Creates and cancels bookings against the [`SeatLedger`].
#[derive(Clone)]
pub struct BookingOrchestrator {
    bookings: Arc<dyn BookingStore>,
    ledger: SeatLedger,
    waitlist: WaitlistQueue,
    coordinator: NotificationCoordinator,
    event_bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    in_flight: Arc<Mutex<HashMap<IdempotencyKey, KeyLock>>>,
}

impl BookingOrchestrator {
    /// Wire an orchestrator.
    #[must_use]
    pub fn new(
        bookings: Arc<dyn BookingStore>,
        ledger: SeatLedger,
        waitlist: WaitlistQueue,
        coordinator: NotificationCoordinator,
        event_bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            bookings,
            ledger,
            waitlist,
            coordinator,
            event_bus,
            clock,
            in_flight: Arc::default(),
        }
    }

    /// Book `quantity` seats for a user.
    ///
    /// Requests sharing an idempotency key are serialised in this process,
    /// and the storage uniqueness constraint covers other processes. A
    /// repeated key returns the original booking with `replayed = true` and
    /// leaves the ledger untouched.
    ///
    /// # Errors
    ///
    /// - [`BookingError::SoldOut`]: not enough seats; the user may join the waitlist
    /// - [`BookingError::Duplicate`]: the user already holds a confirmed booking
    /// - [`BookingError::TryAgain`]: ledger contention outlasted the retry limit
    /// - [`BookingError::InvalidQuantity`], [`BookingError::EventNotFound`]
    /// - [`BookingError::Store`]: the booking could not be written; seats were returned
    pub async fn create_booking(
        &self,
        user_id: UserId,
        event_id: EventId,
        quantity: u32,
        idempotency_key: IdempotencyKey,
    ) -> Result<BookingResult, BookingError> {
        if quantity == 0 {
            counter!("bookings_rejected_total", "reason" => "invalid_quantity").increment(1);
            return Err(BookingError::InvalidQuantity(quantity));
        }

        let lock = self.key_lock(&idempotency_key);
        let result = {
            let _guard = lock.lock().await;
            self.create_serialised(user_id, event_id, quantity, &idempotency_key)
                .await
        };
        self.forget_key_lock(&idempotency_key, &lock);
        result
    }

    async fn create_serialised(
        &self,
        user_id: UserId,
        event_id: EventId,
        quantity: u32,
        idempotency_key: &IdempotencyKey,
    ) -> Result<BookingResult, BookingError> {
        if let Some(existing) = self
            .bookings
            .find_by_idempotency_key(idempotency_key)
            .await?
        {
            return Ok(Self::replay(existing));
        }

        if let Some(active) = self.bookings.find_active(user_id, event_id).await? {
            counter!("bookings_rejected_total", "reason" => "duplicate").increment(1);
            debug!(
                user_id = %user_id,
                event_id = %event_id,
                existing = %active.booking_id,
                "User already holds a booking"
            );
            return Err(BookingError::Duplicate {
                existing: active.booking_id,
            });
        }

        if let Err(e) = self.ledger.reserve_with_retry(event_id, quantity).await {
            let err = BookingError::from(e);
            match &err {
                BookingError::SoldOut { .. } => {
                    counter!("bookings_rejected_total", "reason" => "sold_out").increment(1);
                    debug!(event_id = %event_id, quantity, "Booking rejected, sold out");
                },
                BookingError::TryAgain { attempts, .. } => {
                    counter!("bookings_rejected_total", "reason" => "contention").increment(1);
                    warn!(event_id = %event_id, attempts, "Booking rejected, ledger contention");
                },
                _ => {},
            }
            return Err(err);
        }

        let booking = Booking::confirmed(
            user_id,
            event_id,
            quantity,
            idempotency_key.clone(),
            self.clock.now(),
        );

        if let Err(e) = self.bookings.insert(booking.clone()).await {
            return self.compensate(&booking, e).await;
        }

        counter!("bookings_created_total").increment(1);
        info!(
            booking_id = %booking.booking_id,
            user_id = %user_id,
            event_id = %event_id,
            quantity,
            "Booking confirmed"
        );

        self.settle_waitlist(user_id, event_id).await;

        Ok(BookingResult {
            booking,
            replayed: false,
        })
    }

    /// Give back the seats of a booking that could not be written.
    async fn compensate(
        &self,
        booking: &Booking,
        cause: StoreError,
    ) -> Result<BookingResult, BookingError> {
        warn!(
            booking_id = %booking.booking_id,
            event_id = %booking.event_id,
            quantity = booking.quantity,
            error = %cause,
            "Booking write failed, releasing reserved seats"
        );

        if let Err(e) = self
            .ledger
            .release_with_retry(booking.event_id, booking.quantity)
            .await
        {
            error!(
                event_id = %booking.event_id,
                quantity = booking.quantity,
                error = %e,
                "Compensating release failed, seats are unaccounted for"
            );
            return Err(BookingError::Invariant(format!(
                "reserved {} seats on event {} but could neither book nor release them: {e}",
                booking.quantity, booking.event_id
            )));
        }
        counter!("bookings_compensated_total").increment(1);

        match cause {
            StoreError::Duplicate(UniqueConstraint::IdempotencyKey) => {
                match self
                    .bookings
                    .find_by_idempotency_key(&booking.idempotency_key)
                    .await?
                {
                    Some(existing) => Ok(Self::replay(existing)),
                    None => Err(BookingError::Store(cause)),
                }
            },
            StoreError::Duplicate(UniqueConstraint::ActiveBooking) => {
                match self
                    .bookings
                    .find_active(booking.user_id, booking.event_id)
                    .await?
                {
                    Some(existing) => Err(BookingError::Duplicate {
                        existing: existing.booking_id,
                    }),
                    None => Err(BookingError::Store(cause)),
                }
            },
            other => Err(BookingError::from(other)),
        }
    }

    fn replay(existing: Booking) -> BookingResult {
        counter!("bookings_replayed_total").increment(1);
        debug!(
            booking_id = %existing.booking_id,
            idempotency_key = %existing.idempotency_key,
            "Idempotency key reused, returning original booking"
        );
        BookingResult {
            booking: existing,
            replayed: true,
        }
    }

    /// Convert a notified entry, or drop a still-waiting one, after the user booked.
    async fn settle_waitlist(&self, user_id: UserId, event_id: EventId) {
        let entry = match self.waitlist.active_entry(user_id, event_id).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return,
            Err(e) => {
                warn!(user_id = %user_id, event_id = %event_id, error = %e, "Could not look up waitlist entry");
                return;
            },
        };

        let outcome = match entry.status {
            WaitlistStatus::Notified => self.coordinator.convert(entry.waitlist_id).await,
            WaitlistStatus::Waiting => self.waitlist.leave(entry.waitlist_id).await,
            WaitlistStatus::Expired | WaitlistStatus::Converted => return,
        };
        if let Err(e) = outcome {
            warn!(
                waitlist_id = %entry.waitlist_id,
                status = %entry.status,
                error = %e,
                "Could not settle waitlist entry after booking"
            );
        }
    }

    /// Cancel a confirmed booking and hand its seats to the waitlist.
    ///
    /// Returns once the seats are back in the ledger and the seats-freed
    /// event is queued. A publish failure is logged and does not fail the
    /// cancellation.
    ///
    /// # Errors
    ///
    /// - [`BookingError::NotFound`], [`BookingError::AlreadyCancelled`]
    /// - [`BookingError::Invariant`]: the release would exceed capacity
    /// - [`BookingError::TryAgain`]: the release could not get past contention;
    ///   the booking is back to `CONFIRMED` and the call can be repeated
    pub async fn cancel_booking(&self, booking_id: BookingId) -> Result<Booking, BookingError> {
        let cancelled = self.bookings.cancel(booking_id).await.map_err(|e| match e {
            StoreError::NotFound(_) => BookingError::NotFound(booking_id),
            StoreError::StatusMismatch { .. } => BookingError::AlreadyCancelled(booking_id),
            other => BookingError::from(other),
        })?;

        if let Err(e) = self
            .ledger
            .release_with_retry(cancelled.event_id, cancelled.quantity)
            .await
        {
            warn!(
                booking_id = %booking_id,
                event_id = %cancelled.event_id,
                quantity = cancelled.quantity,
                error = %e,
                "Seat release failed, restoring booking"
            );
            return Err(self.undo_cancel(&cancelled, e.into()).await);
        }

        counter!("bookings_cancelled_total").increment(1);
        info!(
            booking_id = %booking_id,
            event_id = %cancelled.event_id,
            quantity = cancelled.quantity,
            "Booking cancelled"
        );

        self.publish_seats_freed(&cancelled).await;
        Ok(cancelled)
    }

    /// Put a cancelled booking back to `CONFIRMED` after its seats could not
    /// be returned, so the caller can retry the cancellation.
    async fn undo_cancel(&self, cancelled: &Booking, cause: BookingError) -> BookingError {
        match self.bookings.restore(cancelled.booking_id).await {
            Ok(_) => {
                counter!("booking_cancel_restored_total").increment(1);
                cause
            },
            Err(e) => {
                error!(
                    booking_id = %cancelled.booking_id,
                    event_id = %cancelled.event_id,
                    quantity = cancelled.quantity,
                    error = %e,
                    "Booking cancelled but seats were neither released nor restored"
                );
                BookingError::Invariant(format!(
                    "booking {} cancelled with {} seats unreleased: {e}",
                    cancelled.booking_id, cancelled.quantity
                ))
            },
        }
    }

    async fn publish_seats_freed(&self, cancelled: &Booking) {
        let freed = SeatsFreed::new(cancelled.event_id, cancelled.quantity, self.clock.now());
        let metadata = serde_json::json!({ "booking_id": cancelled.booking_id.to_string() });

        let envelope = match SerializedEvent::from_event(&freed, Some(metadata)) {
            Ok(envelope) => envelope,
            Err(e) => {
                counter!("event_bus_publish_errors_total").increment(1);
                error!(event_id = %cancelled.event_id, error = %e, "Could not encode seats-freed event");
                return;
            },
        };

        match self.event_bus.publish(SEATS_FREED_TOPIC, &envelope).await {
            Ok(()) => {
                counter!("event_bus_messages_published_total").increment(1);
                debug!(
                    message_id = %envelope.message_id,
                    event_id = %cancelled.event_id,
                    quantity = cancelled.quantity,
                    "Seats-freed event published"
                );
            },
            Err(e) => {
                counter!("event_bus_publish_errors_total").increment(1);
                error!(
                    event_id = %cancelled.event_id,
                    quantity = cancelled.quantity,
                    error = %e,
                    "Failed to publish seats-freed event"
                );
            },
        }
    }

    /// Load a booking.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::NotFound`] if no such booking exists.
    pub async fn get_booking(&self, booking_id: BookingId) -> Result<Booking, BookingError> {
        self.bookings
            .get(booking_id)
            .await?
            .ok_or(BookingError::NotFound(booking_id))
    }

    fn key_lock(&self, key: &IdempotencyKey) -> KeyLock {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(in_flight.entry(key.clone()).or_default())
    }

    fn forget_key_lock(&self, key: &IdempotencyKey, lock: &KeyLock) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one held here: nobody else is waiting.
        if Arc::strong_count(lock) == 2 {
            in_flight.remove(key);
        }
    }

    #[cfg(test)]
    fn in_flight_keys(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryBookingStore, InMemoryInventoryStore, InMemoryWaitlistStore};
    use boxoffice_core::types::BookingStatus;
    use boxoffice_runtime::{InMemoryEventBus, RetryPolicy};
    use boxoffice_testing::{FailingBookingInsert, RecordingNotifier, test_clock};
    use chrono::Duration;

    struct Fixture {
        orchestrator: BookingOrchestrator,
        ledger: SeatLedger,
        bus: Arc<InMemoryEventBus>,
        event_id: EventId,
    }

    async fn fixture_with(bookings: Arc<dyn BookingStore>, capacity: u32) -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(test_clock());
        let ledger = SeatLedger::new(
            Arc::new(InMemoryInventoryStore::new()),
            RetryPolicy::default(),
        );
        let event_id = EventId::new();
        ledger
            .register(event_id, capacity, clock.now() + Duration::days(1))
            .await
            .unwrap();

        let waitlist_store = Arc::new(InMemoryWaitlistStore::new());
        let waitlist = WaitlistQueue::new(waitlist_store.clone(), ledger.clone(), clock.clone(), 100);
        let coordinator = NotificationCoordinator::new(
            waitlist_store,
            ledger.clone(),
            Arc::new(RecordingNotifier::new()),
            clock.clone(),
            Duration::minutes(10),
            "https://tickets.test/events",
        );
        let bus = Arc::new(InMemoryEventBus::new());
        let orchestrator = BookingOrchestrator::new(
            bookings,
            ledger.clone(),
            waitlist,
            coordinator,
            bus.clone(),
            clock,
        );
        Fixture {
            orchestrator,
            ledger,
            bus,
            event_id,
        }
    }

    async fn fixture(capacity: u32) -> Fixture {
        fixture_with(Arc::new(InMemoryBookingStore::new()), capacity).await
    }

    #[tokio::test]
    async fn replayed_key_returns_original_without_reserving() {
        let f = fixture(5).await;
        let user = UserId::new();

        let first = f
            .orchestrator
            .create_booking(user, f.event_id, 2, "key-1".into())
            .await
            .unwrap();
        let second = f
            .orchestrator
            .create_booking(user, f.event_id, 2, "key-1".into())
            .await
            .unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.booking.booking_id, second.booking.booking_id);
        assert_eq!(f.ledger.inventory(f.event_id).await.unwrap().available, 3);
        assert_eq!(f.orchestrator.in_flight_keys(), 0);
    }

    #[tokio::test]
    async fn second_booking_for_same_user_is_duplicate() {
        let f = fixture(5).await;
        let user = UserId::new();
        let first = f
            .orchestrator
            .create_booking(user, f.event_id, 1, "a".into())
            .await
            .unwrap();

        let err = f
            .orchestrator
            .create_booking(user, f.event_id, 1, "b".into())
            .await
            .unwrap_err();
        assert_eq!(err, BookingError::Duplicate {
            existing: first.booking.booking_id
        });
        assert_eq!(f.ledger.inventory(f.event_id).await.unwrap().available, 4);
    }

    #[tokio::test]
    async fn sold_out_and_invalid_quantity() {
        let f = fixture(1).await;
        f.orchestrator
            .create_booking(UserId::new(), f.event_id, 1, "a".into())
            .await
            .unwrap();

        let err = f
            .orchestrator
            .create_booking(UserId::new(), f.event_id, 1, "b".into())
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::SoldOut { available: 0, .. }));

        assert_eq!(
            f.orchestrator
                .create_booking(UserId::new(), f.event_id, 0, "c".into())
                .await
                .unwrap_err(),
            BookingError::InvalidQuantity(0)
        );
    }

    #[tokio::test]
    async fn failed_write_returns_reserved_seats() {
        let inner: Arc<dyn BookingStore> = Arc::new(InMemoryBookingStore::new());
        let failing = Arc::new(FailingBookingInsert::new(inner));
        let f = fixture_with(failing.clone(), 3).await;

        let err = f
            .orchestrator
            .create_booking(UserId::new(), f.event_id, 2, "k".into())
            .await
            .unwrap_err();

        assert!(matches!(err, BookingError::Store(StoreError::Database(_))));
        assert_eq!(failing.failures(), 1);
        let inventory = f.ledger.inventory(f.event_id).await.unwrap();
        assert_eq!(inventory.available, 3);
        assert_eq!(inventory.version, 2);
    }

    #[tokio::test]
    async fn cancel_releases_and_publishes_once() {
        let f = fixture(2).await;
        let booked = f
            .orchestrator
            .create_booking(UserId::new(), f.event_id, 2, "k".into())
            .await
            .unwrap();

        let cancelled = f
            .orchestrator
            .cancel_booking(booked.booking.booking_id)
            .await
            .unwrap();
        assert_eq!(cancelled.status, BookingStatus::Cancelled);
        assert_eq!(f.ledger.inventory(f.event_id).await.unwrap().available, 2);
        assert_eq!(f.bus.published_count(SEATS_FREED_TOPIC), 1);

        assert_eq!(
            f.orchestrator
                .cancel_booking(booked.booking.booking_id)
                .await
                .unwrap_err(),
            BookingError::AlreadyCancelled(booked.booking.booking_id)
        );
        assert_eq!(f.bus.published_count(SEATS_FREED_TOPIC), 1);
    }

    #[tokio::test]
    async fn cancel_succeeds_when_bus_is_closed() {
        let f = fixture(1).await;
        let booked = f
            .orchestrator
            .create_booking(UserId::new(), f.event_id, 1, "k".into())
            .await
            .unwrap();
        f.bus.close();

        f.orchestrator
            .cancel_booking(booked.booking.booking_id)
            .await
            .unwrap();
        assert_eq!(f.ledger.inventory(f.event_id).await.unwrap().available, 1);
    }

    #[tokio::test]
    async fn unknown_booking() {
        let f = fixture(1).await;
        let missing = BookingId::new();
        assert_eq!(
            f.orchestrator.get_booking(missing).await.unwrap_err(),
            BookingError::NotFound(missing)
        );
        assert_eq!(
            f.orchestrator.cancel_booking(missing).await.unwrap_err(),
            BookingError::NotFound(missing)
        );
    }
}
