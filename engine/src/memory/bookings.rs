use boxoffice_core::error::{StoreError, UniqueConstraint};
use boxoffice_core::store::{BookingStore, StoreFuture};
use boxoffice_core::types::{
    Booking, BookingId, BookingStatus, EventId, IdempotencyKey, UserId,
};
use std::collections::HashMap;
use std::future::ready;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
struct Tables {
    by_id: HashMap<BookingId, Booking>,
    by_key: HashMap<IdempotencyKey, BookingId>,
    active: HashMap<(UserId, EventId), BookingId>,
}

/// In-memory booking rows with the idempotency-key and active-booking
/// uniqueness constraints.
#[derive(Debug, Default)]
pub struct InMemoryBookingStore {
    tables: Mutex<Tables>,
}

impl InMemoryBookingStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored bookings, any status.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .len()
    }

    /// Whether no booking has been stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert_now(&self, booking: Booking) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);

        if tables.by_key.contains_key(&booking.idempotency_key) {
            return Err(StoreError::Duplicate(UniqueConstraint::IdempotencyKey));
        }
        let pair = (booking.user_id, booking.event_id);
        if booking.is_confirmed() && tables.active.contains_key(&pair) {
            return Err(StoreError::Duplicate(UniqueConstraint::ActiveBooking));
        }

        tables
            .by_key
            .insert(booking.idempotency_key.clone(), booking.booking_id);
        if booking.is_confirmed() {
            tables.active.insert(pair, booking.booking_id);
        }
        tables.by_id.insert(booking.booking_id, booking);
        Ok(())
    }

    fn by_key_now(&self, key: &IdempotencyKey) -> Option<Booking> {
        let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        tables
            .by_key
            .get(key)
            .and_then(|id| tables.by_id.get(id))
            .cloned()
    }

    fn active_now(&self, user_id: UserId, event_id: EventId) -> Option<Booking> {
        let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        tables
            .active
            .get(&(user_id, event_id))
            .and_then(|id| tables.by_id.get(id))
            .cloned()
    }

    fn cancel_now(&self, booking_id: BookingId) -> Result<Booking, StoreError> {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        let booking = tables
            .by_id
            .get_mut(&booking_id)
            .ok_or_else(|| StoreError::NotFound(format!("booking {booking_id}")))?;

        if booking.status != BookingStatus::Confirmed {
            return Err(StoreError::StatusMismatch {
                id: booking_id.to_string(),
                expected: BookingStatus::Confirmed.as_str(),
                actual: booking.status.as_str(),
            });
        }

        booking.status = BookingStatus::Cancelled;
        let cancelled = booking.clone();
        tables
            .active
            .remove(&(cancelled.user_id, cancelled.event_id));
        Ok(cancelled)
    }

    fn restore_now(&self, booking_id: BookingId) -> Result<Booking, StoreError> {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        let booking = tables
            .by_id
            .get(&booking_id)
            .ok_or_else(|| StoreError::NotFound(format!("booking {booking_id}")))?;

        if booking.status != BookingStatus::Cancelled {
            return Err(StoreError::StatusMismatch {
                id: booking_id.to_string(),
                expected: BookingStatus::Cancelled.as_str(),
                actual: booking.status.as_str(),
            });
        }
        let pair = (booking.user_id, booking.event_id);
        if tables.active.contains_key(&pair) {
            return Err(StoreError::Duplicate(UniqueConstraint::ActiveBooking));
        }

        tables.active.insert(pair, booking_id);
        let booking = tables
            .by_id
            .get_mut(&booking_id)
            .ok_or_else(|| StoreError::NotFound(format!("booking {booking_id}")))?;
        booking.status = BookingStatus::Confirmed;
        Ok(booking.clone())
    }
}

impl BookingStore for InMemoryBookingStore {
    fn insert(&self, booking: Booking) -> StoreFuture<'_, ()> {
        Box::pin(ready(self.insert_now(booking)))
    }

    fn get(&self, booking_id: BookingId) -> StoreFuture<'_, Option<Booking>> {
        let booking = self
            .tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .get(&booking_id)
            .cloned();
        Box::pin(ready(Ok(booking)))
    }

    fn find_by_idempotency_key<'a>(
        &'a self,
        key: &'a IdempotencyKey,
    ) -> StoreFuture<'a, Option<Booking>> {
        Box::pin(ready(Ok(self.by_key_now(key))))
    }

    fn find_active(&self, user_id: UserId, event_id: EventId) -> StoreFuture<'_, Option<Booking>> {
        Box::pin(ready(Ok(self.active_now(user_id, event_id))))
    }

    fn cancel(&self, booking_id: BookingId) -> StoreFuture<'_, Booking> {
        Box::pin(ready(self.cancel_now(booking_id)))
    }

    fn restore(&self, booking_id: BookingId) -> StoreFuture<'_, Booking> {
        Box::pin(ready(self.restore_now(booking_id)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn booking(user_id: UserId, event_id: EventId, key: &str) -> Booking {
        Booking::confirmed(user_id, event_id, 1, IdempotencyKey::from(key), Utc::now())
    }

    #[tokio::test]
    async fn enforces_both_uniqueness_constraints() {
        let store = InMemoryBookingStore::new();
        let (user, event) = (UserId::new(), EventId::new());

        store.insert(booking(user, event, "k1")).await.unwrap();

        assert_eq!(
            store.insert(booking(UserId::new(), event, "k1")).await,
            Err(StoreError::Duplicate(UniqueConstraint::IdempotencyKey))
        );
        assert_eq!(
            store.insert(booking(user, event, "k2")).await,
            Err(StoreError::Duplicate(UniqueConstraint::ActiveBooking))
        );
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn cancel_frees_the_active_slot_once() {
        let store = InMemoryBookingStore::new();
        let (user, event) = (UserId::new(), EventId::new());
        let first = booking(user, event, "k1");
        store.insert(first.clone()).await.unwrap();

        let cancelled = store.cancel(first.booking_id).await.unwrap();
        assert_eq!(cancelled.status, BookingStatus::Cancelled);
        assert!(matches!(
            store.cancel(first.booking_id).await,
            Err(StoreError::StatusMismatch { .. })
        ));

        assert!(store.find_active(user, event).await.unwrap().is_none());
        store.insert(booking(user, event, "k2")).await.unwrap();
    }

    #[tokio::test]
    async fn restore_reopens_a_cancelled_booking() {
        let store = InMemoryBookingStore::new();
        let (user, event) = (UserId::new(), EventId::new());
        let first = booking(user, event, "k1");
        store.insert(first.clone()).await.unwrap();

        assert!(matches!(
            store.restore(first.booking_id).await,
            Err(StoreError::StatusMismatch { .. })
        ));

        store.cancel(first.booking_id).await.unwrap();
        let restored = store.restore(first.booking_id).await.unwrap();
        assert_eq!(restored.status, BookingStatus::Confirmed);
        assert_eq!(
            store.find_active(user, event).await.unwrap().map(|b| b.booking_id),
            Some(first.booking_id)
        );
    }

    #[tokio::test]
    async fn restore_respects_a_newer_active_booking() {
        let store = InMemoryBookingStore::new();
        let (user, event) = (UserId::new(), EventId::new());
        let first = booking(user, event, "k1");
        store.insert(first.clone()).await.unwrap();
        store.cancel(first.booking_id).await.unwrap();
        store.insert(booking(user, event, "k2")).await.unwrap();

        assert_eq!(
            store.restore(first.booking_id).await,
            Err(StoreError::Duplicate(UniqueConstraint::ActiveBooking))
        );
    }
}
