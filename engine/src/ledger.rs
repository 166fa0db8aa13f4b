//! Seat ledger: oversell-proof seat counters per event.
//!
//! **Concurrency strategy**: optimistic concurrency control. Every mutation
//! reads the record, computes the new `available`, and writes it back with a
//! compare-and-set on `version`. A stale version surfaces as
//! [`LedgerError::Conflict`]; the `*_with_retry` entry points absorb conflicts
//! with bounded, jittered backoff and give up with [`LedgerError::Exhausted`].
//!
//! Under N concurrent single-seat reserves against capacity C, exactly
//! `min(C, N)` succeed and the rest see [`LedgerError::Insufficient`].

use crate::error::LedgerError;
use boxoffice_core::error::{StoreError, UniqueConstraint};
use boxoffice_core::store::{CasOutcome, InventoryStore};
use boxoffice_core::types::{EventId, EventInventory};
use boxoffice_runtime::{RetryPolicy, retry_with_predicate};
use chrono::{DateTime, Utc};
use metrics::counter;
use std::sync::Arc;
use tracing::{debug, error};

/// Atomic reserve/release over an [`InventoryStore`].
#[derive(Clone)]
pub struct SeatLedger {
    store: Arc<dyn InventoryStore>,
    retry: RetryPolicy,
}

impl SeatLedger {
    /// Create a ledger over `store`, retrying conflicts per `retry`.
    #[must_use]
    pub fn new(store: Arc<dyn InventoryStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Retry policy applied by the `*_with_retry` methods.
    #[must_use]
    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Create the inventory record for an event with every seat available.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Store`] with [`StoreError::Duplicate`] if the
    /// event is already registered.
    pub async fn register(
        &self,
        event_id: EventId,
        capacity: u32,
        starts_at: DateTime<Utc>,
    ) -> Result<EventInventory, LedgerError> {
        let inventory = EventInventory::new(event_id, capacity, starts_at);
        self.store.insert(inventory.clone()).await?;
        tracing::info!(event_id = %event_id, capacity, starts_at = %starts_at, "Event registered");
        Ok(inventory)
    }

    /// Current counters for an event.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] if the event is not registered.
    pub async fn inventory(&self, event_id: EventId) -> Result<EventInventory, LedgerError> {
        self.store
            .load(event_id)
            .await?
            .ok_or(LedgerError::NotFound(event_id))
    }

    /// Take `quantity` seats with a single compare-and-set.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::Insufficient`]: fewer than `quantity` seats remain
    /// - [`LedgerError::Conflict`]: the version moved between read and write
    /// - [`LedgerError::NotFound`]: unknown event
    pub async fn reserve(
        &self,
        event_id: EventId,
        quantity: u32,
    ) -> Result<EventInventory, LedgerError> {
        let current = self.inventory(event_id).await?;

        if current.available < quantity {
            counter!("ledger_reserve_total", "outcome" => "insufficient").increment(1);
            debug!(
                event_id = %event_id,
                requested = quantity,
                available = current.available,
                "Insufficient seats"
            );
            return Err(LedgerError::Insufficient {
                event_id,
                requested: quantity,
                available: current.available,
            });
        }

        match self
            .store
            .compare_and_set(event_id, current.version, current.available - quantity)
            .await?
        {
            CasOutcome::Applied(updated) => {
                counter!("ledger_reserve_total", "outcome" => "ok").increment(1);
                counter!("ledger_seats_reserved_total").increment(u64::from(quantity));
                debug!(
                    event_id = %event_id,
                    quantity,
                    available = updated.available,
                    version = updated.version,
                    "Seats reserved"
                );
                Ok(updated)
            },
            CasOutcome::Stale(_) => {
                counter!("ledger_reserve_total", "outcome" => "conflict").increment(1);
                Err(LedgerError::Conflict { event_id })
            },
        }
    }

    /// Return `quantity` seats with a single compare-and-set.
    ///
    /// A release that would push `available` above `capacity` is never
    /// applied: it means a booking was double-released or counters are
    /// corrupt.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::CapacityExceeded`]: the release would exceed capacity
    /// - [`LedgerError::Conflict`]: the version moved between read and write
    /// - [`LedgerError::NotFound`]: unknown event
    pub async fn release(
        &self,
        event_id: EventId,
        quantity: u32,
    ) -> Result<EventInventory, LedgerError> {
        let current = self.inventory(event_id).await?;

        let restored = current
            .available
            .checked_add(quantity)
            .filter(|restored| *restored <= current.capacity);
        let Some(restored) = restored else {
            counter!("ledger_invariant_violations_total").increment(1);
            error!(
                event_id = %event_id,
                capacity = current.capacity,
                available = current.available,
                released = quantity,
                "Release would exceed capacity, refusing"
            );
            return Err(LedgerError::CapacityExceeded {
                event_id,
                capacity: current.capacity,
                available: current.available,
                released: quantity,
            });
        };

        match self
            .store
            .compare_and_set(event_id, current.version, restored)
            .await?
        {
            CasOutcome::Applied(updated) => {
                counter!("ledger_seats_released_total").increment(u64::from(quantity));
                debug!(
                    event_id = %event_id,
                    quantity,
                    available = updated.available,
                    version = updated.version,
                    "Seats released"
                );
                Ok(updated)
            },
            CasOutcome::Stale(_) => Err(LedgerError::Conflict { event_id }),
        }
    }

    /// [`reserve`](Self::reserve), retrying version conflicts.
    ///
    /// # Errors
    ///
    /// As [`reserve`](Self::reserve), except that a conflict on the final
    /// attempt becomes [`LedgerError::Exhausted`].
    pub async fn reserve_with_retry(
        &self,
        event_id: EventId,
        quantity: u32,
    ) -> Result<EventInventory, LedgerError> {
        let result = retry_with_predicate(
            &self.retry,
            || self.reserve(event_id, quantity),
            is_conflict,
        )
        .await;
        self.exhausted_on_conflict(result)
    }

    /// [`release`](Self::release), retrying version conflicts.
    ///
    /// # Errors
    ///
    /// As [`release`](Self::release), except that a conflict on the final
    /// attempt becomes [`LedgerError::Exhausted`].
    pub async fn release_with_retry(
        &self,
        event_id: EventId,
        quantity: u32,
    ) -> Result<EventInventory, LedgerError> {
        let result = retry_with_predicate(
            &self.retry,
            || self.release(event_id, quantity),
            is_conflict,
        )
        .await;
        self.exhausted_on_conflict(result)
    }

    /// Register an event unless it already exists; returns the current record.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Store`] on storage failure.
    pub async fn ensure_registered(
        &self,
        event_id: EventId,
        capacity: u32,
        starts_at: DateTime<Utc>,
    ) -> Result<EventInventory, LedgerError> {
        match self.register(event_id, capacity, starts_at).await {
            Ok(inventory) => Ok(inventory),
            Err(LedgerError::Store(StoreError::Duplicate(UniqueConstraint::EventInventory))) => {
                self.inventory(event_id).await
            },
            Err(e) => Err(e),
        }
    }

    fn exhausted_on_conflict(
        &self,
        result: Result<EventInventory, LedgerError>,
    ) -> Result<EventInventory, LedgerError> {
        result.map_err(|e| match e {
            LedgerError::Conflict { event_id } => {
                error!(
                    event_id = %event_id,
                    attempts = self.retry.max_attempts(),
                    "Ledger contention outlasted retry limit"
                );
                LedgerError::Exhausted {
                    event_id,
                    attempts: self.retry.max_attempts(),
                }
            },
            other => other,
        })
    }
}

fn is_conflict(err: &LedgerError) -> bool {
    matches!(err, LedgerError::Conflict { .. })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::memory::InMemoryInventoryStore;
    use boxoffice_testing::StaleInventoryStore;
    use std::time::Duration;

    fn fast_retry(attempts: usize) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(attempts)
            .initial_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(2))
            .build()
    }

    async fn ledger_with(capacity: u32) -> (SeatLedger, EventId) {
        let ledger = SeatLedger::new(
            Arc::new(InMemoryInventoryStore::new()),
            fast_retry(5),
        );
        let event_id = EventId::new();
        ledger
            .register(event_id, capacity, Utc::now() + chrono::Duration::days(1))
            .await
            .unwrap();
        (ledger, event_id)
    }

    #[tokio::test]
    async fn reserve_decrements_and_bumps_version() {
        let (ledger, event_id) = ledger_with(3).await;

        let after = ledger.reserve(event_id, 2).await.unwrap();
        assert_eq!(after.available, 1);
        assert_eq!(after.version, 1);

        let err = ledger.reserve(event_id, 2).await.unwrap_err();
        assert_eq!(err, LedgerError::Insufficient {
            event_id,
            requested: 2,
            available: 1
        });
    }

    #[tokio::test]
    async fn release_above_capacity_is_refused_and_not_applied() {
        let (ledger, event_id) = ledger_with(2).await;
        ledger.reserve(event_id, 1).await.unwrap();

        let err = ledger.release(event_id, 2).await.unwrap_err();
        assert!(matches!(err, LedgerError::CapacityExceeded { .. }));

        let inventory = ledger.inventory(event_id).await.unwrap();
        assert_eq!(inventory.available, 1);
        assert_eq!(inventory.version, 1);
    }

    #[tokio::test]
    async fn unknown_event_is_not_found() {
        let (ledger, _) = ledger_with(1).await;
        let missing = EventId::new();
        assert_eq!(
            ledger.reserve(missing, 1).await.unwrap_err(),
            LedgerError::NotFound(missing)
        );
        assert_eq!(
            ledger.release(missing, 1).await.unwrap_err(),
            LedgerError::NotFound(missing)
        );
    }

    #[tokio::test]
    async fn persistent_conflicts_exhaust_after_bounded_attempts() {
        let inner: Arc<dyn InventoryStore> = Arc::new(InMemoryInventoryStore::new());
        let event_id = EventId::new();
        inner
            .insert(EventInventory::new(event_id, 10, Utc::now()))
            .await
            .unwrap();
        let stale = Arc::new(StaleInventoryStore::new(inner));
        let ledger = SeatLedger::new(stale.clone(), fast_retry(5));

        let err = ledger.reserve_with_retry(event_id, 1).await.unwrap_err();
        assert_eq!(err, LedgerError::Exhausted {
            event_id,
            attempts: 5
        });
        assert_eq!(stale.attempts(), 5);
    }

    #[tokio::test]
    async fn insufficient_is_not_retried() {
        let inner: Arc<dyn InventoryStore> = Arc::new(InMemoryInventoryStore::new());
        let event_id = EventId::new();
        inner
            .insert(EventInventory::new(event_id, 0, Utc::now()))
            .await
            .unwrap();
        let stale = Arc::new(StaleInventoryStore::new(inner));
        let ledger = SeatLedger::new(stale.clone(), fast_retry(5));

        let err = ledger.reserve_with_retry(event_id, 1).await.unwrap_err();
        assert!(matches!(err, LedgerError::Insufficient { .. }));
        assert_eq!(stale.attempts(), 0);
    }

    #[tokio::test]
    async fn ensure_registered_is_idempotent() {
        let (ledger, event_id) = ledger_with(4).await;
        ledger.reserve(event_id, 1).await.unwrap();

        let existing = ledger
            .ensure_registered(event_id, 99, Utc::now())
            .await
            .unwrap();
        assert_eq!(existing.capacity, 4);
        assert_eq!(existing.available, 3);
    }
}
