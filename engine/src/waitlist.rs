//! Waitlist queue: fair FIFO admission for sold-out events.
//!
//! Positions of `WAITING` entries are a dense `1..=N` sequence per event.
//! Position assignment and gap closing happen inside single
//! [`WaitlistStore`] operations, so concurrent joins and leaves on the same
//! event can never hand out the same position twice.

use crate::error::{LedgerError, WaitlistError};
use crate::ledger::SeatLedger;
use boxoffice_core::environment::Clock;
use boxoffice_core::error::StoreError;
use boxoffice_core::store::{Enqueued, WaitlistStore};
use boxoffice_core::types::{EventId, UserId, WaitlistEntry, WaitlistId, WaitlistStatus};
use metrics::counter;
use std::sync::Arc;
use tracing::{debug, info};

/// Admission, lookup and removal of waitlist entries.
#[derive(Clone)]
pub struct WaitlistQueue {
    store: Arc<dyn WaitlistStore>,
    ledger: SeatLedger,
    clock: Arc<dyn Clock>,
    max_length: u32,
}

impl WaitlistQueue {
    /// Create a queue admitting at most `max_length` waiting entries per event.
    #[must_use]
    pub fn new(
        store: Arc<dyn WaitlistStore>,
        ledger: SeatLedger,
        clock: Arc<dyn Clock>,
        max_length: u32,
    ) -> Self {
        Self {
            store,
            ledger,
            clock,
            max_length,
        }
    }

    /// Put the user at the tail of the event's queue.
    ///
    /// # Errors
    ///
    /// - [`WaitlistError::SeatsAvailable`]: book directly instead
    /// - [`WaitlistError::EventStarted`]: too late to wait
    /// - [`WaitlistError::AlreadyWaiting`]: carries the existing entry with its live position
    /// - [`WaitlistError::QueueFull`]: the ceiling is reached
    /// - [`WaitlistError::EventNotFound`]: unknown event
    pub async fn join(
        &self,
        user_id: UserId,
        event_id: EventId,
    ) -> Result<WaitlistEntry, WaitlistError> {
        let now = self.clock.now();
        let inventory = self
            .ledger
            .inventory(event_id)
            .await
            .map_err(|e| match e {
                LedgerError::NotFound(_) => WaitlistError::EventNotFound(event_id),
                LedgerError::Store(e) => WaitlistError::from(e),
                other => WaitlistError::Invariant(other.to_string()),
            })?;

        if inventory.has_started(now) {
            return Err(WaitlistError::EventStarted(event_id));
        }
        if inventory.available > 0 {
            return Err(WaitlistError::SeatsAvailable {
                event_id,
                available: inventory.available,
            });
        }

        match self
            .store
            .enqueue(user_id, event_id, now, self.max_length)
            .await?
        {
            Enqueued::Created(entry) => {
                counter!("waitlist_joined_total").increment(1);
                info!(
                    waitlist_id = %entry.waitlist_id,
                    user_id = %user_id,
                    event_id = %event_id,
                    position = entry.position,
                    "Joined waitlist"
                );
                Ok(entry)
            },
            Enqueued::Existing(entry) => {
                debug!(
                    waitlist_id = %entry.waitlist_id,
                    status = %entry.status,
                    position = entry.position,
                    "User already on waitlist"
                );
                Err(WaitlistError::AlreadyWaiting {
                    entry: Box::new(entry),
                })
            },
            Enqueued::Full => {
                debug!(event_id = %event_id, max = self.max_length, "Waitlist full");
                Err(WaitlistError::QueueFull {
                    event_id,
                    max: self.max_length,
                })
            },
        }
    }

    /// Remove a `WAITING` entry and close the gap behind it.
    ///
    /// # Errors
    ///
    /// Returns [`WaitlistError::NotFound`] or [`WaitlistError::NotWaiting`].
    pub async fn leave(&self, waitlist_id: WaitlistId) -> Result<WaitlistEntry, WaitlistError> {
        let removed = self
            .store
            .remove_waiting(waitlist_id)
            .await
            .map_err(|e| entry_error(waitlist_id, e))?;

        counter!("waitlist_left_total").increment(1);
        info!(
            waitlist_id = %waitlist_id,
            event_id = %removed.event_id,
            position = removed.position,
            "Left waitlist"
        );
        Ok(removed)
    }

    /// Live rank of a `WAITING` entry, recomputed on every call.
    ///
    /// # Errors
    ///
    /// Returns [`WaitlistError::NotFound`], or [`WaitlistError::NotWaiting`]
    /// once the entry has been notified or terminated.
    pub async fn get_position(&self, waitlist_id: WaitlistId) -> Result<u32, WaitlistError> {
        match self
            .store
            .live_position(waitlist_id)
            .await
            .map_err(|e| entry_error(waitlist_id, e))?
        {
            Some(position) => Ok(position),
            None => {
                let entry = self.get_entry(waitlist_id).await?;
                Err(WaitlistError::NotWaiting {
                    waitlist_id,
                    status: entry.status,
                })
            },
        }
    }

    /// Load an entry.
    ///
    /// # Errors
    ///
    /// Returns [`WaitlistError::NotFound`] if no such entry exists.
    pub async fn get_entry(&self, waitlist_id: WaitlistId) -> Result<WaitlistEntry, WaitlistError> {
        self.store
            .get(waitlist_id)
            .await?
            .ok_or(WaitlistError::NotFound(waitlist_id))
    }

    /// `WAITING` entries for an event, head first.
    ///
    /// # Errors
    ///
    /// Returns [`WaitlistError::Store`] on storage failure.
    pub async fn list_for_event(
        &self,
        event_id: EventId,
    ) -> Result<Vec<WaitlistEntry>, WaitlistError> {
        Ok(self.store.waiting(event_id).await?)
    }

    /// Every entry of a user across events, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`WaitlistError::Store`] on storage failure.
    pub async fn list_for_user(&self, user_id: UserId) -> Result<Vec<WaitlistEntry>, WaitlistError> {
        Ok(self.store.for_user(user_id).await?)
    }

    /// The lowest-position `WAITING` entry, if any.
    ///
    /// # Errors
    ///
    /// Returns [`WaitlistError::Store`] on storage failure.
    pub async fn next_in_line(
        &self,
        event_id: EventId,
    ) -> Result<Option<WaitlistEntry>, WaitlistError> {
        Ok(self.store.head(event_id).await?)
    }

    /// The user's `WAITING` or `NOTIFIED` entry for an event.
    ///
    /// # Errors
    ///
    /// Returns [`WaitlistError::Store`] on storage failure.
    pub async fn active_entry(
        &self,
        user_id: UserId,
        event_id: EventId,
    ) -> Result<Option<WaitlistEntry>, WaitlistError> {
        Ok(self.store.find_active(user_id, event_id).await?)
    }
}

/// Map a storage error on a single entry to the waitlist vocabulary.
pub(crate) fn entry_error(waitlist_id: WaitlistId, err: StoreError) -> WaitlistError {
    match err {
        StoreError::NotFound(_) => WaitlistError::NotFound(waitlist_id),
        StoreError::StatusMismatch { actual, .. } => match WaitlistStatus::parse(actual) {
            Some(status) => WaitlistError::NotWaiting {
                waitlist_id,
                status,
            },
            None => WaitlistError::Invariant(format!(
                "waitlist entry {waitlist_id} has unknown status {actual}"
            )),
        },
        other => WaitlistError::from(other),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryInventoryStore, InMemoryWaitlistStore};
    use boxoffice_runtime::RetryPolicy;
    use boxoffice_testing::{ManualClock, test_clock};
    use chrono::Duration;

    struct Fixture {
        queue: WaitlistQueue,
        ledger: SeatLedger,
        clock: ManualClock,
        event_id: EventId,
    }

    async fn sold_out_event(max_length: u32) -> Fixture {
        let clock = ManualClock::new(test_clock().now());
        let ledger = SeatLedger::new(
            Arc::new(InMemoryInventoryStore::new()),
            RetryPolicy::default(),
        );
        let event_id = EventId::new();
        ledger
            .register(event_id, 1, clock.now() + Duration::days(7))
            .await
            .unwrap();
        ledger.reserve(event_id, 1).await.unwrap();

        let queue = WaitlistQueue::new(
            Arc::new(InMemoryWaitlistStore::new()),
            ledger.clone(),
            Arc::new(clock.clone()),
            max_length,
        );
        Fixture {
            queue,
            ledger,
            clock,
            event_id,
        }
    }

    #[tokio::test]
    async fn join_assigns_increasing_positions() {
        let f = sold_out_event(100).await;

        let a = f.queue.join(UserId::new(), f.event_id).await.unwrap();
        let b = f.queue.join(UserId::new(), f.event_id).await.unwrap();

        assert_eq!((a.position, b.position), (1, 2));
        assert_eq!(a.status, WaitlistStatus::Waiting);
        assert_eq!(
            f.queue.next_in_line(f.event_id).await.unwrap().unwrap().waitlist_id,
            a.waitlist_id
        );
    }

    #[tokio::test]
    async fn join_rejected_while_seats_remain() {
        let f = sold_out_event(100).await;
        f.ledger.release(f.event_id, 1).await.unwrap();

        let err = f.queue.join(UserId::new(), f.event_id).await.unwrap_err();
        assert_eq!(err, WaitlistError::SeatsAvailable {
            event_id: f.event_id,
            available: 1
        });
    }

    #[tokio::test]
    async fn join_rejected_after_event_start() {
        let f = sold_out_event(100).await;
        f.clock.advance(Duration::days(8));

        let err = f.queue.join(UserId::new(), f.event_id).await.unwrap_err();
        assert_eq!(err, WaitlistError::EventStarted(f.event_id));
    }

    #[tokio::test]
    async fn join_unknown_event() {
        let f = sold_out_event(100).await;
        let missing = EventId::new();
        assert_eq!(
            f.queue.join(UserId::new(), missing).await.unwrap_err(),
            WaitlistError::EventNotFound(missing)
        );
    }

    #[tokio::test]
    async fn second_join_reports_live_position() {
        let f = sold_out_event(100).await;
        let first = f.queue.join(UserId::new(), f.event_id).await.unwrap();
        let user = UserId::new();
        let mine = f.queue.join(user, f.event_id).await.unwrap();

        f.queue.leave(first.waitlist_id).await.unwrap();

        match f.queue.join(user, f.event_id).await.unwrap_err() {
            WaitlistError::AlreadyWaiting { entry } => {
                assert_eq!(entry.waitlist_id, mine.waitlist_id);
                assert_eq!(entry.position, 1);
            },
            other => panic!("expected AlreadyWaiting, got {other:?}"),
        }
        assert_eq!(f.queue.get_position(mine.waitlist_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn queue_full_at_ceiling() {
        let f = sold_out_event(2).await;
        f.queue.join(UserId::new(), f.event_id).await.unwrap();
        f.queue.join(UserId::new(), f.event_id).await.unwrap();

        assert_eq!(
            f.queue.join(UserId::new(), f.event_id).await.unwrap_err(),
            WaitlistError::QueueFull {
                event_id: f.event_id,
                max: 2
            }
        );
    }

    #[tokio::test]
    async fn leave_twice_is_not_found() {
        let f = sold_out_event(100).await;
        let entry = f.queue.join(UserId::new(), f.event_id).await.unwrap();

        f.queue.leave(entry.waitlist_id).await.unwrap();
        assert_eq!(
            f.queue.leave(entry.waitlist_id).await.unwrap_err(),
            WaitlistError::NotFound(entry.waitlist_id)
        );
    }

    #[tokio::test]
    async fn list_for_user_spans_events() {
        let f = sold_out_event(100).await;
        let user = UserId::new();
        f.queue.join(user, f.event_id).await.unwrap();

        let entries = f.queue.list_for_user(user).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(f.queue.list_for_event(f.event_id).await.unwrap().len(), 1);
    }
}
