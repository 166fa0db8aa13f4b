//! Seats-freed consumer side.
//!
//! The bus delivers at least once, so the handler remembers the message ids
//! it has already processed and drops redeliveries. The window is bounded:
//! the oldest ids are forgotten first.
//!
//! Seats are advanced one at a time with retry. If a message fails part way,
//! the seats still owed are kept under its id and a redelivery advances only
//! those.

use crate::coordinator::NotificationCoordinator;
use async_trait::async_trait;
use boxoffice_core::event::{Event, SeatsFreed, SerializedEvent};
use boxoffice_runtime::{EventHandler, RetryPolicy};
use metrics::counter;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default number of message ids remembered for duplicate suppression.
pub const DEFAULT_DEDUPE_WINDOW: usize = 10_000;

#[derive(Default)]
struct SeenIds {
    order: VecDeque<Uuid>,
    ids: HashSet<Uuid>,
}

impl SeenIds {
    fn contains(&self, id: &Uuid) -> bool {
        self.ids.contains(id)
    }

    fn remember(&mut self, id: Uuid, capacity: usize) {
        if !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

/// Feeds [`SeatsFreed`] events into the [`NotificationCoordinator`].
pub struct SeatsFreedHandler {
    coordinator: NotificationCoordinator,
    seen: Mutex<SeenIds>,
    window: usize,
    retry: RetryPolicy,
    // Seats still owed by messages that failed part way.
    owed: Mutex<HashMap<Uuid, u32>>,
}

impl SeatsFreedHandler {
    /// Create a handler remembering [`DEFAULT_DEDUPE_WINDOW`] message ids.
    #[must_use]
    pub fn new(coordinator: NotificationCoordinator) -> Self {
        Self::with_window(coordinator, DEFAULT_DEDUPE_WINDOW)
    }

    /// Create a handler remembering `window` message ids.
    #[must_use]
    pub fn with_window(coordinator: NotificationCoordinator, window: usize) -> Self {
        Self {
            coordinator,
            seen: Mutex::new(SeenIds::default()),
            window: window.max(1),
            retry: RetryPolicy::default(),
            owed: Mutex::new(HashMap::new()),
        }
    }

    /// Retry each promotion under `policy` before failing the message.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    fn already_seen(&self, id: &Uuid) -> bool {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    fn remember(&self, id: Uuid) {
        self.owed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remember(id, self.window);
    }

    fn seats_owed(&self, id: Uuid, quantity: u32) -> u32 {
        self.owed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .copied()
            .unwrap_or(quantity)
    }

    fn record_owed(&self, id: Uuid, remaining: u32) {
        let mut owed = self.owed.lock().unwrap_or_else(PoisonError::into_inner);
        owed.insert(id, remaining);
        if owed.len() > self.window {
            warn!(pending = owed.len(), "Many seats-freed events are partially processed");
        }
    }
}

#[async_trait]
impl EventHandler for SeatsFreedHandler {
    async fn handle(
        &self,
        event: &SerializedEvent,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if event.event_type != SeatsFreed::EVENT_TYPE {
            debug!(event_type = %event.event_type, "Ignoring unrelated event");
            return Ok(());
        }
        if self.already_seen(&event.message_id) {
            counter!("event_bus_duplicates_dropped_total").increment(1);
            debug!(message_id = %event.message_id, "Dropping redelivered seats-freed event");
            return Ok(());
        }

        let freed = SeatsFreed::from_bytes(&event.data)?;
        let mut remaining = self.seats_owed(event.message_id, freed.quantity);
        let mut notified = 0_u32;

        while remaining > 0 {
            match self.coordinator.notify_next(freed.event_id, &self.retry).await {
                Ok(Some(_)) => {
                    notified += 1;
                    remaining -= 1;
                },
                Ok(None) => break,
                Err(e) => {
                    self.record_owed(event.message_id, remaining);
                    warn!(
                        message_id = %event.message_id,
                        event_id = %freed.event_id,
                        notified,
                        remaining,
                        error = %e,
                        "Seats-freed event partially processed"
                    );
                    return Err(e.into());
                },
            }
        }

        self.remember(event.message_id);
        info!(
            message_id = %event.message_id,
            event_id = %freed.event_id,
            quantity = freed.quantity,
            notified,
            "Processed seats-freed event"
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ledger::SeatLedger;
    use crate::memory::{InMemoryInventoryStore, InMemoryWaitlistStore};
    use boxoffice_core::environment::Clock;
    use boxoffice_core::store::WaitlistStore;
    use boxoffice_core::types::{EventId, UserId};
    use boxoffice_runtime::RetryPolicy;
    use boxoffice_core::types::WaitlistStatus;
    use boxoffice_testing::{FlakyWaitlistStore, RecordingNotifier, test_clock};
    use std::sync::Arc;
    use std::time::Duration;

    struct Flaky {
        handler: SeatsFreedHandler,
        notifier: RecordingNotifier,
        store: Arc<FlakyWaitlistStore>,
        event_id: EventId,
    }

    async fn flaky_handler(waiting: usize) -> Flaky {
        let clock = test_clock();
        let ledger = SeatLedger::new(
            Arc::new(InMemoryInventoryStore::new()),
            RetryPolicy::default(),
        );
        let event_id = EventId::new();
        ledger
            .register(event_id, 10, clock.now() + chrono::Duration::days(1))
            .await
            .unwrap();

        let inner = Arc::new(InMemoryWaitlistStore::new());
        for _ in 0..waiting {
            inner
                .enqueue(UserId::new(), event_id, clock.now(), 100)
                .await
                .unwrap();
        }
        let store = Arc::new(FlakyWaitlistStore::new(inner));

        let notifier = RecordingNotifier::new();
        let coordinator = NotificationCoordinator::new(
            store.clone(),
            ledger,
            Arc::new(notifier.clone()),
            Arc::new(clock),
            chrono::Duration::minutes(10),
            "https://tickets.test/events",
        );
        let policy = RetryPolicy::builder()
            .max_attempts(3)
            .initial_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(2))
            .build();
        Flaky {
            handler: SeatsFreedHandler::new(coordinator).with_retry_policy(policy),
            notifier,
            store,
            event_id,
        }
    }

    async fn handler_with_queue(
        waiting: usize,
        window: usize,
    ) -> (SeatsFreedHandler, RecordingNotifier, EventId) {
        let clock = test_clock();
        let ledger = SeatLedger::new(
            Arc::new(InMemoryInventoryStore::new()),
            RetryPolicy::default(),
        );
        let event_id = EventId::new();
        ledger
            .register(event_id, 10, clock.now() + chrono::Duration::days(1))
            .await
            .unwrap();

        let store = Arc::new(InMemoryWaitlistStore::new());
        for _ in 0..waiting {
            store
                .enqueue(UserId::new(), event_id, clock.now(), 100)
                .await
                .unwrap();
        }

        let notifier = RecordingNotifier::new();
        let coordinator = NotificationCoordinator::new(
            store,
            ledger,
            Arc::new(notifier.clone()),
            Arc::new(clock),
            chrono::Duration::minutes(10),
            "https://tickets.test/events",
        );
        (
            SeatsFreedHandler::with_window(coordinator, window),
            notifier,
            event_id,
        )
    }

    fn envelope(event_id: EventId, quantity: u32) -> SerializedEvent {
        SerializedEvent::from_event(&SeatsFreed::new(event_id, quantity, test_clock().now()), None)
            .unwrap()
    }

    #[tokio::test]
    async fn redelivery_is_dropped() {
        let (handler, notifier, event_id) = handler_with_queue(3, 16).await;
        let event = envelope(event_id, 1);

        handler.handle(&event).await.unwrap();
        handler.handle(&event).await.unwrap();

        assert_eq!(notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn window_forgets_oldest_ids() {
        let (handler, notifier, event_id) = handler_with_queue(3, 1).await;
        let first = envelope(event_id, 1);
        let second = envelope(event_id, 1);

        handler.handle(&first).await.unwrap();
        handler.handle(&second).await.unwrap();
        handler.handle(&first).await.unwrap();

        assert_eq!(notifier.sent().len(), 3);
    }

    #[tokio::test]
    async fn unrelated_and_corrupt_events() {
        let (handler, notifier, _) = handler_with_queue(1, 16).await;

        let other = SerializedEvent::new("Other.v1".into(), "k".into(), vec![1], None);
        handler.handle(&other).await.unwrap();

        let corrupt = SerializedEvent::new("SeatsFreed.v1".into(), "k".into(), vec![0xff], None);
        assert!(handler.handle(&corrupt).await.is_err());

        assert!(notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn transient_store_failure_is_retried() {
        let f = flaky_handler(1).await;
        f.store.fail_next(1);

        f.handler.handle(&envelope(f.event_id, 1)).await.unwrap();

        assert_eq!(f.store.failures(), 1);
        assert_eq!(f.notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn redelivery_after_partial_failure_notifies_only_the_rest() {
        let f = flaky_handler(4).await;
        let event = envelope(f.event_id, 3);

        // The first seat goes through, then every attempt on the second fails.
        f.store.fail_after(1, 3);
        assert!(f.handler.handle(&event).await.is_err());
        assert_eq!(f.notifier.sent().len(), 1);

        f.handler.handle(&event).await.unwrap();
        assert_eq!(f.notifier.sent().len(), 3);

        let left = f.store.waiting(f.event_id).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].status, WaitlistStatus::Waiting);

        // Fully processed now, so a further copy is a duplicate.
        f.handler.handle(&event).await.unwrap();
        assert_eq!(f.notifier.sent().len(), 3);
    }
}
