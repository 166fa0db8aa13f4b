//! Expiry sweeper: periodic reconciliation of lapsed booking windows.
//!
//! Each pass expires every `NOTIFIED` entry whose window closed and asks the
//! coordinator to notify one more candidate for that entry's event. Entries
//! converted or expired by someone else between the scan and the transition
//! are skipped, so overlapping passes never advance an entry twice.
//!
//! An advancement that still fails after retry is owed to its event and
//! attempted again at the start of the next pass.

use crate::coordinator::NotificationCoordinator;
use crate::error::WaitlistError;
use boxoffice_core::environment::Clock;
use boxoffice_core::store::WaitlistStore;
use boxoffice_core::types::EventId;
use boxoffice_runtime::RetryPolicy;
use metrics::{gauge, histogram};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Drives `NOTIFIED → EXPIRED` and the cascade to the next entry.
#[derive(Clone)]
pub struct Sweeper {
    store: Arc<dyn WaitlistStore>,
    coordinator: NotificationCoordinator,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    owed: Arc<Mutex<HashMap<EventId, u32>>>,
}

impl Sweeper {
    /// Create a sweeper.
    #[must_use]
    pub fn new(
        store: Arc<dyn WaitlistStore>,
        coordinator: NotificationCoordinator,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            coordinator,
            clock,
            retry: RetryPolicy::default(),
            owed: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Retry each advancement under `policy` before owing it to the next pass.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Advancements owed to `event_id` from earlier failed passes.
    #[must_use]
    pub fn owed(&self, event_id: EventId) -> u32 {
        self.owed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event_id)
            .copied()
            .unwrap_or(0)
    }

    /// Run one pass; returns how many entries were expired.
    ///
    /// Every expired entry triggers exactly one seats-freed advancement of
    /// quantity 1 on its event. Advancements owed by earlier passes run first.
    ///
    /// # Errors
    ///
    /// Returns [`WaitlistError`] if the overdue scan fails or an entry
    /// cannot be transitioned for a reason other than a concurrent change.
    pub async fn sweep(&self) -> Result<usize, WaitlistError> {
        let started = Instant::now();
        let now = self.clock.now();
        self.settle_owed().await;
        let overdue = self.store.overdue(now).await?;

        let mut advanced = 0;
        for entry in overdue {
            match self.coordinator.expire(entry.waitlist_id).await {
                Ok(_) => {},
                Err(WaitlistError::InvalidTransition { from, .. }) => {
                    debug!(
                        waitlist_id = %entry.waitlist_id,
                        status = %from,
                        "Entry settled since scan, skipping"
                    );
                    continue;
                },
                Err(e) => return Err(e),
            }
            advanced += 1;
            self.advance(entry.event_id, 1).await;
        }

        histogram!("sweep_duration_seconds").record(started.elapsed().as_secs_f64());
        gauge!("sweep_last_advanced").set(u32::try_from(advanced).unwrap_or(u32::MAX));
        if advanced > 0 {
            info!(advanced, "Expiry sweep advanced entries");
        } else {
            debug!("Expiry sweep found nothing to do");
        }
        Ok(advanced)
    }

    async fn settle_owed(&self) {
        let owed: Vec<_> = self
            .owed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (event_id, seats) in owed {
            debug!(event_id = %event_id, seats, "Retrying owed waitlist advancement");
            self.advance(event_id, seats).await;
        }
    }

    /// Notify up to `seats` entries; whatever is left after retry is owed.
    async fn advance(&self, event_id: EventId, seats: u32) {
        let mut remaining = seats;
        while remaining > 0 {
            match self.coordinator.notify_next(event_id, &self.retry).await {
                Ok(Some(_)) => remaining -= 1,
                Ok(None) => return,
                Err(e) => {
                    let mut owed = self.owed.lock().unwrap_or_else(PoisonError::into_inner);
                    *owed.entry(event_id).or_insert(0) += remaining;
                    gauge!("sweep_owed_events").set(u32::try_from(owed.len()).unwrap_or(u32::MAX));
                    error!(
                        event_id = %event_id,
                        owed = remaining,
                        error = %e,
                        "Could not advance waitlist after expiry, will retry next pass"
                    );
                    return;
                },
            }
        }
    }

    /// Run [`sweep`](Self::sweep) every `interval` until a shutdown signal.
    ///
    /// A failed pass is logged and the next tick runs normally.
    #[must_use]
    pub fn spawn(
        self,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_secs = interval.as_secs(), "Expiry sweeper started");

            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            error!(error = %e, "Expiry sweep failed");
                        }
                    }
                }
            }

            info!("Expiry sweeper stopped");
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::ledger::SeatLedger;
    use crate::memory::{InMemoryInventoryStore, InMemoryWaitlistStore};
    use boxoffice_core::store::Enqueued;
    use boxoffice_core::types::{EventId, UserId, WaitlistId, WaitlistStatus};
    use boxoffice_runtime::RetryPolicy;
    use boxoffice_testing::{FlakyWaitlistStore, ManualClock, RecordingNotifier, test_clock};

    struct Fixture {
        sweeper: Sweeper,
        coordinator: NotificationCoordinator,
        store: Arc<InMemoryWaitlistStore>,
        flaky: Arc<FlakyWaitlistStore>,
        notifier: RecordingNotifier,
        clock: ManualClock,
        event_id: EventId,
    }

    async fn fixture() -> Fixture {
        let clock = ManualClock::new(test_clock().now());
        let ledger = SeatLedger::new(
            Arc::new(InMemoryInventoryStore::new()),
            RetryPolicy::default(),
        );
        let event_id = EventId::new();
        ledger
            .register(event_id, 1, clock.now() + chrono::Duration::days(1))
            .await
            .unwrap();

        let store = Arc::new(InMemoryWaitlistStore::new());
        let flaky = Arc::new(FlakyWaitlistStore::new(store.clone()));
        let notifier = RecordingNotifier::new();
        let coordinator = NotificationCoordinator::new(
            flaky.clone(),
            ledger,
            Arc::new(notifier.clone()),
            Arc::new(clock.clone()),
            chrono::Duration::minutes(10),
            "https://tickets.test/events",
        );
        let policy = RetryPolicy::builder()
            .max_attempts(2)
            .initial_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(2))
            .build();
        let sweeper = Sweeper::new(flaky.clone(), coordinator.clone(), Arc::new(clock.clone()))
            .with_retry_policy(policy);
        Fixture {
            sweeper,
            coordinator,
            store,
            flaky,
            notifier,
            clock,
            event_id,
        }
    }

    async fn join(f: &Fixture) -> WaitlistId {
        match f
            .store
            .enqueue(UserId::new(), f.event_id, f.clock.now(), 100)
            .await
            .unwrap()
        {
            Enqueued::Created(entry) => entry.waitlist_id,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn lapsed_window_cascades_to_next_entry() {
        let f = fixture().await;
        let a = join(&f).await;
        let b = join(&f).await;
        f.coordinator.on_seats_freed(f.event_id, 1).await.unwrap();

        f.clock.advance(chrono::Duration::minutes(9));
        assert_eq!(f.sweeper.sweep().await.unwrap(), 0);

        f.clock.advance(chrono::Duration::minutes(2));
        assert_eq!(f.sweeper.sweep().await.unwrap(), 1);

        let a = f.store.get(a).await.unwrap().unwrap();
        let b = f.store.get(b).await.unwrap().unwrap();
        assert_eq!(a.status, WaitlistStatus::Expired);
        assert_eq!(b.status, WaitlistStatus::Notified);
        assert_eq!(f.notifier.recipients(), vec![a.user_id, b.user_id]);
    }

    #[tokio::test]
    async fn advancement_failing_once_is_retried_in_the_same_pass() {
        let f = fixture().await;
        join(&f).await;
        let b = join(&f).await;
        f.coordinator.on_seats_freed(f.event_id, 1).await.unwrap();
        f.clock.advance(chrono::Duration::minutes(11));

        f.flaky.fail_next(1);
        assert_eq!(f.sweeper.sweep().await.unwrap(), 1);
        assert_eq!(f.flaky.failures(), 1);
        assert_eq!(f.store.get(b).await.unwrap().unwrap().status, WaitlistStatus::Notified);
        assert_eq!(f.sweeper.owed(f.event_id), 0);
    }

    #[tokio::test]
    async fn failed_advancement_is_owed_to_the_next_pass() {
        let f = fixture().await;
        let a = join(&f).await;
        let b = join(&f).await;
        f.coordinator.on_seats_freed(f.event_id, 1).await.unwrap();
        f.clock.advance(chrono::Duration::minutes(11));

        f.flaky.fail_next(100);
        assert_eq!(f.sweeper.sweep().await.unwrap(), 1);
        assert_eq!(f.store.get(a).await.unwrap().unwrap().status, WaitlistStatus::Expired);
        assert_eq!(f.store.get(b).await.unwrap().unwrap().status, WaitlistStatus::Waiting);
        assert_eq!(f.sweeper.owed(f.event_id), 1);

        // A clone shares what is owed.
        let spawned = f.sweeper.clone();
        f.flaky.fail_next(0);
        assert_eq!(spawned.sweep().await.unwrap(), 0);
        assert_eq!(f.store.get(b).await.unwrap().unwrap().status, WaitlistStatus::Notified);
        assert_eq!(f.sweeper.owed(f.event_id), 0);
        assert_eq!(f.notifier.sent().len(), 2);
    }

    #[tokio::test]
    async fn converted_entries_are_left_alone() {
        let f = fixture().await;
        let a = join(&f).await;
        f.coordinator.on_seats_freed(f.event_id, 1).await.unwrap();
        f.coordinator.convert(a).await.unwrap();

        f.clock.advance(chrono::Duration::hours(1));
        assert_eq!(f.sweeper.sweep().await.unwrap(), 0);
        assert_eq!(
            f.store.get(a).await.unwrap().unwrap().status,
            WaitlistStatus::Converted
        );
    }

    #[tokio::test]
    async fn repeated_sweeps_do_not_double_process() {
        let f = fixture().await;
        join(&f).await;
        f.coordinator.on_seats_freed(f.event_id, 1).await.unwrap();
        f.clock.advance(chrono::Duration::minutes(11));

        let (first, second) = tokio::join!(f.sweeper.sweep(), f.sweeper.sweep());
        assert_eq!(first.unwrap() + second.unwrap(), 1);
        assert_eq!(f.sweeper.sweep().await.unwrap(), 0);
        assert_eq!(f.notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn spawned_sweeper_stops_on_shutdown() {
        let f = fixture().await;
        let (tx, rx) = broadcast::channel(1);
        let handle = f.sweeper.clone().spawn(Duration::from_secs(300), rx);

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
