//! Shared fixtures for the engine integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use boxoffice::{BoxOffice, Config, Stores};
use boxoffice_core::environment::Clock;
use boxoffice_core::notify::Notifier;
use boxoffice_core::types::{EventId, WaitlistId, WaitlistStatus};
use boxoffice_runtime::InMemoryEventBus;
use boxoffice_testing::{ManualClock, RecordingNotifier, test_clock};
use std::sync::Arc;
use std::time::Duration;

/// An application over in-memory stores with a controllable clock.
pub struct Harness {
    pub app: BoxOffice,
    pub bus: Arc<InMemoryEventBus>,
    pub clock: ManualClock,
}

/// Defaults with millisecond backoff so contention tests finish quickly.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.ledger.initial_backoff_ms = 1;
    config.ledger.max_backoff_ms = 5;
    config
}

pub fn harness_with(config: Config, stores: Stores, notifier: Arc<dyn Notifier>) -> Harness {
    boxoffice_testing::init_test_tracing();
    let clock = ManualClock::new(test_clock().now());
    let bus = Arc::new(InMemoryEventBus::new());
    let app = BoxOffice::new(config, stores, bus.clone(), Arc::new(clock.clone()), notifier);
    Harness { app, bus, clock }
}

/// In-memory harness plus the notifier it delivers to.
pub fn harness() -> (Harness, RecordingNotifier) {
    let notifier = RecordingNotifier::new();
    let h = harness_with(fast_config(), Stores::in_memory(), Arc::new(notifier.clone()));
    (h, notifier)
}

impl Harness {
    /// Register an event starting in 30 days.
    pub async fn event(&self, capacity: u32) -> EventId {
        let event_id = EventId::new();
        self.app
            .ledger()
            .register(event_id, capacity, self.clock.now() + chrono::Duration::days(30))
            .await
            .unwrap();
        event_id
    }

    pub async fn available(&self, event_id: EventId) -> u32 {
        self.app.ledger().inventory(event_id).await.unwrap().available
    }

    pub async fn status(&self, waitlist_id: WaitlistId) -> WaitlistStatus {
        self.app.waitlist().get_entry(waitlist_id).await.unwrap().status
    }

    /// Wait for the background consumer to move an entry to `status`.
    pub async fn wait_for_status(&self, waitlist_id: WaitlistId, status: WaitlistStatus) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.status(waitlist_id).await != status {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}
