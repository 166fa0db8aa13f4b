//! Waitlist, notification and expiry flows across the whole application.

#![allow(clippy::unwrap_used, clippy::panic)]

mod common;

use boxoffice::{Stores, WaitlistError};
use boxoffice_core::environment::Clock;
use boxoffice_core::types::{EventId, IdempotencyKey, UserId, WaitlistEntry, WaitlistStatus};
use boxoffice_testing::{FailingNotifier, FlakyWaitlistStore, RecordingNotifier};
use common::{Harness, fast_config, harness, harness_with};
use std::sync::Arc;

async fn sold_out_event(h: &Harness) -> EventId {
    let event_id = h.event(1).await;
    h.app
        .bookings()
        .create_booking(UserId::new(), event_id, 1, IdempotencyKey::new(format!("holder-{event_id}")))
        .await
        .unwrap();
    event_id
}

fn flaky_harness() -> (Harness, Arc<FlakyWaitlistStore>, RecordingNotifier) {
    let memory = Stores::in_memory();
    let flaky = Arc::new(FlakyWaitlistStore::new(memory.waitlist.clone()));
    let stores = Stores {
        waitlist: flaky.clone(),
        ..memory
    };
    let notifier = RecordingNotifier::new();
    let h = harness_with(fast_config(), stores, Arc::new(notifier.clone()));
    (h, flaky, notifier)
}

async fn join_all(h: &Harness, event_id: EventId, n: usize) -> Vec<WaitlistEntry> {
    let mut entries = Vec::new();
    for _ in 0..n {
        entries.push(h.app.waitlist().join(UserId::new(), event_id).await.unwrap());
    }
    entries
}

/// One seat, U1 books, U2 waits, U1 cancels, U2 is notified and books.
#[tokio::test]
async fn cancelled_seat_reaches_the_waitlist_and_converts() {
    let (mut h, notifier) = harness();
    h.app.start().unwrap();
    let event_id = h.event(1).await;
    let (u1, u2) = (UserId::new(), UserId::new());

    let booking = h
        .app
        .bookings()
        .create_booking(u1, event_id, 1, "u1".into())
        .await
        .unwrap()
        .booking;
    assert_eq!(h.available(event_id).await, 0);

    let entry = h.app.waitlist().join(u2, event_id).await.unwrap();
    assert_eq!(entry.position, 1);

    h.app.bookings().cancel_booking(booking.booking_id).await.unwrap();
    h.wait_for_status(entry.waitlist_id, WaitlistStatus::Notified)
        .await;

    let notified = h.app.waitlist().get_entry(entry.waitlist_id).await.unwrap();
    assert_eq!(notified.notified_at, Some(h.clock.now()));
    assert_eq!(
        notified.expires_at,
        Some(h.clock.now() + chrono::Duration::minutes(10))
    );
    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, u2);
    assert_eq!(sent[0].1.available_seats, 1);
    assert!(sent[0].1.booking_url.contains(&event_id.to_string()));

    h.app
        .bookings()
        .create_booking(u2, event_id, 1, "u2".into())
        .await
        .unwrap();
    assert_eq!(h.status(entry.waitlist_id).await, WaitlistStatus::Converted);
    assert_eq!(h.available(event_id).await, 0);

    h.app.shutdown().await;
}

/// Same start, but U2 never books: the sweeper expires the entry and, with
/// the queue empty, nobody else is notified.
#[tokio::test]
async fn lapsed_window_expires_without_further_notification() {
    let (mut h, notifier) = harness();
    h.app.start().unwrap();
    let event_id = h.event(1).await;
    let booking = h
        .app
        .bookings()
        .create_booking(UserId::new(), event_id, 1, "u1".into())
        .await
        .unwrap()
        .booking;
    let entry = h.app.waitlist().join(UserId::new(), event_id).await.unwrap();

    h.app.bookings().cancel_booking(booking.booking_id).await.unwrap();
    h.wait_for_status(entry.waitlist_id, WaitlistStatus::Notified)
        .await;

    h.clock.advance(chrono::Duration::minutes(10));
    assert_eq!(h.app.sweeper().sweep().await.unwrap(), 0);

    h.clock.advance(chrono::Duration::seconds(1));
    assert_eq!(h.app.sweeper().sweep().await.unwrap(), 1);
    assert_eq!(h.status(entry.waitlist_id).await, WaitlistStatus::Expired);
    assert_eq!(notifier.sent().len(), 1);

    h.app.shutdown().await;
}

#[tokio::test]
async fn notifications_follow_join_order() {
    let (h, notifier) = harness();
    let event_id = sold_out_event(&h).await;
    let entries = join_all(&h, event_id, 5).await;

    for _ in 0..5 {
        h.app.coordinator().on_seats_freed(event_id, 1).await.unwrap();
    }

    let joined: Vec<_> = entries.iter().map(|e| e.user_id).collect();
    assert_eq!(notifier.recipients(), joined);
}

#[tokio::test]
async fn freeing_several_seats_notifies_that_many_entries() {
    let (h, notifier) = harness();
    let event_id = sold_out_event(&h).await;
    let entries = join_all(&h, event_id, 4).await;

    let notified = h.app.coordinator().on_seats_freed(event_id, 3).await.unwrap();

    assert_eq!(notified.len(), 3);
    assert_eq!(notifier.sent().len(), 3);
    assert_eq!(h.app.waitlist().get_position(entries[3].waitlist_id).await, Ok(1));
}

#[tokio::test]
async fn expiry_cascades_down_the_queue() {
    let (h, notifier) = harness();
    let event_id = sold_out_event(&h).await;
    let entries = join_all(&h, event_id, 3).await;

    h.app.coordinator().on_seats_freed(event_id, 1).await.unwrap();
    for expired in 0..2 {
        h.clock.advance(chrono::Duration::minutes(11));
        assert_eq!(h.app.sweeper().sweep().await.unwrap(), 1);
        assert_eq!(
            h.status(entries[expired].waitlist_id).await,
            WaitlistStatus::Expired
        );
        assert_eq!(
            h.status(entries[expired + 1].waitlist_id).await,
            WaitlistStatus::Notified
        );
    }

    let joined: Vec<_> = entries.iter().map(|e| e.user_id).collect();
    assert_eq!(notifier.recipients(), joined);
}

#[tokio::test]
async fn delivery_failure_still_opens_the_window() {
    let first = UserId::new();
    let failing = FailingNotifier::for_users([first]);
    let h = harness_with(fast_config(), Stores::in_memory(), Arc::new(failing.clone()));
    let event_id = sold_out_event(&h).await;
    let a = h.app.waitlist().join(first, event_id).await.unwrap();
    let b = h.app.waitlist().join(UserId::new(), event_id).await.unwrap();

    h.app.coordinator().on_seats_freed(event_id, 1).await.unwrap();
    assert_eq!(h.status(a.waitlist_id).await, WaitlistStatus::Notified);
    assert_eq!(h.status(b.waitlist_id).await, WaitlistStatus::Waiting);

    // The lapsed window moves the seat on to the next user.
    h.clock.advance(chrono::Duration::minutes(11));
    h.app.sweeper().sweep().await.unwrap();
    assert_eq!(h.status(b.waitlist_id).await, WaitlistStatus::Notified);
    assert_eq!(failing.attempts(), vec![first, b.user_id]);
}

#[tokio::test]
async fn leaving_closes_the_gap() {
    let (h, _) = harness();
    let event_id = sold_out_event(&h).await;
    let entries = join_all(&h, event_id, 4).await;

    h.app.waitlist().leave(entries[1].waitlist_id).await.unwrap();

    let waiting = h.app.waitlist().list_for_event(event_id).await.unwrap();
    let positions: Vec<_> = waiting.iter().map(|e| e.position).collect();
    assert_eq!(positions, vec![1, 2, 3]);
    assert_eq!(h.app.waitlist().get_position(entries[3].waitlist_id).await, Ok(3));
    assert_eq!(
        h.app.waitlist().get_position(entries[1].waitlist_id).await,
        Err(WaitlistError::NotFound(entries[1].waitlist_id))
    );
}

#[tokio::test]
async fn join_is_rejected_when_it_cannot_help() {
    let mut config = fast_config();
    config.waitlist.max_length = 2;
    let h = harness_with(
        config,
        Stores::in_memory(),
        Arc::new(boxoffice_testing::RecordingNotifier::new()),
    );

    let open = h.event(5).await;
    assert!(matches!(
        h.app.waitlist().join(UserId::new(), open).await,
        Err(WaitlistError::SeatsAvailable { available: 5, .. })
    ));

    let event_id = sold_out_event(&h).await;
    let entries = join_all(&h, event_id, 2).await;
    assert!(matches!(
        h.app.waitlist().join(UserId::new(), event_id).await,
        Err(WaitlistError::QueueFull { max: 2, .. })
    ));

    match h.app.waitlist().join(entries[1].user_id, event_id).await {
        Err(WaitlistError::AlreadyWaiting { entry }) => {
            assert_eq!(entry.waitlist_id, entries[1].waitlist_id);
            assert_eq!(entry.position, 2);
        },
        other => panic!("expected AlreadyWaiting, got {other:?}"),
    }

    h.clock.advance(chrono::Duration::days(31));
    assert!(matches!(
        h.app.waitlist().join(UserId::new(), event_id).await,
        Err(WaitlistError::EventStarted(_))
    ));
}

#[tokio::test]
async fn direct_booking_removes_a_waiting_entry() {
    let (h, _) = harness();
    let event_id = sold_out_event(&h).await;
    let entries = join_all(&h, event_id, 2).await;

    // A seat comes back outside the waitlist flow and the second user grabs it.
    h.app.ledger().release_with_retry(event_id, 1).await.unwrap();
    h.app
        .bookings()
        .create_booking(entries[1].user_id, event_id, 1, "direct".into())
        .await
        .unwrap();

    let waiting = h.app.waitlist().list_for_event(event_id).await.unwrap();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].waitlist_id, entries[0].waitlist_id);
    assert!(
        h.app
            .waitlist()
            .active_entry(entries[1].user_id, event_id)
            .await
            .unwrap()
            .is_none()
    );
}

/// The consumer path outlasts store failures: the handler retries each
/// promotion, and the consumer redelivers once the handler gives up.
#[tokio::test]
async fn cancelled_seat_is_offered_despite_store_failures() {
    let (mut h, flaky, notifier) = flaky_harness();
    h.app.start().unwrap();
    let event_id = h.event(1).await;
    let booking = h
        .app
        .bookings()
        .create_booking(UserId::new(), event_id, 1, "u1".into())
        .await
        .unwrap()
        .booking;
    let entry = h.app.waitlist().join(UserId::new(), event_id).await.unwrap();

    // More failures than one delivery retries through.
    flaky.fail_next(7);
    h.app.bookings().cancel_booking(booking.booking_id).await.unwrap();
    h.wait_for_status(entry.waitlist_id, WaitlistStatus::Notified)
        .await;

    assert_eq!(flaky.failures(), 7);
    assert_eq!(notifier.recipients(), vec![entry.user_id]);

    h.app.shutdown().await;
}

/// A failed advancement after expiry is not lost: the next sweep delivers it.
#[tokio::test]
async fn failed_advancement_after_expiry_runs_on_the_next_sweep() {
    let (h, flaky, notifier) = flaky_harness();
    let event_id = sold_out_event(&h).await;
    let entries = join_all(&h, event_id, 2).await;
    h.app.coordinator().on_seats_freed(event_id, 1).await.unwrap();

    flaky.fail_next(100);
    h.clock.advance(chrono::Duration::minutes(11));
    assert_eq!(h.app.sweeper().sweep().await.unwrap(), 1);
    assert_eq!(h.status(entries[0].waitlist_id).await, WaitlistStatus::Expired);
    assert_eq!(h.status(entries[1].waitlist_id).await, WaitlistStatus::Waiting);
    assert_eq!(h.app.sweeper().owed(event_id), 1);

    flaky.fail_next(0);
    assert_eq!(h.app.sweeper().sweep().await.unwrap(), 0);
    assert_eq!(h.status(entries[1].waitlist_id).await, WaitlistStatus::Notified);
    assert_eq!(h.app.sweeper().owed(event_id), 0);
    assert_eq!(
        notifier.recipients(),
        vec![entries[0].user_id, entries[1].user_id]
    );
}
