//! Store wrappers that inject failures into an otherwise working store.
//!
//! Each wrapper delegates to an inner store and only overrides the operation
//! under test, so the rest of the flow runs against real state.

use boxoffice_core::error::StoreError;
use boxoffice_core::store::{
    BookingStore, CasOutcome, Enqueued, InventoryStore, StoreFuture, WaitlistStore,
};
use boxoffice_core::types::{
    Booking, BookingId, EventId, EventInventory, IdempotencyKey, UserId, WaitlistEntry,
    WaitlistId, WaitlistStatus,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Inventory store whose compare-and-set loses the race while switched on.
///
/// When stale, every `compare_and_set` reports [`CasOutcome::Stale`] with the
/// current record, which is what a writer sees under unbounded contention.
/// A new wrapper starts stale.
pub struct StaleInventoryStore {
    inner: Arc<dyn InventoryStore>,
    attempts: AtomicUsize,
    stale: AtomicBool,
}

impl StaleInventoryStore {
    /// Wrap `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn InventoryStore>) -> Self {
        Self {
            inner,
            attempts: AtomicUsize::new(0),
            stale: AtomicBool::new(true),
        }
    }

    /// Switch the injected contention on or off.
    pub fn set_stale(&self, on: bool) {
        self.stale.store(on, Ordering::SeqCst);
    }

    /// Number of compare-and-set calls observed.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl InventoryStore for StaleInventoryStore {
    fn insert(&self, inventory: EventInventory) -> StoreFuture<'_, ()> {
        self.inner.insert(inventory)
    }

    fn load(&self, event_id: EventId) -> StoreFuture<'_, Option<EventInventory>> {
        self.inner.load(event_id)
    }

    fn compare_and_set(
        &self,
        event_id: EventId,
        expected_version: u64,
        available: u32,
    ) -> StoreFuture<'_, CasOutcome> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.stale.load(Ordering::SeqCst) {
            return self.inner.compare_and_set(event_id, expected_version, available);
        }
        Box::pin(async move {
            let current = self
                .inner
                .load(event_id)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("inventory for event {event_id}")))?;
            Ok(CasOutcome::Stale(current))
        })
    }
}

/// Booking store whose `insert` fails with a database error.
///
/// Used to exercise the seat compensation path after a successful reserve.
pub struct FailingBookingInsert {
    inner: Arc<dyn BookingStore>,
    failures: AtomicUsize,
}

impl FailingBookingInsert {
    /// Wrap `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn BookingStore>) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(0),
        }
    }

    /// Number of inserts that were failed.
    #[must_use]
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

impl BookingStore for FailingBookingInsert {
    fn insert(&self, _booking: Booking) -> StoreFuture<'_, ()> {
        self.failures.fetch_add(1, Ordering::SeqCst);
        Box::pin(async {
            Err(StoreError::Database(
                "injected failure: connection reset".to_string(),
            ))
        })
    }

    fn get(&self, booking_id: BookingId) -> StoreFuture<'_, Option<Booking>> {
        self.inner.get(booking_id)
    }

    fn find_by_idempotency_key<'a>(
        &'a self,
        key: &'a IdempotencyKey,
    ) -> StoreFuture<'a, Option<Booking>> {
        self.inner.find_by_idempotency_key(key)
    }

    fn find_active(&self, user_id: UserId, event_id: EventId) -> StoreFuture<'_, Option<Booking>> {
        self.inner.find_active(user_id, event_id)
    }

    fn cancel(&self, booking_id: BookingId) -> StoreFuture<'_, Booking> {
        self.inner.cancel(booking_id)
    }

    fn restore(&self, booking_id: BookingId) -> StoreFuture<'_, Booking> {
        self.inner.restore(booking_id)
    }
}

/// Waitlist store whose `promote_head` fails a set number of times.
///
/// After [`fail_next`](Self::fail_next)`(n)` the next `n` promotions return a
/// database error without touching the queue; later calls delegate again.
pub struct FlakyWaitlistStore {
    inner: Arc<dyn WaitlistStore>,
    passes: AtomicUsize,
    pending: AtomicUsize,
    failures: AtomicUsize,
}

impl FlakyWaitlistStore {
    /// Wrap `inner`. No failures are armed.
    #[must_use]
    pub fn new(inner: Arc<dyn WaitlistStore>) -> Self {
        Self {
            inner,
            passes: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` promotions, replacing any failures still armed.
    pub fn fail_next(&self, n: usize) {
        self.fail_after(0, n);
    }

    /// Let `ok` promotions through, then fail the `n` after them.
    pub fn fail_after(&self, ok: usize, n: usize) {
        self.passes.store(ok, Ordering::SeqCst);
        self.pending.store(n, Ordering::SeqCst);
    }

    /// Number of promotions that were failed.
    #[must_use]
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        let passed = self
            .passes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        !passed
            && self
                .pending
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
    }
}

impl WaitlistStore for FlakyWaitlistStore {
    fn enqueue(
        &self,
        user_id: UserId,
        event_id: EventId,
        now: DateTime<Utc>,
        max_waiting: u32,
    ) -> StoreFuture<'_, Enqueued> {
        self.inner.enqueue(user_id, event_id, now, max_waiting)
    }

    fn get(&self, waitlist_id: WaitlistId) -> StoreFuture<'_, Option<WaitlistEntry>> {
        self.inner.get(waitlist_id)
    }

    fn find_active(
        &self,
        user_id: UserId,
        event_id: EventId,
    ) -> StoreFuture<'_, Option<WaitlistEntry>> {
        self.inner.find_active(user_id, event_id)
    }

    fn live_position(&self, waitlist_id: WaitlistId) -> StoreFuture<'_, Option<u32>> {
        self.inner.live_position(waitlist_id)
    }

    fn remove_waiting(&self, waitlist_id: WaitlistId) -> StoreFuture<'_, WaitlistEntry> {
        self.inner.remove_waiting(waitlist_id)
    }

    fn waiting(&self, event_id: EventId) -> StoreFuture<'_, Vec<WaitlistEntry>> {
        self.inner.waiting(event_id)
    }

    fn for_user(&self, user_id: UserId) -> StoreFuture<'_, Vec<WaitlistEntry>> {
        self.inner.for_user(user_id)
    }

    fn head(&self, event_id: EventId) -> StoreFuture<'_, Option<WaitlistEntry>> {
        self.inner.head(event_id)
    }

    fn promote_head(
        &self,
        event_id: EventId,
        notified_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<WaitlistEntry>> {
        if self.take_failure() {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Box::pin(async {
                Err(StoreError::Database(
                    "injected failure: connection reset".to_string(),
                ))
            });
        }
        self.inner.promote_head(event_id, notified_at, expires_at)
    }

    fn transition(
        &self,
        waitlist_id: WaitlistId,
        from: WaitlistStatus,
        to: WaitlistStatus,
    ) -> StoreFuture<'_, WaitlistEntry> {
        self.inner.transition(waitlist_id, from, to)
    }

    fn overdue(&self, now: DateTime<Utc>) -> StoreFuture<'_, Vec<WaitlistEntry>> {
        self.inner.overdue(now)
    }
}
