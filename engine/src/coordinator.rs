//! Notification coordinator: the `WAITING → NOTIFIED → {EXPIRED, CONVERTED}`
//! state machine.
//!
//! ```text
//! seats freed (event, qty)
//!     │
//!     ├─► promote head to NOTIFIED (notified_at = now, expires_at = now + window)
//!     ├─► persist
//!     └─► notify(user, payload)      // failure logged, never rolled back
//!     ... repeated qty times or until the queue is empty
//! ```
//!
//! A notified entry does not hold a seat: freed seats stay in the ledger's
//! general pool during the booking window.

use crate::error::WaitlistError;
use crate::ledger::SeatLedger;
use crate::waitlist::entry_error;
use boxoffice_core::environment::Clock;
use boxoffice_core::error::StoreError;
use boxoffice_core::notify::Notifier;
use boxoffice_core::store::WaitlistStore;
use boxoffice_core::types::{EventId, SeatNotification, WaitlistEntry, WaitlistId, WaitlistStatus};
use boxoffice_runtime::{RetryPolicy, retry_with_predicate};
use metrics::counter;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Advances waitlist entries and hands notifications to the [`Notifier`].
#[derive(Clone)]
pub struct NotificationCoordinator {
    store: Arc<dyn WaitlistStore>,
    ledger: SeatLedger,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    booking_window: chrono::Duration,
    booking_url_base: String,
}

impl NotificationCoordinator {
    /// Create a coordinator granting `booking_window` to each notified entry.
    #[must_use]
    pub fn new(
        store: Arc<dyn WaitlistStore>,
        ledger: SeatLedger,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        booking_window: chrono::Duration,
        booking_url_base: impl Into<String>,
    ) -> Self {
        Self {
            store,
            ledger,
            notifier,
            clock,
            booking_window,
            booking_url_base: booking_url_base.into(),
        }
    }

    /// Booking window granted on notification.
    #[must_use]
    pub const fn booking_window(&self) -> chrono::Duration {
        self.booking_window
    }

    /// Notify up to `quantity` entries at the head of the event's queue.
    ///
    /// Entries are promoted one at a time; each promotion is a single atomic
    /// store operation, so one freed seat never notifies two entries.
    /// Returns the entries that were moved to `NOTIFIED`, in queue order.
    ///
    /// # Errors
    ///
    /// Returns [`WaitlistError`] if a promotion cannot be persisted. Entries
    /// promoted before the failure stay `NOTIFIED`.
    pub async fn on_seats_freed(
        &self,
        event_id: EventId,
        quantity: u32,
    ) -> Result<Vec<WaitlistEntry>, WaitlistError> {
        let mut notified = Vec::new();

        for _ in 0..quantity {
            let now = self.clock.now();
            let Some(entry) = self
                .store
                .promote_head(event_id, now, now + self.booking_window)
                .await?
            else {
                debug!(event_id = %event_id, "Waitlist empty, nothing to notify");
                break;
            };

            counter!("waitlist_notified_total").increment(1);
            info!(
                waitlist_id = %entry.waitlist_id,
                user_id = %entry.user_id,
                event_id = %event_id,
                expires_at = ?entry.expires_at,
                "Waitlist entry notified"
            );

            self.dispatch(&entry).await;
            notified.push(entry);
        }

        Ok(notified)
    }

    /// Notify the head of the event's queue, retrying temporary failures.
    ///
    /// Returns `None` once the queue is empty. Callers advancing several
    /// seats call this once per seat, so a failure part way through leaves
    /// them knowing exactly how many seats are still owed.
    ///
    /// # Errors
    ///
    /// Returns the last [`WaitlistError`] once `policy` is exhausted, or the
    /// first error that is not temporary.
    pub async fn notify_next(
        &self,
        event_id: EventId,
        policy: &RetryPolicy,
    ) -> Result<Option<WaitlistEntry>, WaitlistError> {
        let mut notified = retry_with_predicate(
            policy,
            || self.on_seats_freed(event_id, 1),
            |e: &WaitlistError| e.kind().is_temporary(),
        )
        .await?;
        Ok(notified.pop())
    }

    /// Mark a notified entry as converted after its user booked.
    ///
    /// # Errors
    ///
    /// - [`WaitlistError::InvalidTransition`]: the entry is not `NOTIFIED`
    /// - [`WaitlistError::NotFound`]: no such entry
    pub async fn convert(&self, waitlist_id: WaitlistId) -> Result<WaitlistEntry, WaitlistError> {
        let entry = self
            .advance(waitlist_id, WaitlistStatus::Converted)
            .await?;
        counter!("waitlist_converted_total").increment(1);
        info!(
            waitlist_id = %waitlist_id,
            user_id = %entry.user_id,
            event_id = %entry.event_id,
            "Waitlist entry converted"
        );
        Ok(entry)
    }

    /// Mark a notified entry as expired.
    ///
    /// # Errors
    ///
    /// - [`WaitlistError::InvalidTransition`]: the entry is not `NOTIFIED`
    /// - [`WaitlistError::NotFound`]: no such entry
    pub async fn expire(&self, waitlist_id: WaitlistId) -> Result<WaitlistEntry, WaitlistError> {
        let entry = self.advance(waitlist_id, WaitlistStatus::Expired).await?;
        counter!("waitlist_expired_total").increment(1);
        info!(
            waitlist_id = %waitlist_id,
            user_id = %entry.user_id,
            event_id = %entry.event_id,
            "Waitlist entry expired"
        );
        Ok(entry)
    }

    async fn advance(
        &self,
        waitlist_id: WaitlistId,
        to: WaitlistStatus,
    ) -> Result<WaitlistEntry, WaitlistError> {
        self.store
            .transition(waitlist_id, WaitlistStatus::Notified, to)
            .await
            .map_err(|e| match e {
                StoreError::StatusMismatch { actual, .. } => {
                    let from = WaitlistStatus::parse(actual);
                    warn!(
                        waitlist_id = %waitlist_id,
                        from = actual,
                        to = %to,
                        "Rejected waitlist transition"
                    );
                    from.map_or_else(
                        || {
                            WaitlistError::Invariant(format!(
                                "waitlist entry {waitlist_id} has unknown status {actual}"
                            ))
                        },
                        |from| WaitlistError::InvalidTransition {
                            waitlist_id,
                            from,
                            to,
                        },
                    )
                },
                other => entry_error(waitlist_id, other),
            })
    }

    /// Hand the notification to the collaborator. Failures are isolated here.
    async fn dispatch(&self, entry: &WaitlistEntry) {
        let Some(expires_at) = entry.expires_at else {
            error!(
                waitlist_id = %entry.waitlist_id,
                "Notified entry has no expiry, skipping delivery"
            );
            return;
        };

        let available_seats = match self.ledger.inventory(entry.event_id).await {
            Ok(inventory) => inventory.available,
            Err(e) => {
                warn!(event_id = %entry.event_id, error = %e, "Could not read availability for notification");
                0
            },
        };

        let payload = SeatNotification {
            waitlist_id: entry.waitlist_id,
            user_id: entry.user_id,
            event_id: entry.event_id,
            available_seats,
            expires_at,
            booking_url: format!(
                "{}/{}/book?waitlist={}",
                self.booking_url_base.trim_end_matches('/'),
                entry.event_id,
                entry.waitlist_id
            ),
        };

        match self.notifier.notify(entry.user_id, &payload).await {
            Ok(()) => {
                counter!("notifications_sent_total").increment(1);
            },
            Err(e) => {
                counter!("notifications_failed_total").increment(1);
                error!(
                    waitlist_id = %entry.waitlist_id,
                    user_id = %entry.user_id,
                    error = %e,
                    "Seat notification delivery failed"
                );
            },
        }
    }
}
