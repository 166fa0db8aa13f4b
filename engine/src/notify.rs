//! Notifier implementations shipped with the engine.
//!
//! Real delivery (email, WebSocket, in-app) lives outside this crate and plugs
//! in through [`Notifier`]. [`TracingNotifier`] is the default channel for the
//! demo and single-process deployments; [`MultiChannelNotifier`] fans one
//! notification out to several channels and isolates their failures.

use boxoffice_core::notify::{NotifyError, Notifier};
use boxoffice_core::types::{SeatNotification, UserId};
use std::future::{Future, ready};
use std::pin::Pin;
use std::sync::Arc;
use tracing::{info, warn};

type NotifyFuture<'a> = Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + 'a>>;

/// Writes every notification to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify<'a>(&'a self, user_id: UserId, payload: &'a SeatNotification) -> NotifyFuture<'a> {
        info!(
            user_id = %user_id,
            waitlist_id = %payload.waitlist_id,
            event_id = %payload.event_id,
            available_seats = payload.available_seats,
            expires_at = %payload.expires_at,
            booking_url = %payload.booking_url,
            "Seat available for waitlisted user"
        );
        Box::pin(ready(Ok(())))
    }
}

/// Delivers to every registered channel.
///
/// A channel failure is logged and does not stop the remaining channels.
/// Delivery succeeds if at least one channel accepted the notification.
#[derive(Clone, Default)]
pub struct MultiChannelNotifier {
    channels: Vec<(String, Arc<dyn Notifier>)>,
}

impl MultiChannelNotifier {
    /// Create a notifier with no channels.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a named channel.
    #[must_use]
    pub fn with_channel(mut self, name: impl Into<String>, channel: Arc<dyn Notifier>) -> Self {
        self.channels.push((name.into(), channel));
        self
    }

    /// Number of registered channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether no channel is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl Notifier for MultiChannelNotifier {
    fn notify<'a>(&'a self, user_id: UserId, payload: &'a SeatNotification) -> NotifyFuture<'a> {
        Box::pin(async move {
            let mut delivered = false;
            let mut last_error = None;

            for (name, channel) in &self.channels {
                match channel.notify(user_id, payload).await {
                    Ok(()) => delivered = true,
                    Err(e) => {
                        warn!(channel = %name, user_id = %user_id, error = %e, "Notification channel failed");
                        last_error = Some(e);
                    },
                }
            }

            if delivered {
                return Ok(());
            }
            Err(last_error.unwrap_or_else(|| NotifyError::Unavailable {
                channel: "multi".to_string(),
                reason: "no channels configured".to_string(),
            }))
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use boxoffice_core::environment::Clock;
    use boxoffice_core::types::{EventId, WaitlistId};
    use boxoffice_testing::{FailingNotifier, RecordingNotifier, test_clock};

    fn payload(user_id: UserId) -> SeatNotification {
        SeatNotification {
            waitlist_id: WaitlistId::new(),
            user_id,
            event_id: EventId::new(),
            available_seats: 1,
            expires_at: test_clock().now(),
            booking_url: "https://tickets.test/events/e/book".to_string(),
        }
    }

    #[tokio::test]
    async fn failing_channel_does_not_block_the_others() {
        let recorder = RecordingNotifier::new();
        let failing = FailingNotifier::always();
        let notifier = MultiChannelNotifier::new()
            .with_channel("email", Arc::new(failing.clone()))
            .with_channel("in-app", Arc::new(recorder.clone()));
        let user = UserId::new();

        notifier.notify(user, &payload(user)).await.unwrap();

        assert_eq!(failing.attempts(), vec![user]);
        assert_eq!(recorder.recipients(), vec![user]);
    }

    #[tokio::test]
    async fn fails_when_every_channel_fails() {
        let notifier = MultiChannelNotifier::new()
            .with_channel("email", Arc::new(FailingNotifier::always()))
            .with_channel("sms", Arc::new(FailingNotifier::always()));
        let user = UserId::new();

        assert!(notifier.notify(user, &payload(user)).await.is_err());
    }

    #[tokio::test]
    async fn no_channels_is_unavailable() {
        let user = UserId::new();
        let err = MultiChannelNotifier::new()
            .notify(user, &payload(user))
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn tracing_notifier_always_accepts() {
        let user = UserId::new();
        TracingNotifier.notify(user, &payload(user)).await.unwrap();
    }
}
