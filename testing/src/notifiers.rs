//! In-memory [`Notifier`] implementations for tests.

use boxoffice_core::notify::{NotifyError, Notifier};
use boxoffice_core::types::{SeatNotification, UserId};
use std::collections::HashSet;
use std::future::{Future, ready};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

type NotifyFuture<'a> = Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + 'a>>;

/// Records every notification it is asked to deliver.
///
/// # Example
///
/// ```
/// use boxoffice_testing::RecordingNotifier;
///
/// let notifier = RecordingNotifier::new();
/// assert!(notifier.sent().is_empty());
/// ```
#[derive(Clone, Debug, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<(UserId, SeatNotification)>>>,
}

impl RecordingNotifier {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every delivery so far, in call order.
    #[must_use]
    pub fn sent(&self) -> Vec<(UserId, SeatNotification)> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Recipients in call order.
    #[must_use]
    pub fn recipients(&self) -> Vec<UserId> {
        self.sent().into_iter().map(|(user, _)| user).collect()
    }

    /// Forget recorded deliveries.
    pub fn clear(&self) {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Notifier for RecordingNotifier {
    fn notify<'a>(&'a self, user_id: UserId, payload: &'a SeatNotification) -> NotifyFuture<'a> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((user_id, payload.clone()));
        Box::pin(ready(Ok(())))
    }
}

/// Fails deliveries, either for everyone or for selected users.
///
/// Attempts are still recorded so tests can assert the call happened.
#[derive(Clone, Debug, Default)]
pub struct FailingNotifier {
    only_for: Option<HashSet<UserId>>,
    attempts: Arc<Mutex<Vec<UserId>>>,
}

impl FailingNotifier {
    /// Fail every delivery.
    #[must_use]
    pub fn always() -> Self {
        Self::default()
    }

    /// Fail deliveries to `users` only; everyone else succeeds.
    #[must_use]
    pub fn for_users(users: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            only_for: Some(users.into_iter().collect()),
            attempts: Arc::default(),
        }
    }

    /// Users a delivery was attempted for, in call order.
    #[must_use]
    pub fn attempts(&self) -> Vec<UserId> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Notifier for FailingNotifier {
    fn notify<'a>(&'a self, user_id: UserId, _payload: &'a SeatNotification) -> NotifyFuture<'a> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(user_id);

        let fails = self
            .only_for
            .as_ref()
            .is_none_or(|users| users.contains(&user_id));

        let result = if fails {
            Err(NotifyError::Unavailable {
                channel: "test".to_string(),
                reason: "injected failure".to_string(),
            })
        } else {
            Ok(())
        };
        Box::pin(ready(result))
    }
}
