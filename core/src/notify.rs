//! Outbound notification capability.
//!
//! The core calls [`Notifier::notify`] after a waitlist entry has been moved to
//! `NOTIFIED` and persisted. Delivery (email, WebSocket, in-app) lives outside
//! the core. A delivery failure never rolls back the committed transition.

use crate::types::{SeatNotification, UserId};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors reported by a notification channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotifyError {
    /// The channel could not be reached.
    #[error("Notification channel '{channel}' unavailable: {reason}")]
    Unavailable {
        /// Channel name
        channel: String,
        /// Why
        reason: String,
    },

    /// The channel refused the message.
    #[error("Notification rejected by '{channel}': {reason}")]
    Rejected {
        /// Channel name
        channel: String,
        /// Why
        reason: String,
    },
}

/// `notify(user, payload)`.
pub trait Notifier: Send + Sync {
    /// Deliver a seat notification to a user.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError`] if the channel fails; callers log and move on.
    fn notify<'a>(
        &'a self,
        user_id: UserId,
        payload: &'a SeatNotification,
    ) -> Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + 'a>>;
}
