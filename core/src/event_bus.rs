//! Event bus abstraction for the cancellation → waitlist hand-off.
//!
//! ```text
//! cancel_booking ──► release seats ──► publish SeatsFreed ──► (returns)
//!                                              │
//!                                              ▼
//!                                     ┌─────────────────┐
//!                                     │    Event Bus    │◄── at-least-once,
//!                                     └────────┬────────┘    ordered per key
//!                                              ▼
//!                                  Notification Coordinator
//! ```
//!
//! # Key Principles
//!
//! - **Fire and forget**: publishers never wait for consumers
//! - **At-least-once delivery**: events may be delivered more than once
//! - **Ordered within partition**: events sharing a key keep publish order
//! - **Idempotency**: subscribers drop redeliveries by `message_id`
//!
//! # Implementations
//!
//! - `InMemoryEventBus` (in `boxoffice-runtime`): single-process, per-topic FIFO
//! - A partitioned log keyed by event id for multi-node deployments

use crate::event::SerializedEvent;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Why a publish or subscribe did not go through.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// The event could not be queued on `topic`.
    #[error("cannot publish to '{topic}': {reason}")]
    PublishFailed {
        /// Destination topic.
        topic: String,
        /// What went wrong.
        reason: String,
    },

    /// No stream could be opened for `topics`.
    #[error("cannot subscribe to {topics:?}: {reason}")]
    SubscriptionFailed {
        /// Requested topics.
        topics: Vec<String>,
        /// What went wrong.
        reason: String,
    },
}

/// Events delivered to one subscriber, in publish order per topic.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<SerializedEvent, EventBusError>> + Send>>;

/// Carries [`SeatsFreed`](crate::event::SeatsFreed) and similar events from
/// the service that emits them to their consumers.
///
/// Methods return boxed futures so the bus can live behind `Arc<dyn EventBus>`.
pub trait EventBus: Send + Sync {
    /// Queue `event` on `topic` without waiting for any subscriber.
    ///
    /// # Errors
    ///
    /// [`EventBusError::PublishFailed`] when the bus no longer accepts events.
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;

    /// Open a stream over `topics`, starting with anything published while
    /// nobody was listening.
    ///
    /// # Errors
    ///
    /// [`EventBusError::SubscriptionFailed`] when no stream can be opened.
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>>;
}
