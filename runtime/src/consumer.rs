//! Event bus consumer with automatic reconnection.
//!
//! `EventConsumer` owns the subscribe-process-reconnect loop so handlers only
//! implement [`EventHandler`]:
//!
//! ```text
//! loop {
//!     subscribe (retry after delay on failure)
//!     for each event:
//!         handler.handle(event)   // on error, redeliver after delay
//!                                 // up to max_deliveries, then log and move on
//!         stop on shutdown signal
//!     stream ended → reconnect after delay
//! }
//! ```
//!
//! Events are handled one at a time in stream order, so a handler sees the
//! events of one partition key in publish order.

use async_trait::async_trait;
use boxoffice_core::event::SerializedEvent;
use boxoffice_core::event_bus::{EventBus, EventBusError};
use futures::StreamExt;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Processes one event delivered by an [`EventConsumer`].
///
/// Delivery is at-least-once: implementations must tolerate redelivery of an
/// event with the same `message_id`.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Handle one event.
    ///
    /// # Errors
    ///
    /// The consumer redelivers a failed event after its retry delay, up to
    /// its delivery limit. After that the error is logged and the next event
    /// is processed.
    async fn handle(
        &self,
        event: &SerializedEvent,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Generic event bus consumer.
pub struct EventConsumer {
    /// Consumer name (for logging and monitoring)
    name: String,

    /// Topics to subscribe to
    topics: Vec<String>,

    /// Event bus to consume from
    event_bus: Arc<dyn EventBus>,

    /// Handler for processing events
    handler: Arc<dyn EventHandler>,

    /// Shutdown signal receiver
    shutdown: broadcast::Receiver<()>,

    /// Retry delay on connection failure and before redelivery (default: 5 seconds)
    retry_delay: Duration,

    /// Deliveries of one event before it is dropped (default: 3)
    max_deliveries: u32,
}

impl EventConsumer {
    /// Create a new event consumer with a 5 second reconnect delay.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        topics: Vec<String>,
        event_bus: Arc<dyn EventBus>,
        handler: Arc<dyn EventHandler>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            name: name.into(),
            topics,
            event_bus,
            handler,
            shutdown,
            retry_delay: Duration::from_secs(5),
            max_deliveries: 3,
        }
    }

    /// Set custom retry delay.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set how many times one event is handed to the handler before it is dropped.
    #[must_use]
    pub fn with_max_deliveries(mut self, deliveries: u32) -> Self {
        self.max_deliveries = deliveries.max(1);
        self
    }

    /// Spawn the consumer as a background task.
    ///
    /// The task runs until a shutdown signal is received.
    #[must_use]
    pub fn spawn(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&mut self) {
        info!(consumer = %self.name, "Event consumer started");

        loop {
            let topics: Vec<&str> = self.topics.iter().map(String::as_str).collect();

            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.name, "Event consumer received shutdown signal");
                    break;
                }
                subscribe_result = self.event_bus.subscribe(&topics) => {
                    match subscribe_result {
                        Ok(mut stream) => {
                            info!(consumer = %self.name, topics = ?self.topics, "Subscribed to event bus");

                            if self.process_stream(&mut stream).await {
                                break;
                            }

                            warn!(consumer = %self.name, "Event stream ended, reconnecting in {:?}", self.retry_delay);
                        }
                        Err(e) => {
                            error!(
                                consumer = %self.name,
                                error = %e,
                                "Failed to subscribe to event bus, retrying in {:?}",
                                self.retry_delay
                            );
                        }
                    }
                }
            }

            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.name, "Event consumer received shutdown signal");
                    break;
                }
                () = tokio::time::sleep(self.retry_delay) => {}
            }
        }

        info!(consumer = %self.name, "Event consumer stopped");
    }

    /// Hand one event to the handler, redelivering on failure.
    ///
    /// Returns `true` if shutdown was signalled while waiting to redeliver.
    async fn deliver(&mut self, event: &SerializedEvent) -> bool {
        let mut delivery = 1;
        loop {
            let Err(e) = self.handler.handle(event).await else {
                return false;
            };
            counter!("event_bus_consume_errors_total").increment(1);

            if delivery >= self.max_deliveries {
                counter!("event_bus_messages_dropped_total").increment(1);
                error!(
                    consumer = %self.name,
                    message_id = %event.message_id,
                    event_type = %event.event_type,
                    deliveries = delivery,
                    error = %e,
                    "Failed to handle event, dropping it"
                );
                return false;
            }

            warn!(
                consumer = %self.name,
                message_id = %event.message_id,
                event_type = %event.event_type,
                delivery,
                error = %e,
                "Failed to handle event, redelivering in {:?}",
                self.retry_delay
            );
            delivery += 1;

            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.name, "Event consumer received shutdown signal during redelivery");
                    return true;
                }
                () = tokio::time::sleep(self.retry_delay) => {}
            }
        }
    }

    /// Process events until the stream ends (`false`) or shutdown is signalled (`true`).
    async fn process_stream<S>(&mut self, stream: &mut S) -> bool
    where
        S: futures::Stream<Item = Result<SerializedEvent, EventBusError>> + Unpin + Send,
    {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.name, "Event consumer received shutdown signal during processing");
                    return true;
                }
                event_result = stream.next() => {
                    match event_result {
                        Some(Ok(event)) => {
                            counter!("event_bus_messages_consumed_total").increment(1);
                            if self.deliver(&event).await {
                                return true;
                            }
                        }
                        Some(Err(e)) => {
                            counter!("event_bus_consume_errors_total").increment(1);
                            error!(consumer = %self.name, error = %e, "Error receiving event from stream");
                        }
                        None => return false,
                    }
                }
            }
        }
    }
}
