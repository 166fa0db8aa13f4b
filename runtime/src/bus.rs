//! In-process event bus.
//!
//! A single-process implementation of [`EventBus`]: every topic is an ordered
//! queue, and each subscriber gets its own unbounded channel so publishers
//! never wait on consumers. Events published while a topic has no live
//! subscriber are buffered and handed to the next one, which keeps delivery
//! at-least-once across consumer restarts.

use boxoffice_core::event::SerializedEvent;
use boxoffice_core::event_bus::{EventBus, EventBusError, EventStream};
use std::collections::{HashMap, VecDeque};
use std::future::{Future, ready};
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;

type Delivery = Result<SerializedEvent, EventBusError>;

#[derive(Default)]
struct Topic {
    subscribers: Vec<mpsc::UnboundedSender<Delivery>>,
    backlog: VecDeque<SerializedEvent>,
    published: u64,
}

#[derive(Default)]
struct BusState {
    topics: HashMap<String, Topic>,
    closed: bool,
}

/// Ordered, non-blocking, in-process event bus.
///
/// # Example
///
/// ```rust
/// use boxoffice_core::event::SerializedEvent;
/// use boxoffice_core::event_bus::EventBus;
/// use boxoffice_runtime::InMemoryEventBus;
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryEventBus::new();
/// let mut stream = bus.subscribe(&["seats-freed"]).await?;
///
/// let event = SerializedEvent::new("SeatsFreed.v1".into(), "event-1".into(), vec![1], None);
/// bus.publish("seats-freed", &event).await?;
///
/// let received = stream.next().await.unwrap()?;
/// assert_eq!(received.message_id, event.message_id);
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct InMemoryEventBus {
    state: Mutex<BusState>,
}

impl InMemoryEventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events ever published to `topic`.
    #[must_use]
    pub fn published_count(&self, topic: &str) -> u64 {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.topics.get(topic).map_or(0, |t| t.published)
    }

    /// Number of events waiting for a subscriber on `topic`.
    #[must_use]
    pub fn backlog_len(&self, topic: &str) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.topics.get(topic).map_or(0, |t| t.backlog.len())
    }

    /// Refuse further publishes and end every subscriber stream.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        for topic in state.topics.values_mut() {
            topic.subscribers.clear();
        }
    }

    fn publish_now(&self, topic: &str, event: &SerializedEvent) -> Result<(), EventBusError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(EventBusError::PublishFailed {
                topic: topic.to_string(),
                reason: "bus closed".to_string(),
            });
        }

        let entry = state.topics.entry(topic.to_string()).or_default();
        entry.published += 1;
        entry
            .subscribers
            .retain(|tx| tx.send(Ok(event.clone())).is_ok());

        if entry.subscribers.is_empty() {
            entry.backlog.push_back(event.clone());
        }

        tracing::trace!(topic, message_id = %event.message_id, "Event published");
        Ok(())
    }

    fn subscribe_now(&self, topics: &[&str]) -> Result<EventStream, EventBusError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(EventBusError::SubscriptionFailed {
                topics: topics.iter().map(ToString::to_string).collect(),
                reason: "bus closed".to_string(),
            });
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        for name in topics {
            let topic = state.topics.entry((*name).to_string()).or_default();
            for event in topic.backlog.drain(..) {
                // The receiver is alive in this scope.
                let _ = tx.send(Ok(event));
            }
            topic.subscribers.push(tx.clone());
        }

        Ok(Box::pin(futures::stream::poll_fn(move |cx| {
            rx.poll_recv(cx)
        })))
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        Box::pin(ready(self.publish_now(topic, event)))
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>> {
        Box::pin(ready(self.subscribe_now(topics)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn event(key: &str, byte: u8) -> SerializedEvent {
        SerializedEvent::new("Test.v1".to_string(), key.to_string(), vec![byte], None)
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus = InMemoryEventBus::new();
        let mut stream = bus.subscribe(&["t"]).await.unwrap();

        for i in 0..10 {
            bus.publish("t", &event("k", i)).await.unwrap();
        }

        for i in 0..10 {
            let received = stream.next().await.unwrap().unwrap();
            assert_eq!(received.data, vec![i]);
        }
    }

    #[tokio::test]
    async fn buffers_until_first_subscriber() {
        let bus = InMemoryEventBus::new();
        bus.publish("t", &event("k", 1)).await.unwrap();
        bus.publish("t", &event("k", 2)).await.unwrap();
        assert_eq!(bus.backlog_len("t"), 2);

        let mut stream = bus.subscribe(&["t"]).await.unwrap();
        assert_eq!(bus.backlog_len("t"), 0);
        assert_eq!(stream.next().await.unwrap().unwrap().data, vec![1]);
        assert_eq!(stream.next().await.unwrap().unwrap().data, vec![2]);
    }

    #[tokio::test]
    async fn dropped_subscriber_falls_back_to_backlog() {
        let bus = InMemoryEventBus::new();
        let stream = bus.subscribe(&["t"]).await.unwrap();
        drop(stream);

        bus.publish("t", &event("k", 7)).await.unwrap();
        assert_eq!(bus.backlog_len("t"), 1);
        assert_eq!(bus.published_count("t"), 1);
    }

    #[tokio::test]
    async fn close_ends_streams_and_rejects_publishes() {
        let bus = InMemoryEventBus::new();
        let mut stream = bus.subscribe(&["t"]).await.unwrap();

        bus.close();

        assert!(stream.next().await.is_none());
        assert!(bus.publish("t", &event("k", 1)).await.is_err());
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = InMemoryEventBus::new();
        let mut a = bus.subscribe(&["a"]).await.unwrap();
        bus.publish("b", &event("k", 9)).await.unwrap();
        bus.publish("a", &event("k", 1)).await.unwrap();

        assert_eq!(a.next().await.unwrap().unwrap().data, vec![1]);
        assert_eq!(bus.backlog_len("b"), 1);
    }
}
