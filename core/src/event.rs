//! Events exchanged over the event bus.
//!
//! Events are serialized with `bincode`. The envelope ([`SerializedEvent`])
//! carries a message id for duplicate suppression and a partition key so a
//! distributed bus can keep per-event ordering.
//!
//! # Example
//!
//! ```
//! use boxoffice_core::event::{Event, SeatsFreed, SerializedEvent};
//! use boxoffice_core::types::EventId;
//! use chrono::Utc;
//!
//! let freed = SeatsFreed::new(EventId::new(), 2, Utc::now());
//! let envelope = SerializedEvent::from_event(&freed, None).unwrap();
//! assert_eq!(envelope.event_type, "SeatsFreed.v1");
//! assert_eq!(SeatsFreed::from_bytes(&envelope.data).unwrap(), freed);
//! ```

use crate::types::EventId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use uuid::Uuid;

/// Topic carrying [`SeatsFreed`] events.
pub const SEATS_FREED_TOPIC: &str = "seats-freed";

/// An event could not be turned into bytes or back.
#[derive(Error, Debug)]
pub enum EventError {
    /// Encoding failed.
    #[error("cannot encode event: {0}")]
    Encode(String),

    /// The bytes are not a valid encoding of the requested event type.
    #[error("cannot decode event: {0}")]
    Decode(String),
}

/// An event that can be published on the bus.
///
/// `event_type()` returns a stable, versioned identifier such as
/// `"SeatsFreed.v1"`. `partition_key()` selects the ordering domain: events
/// with the same key are delivered in publish order.
pub trait Event: Send + Sync + 'static {
    /// Versioned event type identifier.
    fn event_type(&self) -> &'static str;

    /// Ordering key for partitioned delivery.
    fn partition_key(&self) -> String;

    /// Serialize this event to bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Encode`] if the event cannot be encoded.
    fn to_bytes(&self) -> Result<Vec<u8>, EventError>
    where
        Self: Serialize,
    {
        bincode::serialize(self).map_err(|e| EventError::Encode(e.to_string()))
    }

    /// Deserialize an event from bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Decode`] if the bytes are corrupted or belong to
    /// a different event type.
    fn from_bytes(bytes: &[u8]) -> Result<Self, EventError>
    where
        Self: DeserializeOwned + Sized,
    {
        bincode::deserialize(bytes).map_err(|e| EventError::Decode(e.to_string()))
    }
}

/// Seats were returned to an event's ledger and waitlisted users may claim them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatsFreed {
    /// Event whose seats were freed
    pub event_id: EventId,
    /// How many seats
    pub quantity: u32,
    /// When the release was committed
    pub freed_at: DateTime<Utc>,
}

impl SeatsFreed {
    /// Versioned type identifier carried in the envelope.
    pub const EVENT_TYPE: &'static str = "SeatsFreed.v1";

    /// Create a seats-freed event.
    #[must_use]
    pub const fn new(event_id: EventId, quantity: u32, freed_at: DateTime<Utc>) -> Self {
        Self {
            event_id,
            quantity,
            freed_at,
        }
    }
}

impl Event for SeatsFreed {
    fn event_type(&self) -> &'static str {
        Self::EVENT_TYPE
    }

    fn partition_key(&self) -> String {
        self.event_id.to_string()
    }
}

/// A serialized event ready for the bus.
#[derive(Clone, Debug)]
pub struct SerializedEvent {
    /// Unique per publish; consumers use it to drop redeliveries.
    pub message_id: Uuid,

    /// The event type identifier (e.g., "SeatsFreed.v1").
    pub event_type: String,

    /// Partition key; ordering is guaranteed among events sharing it.
    pub key: String,

    /// The bincode-serialized event data.
    pub data: Vec<u8>,

    /// Optional metadata (e.g. `booking_id` that caused the event).
    pub metadata: Option<serde_json::Value>,
}

impl SerializedEvent {
    /// Create a new serialized event with a fresh message id.
    #[must_use]
    pub fn new(
        event_type: String,
        key: String,
        data: Vec<u8>,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            event_type,
            key,
            data,
            metadata,
        }
    }

    /// Create a serialized event from an [`Event`].
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Encode`] if the event cannot be encoded.
    pub fn from_event<E: Event + Serialize>(
        event: &E,
        metadata: Option<serde_json::Value>,
    ) -> Result<Self, EventError> {
        Ok(Self::new(
            event.event_type().to_string(),
            event.partition_key(),
            event.to_bytes()?,
            metadata,
        ))
    }
}
