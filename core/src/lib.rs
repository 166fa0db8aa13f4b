//! # Box Office Core
//!
//! Domain types, error taxonomy and environment traits for the ticket
//! inventory core.
//!
//! This crate holds no I/O. It defines what the services in the `boxoffice`
//! crate operate on and the seams where storage, time, notification delivery
//! and the event pipeline are injected.
//!
//! ## Core Concepts
//!
//! - **Event inventory**: `capacity` / `available` / `version` counters per event,
//!   mutated only through compare-and-set
//! - **Booking**: a confirmed or cancelled claim on seats, keyed by an idempotency key
//! - **Waitlist entry**: a FIFO position that moves `WAITING → NOTIFIED → {EXPIRED, CONVERTED}`
//! - **Seats freed**: the event that connects cancellation to waitlist advancement
//!
//! ## Seams
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`environment::Clock`] | Current time, injectable for tests |
//! | [`store::InventoryStore`] | Per-event counters with optimistic concurrency |
//! | [`store::BookingStore`] | Booking rows with uniqueness constraints |
//! | [`store::WaitlistStore`] | Serialised position assignment and gap closing |
//! | [`notify::Notifier`] | Outbound `notify(user, payload)` capability |
//! | [`event_bus::EventBus`] | Ordered, at-least-once delivery of seats-freed events |

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod environment;
pub mod error;
pub mod event;
pub mod event_bus;
pub mod notify;
pub mod store;
pub mod types;

pub use error::{ErrorKind, StoreError, UniqueConstraint};
pub use types::{
    Booking, BookingId, BookingStatus, EventId, EventInventory, IdempotencyKey, SeatNotification,
    UserId, WaitlistEntry, WaitlistId, WaitlistStatus,
};
