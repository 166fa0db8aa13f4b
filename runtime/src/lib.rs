//! # Box Office Runtime
//!
//! Execution plumbing shared by the inventory services:
//!
//! - **retry**: bounded retries with jittered exponential backoff
//! - **bus**: in-process, per-topic ordered [`EventBus`](boxoffice_core::event_bus::EventBus)
//! - **consumer**: subscribe-process-reconnect loop with graceful shutdown
//! - **metrics**: Prometheus exporter and metric descriptions

/// Retry logic with jittered exponential backoff
pub mod retry;

/// In-process event bus
pub mod bus;

/// Resilient event bus consumer
pub mod consumer;

/// Prometheus metrics for observability
pub mod metrics;

pub use bus::InMemoryEventBus;
pub use consumer::{EventConsumer, EventHandler};
pub use retry::{RetryPolicy, retry_with_predicate};
