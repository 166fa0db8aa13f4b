//! Prometheus metrics for observability and monitoring.
//!
//! Covers the seat ledger, bookings, the waitlist, notification delivery,
//! the expiry sweeper, the event bus and retries.
//!
//! # Example
//!
//! ```rust,no_run
//! use boxoffice_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Serve metrics on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use thiserror::Error;

// Re-export metrics macros for use in other crates
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the global recorder and spawn the HTTP listener.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or a different recorder
    /// is already installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                tokio::spawn(async move {
                    if exporter.await.is_err() {
                        tracing::error!("Metrics exporter stopped");
                    }
                });
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics server started - available at http://{}/metrics",
                    self.addr
                );
                Ok(())
            },
            Err(e) => Err(MetricsError::Install(e.to_string())),
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Seat ledger
    describe_counter!(
        "ledger_reserve_total",
        "Reserve attempts by outcome (ok, insufficient, conflict)"
    );
    describe_counter!("ledger_seats_reserved_total", "Seats taken from the ledger");
    describe_counter!("ledger_seats_released_total", "Seats returned to the ledger");
    describe_counter!(
        "ledger_invariant_violations_total",
        "Releases rejected because they would exceed capacity"
    );

    // Bookings
    describe_counter!("bookings_created_total", "Bookings confirmed");
    describe_counter!(
        "bookings_replayed_total",
        "Booking requests answered from an existing idempotency key"
    );
    describe_counter!("bookings_rejected_total", "Booking requests rejected by reason");
    describe_counter!("bookings_cancelled_total", "Bookings cancelled");
    describe_counter!(
        "bookings_compensated_total",
        "Reservations rolled back after a failed booking write"
    );
    describe_counter!(
        "booking_cancel_restored_total",
        "Cancellations undone because the seats could not be released"
    );

    // Waitlist
    describe_counter!("waitlist_joined_total", "Waitlist entries created");
    describe_counter!("waitlist_left_total", "Waitlist entries removed by their user");
    describe_counter!("waitlist_notified_total", "Entries moved to NOTIFIED");
    describe_counter!("waitlist_converted_total", "Entries moved to CONVERTED");
    describe_counter!("waitlist_expired_total", "Entries moved to EXPIRED");

    // Notification delivery
    describe_counter!(
        "notifications_sent_total",
        "Seat notifications delivered to the notification collaborator"
    );
    describe_counter!(
        "notifications_failed_total",
        "Seat notifications the collaborator failed to deliver"
    );

    // Sweeper
    describe_histogram!("sweep_duration_seconds", "Time taken by one expiry sweep");
    describe_gauge!("sweep_last_advanced", "Entries advanced by the last sweep");
    describe_gauge!(
        "sweep_owed_events",
        "Events with advancements owed to the next sweep"
    );

    // Event bus
    describe_counter!(
        "event_bus_messages_published_total",
        "Total number of messages published to event bus"
    );
    describe_counter!(
        "event_bus_publish_errors_total",
        "Total number of publish errors"
    );
    describe_counter!(
        "event_bus_messages_consumed_total",
        "Total number of messages consumed from event bus"
    );
    describe_counter!(
        "event_bus_consume_errors_total",
        "Total number of consume errors"
    );
    describe_counter!(
        "event_bus_duplicates_dropped_total",
        "Redelivered messages dropped by message id"
    );
    describe_counter!(
        "event_bus_messages_dropped_total",
        "Messages dropped after their last failed delivery"
    );

    // Retry
    describe_counter!("retry_attempts_total", "Total number of retry attempts");
    describe_counter!("retry_successes_total", "Total number of successful retries");
    describe_counter!(
        "retry_exhausted_total",
        "Total number of retry attempts that exhausted max retries"
    );
}
