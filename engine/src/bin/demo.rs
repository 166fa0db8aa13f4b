//! Box Office Demo
//!
//! Walks through the single-seat scenario end to end:
//! - A sold-out event and a user joining its waitlist
//! - Cancellation freeing the seat and notifying the head of the queue
//! - The notified user booking within the window (entry converted)
//! - A second round where the window lapses and the sweeper expires the entry
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin demo
//!
//! # With Prometheus metrics on :9090
//! METRICS_ENABLED=true cargo run --bin demo
//! ```

use anyhow::{Context, bail};
use boxoffice::{BoxOffice, Config, TracingNotifier};
use boxoffice_core::environment::Clock;
use boxoffice_core::types::{EventId, IdempotencyKey, UserId, WaitlistId, WaitlistStatus};
use boxoffice_runtime::metrics::MetricsServer;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Wall clock that can be pushed forward, so the demo need not wait ten
/// minutes for a booking window to lapse.
struct FastForwardClock {
    offset: Mutex<chrono::Duration>,
}

impl FastForwardClock {
    fn new() -> Self {
        Self {
            offset: Mutex::new(chrono::Duration::zero()),
        }
    }

    fn advance(&self, by: chrono::Duration) {
        *self.offset.lock().unwrap_or_else(PoisonError::into_inner) += by;
    }
}

impl Clock for FastForwardClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Poll until the consumer has moved the entry to `status`.
async fn wait_for_status(
    app: &BoxOffice,
    waitlist_id: WaitlistId,
    status: WaitlistStatus,
) -> anyhow::Result<()> {
    for _ in 0..100 {
        if app.waitlist().get_entry(waitlist_id).await?.status == status {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    bail!("waitlist entry {waitlist_id} never reached {status}")
}

/// Sell the only seat, queue a second user and free the seat again.
///
/// Returns the waiting user and their entry once it is `NOTIFIED`.
async fn sell_out_and_free(
    app: &BoxOffice,
    clock: &FastForwardClock,
    label: &str,
) -> anyhow::Result<(EventId, UserId, WaitlistId)> {
    let event_id = EventId::new();
    app.ledger()
        .register(event_id, 1, clock.now() + chrono::Duration::days(30))
        .await?;
    println!("   Event {event_id} registered with 1 seat");

    let holder = UserId::new();
    let booking = app
        .bookings()
        .create_booking(holder, event_id, 1, IdempotencyKey::new(format!("{label}-holder")))
        .await?
        .booking;
    let available = app.ledger().inventory(event_id).await?.available;
    println!("   U1 booked {} (available = {available})", booking.booking_id);

    let waiter = UserId::new();
    let entry = app.waitlist().join(waiter, event_id).await?;
    println!("   U2 joined the waitlist at position {}", entry.position);

    app.bookings().cancel_booking(booking.booking_id).await?;
    println!("   U1 cancelled; seats-freed event published");

    wait_for_status(app, entry.waitlist_id, WaitlistStatus::Notified).await?;
    let entry = app.waitlist().get_entry(entry.waitlist_id).await?;
    let expires_at = entry
        .expires_at
        .context("notified entry has no booking deadline")?;
    println!("   U2 notified, window open until {expires_at}");

    Ok((event_id, waiter, entry.waitlist_id))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.server.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut metrics = MetricsServer::new(config.metrics_addr());
    if config.server.metrics_enabled {
        metrics.start()?;
    }

    println!("\n============================================");
    println!("   Box Office - Waitlist Demo");
    println!("============================================\n");

    let clock = Arc::new(FastForwardClock::new());
    let mut app = BoxOffice::from_config(config, clock.clone(), Arc::new(TracingNotifier)).await?;
    app.start()?;
    println!("Application started\n");

    // ========== Round 1: notified user books in time ==========

    println!("1. Notified user books within the window");
    let (event_id, waiter, waitlist_id) = sell_out_and_free(&app, &clock, "round-1").await?;

    let result = app
        .bookings()
        .create_booking(waiter, event_id, 1, IdempotencyKey::new("round-1-waiter"))
        .await?;
    let entry = app.waitlist().get_entry(waitlist_id).await?;
    println!(
        "   U2 booked {} -> waitlist entry {}\n",
        result.booking.booking_id, entry.status
    );

    // ========== Round 2: window lapses ==========

    println!("2. Notified user lets the window lapse");
    let (_, _, waitlist_id) = sell_out_and_free(&app, &clock, "round-2").await?;

    let window = app.coordinator().booking_window();
    clock.advance(window + chrono::Duration::minutes(1));
    println!("   Clock advanced past the {}-minute window", window.num_minutes());

    let expired = app.sweeper().sweep().await?;
    let entry = app.waitlist().get_entry(waitlist_id).await?;
    println!(
        "   Sweeper expired {expired} entry -> waitlist entry {}; queue empty, nobody else notified\n",
        entry.status
    );

    if let Some(rendered) = metrics.render() {
        println!("Metrics snapshot:\n{rendered}");
    }

    app.shutdown().await;
    println!("Demo complete");
    Ok(())
}
