//! # Box Office
//!
//! Ticket inventory core: an oversell-proof seat ledger, idempotent bookings
//! and a fair FIFO waitlist that hands freed seats to the next user in line
//! with a time-boxed booking window.
//!
//! ## Services
//!
//! | Service | Responsibility |
//! |---------|----------------|
//! | [`SeatLedger`] | Compare-and-set reserve/release with bounded retries |
//! | [`BookingOrchestrator`] | Idempotent create, cancel, compensation |
//! | [`WaitlistQueue`] | Join, leave and dense positions |
//! | [`NotificationCoordinator`] | `WAITING → NOTIFIED → {EXPIRED, CONVERTED}` |
//! | [`Sweeper`] | Periodic expiry of lapsed booking windows |
//!
//! Cancellation publishes a seats-freed event; [`SeatsFreedHandler`] consumes
//! it and drives the coordinator. [`BoxOffice`] wires everything together.
//!
//! ## Example
//!
//! ```no_run
//! use boxoffice::{BoxOffice, Config, TracingNotifier};
//! use boxoffice_core::environment::SystemClock;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), boxoffice::AppError> {
//! let mut app = BoxOffice::from_config(
//!     Config::from_env(),
//!     Arc::new(SystemClock),
//!     Arc::new(TracingNotifier),
//! )
//! .await?;
//! app.start()?;
//! app.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod app;
pub mod booking;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod handler;
pub mod ledger;
pub mod memory;
pub mod notify;
pub mod sweeper;
pub mod waitlist;

pub use app::{AppError, BoxOffice, Stores};
pub use booking::{BookingOrchestrator, BookingResult};
pub use config::{Config, StorageBackend};
pub use coordinator::NotificationCoordinator;
pub use error::{BookingError, LedgerError, WaitlistError};
pub use handler::SeatsFreedHandler;
pub use ledger::SeatLedger;
pub use notify::{MultiChannelNotifier, TracingNotifier};
pub use sweeper::Sweeper;
pub use waitlist::WaitlistQueue;
