//! `PostgreSQL` storage for the box office.
//!
//! Implements the storage traits from `boxoffice-core` on top of a sqlx
//! connection pool:
//!
//! - [`PgInventoryStore`]: compare-and-set on a `version` column
//! - [`PgBookingStore`]: uniqueness enforced by a unique key and a partial unique index
//! - [`PgWaitlistStore`]: every mutation of one event's queue runs in a
//!   transaction holding a per-event advisory lock
//!
//! # Example
//!
//! ```no_run
//! use boxoffice_postgres::{PgInventoryStore, connect, migrate};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = connect("postgres://localhost/boxoffice", 10).await?;
//! migrate(&pool).await?;
//! let inventory = PgInventoryStore::new(pool);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

mod bookings;
mod error;
mod inventory;
mod waitlist;

pub use bookings::PgBookingStore;
pub use inventory::PgInventoryStore;
pub use sqlx::PgPool;
pub use waitlist::PgWaitlistStore;

use sqlx::postgres::PgPoolOptions;

/// Open a connection pool.
///
/// # Errors
///
/// Returns [`sqlx::Error`] if the database cannot be reached.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// Apply the bundled schema migrations.
///
/// # Errors
///
/// Returns [`sqlx::migrate::MigrateError`] if a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
