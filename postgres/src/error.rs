//! sqlx error mapping and integer conversions shared by the stores.

use boxoffice_core::error::{StoreError, UniqueConstraint};

/// Map a sqlx error onto the storage taxonomy.
///
/// Unique violations are identified by constraint name so callers can tell
/// an idempotent replay from a second active booking.
pub(crate) fn db_error(error: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &error {
        if db.is_unique_violation() {
            let constraint = match db.constraint() {
                Some("event_inventory_pkey") => Some(UniqueConstraint::EventInventory),
                Some("bookings_idempotency_key_key") => Some(UniqueConstraint::IdempotencyKey),
                Some("bookings_active_user_event") => Some(UniqueConstraint::ActiveBooking),
                Some("waitlist_active_user_event") => Some(UniqueConstraint::ActiveWaitlistEntry),
                _ => None,
            };
            if let Some(constraint) = constraint {
                return StoreError::Duplicate(constraint);
            }
        }
        if db.is_check_violation() {
            return StoreError::Invariant(db.message().to_string());
        }
    }
    tracing::warn!(error = %error, "PostgreSQL query failed");
    StoreError::Database(error.to_string())
}

pub(crate) fn to_i32(value: u32, column: &str) -> Result<i32, StoreError> {
    i32::try_from(value)
        .map_err(|_| StoreError::Invariant(format!("{column} {value} does not fit INTEGER")))
}

pub(crate) fn to_u32(value: i32, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Invariant(format!("{column} is negative: {value}")))
}

pub(crate) fn to_i64(value: u64, column: &str) -> Result<i64, StoreError> {
    i64::try_from(value)
        .map_err(|_| StoreError::Invariant(format!("{column} {value} does not fit BIGINT")))
}

pub(crate) fn to_u64(value: i64, column: &str) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Invariant(format!("{column} is negative: {value}")))
}
