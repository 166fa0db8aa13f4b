use crate::error::{db_error, to_i32, to_u32};
use boxoffice_core::error::StoreError;
use boxoffice_core::store::{BookingStore, StoreFuture};
use boxoffice_core::types::{
    Booking, BookingId, BookingStatus, EventId, IdempotencyKey, UserId,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

const COLUMNS: &str =
    "booking_id, user_id, event_id, quantity, status, idempotency_key, created_at";

/// Booking rows in the `bookings` table.
#[derive(Clone, Debug)]
pub struct PgBookingStore {
    pool: PgPool,
}

impl PgBookingStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn get_inner(&self, booking_id: BookingId) -> Result<Option<Booking>, StoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM bookings WHERE booking_id = $1"))
            .bind(booking_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.as_ref().map(booking_from_row).transpose()
    }
}

fn booking_from_row(row: &PgRow) -> Result<Booking, StoreError> {
    let booking_id: Uuid = row.try_get("booking_id").map_err(db_error)?;
    let user_id: Uuid = row.try_get("user_id").map_err(db_error)?;
    let event_id: Uuid = row.try_get("event_id").map_err(db_error)?;
    let quantity: i32 = row.try_get("quantity").map_err(db_error)?;
    let status: String = row.try_get("status").map_err(db_error)?;
    let key: String = row.try_get("idempotency_key").map_err(db_error)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(db_error)?;

    let status = BookingStatus::parse(&status).ok_or_else(|| {
        StoreError::Invariant(format!("booking {booking_id} has unknown status {status}"))
    })?;

    Ok(Booking {
        booking_id: BookingId::from_uuid(booking_id),
        user_id: UserId::from_uuid(user_id),
        event_id: EventId::from_uuid(event_id),
        quantity: to_u32(quantity, "quantity")?,
        status,
        idempotency_key: IdempotencyKey::new(key),
        created_at,
    })
}

impl BookingStore for PgBookingStore {
    fn insert(&self, booking: Booking) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(&format!(
                "INSERT INTO bookings ({COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)"
            ))
            .bind(booking.booking_id.as_uuid())
            .bind(booking.user_id.as_uuid())
            .bind(booking.event_id.as_uuid())
            .bind(to_i32(booking.quantity, "quantity")?)
            .bind(booking.status.as_str())
            .bind(booking.idempotency_key.as_str())
            .bind(booking.created_at)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
            Ok(())
        })
    }

    fn get(&self, booking_id: BookingId) -> StoreFuture<'_, Option<Booking>> {
        Box::pin(self.get_inner(booking_id))
    }

    fn find_by_idempotency_key<'a>(
        &'a self,
        key: &'a IdempotencyKey,
    ) -> StoreFuture<'a, Option<Booking>> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM bookings WHERE idempotency_key = $1"
            ))
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

            row.as_ref().map(booking_from_row).transpose()
        })
    }

    fn find_active(
        &self,
        user_id: UserId,
        event_id: EventId,
    ) -> StoreFuture<'_, Option<Booking>> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM bookings \
                 WHERE user_id = $1 AND event_id = $2 AND status = 'CONFIRMED'"
            ))
            .bind(user_id.as_uuid())
            .bind(event_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

            row.as_ref().map(booking_from_row).transpose()
        })
    }

    fn cancel(&self, booking_id: BookingId) -> StoreFuture<'_, Booking> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                "UPDATE bookings SET status = 'CANCELLED' \
                 WHERE booking_id = $1 AND status = 'CONFIRMED' \
                 RETURNING {COLUMNS}"
            ))
            .bind(booking_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

            if let Some(row) = row {
                return booking_from_row(&row);
            }

            match self.get_inner(booking_id).await? {
                Some(current) => Err(StoreError::StatusMismatch {
                    id: booking_id.to_string(),
                    expected: BookingStatus::Confirmed.as_str(),
                    actual: current.status.as_str(),
                }),
                None => Err(StoreError::NotFound(format!("booking {booking_id}"))),
            }
        })
    }

    fn restore(&self, booking_id: BookingId) -> StoreFuture<'_, Booking> {
        Box::pin(async move {
            // The partial unique index on confirmed (user_id, event_id)
            // rejects the update if the user has booked again since.
            let row = sqlx::query(&format!(
                "UPDATE bookings SET status = 'CONFIRMED' \
                 WHERE booking_id = $1 AND status = 'CANCELLED' \
                 RETURNING {COLUMNS}"
            ))
            .bind(booking_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

            if let Some(row) = row {
                return booking_from_row(&row);
            }

            match self.get_inner(booking_id).await? {
                Some(current) => Err(StoreError::StatusMismatch {
                    id: booking_id.to_string(),
                    expected: BookingStatus::Cancelled.as_str(),
                    actual: current.status.as_str(),
                }),
                None => Err(StoreError::NotFound(format!("booking {booking_id}"))),
            }
        })
    }
}
