use crate::error::{db_error, to_i32, to_i64, to_u32, to_u64};
use boxoffice_core::error::StoreError;
use boxoffice_core::store::{CasOutcome, InventoryStore, StoreFuture};
use boxoffice_core::types::{EventId, EventInventory};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

const COLUMNS: &str = "event_id, capacity, available, version, starts_at";

/// Seat counters in the `event_inventory` table.
///
/// `compare_and_set` is a single `UPDATE ... WHERE version = $expected`, so
/// concurrent writers on different nodes serialise on the row.
#[derive(Clone, Debug)]
pub struct PgInventoryStore {
    pool: PgPool,
}

impl PgInventoryStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_inner(&self, event_id: EventId) -> Result<Option<EventInventory>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM event_inventory WHERE event_id = $1"
        ))
        .bind(event_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.as_ref().map(inventory_from_row).transpose()
    }
}

fn inventory_from_row(row: &PgRow) -> Result<EventInventory, StoreError> {
    let event_id: Uuid = row.try_get("event_id").map_err(db_error)?;
    let capacity: i32 = row.try_get("capacity").map_err(db_error)?;
    let available: i32 = row.try_get("available").map_err(db_error)?;
    let version: i64 = row.try_get("version").map_err(db_error)?;
    let starts_at: DateTime<Utc> = row.try_get("starts_at").map_err(db_error)?;

    Ok(EventInventory {
        event_id: EventId::from_uuid(event_id),
        capacity: to_u32(capacity, "capacity")?,
        available: to_u32(available, "available")?,
        version: to_u64(version, "version")?,
        starts_at,
    })
}

impl InventoryStore for PgInventoryStore {
    fn insert(&self, inventory: EventInventory) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(&format!(
                "INSERT INTO event_inventory ({COLUMNS}) VALUES ($1, $2, $3, $4, $5)"
            ))
            .bind(inventory.event_id.as_uuid())
            .bind(to_i32(inventory.capacity, "capacity")?)
            .bind(to_i32(inventory.available, "available")?)
            .bind(to_i64(inventory.version, "version")?)
            .bind(inventory.starts_at)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

            tracing::debug!(
                event_id = %inventory.event_id,
                capacity = inventory.capacity,
                "Inventory record inserted"
            );
            Ok(())
        })
    }

    fn load(&self, event_id: EventId) -> StoreFuture<'_, Option<EventInventory>> {
        Box::pin(self.load_inner(event_id))
    }

    fn compare_and_set(
        &self,
        event_id: EventId,
        expected_version: u64,
        available: u32,
    ) -> StoreFuture<'_, CasOutcome> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                "UPDATE event_inventory \
                 SET available = $3, version = version + 1 \
                 WHERE event_id = $1 AND version = $2 \
                 RETURNING {COLUMNS}"
            ))
            .bind(event_id.as_uuid())
            .bind(to_i64(expected_version, "version")?)
            .bind(to_i32(available, "available")?)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

            if let Some(row) = row {
                return Ok(CasOutcome::Applied(inventory_from_row(&row)?));
            }

            match self.load_inner(event_id).await? {
                Some(current) => Ok(CasOutcome::Stale(current)),
                None => Err(StoreError::NotFound(format!("inventory for event {event_id}"))),
            }
        })
    }
}
