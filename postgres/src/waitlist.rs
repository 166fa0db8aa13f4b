use crate::error::{db_error, to_i32, to_u32};
use boxoffice_core::error::StoreError;
use boxoffice_core::store::{Enqueued, StoreFuture, WaitlistStore, check_transition};
use boxoffice_core::types::{EventId, UserId, WaitlistEntry, WaitlistId, WaitlistStatus};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

const COLUMNS: &str =
    "waitlist_id, user_id, event_id, position, status, created_at, notified_at, expires_at";

/// Waitlist entries in the `waitlist_entries` table.
///
/// Join, leave and head promotion take a transaction-scoped advisory lock
/// keyed on the event, then read and renumber positions inside the same
/// transaction. Nodes sharing the database therefore never hand out the
/// same position twice.
#[derive(Clone, Debug)]
pub struct PgWaitlistStore {
    pool: PgPool,
}

impl PgWaitlistStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn get_inner(&self, waitlist_id: WaitlistId) -> Result<Option<WaitlistEntry>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM waitlist_entries WHERE waitlist_id = $1"
        ))
        .bind(waitlist_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.as_ref().map(entry_from_row).transpose()
    }

    async fn enqueue_inner(
        &self,
        user_id: UserId,
        event_id: EventId,
        now: DateTime<Utc>,
        max_waiting: u32,
    ) -> Result<Enqueued, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        lock_event(&mut tx, event_id).await?;

        let existing = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM waitlist_entries \
             WHERE user_id = $1 AND event_id = $2 AND status IN ('WAITING', 'NOTIFIED')"
        ))
        .bind(user_id.as_uuid())
        .bind(event_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?;
        if let Some(row) = existing {
            return Ok(Enqueued::Existing(entry_from_row(&row)?));
        }

        let waiting: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM waitlist_entries WHERE event_id = $1 AND status = 'WAITING'",
        )
        .bind(event_id.as_uuid())
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;
        let waiting = u32::try_from(waiting).unwrap_or(u32::MAX);
        if waiting >= max_waiting {
            return Ok(Enqueued::Full);
        }

        let entry = WaitlistEntry::waiting(user_id, event_id, waiting + 1, now);
        sqlx::query(
            "INSERT INTO waitlist_entries (waitlist_id, user_id, event_id, position, status, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(entry.waitlist_id.as_uuid())
        .bind(entry.user_id.as_uuid())
        .bind(entry.event_id.as_uuid())
        .bind(to_i32(entry.position, "position")?)
        .bind(entry.status.as_str())
        .bind(entry.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        tracing::debug!(
            waitlist_id = %entry.waitlist_id,
            event_id = %event_id,
            position = entry.position,
            "Waitlist entry inserted"
        );
        Ok(Enqueued::Created(entry))
    }

    async fn remove_waiting_inner(
        &self,
        waitlist_id: WaitlistId,
    ) -> Result<WaitlistEntry, StoreError> {
        let event_id = self
            .get_inner(waitlist_id)
            .await?
            .ok_or_else(|| not_found(waitlist_id))?
            .event_id;

        let mut tx = self.pool.begin().await.map_err(db_error)?;
        lock_event(&mut tx, event_id).await?;

        // Re-read under the lock; the entry may have been promoted meanwhile.
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM waitlist_entries WHERE waitlist_id = $1"
        ))
        .bind(waitlist_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?
        .ok_or_else(|| not_found(waitlist_id))?;
        let entry = entry_from_row(&row)?;
        if entry.status != WaitlistStatus::Waiting {
            return Err(StoreError::StatusMismatch {
                id: waitlist_id.to_string(),
                expected: WaitlistStatus::Waiting.as_str(),
                actual: entry.status.as_str(),
            });
        }

        sqlx::query("DELETE FROM waitlist_entries WHERE waitlist_id = $1")
            .bind(waitlist_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        close_gap(&mut tx, event_id, entry.position).await?;

        tx.commit().await.map_err(db_error)?;
        Ok(entry)
    }

    async fn promote_head_inner(
        &self,
        event_id: EventId,
        notified_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<WaitlistEntry>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        lock_event(&mut tx, event_id).await?;

        let row = sqlx::query(&format!(
            "UPDATE waitlist_entries \
             SET status = 'NOTIFIED', notified_at = $2, expires_at = $3 \
             WHERE waitlist_id = ( \
                 SELECT waitlist_id FROM waitlist_entries \
                 WHERE event_id = $1 AND status = 'WAITING' \
                 ORDER BY position LIMIT 1 \
             ) \
             RETURNING {COLUMNS}"
        ))
        .bind(event_id.as_uuid())
        .bind(notified_at)
        .bind(expires_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let promoted = entry_from_row(&row)?;
        close_gap(&mut tx, event_id, promoted.position).await?;

        tx.commit().await.map_err(db_error)?;
        Ok(Some(promoted))
    }

    async fn transition_inner(
        &self,
        waitlist_id: WaitlistId,
        from: WaitlistStatus,
        to: WaitlistStatus,
    ) -> Result<WaitlistEntry, StoreError> {
        check_transition(from, to)?;

        let row = sqlx::query(&format!(
            "UPDATE waitlist_entries SET status = $3 \
             WHERE waitlist_id = $1 AND status = $2 \
             RETURNING {COLUMNS}"
        ))
        .bind(waitlist_id.as_uuid())
        .bind(from.as_str())
        .bind(to.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        if let Some(row) = row {
            return entry_from_row(&row);
        }
        match self.get_inner(waitlist_id).await? {
            Some(current) => Err(StoreError::StatusMismatch {
                id: waitlist_id.to_string(),
                expected: from.as_str(),
                actual: current.status.as_str(),
            }),
            None => Err(not_found(waitlist_id)),
        }
    }

    async fn fetch_all(
        &self,
        sql: &str,
        bind: Uuid,
    ) -> Result<Vec<WaitlistEntry>, StoreError> {
        let rows = sqlx::query(sql)
            .bind(bind)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        rows.iter().map(entry_from_row).collect()
    }
}

/// Serialise queue mutations of one event across every connection.
async fn lock_event(conn: &mut PgConnection, event_id: EventId) -> Result<(), StoreError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::uuid::text, 0))")
        .bind(event_id.as_uuid())
        .execute(conn)
        .await
        .map_err(db_error)?;
    Ok(())
}

/// Shift every `WAITING` entry behind `vacated` one place forward.
async fn close_gap(
    conn: &mut PgConnection,
    event_id: EventId,
    vacated: u32,
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE waitlist_entries SET position = position - 1 \
         WHERE event_id = $1 AND status = 'WAITING' AND position > $2",
    )
    .bind(event_id.as_uuid())
    .bind(to_i32(vacated, "position")?)
    .execute(conn)
    .await
    .map_err(db_error)?;
    Ok(())
}

fn entry_from_row(row: &PgRow) -> Result<WaitlistEntry, StoreError> {
    let waitlist_id: Uuid = row.try_get("waitlist_id").map_err(db_error)?;
    let user_id: Uuid = row.try_get("user_id").map_err(db_error)?;
    let event_id: Uuid = row.try_get("event_id").map_err(db_error)?;
    let position: i32 = row.try_get("position").map_err(db_error)?;
    let status: String = row.try_get("status").map_err(db_error)?;

    let status = WaitlistStatus::parse(&status).ok_or_else(|| {
        StoreError::Invariant(format!("waitlist entry {waitlist_id} has unknown status {status}"))
    })?;

    Ok(WaitlistEntry {
        waitlist_id: WaitlistId::from_uuid(waitlist_id),
        user_id: UserId::from_uuid(user_id),
        event_id: EventId::from_uuid(event_id),
        position: to_u32(position, "position")?,
        status,
        created_at: row.try_get("created_at").map_err(db_error)?,
        notified_at: row.try_get("notified_at").map_err(db_error)?,
        expires_at: row.try_get("expires_at").map_err(db_error)?,
    })
}

fn not_found(id: WaitlistId) -> StoreError {
    StoreError::NotFound(format!("waitlist entry {id}"))
}

impl WaitlistStore for PgWaitlistStore {
    fn enqueue(
        &self,
        user_id: UserId,
        event_id: EventId,
        now: DateTime<Utc>,
        max_waiting: u32,
    ) -> StoreFuture<'_, Enqueued> {
        Box::pin(self.enqueue_inner(user_id, event_id, now, max_waiting))
    }

    fn get(&self, waitlist_id: WaitlistId) -> StoreFuture<'_, Option<WaitlistEntry>> {
        Box::pin(self.get_inner(waitlist_id))
    }

    fn find_active(
        &self,
        user_id: UserId,
        event_id: EventId,
    ) -> StoreFuture<'_, Option<WaitlistEntry>> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM waitlist_entries \
                 WHERE user_id = $1 AND event_id = $2 AND status IN ('WAITING', 'NOTIFIED')"
            ))
            .bind(user_id.as_uuid())
            .bind(event_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

            row.as_ref().map(entry_from_row).transpose()
        })
    }

    fn live_position(&self, waitlist_id: WaitlistId) -> StoreFuture<'_, Option<u32>> {
        Box::pin(async move {
            let row = sqlx::query(
                "SELECT w.status, \
                        (SELECT COUNT(*) FROM waitlist_entries o \
                         WHERE o.event_id = w.event_id AND o.status = 'WAITING' \
                           AND o.position < w.position) + 1 AS live_rank \
                 FROM waitlist_entries w WHERE w.waitlist_id = $1",
            )
            .bind(waitlist_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .ok_or_else(|| not_found(waitlist_id))?;

            let status: String = row.try_get("status").map_err(db_error)?;
            if status != WaitlistStatus::Waiting.as_str() {
                return Ok(None);
            }
            let rank: i64 = row.try_get("live_rank").map_err(db_error)?;
            Ok(Some(u32::try_from(rank).unwrap_or(u32::MAX)))
        })
    }

    fn remove_waiting(&self, waitlist_id: WaitlistId) -> StoreFuture<'_, WaitlistEntry> {
        Box::pin(self.remove_waiting_inner(waitlist_id))
    }

    fn waiting(&self, event_id: EventId) -> StoreFuture<'_, Vec<WaitlistEntry>> {
        Box::pin(async move {
            self.fetch_all(
                &format!(
                    "SELECT {COLUMNS} FROM waitlist_entries \
                     WHERE event_id = $1 AND status = 'WAITING' ORDER BY position"
                ),
                *event_id.as_uuid(),
            )
            .await
        })
    }

    fn for_user(&self, user_id: UserId) -> StoreFuture<'_, Vec<WaitlistEntry>> {
        Box::pin(async move {
            self.fetch_all(
                &format!(
                    "SELECT {COLUMNS} FROM waitlist_entries \
                     WHERE user_id = $1 ORDER BY created_at DESC, seq DESC"
                ),
                *user_id.as_uuid(),
            )
            .await
        })
    }

    fn head(&self, event_id: EventId) -> StoreFuture<'_, Option<WaitlistEntry>> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM waitlist_entries \
                 WHERE event_id = $1 AND status = 'WAITING' ORDER BY position LIMIT 1"
            ))
            .bind(event_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

            row.as_ref().map(entry_from_row).transpose()
        })
    }

    fn promote_head(
        &self,
        event_id: EventId,
        notified_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<WaitlistEntry>> {
        Box::pin(self.promote_head_inner(event_id, notified_at, expires_at))
    }

    fn transition(
        &self,
        waitlist_id: WaitlistId,
        from: WaitlistStatus,
        to: WaitlistStatus,
    ) -> StoreFuture<'_, WaitlistEntry> {
        Box::pin(self.transition_inner(waitlist_id, from, to))
    }

    fn overdue(&self, now: DateTime<Utc>) -> StoreFuture<'_, Vec<WaitlistEntry>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM waitlist_entries \
                 WHERE status = 'NOTIFIED' AND expires_at < $1 ORDER BY expires_at"
            ))
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
            rows.iter().map(entry_from_row).collect()
        })
    }
}
