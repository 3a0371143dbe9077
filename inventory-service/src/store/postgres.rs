//! Postgres backend. The version-conditional item update, the conditional
//! reservation transition, and the unique (product_id, order_id) key do the
//! concurrency heavy lifting; everything in `apply` runs in one transaction,
//! and the pessimistic path additionally takes a `FOR UPDATE` row lock so
//! the plan always runs against the row it will write.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use uuid::Uuid;

use crate::error::InventoryError;
use crate::models::{
    InventoryItem, InventoryItemRow, NewOutboxEvent, OutboxEvent, OutboxEventRow, OutboxStatus,
    ReservationRow, StockReservation,
};
use crate::schema::{inventory_items, outbox_events, stock_reservations};
use crate::store::{ApplyOutcome, InventoryStore, LedgerPlan, LedgerWrite, ReservationWrite};

type DbPool = Pool<AsyncPgConnection>;

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

/// Lets the transaction closure abort with a conditional outcome or a
/// domain error (rolling back whatever it wrote so far) instead of a
/// database error.
#[derive(Debug)]
enum TxError {
    Db(DieselError),
    Outcome(ApplyOutcome),
    Domain(InventoryError),
}

impl From<DieselError> for TxError {
    fn from(e: DieselError) -> Self {
        TxError::Db(e)
    }
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn pool_err<E: std::fmt::Display>(e: E) -> InventoryError {
    InventoryError::Internal(anyhow!("failed to get db connection: {e}"))
}

fn db_err(e: DieselError) -> InventoryError {
    InventoryError::Internal(e.into())
}

fn finish(result: Result<ApplyOutcome, TxError>) -> Result<ApplyOutcome, InventoryError> {
    match result {
        Ok(outcome) => Ok(outcome),
        Err(TxError::Outcome(outcome)) => Ok(outcome),
        Err(TxError::Domain(e)) => Err(e),
        Err(TxError::Db(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _))) => {
            Ok(ApplyOutcome::DuplicateReservation)
        }
        Err(TxError::Db(e)) => Err(db_err(e)),
    }
}

/// The write half shared by both apply paths; must run inside a transaction.
async fn perform_write(
    conn: &mut AsyncPgConnection,
    write: LedgerWrite,
) -> Result<ApplyOutcome, TxError> {
    let now = Utc::now();

    if let Some(ReservationWrite::Transition {
        reservation_id,
        from,
        to,
        released_at,
    }) = &write.reservation
    {
        let updated = diesel::update(
            stock_reservations::table
                .filter(stock_reservations::id.eq(reservation_id))
                .filter(stock_reservations::status.eq(from.as_str())),
        )
        .set((
            stock_reservations::status.eq(to.as_str()),
            stock_reservations::released_at.eq(*released_at),
        ))
        .execute(conn)
        .await?;
        if updated == 0 {
            return Err(TxError::Outcome(ApplyOutcome::AlreadyTransitioned));
        }
    }

    if write.create_item {
        let inserted = diesel::insert_into(inventory_items::table)
            .values((
                inventory_items::product_id.eq(&write.product_id),
                inventory_items::available_quantity.eq(write.levels.available),
                inventory_items::reserved_quantity.eq(write.levels.reserved),
                inventory_items::total_quantity.eq(write.levels.total),
                inventory_items::version.eq(1i64),
                inventory_items::low_stock_threshold.eq(write.low_stock_threshold),
                inventory_items::created_at.eq(now),
                inventory_items::updated_at.eq(now),
            ))
            .on_conflict(inventory_items::product_id)
            .do_nothing()
            .execute(conn)
            .await?;
        if inserted == 0 {
            return Err(TxError::Outcome(ApplyOutcome::VersionConflict));
        }
    } else {
        let updated = diesel::update(
            inventory_items::table
                .filter(inventory_items::product_id.eq(&write.product_id))
                .filter(inventory_items::version.eq(write.expected_version)),
        )
        .set((
            inventory_items::available_quantity.eq(write.levels.available),
            inventory_items::reserved_quantity.eq(write.levels.reserved),
            inventory_items::total_quantity.eq(write.levels.total),
            inventory_items::version.eq(write.expected_version + 1),
            inventory_items::updated_at.eq(now),
        ))
        .execute(conn)
        .await?;
        if updated == 0 {
            return Err(TxError::Outcome(ApplyOutcome::VersionConflict));
        }
    }

    if let Some(ReservationWrite::Insert(reservation)) = &write.reservation {
        let row = ReservationRow::from(reservation.clone());
        diesel::insert_into(stock_reservations::table)
            .values(&row)
            .execute(conn)
            .await?;
    }

    let event_row = OutboxEventRow::pending(&write.event, now);
    diesel::insert_into(outbox_events::table)
        .values(&event_row)
        .execute(conn)
        .await?;

    Ok(ApplyOutcome::Applied)
}

#[async_trait]
impl InventoryStore for PgStore {
    async fn get_item(&self, product_id: &str) -> Result<Option<InventoryItem>, InventoryError> {
        let mut conn = self.pool.get().await.map_err(pool_err)?;
        let row = inventory_items::table
            .filter(inventory_items::product_id.eq(product_id))
            .first::<InventoryItemRow>(&mut conn)
            .await
            .optional()
            .map_err(db_err)?;
        Ok(row.map(Into::into))
    }

    async fn get_reservation(&self, id: Uuid) -> Result<Option<StockReservation>, InventoryError> {
        let mut conn = self.pool.get().await.map_err(pool_err)?;
        let row = stock_reservations::table
            .filter(stock_reservations::id.eq(id))
            .first::<ReservationRow>(&mut conn)
            .await
            .optional()
            .map_err(db_err)?;
        row.map(TryInto::try_into)
            .transpose()
            .map_err(InventoryError::Internal)
    }

    async fn find_reservation(
        &self,
        product_id: &str,
        order_id: &str,
    ) -> Result<Option<StockReservation>, InventoryError> {
        let mut conn = self.pool.get().await.map_err(pool_err)?;
        let row = stock_reservations::table
            .filter(stock_reservations::product_id.eq(product_id))
            .filter(stock_reservations::order_id.eq(order_id))
            .first::<ReservationRow>(&mut conn)
            .await
            .optional()
            .map_err(db_err)?;
        row.map(TryInto::try_into)
            .transpose()
            .map_err(InventoryError::Internal)
    }

    async fn expired_reservations(
        &self,
        as_of: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<StockReservation>, InventoryError> {
        let mut conn = self.pool.get().await.map_err(pool_err)?;
        let rows = stock_reservations::table
            .filter(stock_reservations::status.eq("ACTIVE"))
            .filter(stock_reservations::expires_at.lt(as_of))
            .order(stock_reservations::expires_at.asc())
            .limit(limit)
            .load::<ReservationRow>(&mut conn)
            .await
            .map_err(db_err)?;
        rows.into_iter()
            .map(|r| r.try_into().map_err(InventoryError::Internal))
            .collect()
    }

    async fn apply(&self, write: LedgerWrite) -> Result<ApplyOutcome, InventoryError> {
        let mut conn = self.pool.get().await.map_err(pool_err)?;
        let result = conn
            .transaction::<ApplyOutcome, TxError, _>(|conn| {
                Box::pin(async move { perform_write(conn, write).await })
            })
            .await;
        finish(result)
    }

    async fn apply_under_lock(
        &self,
        product_id: &str,
        plan: LedgerPlan,
    ) -> Result<ApplyOutcome, InventoryError> {
        let mut conn = self.pool.get().await.map_err(pool_err)?;
        let result = conn
            .transaction::<ApplyOutcome, TxError, _>(|conn| {
                Box::pin(async move {
                    let row = inventory_items::table
                        .filter(inventory_items::product_id.eq(product_id))
                        .for_update()
                        .first::<InventoryItemRow>(conn)
                        .await
                        .optional()?;
                    let write = plan(row.map(Into::into)).map_err(TxError::Domain)?;
                    perform_write(conn, write).await
                })
            })
            .await;
        finish(result)
    }

    async fn append_event(&self, event: NewOutboxEvent) -> Result<Uuid, InventoryError> {
        let mut conn = self.pool.get().await.map_err(pool_err)?;
        let row = OutboxEventRow::pending(&event, Utc::now());
        let id = row.id;
        diesel::insert_into(outbox_events::table)
            .values(&row)
            .execute(&mut conn)
            .await
            .map_err(db_err)?;
        Ok(id)
    }

    async fn claim_events(
        &self,
        max_retries: i32,
        limit: i64,
        as_of: DateTime<Utc>,
        stale_after: chrono::Duration,
    ) -> Result<Vec<OutboxEvent>, InventoryError> {
        let mut conn = self.pool.get().await.map_err(pool_err)?;
        let stale_before = as_of - stale_after;

        let candidates: Vec<Uuid> = outbox_events::table
            .filter(
                outbox_events::status
                    .eq(OutboxStatus::Pending.as_str())
                    .or(outbox_events::status
                        .eq(OutboxStatus::Failed.as_str())
                        .and(outbox_events::retry_count.lt(max_retries)))
                    .or(outbox_events::status
                        .eq(OutboxStatus::Processing.as_str())
                        .and(outbox_events::claimed_at.lt(Some(stale_before)))),
            )
            .order(outbox_events::created_at.asc())
            .limit(limit)
            .select(outbox_events::id)
            .load(&mut conn)
            .await
            .map_err(db_err)?;

        // Per-row conditional claim: a candidate grabbed by a competing
        // processor between the select and this update matches zero rows.
        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            let row = diesel::update(
                outbox_events::table
                    .filter(outbox_events::id.eq(id))
                    .filter(
                        outbox_events::status
                            .eq(OutboxStatus::Pending.as_str())
                            .or(outbox_events::status
                                .eq(OutboxStatus::Failed.as_str())
                                .and(outbox_events::retry_count.lt(max_retries)))
                            .or(outbox_events::status
                                .eq(OutboxStatus::Processing.as_str())
                                .and(outbox_events::claimed_at.lt(Some(stale_before)))),
                    ),
            )
            .set((
                outbox_events::status.eq(OutboxStatus::Processing.as_str()),
                outbox_events::claimed_at.eq(Some(as_of)),
            ))
            .get_result::<OutboxEventRow>(&mut conn)
            .await
            .optional()
            .map_err(db_err)?;
            if let Some(row) = row {
                claimed.push(row.try_into().map_err(InventoryError::Internal)?);
            }
        }
        Ok(claimed)
    }

    async fn mark_event_published(
        &self,
        id: Uuid,
        published_at: DateTime<Utc>,
    ) -> Result<bool, InventoryError> {
        let mut conn = self.pool.get().await.map_err(pool_err)?;
        let updated = diesel::update(
            outbox_events::table
                .filter(outbox_events::id.eq(id))
                .filter(outbox_events::status.ne(OutboxStatus::Published.as_str())),
        )
        .set((
            outbox_events::status.eq(OutboxStatus::Published.as_str()),
            outbox_events::published_at.eq(Some(published_at)),
        ))
        .execute(&mut conn)
        .await
        .map_err(db_err)?;
        Ok(updated > 0)
    }

    async fn mark_event_failed(&self, id: Uuid, error: &str) -> Result<(), InventoryError> {
        let mut conn = self.pool.get().await.map_err(pool_err)?;
        diesel::update(outbox_events::table.filter(outbox_events::id.eq(id)))
            .set((
                outbox_events::status.eq(OutboxStatus::Failed.as_str()),
                outbox_events::retry_count.eq(outbox_events::retry_count + 1),
                outbox_events::error_message.eq(Some(error.to_string())),
            ))
            .execute(&mut conn)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
