//! SQLite-backed order store.
//!
//! The invariants are enforced by the storage layer itself: partial unique
//! indexes over verified rows back a single conditional `UPDATE` that
//! performs the Pending -> Verified transition. Classification of a refused
//! transition happens inside the same database transaction, so the reported
//! reason is consistent with the state that refused it.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::SqlitePool;
use tracing::{debug, info};

use super::{OrderStore, StoreError, VerifyOutcome};
use crate::order::{FulfillmentState, Order, OrderStatus};

/// Schema, applied idempotently at startup. The two partial unique indexes
/// are the storage-level guarantee behind the single-sale and
/// transaction-uniqueness invariants.
const SCHEMA: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS orders (
        order_id     TEXT PRIMARY KEY,
        card_id      INTEGER NOT NULL,
        email        TEXT NOT NULL,
        payable_inr  INTEGER NOT NULL,
        txn_id       TEXT,
        status       TEXT NOT NULL DEFAULT 'pending',
        fulfillment  TEXT NOT NULL DEFAULT 'none',
        created_at   TEXT NOT NULL,
        verified_at  TEXT
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS orders_one_sale_per_card
        ON orders(card_id) WHERE status = 'verified'",
    "CREATE UNIQUE INDEX IF NOT EXISTS orders_one_order_per_txn
        ON orders(txn_id) WHERE status = 'verified'",
];

/// How long a writer waits on SQLite's internal lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite order store.
pub struct SqliteOrderStore {
    pool: SqlitePool,
    op_timeout: Duration,
}

impl SqliteOrderStore {
    /// Open (creating if necessary) the database at `path` and apply the
    /// schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub async fn open(path: &Path, op_timeout: Duration) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        info!("sqlite order store ready at {}", path.display());
        Ok(Self { pool, op_timeout })
    }

    /// Run a store operation under the bounded timeout.
    async fn timed<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>> + Send,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout),
        }
    }
}

async fn fetch_order<'e, E>(executor: E, order_id: &str) -> Result<Option<Order>, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    Ok(
        sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE order_id = ?1")
            .bind(order_id)
            .fetch_optional(executor)
            .await?,
    )
}

#[async_trait]
impl OrderStore for SqliteOrderStore {
    async fn create(&self, order: &Order) -> Result<(), StoreError> {
        let op = async {
            let result = sqlx::query(
                "INSERT INTO orders
                    (order_id, card_id, email, payable_inr, txn_id, status,
                     fulfillment, created_at, verified_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )
            .bind(&order.order_id)
            .bind(order.card_id)
            .bind(&order.email)
            .bind(order.payable_inr)
            .bind(&order.txn_id)
            .bind(order.status)
            .bind(order.fulfillment)
            .bind(order.created_at)
            .bind(order.verified_at)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => Ok(()),
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    Err(StoreError::DuplicateOrderId)
                }
                Err(e) => Err(e.into()),
            }
        };
        self.timed(op).await
    }

    async fn find_by_order_id(&self, order_id: &str) -> Result<Option<Order>, StoreError> {
        self.timed(fetch_order(&self.pool, order_id)).await
    }

    async fn find_by_txn_id(&self, txn_id: &str) -> Result<Option<Order>, StoreError> {
        let op = async {
            Ok(
                sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE txn_id = ?1")
                    .bind(txn_id)
                    .fetch_optional(&self.pool)
                    .await?,
            )
        };
        self.timed(op).await
    }

    async fn try_verify(&self, order_id: &str, txn_id: &str) -> Result<VerifyOutcome, StoreError> {
        let op = async {
            let mut tx = self.pool.begin().await?;

            // The entire decision is this one conditional statement. The
            // correlated subqueries and the partial unique indexes make two
            // racing attempts for the same card impossible to both succeed.
            let updated = sqlx::query(
                "UPDATE orders
                 SET status = 'verified', txn_id = ?2, verified_at = ?3
                 WHERE order_id = ?1
                   AND status = 'pending'
                   AND NOT EXISTS (SELECT 1 FROM orders s
                                   WHERE s.card_id = orders.card_id
                                     AND s.status = 'verified')
                   AND NOT EXISTS (SELECT 1 FROM orders t
                                   WHERE t.txn_id = ?2
                                     AND t.status = 'verified')",
            )
            .bind(order_id)
            .bind(txn_id)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() == 1 {
                let order = fetch_order(&mut *tx, order_id).await?.ok_or_else(|| {
                    StoreError::Conflict("verified order disappeared mid-transaction".to_string())
                })?;
                tx.commit().await?;
                debug!("order {order_id} verified with txn {txn_id}");
                return Ok(VerifyOutcome::Verified(order));
            }

            // Refused. Classify inside the same transaction so the reason
            // matches the state that refused the update.
            let Some(order) = fetch_order(&mut *tx, order_id).await? else {
                return Ok(VerifyOutcome::NotFound);
            };

            match order.status {
                OrderStatus::Verified => Ok(VerifyOutcome::AlreadyVerified(order)),
                // Failed is only ever entered because the card went to
                // another order.
                OrderStatus::Failed => Ok(VerifyOutcome::SoldOut),
                OrderStatus::Pending => {
                    let card_sold: i64 = sqlx::query_scalar(
                        "SELECT COUNT(*) FROM orders
                         WHERE card_id = ?1 AND status = 'verified'",
                    )
                    .bind(order.card_id)
                    .fetch_one(&mut *tx)
                    .await?;

                    if card_sold > 0 {
                        // The card went to another order; this one can never
                        // verify. Mark it Failed as part of the same
                        // transaction.
                        sqlx::query(
                            "UPDATE orders SET status = 'failed'
                             WHERE order_id = ?1 AND status = 'pending'",
                        )
                        .bind(order_id)
                        .execute(&mut *tx)
                        .await?;
                        tx.commit().await?;
                        return Ok(VerifyOutcome::SoldOut);
                    }

                    let txn_used: i64 = sqlx::query_scalar(
                        "SELECT COUNT(*) FROM orders
                         WHERE txn_id = ?1 AND status = 'verified'",
                    )
                    .bind(txn_id)
                    .fetch_one(&mut *tx)
                    .await?;

                    if txn_used > 0 {
                        return Ok(VerifyOutcome::DuplicateTransaction);
                    }

                    // Pending, card unsold, txn unused: the update could only
                    // have been refused by a write that is no longer visible.
                    Err(StoreError::Conflict(
                        "verification raced a concurrent update".to_string(),
                    ))
                }
            }
        };
        self.timed(op).await
    }

    async fn verified_order_for_card(&self, card_id: u32) -> Result<Option<Order>, StoreError> {
        let op = async {
            Ok(sqlx::query_as::<_, Order>(
                "SELECT * FROM orders WHERE card_id = ?1 AND status = 'verified'",
            )
            .bind(card_id)
            .fetch_optional(&self.pool)
            .await?)
        };
        self.timed(op).await
    }

    async fn sold_card_ids(&self) -> Result<Vec<u32>, StoreError> {
        let op = async {
            Ok(sqlx::query_scalar::<_, u32>(
                "SELECT card_id FROM orders WHERE status = 'verified' ORDER BY card_id",
            )
            .fetch_all(&self.pool)
            .await?)
        };
        self.timed(op).await
    }

    async fn list_all(&self) -> Result<Vec<Order>, StoreError> {
        let op = async {
            Ok(sqlx::query_as::<_, Order>(
                "SELECT * FROM orders ORDER BY created_at DESC, rowid DESC",
            )
            .fetch_all(&self.pool)
            .await?)
        };
        self.timed(op).await
    }

    async fn record_fulfillment(
        &self,
        order_id: &str,
        state: FulfillmentState,
    ) -> Result<(), StoreError> {
        let op = async {
            sqlx::query("UPDATE orders SET fulfillment = ?2 WHERE order_id = ?1")
                .bind(order_id)
                .bind(state)
                .execute(&self.pool)
                .await?;
            Ok(())
        };
        self.timed(op).await
    }
}
