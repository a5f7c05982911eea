//! Order persistence.
//!
//! The store is the single shared mutable resource and the sole arbiter of
//! the single-sale and transaction-uniqueness invariants. No component may
//! cache "sold" state in process memory; under multiple service instances
//! such a cache desynchronizes immediately.
//!
//! The crux is [`OrderStore::try_verify`]: one atomic conditional
//! transition that either sells the card to exactly one order or reports
//! precisely why it refused. Everything else is plain reads.
//!
//! ```text
//! VerifyPayment(orderId, txnId)
//!        │
//!        ▼
//! ┌──────────────────────────────┐
//! │ try_verify (single atomic op)│
//! └──────┬───────────────────────┘
//!        │
//!   ┌────┴───────┬──────────────┬────────────────────┐
//!   ▼            ▼              ▼                    ▼
//! Verified  AlreadyVerified  SoldOut         DuplicateTransaction
//! (sold)    (idempotent      (card went to   (txn attached to a
//!            replay)          another order)  different order)
//! ```

mod memory;
mod sqlite;

pub use memory::MemoryOrderStore;
pub use sqlite::SqliteOrderStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::order::{FulfillmentState, Order};

/// Storage-layer failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An order with the same id already exists.
    #[error("order id already exists")]
    DuplicateOrderId,

    /// The bounded operation timeout elapsed. Safe to retry: `try_verify`
    /// is idempotent per (orderId, txnId) pair.
    #[error("store operation timed out")]
    Timeout,

    /// A concurrent update raced this operation in a way that could not be
    /// classified. Safe to retry.
    #[error("conflicting concurrent update: {0}")]
    Conflict(String),

    /// Backend failure (connection, corruption, constraint machinery).
    #[error("storage backend failure: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

impl From<StoreError> for crate::Error {
    fn from(e: StoreError) -> Self {
        match e {
            // Id generation makes collisions practically impossible; when
            // one does happen the same request can simply run again.
            StoreError::DuplicateOrderId | StoreError::Timeout | StoreError::Conflict(_) => {
                Self::Retryable(e.to_string())
            }
            StoreError::Backend(msg) => Self::Store(msg),
        }
    }
}

/// Outcome of the atomic verification transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// This call performed the Pending -> Verified transition; the card is
    /// now sold to this order.
    Verified(Order),

    /// The order was already verified by an earlier call. Fulfillment must
    /// not be dispatched again.
    AlreadyVerified(Order),

    /// Another order for the same card is already verified. The losing
    /// order is marked `Failed` in the same transaction.
    SoldOut,

    /// The transaction id is attached to a different verified order. The
    /// order stays `Pending`; the buyer may retry with a corrected id.
    DuplicateTransaction,

    /// No order with this id exists.
    NotFound,
}

/// Persistence contract the verification core depends on.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Persist a new order.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::DuplicateOrderId`] on an id collision.
    async fn create(&self, order: &Order) -> Result<(), StoreError>;

    /// Look up an order by id.
    async fn find_by_order_id(&self, order_id: &str) -> Result<Option<Order>, StoreError>;

    /// Look up the order holding a transaction id, if any.
    async fn find_by_txn_id(&self, txn_id: &str) -> Result<Option<Order>, StoreError>;

    /// Atomically transition an order to `Verified`.
    ///
    /// Succeeds only if the order is `Pending`, no other order for the same
    /// card is `Verified`, and no other verified order holds `txn_id`. This
    /// must be a single storage-level conditional operation, never a
    /// read-then-write sequence: two concurrent attempts for the same card
    /// must not both observe "not sold yet".
    async fn try_verify(&self, order_id: &str, txn_id: &str) -> Result<VerifyOutcome, StoreError>;

    /// The verified order for a card, if the card is sold. Used for the
    /// best-effort early check at order creation; `try_verify` remains the
    /// authority.
    async fn verified_order_for_card(&self, card_id: u32) -> Result<Option<Order>, StoreError>;

    /// Ids of all sold cards, for the storefront listing.
    async fn sold_card_ids(&self) -> Result<Vec<u32>, StoreError>;

    /// All orders, newest first.
    async fn list_all(&self) -> Result<Vec<Order>, StoreError>;

    /// Update the delivery audit state of an order.
    async fn record_fulfillment(
        &self,
        order_id: &str,
        state: FulfillmentState,
    ) -> Result<(), StoreError>;
}
