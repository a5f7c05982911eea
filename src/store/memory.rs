//! In-memory order store for tests and local development.
//!
//! Holds the same contract as the SQLite store. A single mutex guards all
//! state, so `try_verify` is trivially atomic; the store itself is the
//! arbiter here, not a cache in front of one.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::{OrderStore, StoreError, VerifyOutcome};
use crate::order::{FulfillmentState, Order, OrderStatus};

/// Mutex-guarded in-process order store.
#[derive(Debug, Default)]
pub struct MemoryOrderStore {
    // Insertion order is retained so list_all can report newest first.
    orders: Mutex<Vec<Order>>,
}

impl MemoryOrderStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn create(&self, order: &Order) -> Result<(), StoreError> {
        let mut orders = self.orders.lock();
        if orders.iter().any(|o| o.order_id == order.order_id) {
            return Err(StoreError::DuplicateOrderId);
        }
        orders.push(order.clone());
        Ok(())
    }

    async fn find_by_order_id(&self, order_id: &str) -> Result<Option<Order>, StoreError> {
        let orders = self.orders.lock();
        Ok(orders.iter().find(|o| o.order_id == order_id).cloned())
    }

    async fn find_by_txn_id(&self, txn_id: &str) -> Result<Option<Order>, StoreError> {
        let orders = self.orders.lock();
        Ok(orders
            .iter()
            .find(|o| o.txn_id.as_deref() == Some(txn_id))
            .cloned())
    }

    async fn try_verify(&self, order_id: &str, txn_id: &str) -> Result<VerifyOutcome, StoreError> {
        let mut orders = self.orders.lock();

        let Some(idx) = orders.iter().position(|o| o.order_id == order_id) else {
            return Ok(VerifyOutcome::NotFound);
        };

        match orders[idx].status {
            OrderStatus::Verified => Ok(VerifyOutcome::AlreadyVerified(orders[idx].clone())),
            OrderStatus::Failed => Ok(VerifyOutcome::SoldOut),
            OrderStatus::Pending => {
                let card_id = orders[idx].card_id;
                let card_sold = orders
                    .iter()
                    .any(|o| o.card_id == card_id && o.status == OrderStatus::Verified);
                if card_sold {
                    orders[idx].status = OrderStatus::Failed;
                    return Ok(VerifyOutcome::SoldOut);
                }

                let txn_used = orders
                    .iter()
                    .any(|o| o.txn_id.as_deref() == Some(txn_id) && o.status == OrderStatus::Verified);
                if txn_used {
                    return Ok(VerifyOutcome::DuplicateTransaction);
                }

                let order = &mut orders[idx];
                order.status = OrderStatus::Verified;
                order.txn_id = Some(txn_id.to_string());
                order.verified_at = Some(Utc::now());
                Ok(VerifyOutcome::Verified(order.clone()))
            }
        }
    }

    async fn verified_order_for_card(&self, card_id: u32) -> Result<Option<Order>, StoreError> {
        let orders = self.orders.lock();
        Ok(orders
            .iter()
            .find(|o| o.card_id == card_id && o.status == OrderStatus::Verified)
            .cloned())
    }

    async fn sold_card_ids(&self) -> Result<Vec<u32>, StoreError> {
        let orders = self.orders.lock();
        let mut ids: Vec<u32> = orders
            .iter()
            .filter(|o| o.status == OrderStatus::Verified)
            .map(|o| o.card_id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn list_all(&self) -> Result<Vec<Order>, StoreError> {
        let orders = self.orders.lock();
        Ok(orders.iter().rev().cloned().collect())
    }

    async fn record_fulfillment(
        &self,
        order_id: &str,
        state: FulfillmentState,
    ) -> Result<(), StoreError> {
        let mut orders = self.orders.lock();
        if let Some(order) = orders.iter_mut().find(|o| o.order_id == order_id) {
            order.fulfillment = state;
        }
        Ok(())
    }
}
