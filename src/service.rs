//! The verification state machine.
//!
//! Turns a buyer's claim ("I paid") into an authoritative, race-free,
//! idempotent decision about whether a specific single-unit card is sold.
//!
//! ```text
//! CreateOrder(email, cardId)
//!        │  catalog lookup + best-effort sold-out check
//!        ▼
//!     Pending ──────────────(try_verify success)──────────▶ Verified [terminal]
//!        │                                                     │
//!        │ (card sold to another order)                        ▼
//!        ▼                                            fulfillment queued
//!     Failed [terminal]                               (worker dispatches
//!                                                      at most once)
//! ```
//!
//! The early sold-out check at order creation is advisory; the only
//! authority over the single-sale and transaction-uniqueness invariants is
//! the store's atomic `try_verify`, which closes the time-of-check /
//! time-of-use race between the two calls.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::{CardCatalog, GiftCard};
use crate::config::PaymentPolicy;
use crate::error::{Error, Result};
use crate::event::{ServiceEvent, ServiceEventsSender};
use crate::notify::{FulfillmentJob, FulfillmentSender};
use crate::order::{FulfillmentState, Order, OrderStatus, PaymentTarget};
use crate::store::{OrderStore, StoreError, VerifyOutcome};

/// Internal attempts at the atomic transition before a storage transient
/// is surfaced to the caller as retryable.
const VERIFY_ATTEMPTS: u32 = 2;

/// Receipt returned by a successful verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReceipt {
    /// The verified order.
    pub order_id: String,
    /// True when this call replayed an already-verified order instead of
    /// performing the transition itself.
    pub already_verified: bool,
    /// Pointer to the deliverable asset, returned independently of whether
    /// the fulfillment email has gone out yet.
    pub download_ref: String,
}

/// A catalog entry joined with its sold state, for the storefront.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorefrontCard {
    /// Catalog identifier.
    pub id: u32,
    /// Brand displayed to the buyer.
    pub brand: String,
    /// Face value in whole rupees.
    pub value_inr: i64,
    /// Amount the buyer pays, in whole rupees.
    pub payable_inr: i64,
    /// Expiry date.
    pub expiry: String,
    /// Card image.
    pub image_url: String,
    /// Whether a verified order already holds this card.
    pub sold: bool,
}

impl StorefrontCard {
    fn from_card(card: &GiftCard, sold: bool) -> Self {
        Self {
            id: card.id,
            brand: card.brand.clone(),
            value_inr: card.value_inr,
            payable_inr: card.payable_inr,
            expiry: card.expiry.clone(),
            image_url: card.image_url.clone(),
            sold,
        }
    }
}

/// Order creation and payment verification over a shared [`OrderStore`].
///
/// The service itself is stateless across requests; everything it decides
/// is grounded in the catalog (immutable) and the store (the single shared
/// mutable resource).
pub struct VerificationService {
    catalog: CardCatalog,
    store: Arc<dyn OrderStore>,
    policy: PaymentPolicy,
    fulfillments: FulfillmentSender,
    events: ServiceEventsSender,
}

impl VerificationService {
    /// Create a new service.
    #[must_use]
    pub fn new(
        catalog: CardCatalog,
        store: Arc<dyn OrderStore>,
        policy: PaymentPolicy,
        fulfillments: FulfillmentSender,
        events: ServiceEventsSender,
    ) -> Self {
        Self {
            catalog,
            store,
            policy,
            fulfillments,
            events,
        }
    }

    /// The card catalog.
    #[must_use]
    pub fn catalog(&self) -> &CardCatalog {
        &self.catalog
    }

    /// Create a `Pending` order for `card_id` and return it together with
    /// the payment target for external QR rendering.
    ///
    /// # Errors
    ///
    /// Fails with `CardNotFound` for an unknown card, `SoldOut` when a
    /// verified order already holds the card (best-effort; the
    /// authoritative check happens at verification), or `InvalidInput` for
    /// a malformed email.
    pub async fn create_order(&self, email: &str, card_id: u32) -> Result<(Order, PaymentTarget)> {
        let email = normalize_email(email)?;
        let card = self
            .catalog
            .get(card_id)
            .ok_or(Error::CardNotFound(card_id))?;

        if self.store.verified_order_for_card(card_id).await?.is_some() {
            debug!("rejecting order for sold card {card_id}");
            return Err(Error::SoldOut);
        }

        let order = Order::new(email, card);
        self.store.create(&order).await?;

        info!(
            "order {} created: card {card_id} for {}",
            order.order_id, order.email
        );
        let _ = self.events.send(ServiceEvent::OrderCreated {
            order_id: order.order_id.clone(),
            card_id,
        });

        let target = PaymentTarget {
            upi_id: card.upi_id.clone(),
            payable_inr: card.payable_inr,
        };
        Ok((order, target))
    }

    /// Verify a buyer's payment claim for an order.
    ///
    /// Replaying a verification that already succeeded returns success
    /// again without re-dispatching fulfillment: the email goes out at most
    /// once per order no matter how often this is called.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidInput`, `OrderNotFound`,
    /// `InvalidTransactionFormat`, `SoldOut`, `DuplicateTransaction`, or
    /// `Retryable` on storage transients (the identical call may be
    /// retried; `try_verify` is idempotent per transaction id).
    pub async fn verify_payment(
        &self,
        order_id: &str,
        txn_id: &str,
        email: &str,
    ) -> Result<VerifyReceipt> {
        let order_id = order_id.trim();
        let txn_id = txn_id.trim();
        if order_id.is_empty() || txn_id.is_empty() || email.trim().is_empty() {
            return Err(Error::InvalidInput(
                "orderId, txnId and email are required".to_string(),
            ));
        }

        let order = self
            .store
            .find_by_order_id(order_id)
            .await?
            .ok_or_else(|| Error::OrderNotFound(order_id.to_string()))?;

        // Idempotent replay guard: success is repeatable, dispatch is not.
        if order.status == OrderStatus::Verified {
            debug!("order {order_id} already verified, replaying success");
            return Ok(self.receipt(&order, true));
        }

        if let Some(violation) = self.policy.violation(txn_id) {
            return Err(Error::InvalidTransactionFormat(violation));
        }

        self.finish_verification(order_id, txn_id).await
    }

    /// Manually verify an order, bypassing the transaction-format policy.
    ///
    /// Operator path. Every storage invariant still applies: the card must
    /// be unsold and the transaction id unused.
    ///
    /// # Errors
    ///
    /// As [`Self::verify_payment`], minus `InvalidTransactionFormat`.
    pub async fn admin_verify(&self, order_id: &str, txn_id: &str) -> Result<VerifyReceipt> {
        let order_id = order_id.trim();
        let txn_id = txn_id.trim();
        if order_id.is_empty() || txn_id.is_empty() {
            return Err(Error::InvalidInput(
                "orderId and txnId are required".to_string(),
            ));
        }

        info!("manual verification requested for order {order_id}");
        self.finish_verification(order_id, txn_id).await
    }

    /// All orders, newest first.
    ///
    /// # Errors
    ///
    /// Fails on storage errors.
    pub async fn list_orders(&self) -> Result<Vec<Order>> {
        Ok(self.store.list_all().await?)
    }

    /// Catalog entries joined with sold state, for the storefront.
    ///
    /// # Errors
    ///
    /// Fails on storage errors.
    pub async fn storefront_cards(&self) -> Result<Vec<StorefrontCard>> {
        let sold = self.store.sold_card_ids().await?;
        Ok(self
            .catalog
            .iter()
            .map(|card| StorefrontCard::from_card(card, sold.contains(&card.id)))
            .collect())
    }

    async fn finish_verification(&self, order_id: &str, txn_id: &str) -> Result<VerifyReceipt> {
        // try_verify is idempotent per (orderId, txnId), so a transient can
        // be retried here without risking a double sale.
        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            match self.store.try_verify(order_id, txn_id).await {
                Ok(outcome) => break outcome,
                Err(e @ (StoreError::Timeout | StoreError::Conflict(_)))
                    if attempt < VERIFY_ATTEMPTS =>
                {
                    warn!("transient failure verifying order {order_id}: {e}; retrying");
                }
                Err(e) => return Err(e.into()),
            }
        };

        match outcome {
            VerifyOutcome::Verified(order) => {
                info!("order {order_id} verified, card {} sold", order.card_id);
                let _ = self.events.send(ServiceEvent::PaymentVerified {
                    order_id: order.order_id.clone(),
                    card_id: order.card_id,
                });
                self.enqueue_fulfillment(&order).await;
                Ok(self.receipt(&order, false))
            }
            VerifyOutcome::AlreadyVerified(order) => {
                debug!("order {order_id} already verified, replaying success");
                Ok(self.receipt(&order, true))
            }
            VerifyOutcome::SoldOut => {
                warn!("order {order_id} lost the card to another verified order");
                Err(Error::SoldOut)
            }
            VerifyOutcome::DuplicateTransaction => {
                warn!("txn {txn_id} already attached to another verified order");
                Err(Error::DuplicateTransaction)
            }
            VerifyOutcome::NotFound => Err(Error::OrderNotFound(order_id.to_string())),
        }
    }

    /// Hand a freshly verified order to the fulfillment worker. Delivery
    /// problems are logged and recorded, never propagated: they must not
    /// fail the verification that already happened.
    async fn enqueue_fulfillment(&self, order: &Order) {
        let Some(card) = self.catalog.get(order.card_id) else {
            warn!(
                "card {} vanished from catalog, cannot fulfill order {}",
                order.card_id, order.order_id
            );
            return;
        };

        let job = FulfillmentJob {
            order: order.clone(),
            card: card.clone(),
        };
        if let Err(e) = self.fulfillments.try_send(job) {
            warn!(
                "could not queue fulfillment for order {}: {e}",
                order.order_id
            );
            return;
        }

        if let Err(e) = self
            .store
            .record_fulfillment(&order.order_id, FulfillmentState::Queued)
            .await
        {
            warn!(
                "could not record queued fulfillment for order {}: {e}",
                order.order_id
            );
        }
    }

    fn receipt(&self, order: &Order, already_verified: bool) -> VerifyReceipt {
        let download_ref = self
            .catalog
            .get(order.card_id)
            .map(|card| card.image_url.clone())
            .unwrap_or_default();
        VerifyReceipt {
            order_id: order.order_id.clone(),
            already_verified,
            download_ref,
        }
    }
}

fn normalize_email(email: &str) -> Result<String> {
    let email = email.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(Error::InvalidInput(
            "a valid buyer email is required".to_string(),
        ));
    }
    Ok(email.to_string())
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::event::create_event_channel;
    use crate::notify::{create_fulfillment_queue, FulfillmentWorker, Notifier};
    use crate::store::MemoryOrderStore;

    fn card(id: u32) -> GiftCard {
        GiftCard {
            id,
            brand: format!("Card {id}"),
            value_inr: 500,
            payable_inr: 470,
            expiry: "22 Oct 2026".to_string(),
            image_url: format!("https://cards.example/{id}.png"),
            upi_id: "merchant@oksbi".to_string(),
        }
    }

    /// Notifier counting dispatches; always succeeds.
    #[derive(Default)]
    struct CountingNotifier {
        dispatched: AtomicU32,
    }

    #[async_trait]
    impl Notifier for CountingNotifier {
        async fn dispatch(
            &self,
            _email: &str,
            _card: &GiftCard,
            _order: &Order,
        ) -> crate::Result<()> {
            self.dispatched.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        service: Arc<VerificationService>,
        store: Arc<MemoryOrderStore>,
        notifier: Arc<CountingNotifier>,
        worker: tokio::task::JoinHandle<()>,
    }

    fn harness_with_policy(policy: PaymentPolicy) -> Harness {
        let catalog = CardCatalog::new(vec![card(1), card(2)]).expect("catalog");
        let store = Arc::new(MemoryOrderStore::new());
        let notifier = Arc::new(CountingNotifier::default());
        let (fulfill_tx, fulfill_rx) = create_fulfillment_queue();
        let (events, _events_rx) = create_event_channel();
        let worker = FulfillmentWorker::new(
            fulfill_rx,
            Arc::clone(&notifier) as Arc<dyn Notifier>,
            Arc::clone(&store) as Arc<dyn OrderStore>,
            events.clone(),
            3,
            Duration::from_millis(1),
        );
        let worker = tokio::spawn(worker.run());
        let service = Arc::new(VerificationService::new(
            catalog,
            Arc::clone(&store) as Arc<dyn OrderStore>,
            policy,
            fulfill_tx,
            events,
        ));
        Harness {
            service,
            store,
            notifier,
            worker,
        }
    }

    fn harness() -> Harness {
        harness_with_policy(PaymentPolicy::default())
    }

    /// Give the fulfillment worker a moment to drain the queue.
    async fn settle(h: &Harness) {
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(2)).await;
            if h.notifier.dispatched.load(Ordering::SeqCst) > 0 {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_create_order_returns_payment_target() {
        let h = harness();

        let (order, target) = h
            .service
            .create_order("a@x.com", 1)
            .await
            .expect("create order");

        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.payable_inr, 470);
        assert_eq!(target.upi_id, "merchant@oksbi");
        assert_eq!(target.payable_inr, 470);
        h.worker.abort();
    }

    #[tokio::test]
    async fn test_create_order_unknown_card() {
        let h = harness();
        let result = h.service.create_order("a@x.com", 99).await;
        assert!(matches!(result, Err(Error::CardNotFound(99))));
        h.worker.abort();
    }

    #[tokio::test]
    async fn test_create_order_rejects_bad_email() {
        let h = harness();
        assert!(matches!(
            h.service.create_order("  ", 1).await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            h.service.create_order("not-an-email", 1).await,
            Err(Error::InvalidInput(_))
        ));
        h.worker.abort();
    }

    #[tokio::test]
    async fn test_create_order_for_sold_card_fails_before_persisting() {
        let h = harness();
        let (order, _) = h.service.create_order("a@x.com", 1).await.expect("create");
        h.service
            .verify_payment(&order.order_id, "T12345678", "a@x.com")
            .await
            .expect("verify");

        let result = h.service.create_order("b@x.com", 1).await;
        assert!(matches!(result, Err(Error::SoldOut)));

        // Nothing new was persisted for the rejected attempt.
        let all = h.store.list_all().await.expect("list");
        assert_eq!(all.len(), 1);
        h.worker.abort();
    }

    #[tokio::test]
    async fn test_verify_then_replay_dispatches_once() {
        let h = harness();
        let (order, _) = h.service.create_order("a@x.com", 1).await.expect("create");

        let first = h
            .service
            .verify_payment(&order.order_id, "T12345678", "a@x.com")
            .await
            .expect("verify");
        assert!(!first.already_verified);
        assert_eq!(first.download_ref, "https://cards.example/1.png");

        let replay = h
            .service
            .verify_payment(&order.order_id, "T12345678", "a@x.com")
            .await
            .expect("replay");
        assert!(replay.already_verified);
        assert_eq!(replay.download_ref, first.download_ref);

        settle(&h).await;
        assert_eq!(h.notifier.dispatched.load(Ordering::SeqCst), 1);
        h.worker.abort();
    }

    #[tokio::test]
    async fn test_short_txn_rejected_and_order_stays_pending() {
        let h = harness();
        let (order, _) = h.service.create_order("a@x.com", 1).await.expect("create");

        let result = h
            .service
            .verify_payment(&order.order_id, "T1", "a@x.com")
            .await;
        assert!(matches!(result, Err(Error::InvalidTransactionFormat(_))));

        let found = h
            .store
            .find_by_order_id(&order.order_id)
            .await
            .expect("find")
            .expect("present");
        assert_eq!(found.status, OrderStatus::Pending);
        h.worker.abort();
    }

    #[tokio::test]
    async fn test_required_prefix_enforced() {
        let h = harness_with_policy(PaymentPolicy {
            min_txn_length: 8,
            required_txn_prefix: Some("UPI".to_string()),
        });
        let (order, _) = h.service.create_order("a@x.com", 1).await.expect("create");

        assert!(matches!(
            h.service
                .verify_payment(&order.order_id, "T12345678", "a@x.com")
                .await,
            Err(Error::InvalidTransactionFormat(_))
        ));
        h.service
            .verify_payment(&order.order_id, "UPI345678", "a@x.com")
            .await
            .expect("verify");
        h.worker.abort();
    }

    #[tokio::test]
    async fn test_empty_inputs_rejected() {
        let h = harness();
        assert!(matches!(
            h.service.verify_payment("", "T12345678", "a@x.com").await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            h.service.verify_payment("ORD-1-abc", "", "a@x.com").await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            h.service.verify_payment("ORD-1-abc", "T12345678", "").await,
            Err(Error::InvalidInput(_))
        ));
        h.worker.abort();
    }

    #[tokio::test]
    async fn test_unknown_order_not_found() {
        let h = harness();
        assert!(matches!(
            h.service
                .verify_payment("ORD-0-zzzzzz", "T12345678", "a@x.com")
                .await,
            Err(Error::OrderNotFound(_))
        ));
        h.worker.abort();
    }

    #[tokio::test]
    async fn test_concurrent_verifications_sell_card_once() {
        let h = harness();
        let (o1, _) = h.service.create_order("a@x.com", 1).await.expect("create");
        let (o2, _) = h.service.create_order("b@x.com", 1).await.expect("create");

        let s1 = Arc::clone(&h.service);
        let id1 = o1.order_id.clone();
        let t1 = tokio::spawn(async move { s1.verify_payment(&id1, "T12345678", "a@x.com").await });
        let s2 = Arc::clone(&h.service);
        let id2 = o2.order_id.clone();
        let t2 = tokio::spawn(async move { s2.verify_payment(&id2, "T99999999", "b@x.com").await });

        let r1 = t1.await.expect("join");
        let r2 = t2.await.expect("join");

        let successes = [&r1, &r2].iter().filter(|r| r.is_ok()).count();
        let sold_out = [&r1, &r2]
            .iter()
            .filter(|r| matches!(r, Err(Error::SoldOut)))
            .count();
        assert_eq!((successes, sold_out), (1, 1));

        settle(&h).await;
        assert_eq!(h.notifier.dispatched.load(Ordering::SeqCst), 1);
        h.worker.abort();
    }

    #[tokio::test]
    async fn test_duplicate_txn_for_other_card_rejected() {
        let h = harness();
        let (o1, _) = h.service.create_order("a@x.com", 1).await.expect("create");
        let (o2, _) = h.service.create_order("b@x.com", 2).await.expect("create");

        h.service
            .verify_payment(&o1.order_id, "T12345678", "a@x.com")
            .await
            .expect("verify first");
        let result = h
            .service
            .verify_payment(&o2.order_id, "T12345678", "b@x.com")
            .await;

        assert!(matches!(result, Err(Error::DuplicateTransaction)));
        h.worker.abort();
    }

    #[tokio::test]
    async fn test_admin_verify_skips_format_policy() {
        let h = harness_with_policy(PaymentPolicy {
            min_txn_length: 8,
            required_txn_prefix: Some("UPI".to_string()),
        });
        let (order, _) = h.service.create_order("a@x.com", 1).await.expect("create");

        // Would fail the policy, but the invariants still hold.
        let receipt = h
            .service
            .admin_verify(&order.order_id, "cash")
            .await
            .expect("admin verify");
        assert!(!receipt.already_verified);

        let result = h.service.create_order("b@x.com", 1).await;
        assert!(matches!(result, Err(Error::SoldOut)));
        h.worker.abort();
    }

    #[tokio::test]
    async fn test_storefront_marks_sold_cards() {
        let h = harness();
        let (order, _) = h.service.create_order("a@x.com", 1).await.expect("create");
        h.service
            .verify_payment(&order.order_id, "T12345678", "a@x.com")
            .await
            .expect("verify");

        let cards = h.service.storefront_cards().await.expect("storefront");
        assert_eq!(cards.len(), 2);
        assert!(cards[0].sold);
        assert!(!cards[1].sold);
        h.worker.abort();
    }
}
