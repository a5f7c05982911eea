//! Fulfillment dispatch.
//!
//! Delivery is decoupled from verification: a successful `try_verify`
//! enqueues a job and returns immediately, and a background worker drains
//! the queue so a slow or unreachable mail provider can never block, delay,
//! or fail a payment-verification response. Payment truth is authoritative
//! over notification delivery: a dispatch failure is retried, logged and
//! recorded for manual redelivery, never allowed to revert a verified
//! order.

mod mailer;

pub use mailer::HttpMailer;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::catalog::GiftCard;
use crate::event::{ServiceEvent, ServiceEventsSender};
use crate::order::{FulfillmentState, Order};
use crate::store::OrderStore;

/// External collaborator that delivers the unlocked card to the buyer.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver the fulfillment email for a verified order.
    ///
    /// # Errors
    ///
    /// Returns an error if the delivery attempt failed; the caller decides
    /// whether to retry.
    async fn dispatch(&self, email: &str, card: &GiftCard, order: &Order) -> crate::Result<()>;
}

/// One unit of fulfillment work, produced by a successful verification.
///
/// Jobs are enqueued at most once per order: only the call that performs
/// the Pending -> Verified transition produces one.
#[derive(Debug, Clone)]
pub struct FulfillmentJob {
    /// The verified order.
    pub order: Order,
    /// The card being delivered.
    pub card: GiftCard,
}

/// Sending half of the fulfillment queue.
pub type FulfillmentSender = mpsc::Sender<FulfillmentJob>;

/// Create the fulfillment queue pair.
#[must_use]
pub fn create_fulfillment_queue() -> (FulfillmentSender, mpsc::Receiver<FulfillmentJob>) {
    mpsc::channel(256)
}

/// Background worker draining the fulfillment queue.
pub struct FulfillmentWorker {
    rx: mpsc::Receiver<FulfillmentJob>,
    notifier: Arc<dyn Notifier>,
    store: Arc<dyn OrderStore>,
    events: ServiceEventsSender,
    max_attempts: u32,
    backoff: std::time::Duration,
}

impl FulfillmentWorker {
    /// Create a worker over the receiving half of the fulfillment queue.
    #[must_use]
    pub fn new(
        rx: mpsc::Receiver<FulfillmentJob>,
        notifier: Arc<dyn Notifier>,
        store: Arc<dyn OrderStore>,
        events: ServiceEventsSender,
        max_attempts: u32,
        backoff: std::time::Duration,
    ) -> Self {
        Self {
            rx,
            notifier,
            store,
            events,
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Drain the queue until every sender is dropped.
    pub async fn run(mut self) {
        while let Some(job) = self.rx.recv().await {
            self.process(job).await;
        }
        debug!("fulfillment queue closed, worker exiting");
    }

    async fn process(&self, job: FulfillmentJob) {
        let order_id = job.order.order_id.clone();
        for attempt in 1..=self.max_attempts {
            match self
                .notifier
                .dispatch(&job.order.email, &job.card, &job.order)
                .await
            {
                Ok(()) => {
                    info!("fulfillment for order {order_id} dispatched (attempt {attempt})");
                    self.record(&order_id, FulfillmentState::Sent).await;
                    let _ = self.events.send(ServiceEvent::FulfillmentDispatched {
                        order_id,
                        email: job.order.email,
                    });
                    return;
                }
                Err(e) if attempt < self.max_attempts => {
                    warn!("fulfillment attempt {attempt} for order {order_id} failed: {e}");
                    tokio::time::sleep(self.backoff * attempt).await;
                }
                Err(e) => {
                    // Retries exhausted. The order stays Verified; the
                    // failure is recorded so an operator can redeliver.
                    warn!("fulfillment for order {order_id} gave up after {attempt} attempts: {e}");
                    self.record(&order_id, FulfillmentState::Failed).await;
                    let _ = self.events.send(ServiceEvent::FulfillmentFailed {
                        order_id,
                        message: e.to_string(),
                    });
                    return;
                }
            }
        }
    }

    async fn record(&self, order_id: &str, state: FulfillmentState) {
        if let Err(e) = self.store.record_fulfillment(order_id, state).await {
            warn!("could not record fulfillment state for order {order_id}: {e}");
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::event::create_event_channel;
    use crate::order::OrderStatus;
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

    /// Notifier that fails a fixed number of times before succeeding.
    struct FlakyNotifier {
        calls: AtomicU32,
        failures: u32,
    }

    #[async_trait]
    impl Notifier for FlakyNotifier {
        async fn dispatch(
            &self,
            _email: &str,
            _card: &GiftCard,
            _order: &Order,
        ) -> crate::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(crate::Error::Notify("provider unreachable".to_string()))
            } else {
                Ok(())
            }
        }
    }

    async fn run_job(
        notifier: Arc<FlakyNotifier>,
        store: Arc<MemoryOrderStore>,
        order: Order,
    ) {
        let (tx, rx) = create_fulfillment_queue();
        let (events, _events_rx) = create_event_channel();
        let worker = FulfillmentWorker::new(
            rx,
            notifier,
            store,
            events,
            3,
            Duration::from_millis(1),
        );
        let handle = tokio::spawn(worker.run());

        tx.send(FulfillmentJob {
            card: card(order.card_id),
            order,
        })
        .await
        .expect("enqueue");
        drop(tx);
        handle.await.expect("worker");
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let store = Arc::new(MemoryOrderStore::new());
        let order = Order::new("a@x.com", &card(1));
        store.create(&order).await.expect("create");
        let notifier = Arc::new(FlakyNotifier {
            calls: AtomicU32::new(0),
            failures: 2,
        });

        run_job(Arc::clone(&notifier), Arc::clone(&store), order.clone()).await;

        assert_eq!(notifier.calls.load(Ordering::SeqCst), 3);
        let found = store
            .find_by_order_id(&order.order_id)
            .await
            .expect("find")
            .expect("present");
        assert_eq!(found.fulfillment, FulfillmentState::Sent);
    }

    #[tokio::test]
    async fn test_exhausted_retries_never_revert_the_order() {
        let store = Arc::new(MemoryOrderStore::new());
        let order = Order::new("a@x.com", &card(1));
        store.create(&order).await.expect("create");
        store
            .try_verify(&order.order_id, "T12345678")
            .await
            .expect("verify");
        let notifier = Arc::new(FlakyNotifier {
            calls: AtomicU32::new(0),
            failures: 10,
        });

        run_job(Arc::clone(&notifier), Arc::clone(&store), order.clone()).await;

        assert_eq!(notifier.calls.load(Ordering::SeqCst), 3);
        let found = store
            .find_by_order_id(&order.order_id)
            .await
            .expect("find")
            .expect("present");
        assert_eq!(found.fulfillment, FulfillmentState::Failed);
        // Payment truth is untouched.
        assert_eq!(found.status, OrderStatus::Verified);
    }
}
