//! Order records and lifecycle types.

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;

use crate::catalog::GiftCard;

/// Payment state of an order.
///
/// Transitions are monotonic: `Pending` moves to `Verified` or `Failed`;
/// `Verified` is terminal. `Failed` is entered only when no future
/// verification of the order could succeed (the card was sold elsewhere),
/// so it is terminal as well. Recoverable rejections leave the order
/// `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Awaiting payment verification.
    Pending,
    /// Payment verified; the card is sold. Terminal.
    Verified,
    /// The card was sold to a different order. Terminal.
    Failed,
}

/// Delivery audit state for the fulfillment email.
///
/// Tracks the notifier's progress independently of [`OrderStatus`]:
/// payment truth is authoritative over notification delivery, so a failed
/// dispatch never reverts a verified order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum FulfillmentState {
    /// No dispatch attempted (order not verified yet).
    None,
    /// Dispatch handed to the fulfillment worker.
    Queued,
    /// The fulfillment email was delivered to the mail provider.
    Sent,
    /// Dispatch exhausted its retries; flagged for manual redelivery.
    Failed,
}

/// A buyer's claim against one catalog card.
///
/// Orders are never deleted; they remain as an audit trail and as the
/// basis for idempotent replay detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    /// Unique order identifier (`ORD-<millis>-<suffix>`).
    pub order_id: String,
    /// Catalog card this order reserves.
    pub card_id: u32,
    /// Buyer email, used for fulfillment delivery.
    pub email: String,
    /// Payable amount in whole rupees, copied from the catalog at creation
    /// time and immutable afterwards.
    pub payable_inr: i64,
    /// UPI transaction id; set exactly once, by a successful verification.
    pub txn_id: Option<String>,
    /// Payment state.
    pub status: OrderStatus,
    /// Delivery audit state.
    pub fulfillment: FulfillmentState,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Verification timestamp, set together with `txn_id`.
    pub verified_at: Option<DateTime<Utc>>,
}

impl Order {
    /// Build a new `Pending` order for `card`, copying the catalog's
    /// payable amount.
    #[must_use]
    pub fn new(email: impl Into<String>, card: &GiftCard) -> Self {
        Self {
            order_id: generate_order_id(),
            card_id: card.id,
            email: email.into(),
            payable_inr: card.payable_inr,
            txn_id: None,
            status: OrderStatus::Pending,
            fulfillment: FulfillmentState::None,
            created_at: Utc::now(),
            verified_at: None,
        }
    }
}

/// Where and how much the buyer should pay, for external QR rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentTarget {
    /// UPI id to pay to.
    pub upi_id: String,
    /// Amount in whole rupees.
    pub payable_inr: i64,
}

/// Generate an order id of the form `ORD-<unix-millis>-<6 alphanumerics>`.
///
/// The timestamp plus random suffix makes collisions practically
/// impossible; the store still rejects a collision outright.
#[must_use]
pub fn generate_order_id() -> String {
    let millis = Utc::now().timestamp_millis();
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("ORD-{millis}-{suffix}")
}
