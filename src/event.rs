//! Service event system.

use tokio::sync::broadcast;

/// Events emitted by the verification service and fulfillment worker.
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    /// Server has started successfully.
    Started,

    /// Server is shutting down.
    ShuttingDown,

    /// A new order was created.
    OrderCreated {
        /// Order identifier.
        order_id: String,
        /// Reserved card.
        card_id: u32,
    },

    /// A payment was verified and the card sold.
    PaymentVerified {
        /// Order identifier.
        order_id: String,
        /// Sold card.
        card_id: u32,
    },

    /// The fulfillment email was handed to the mail provider.
    FulfillmentDispatched {
        /// Order identifier.
        order_id: String,
        /// Recipient address.
        email: String,
    },

    /// Fulfillment dispatch exhausted its retries.
    FulfillmentFailed {
        /// Order identifier.
        order_id: String,
        /// Final error.
        message: String,
    },
}

/// Channel for receiving service events.
pub type ServiceEventsChannel = broadcast::Receiver<ServiceEvent>;

/// Sender for service events.
pub type ServiceEventsSender = broadcast::Sender<ServiceEvent>;

/// Create a new event channel pair.
#[must_use]
pub fn create_event_channel() -> (ServiceEventsSender, ServiceEventsChannel) {
    broadcast::channel(256)
}
