//! Order and UPI payment-verification service for single-unit digital gift cards.
//!
//! A buyer reserves a card, pays out-of-band via a UPI QR code, and submits
//! the transaction id for verification. The crate turns that claim into an
//! authoritative, race-free, idempotent decision about whether the card is
//! sold, then hands delivery to a background fulfillment worker.
//!
//! The pieces:
//! - [`catalog`] - static card metadata, loaded once at startup
//! - [`store`] - order persistence; the sole arbiter of the single-sale and
//!   transaction-uniqueness invariants
//! - [`service`] - the verification state machine
//! - [`notify`] - fulfillment dispatch, decoupled from verification
//! - [`http`] - the axum JSON surface
//! - [`server`] - runtime wiring and graceful shutdown

pub mod catalog;
pub mod config;
pub mod error;
pub mod event;
pub mod http;
pub mod notify;
pub mod order;
pub mod server;
pub mod service;
pub mod store;

pub use catalog::{CardCatalog, GiftCard};
pub use config::ServiceConfig;
pub use error::{Error, Result};
pub use server::{RunningServer, ServerBuilder};
pub use service::{VerificationService, VerifyReceipt};
