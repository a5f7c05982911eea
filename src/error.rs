//! Crate-wide error types.
//!
//! Business-rule rejections carry a precise, actionable reason; only
//! storage/network transients surface as [`Error::Retryable`], which a
//! caller may safely retry with the identical request.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the cardvault service.
#[derive(Debug, Error)]
pub enum Error {
    /// A required field was missing or malformed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The requested card does not exist in the catalog.
    #[error("card {0} not found")]
    CardNotFound(u32),

    /// The requested order does not exist.
    #[error("order {0} not found")]
    OrderNotFound(String),

    /// Another order for this card has already been verified.
    #[error("this gift card is already sold out")]
    SoldOut,

    /// The transaction id is already attached to a different verified order.
    #[error("transaction id already used by another verified order")]
    DuplicateTransaction,

    /// The transaction id violates the configured format policy.
    #[error("transaction id rejected: {0}")]
    InvalidTransactionFormat(String),

    /// Transient storage failure; the identical request may be retried.
    #[error("temporary failure, please retry: {0}")]
    Retryable(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Non-transient storage failure.
    #[error("storage error: {0}")]
    Store(String),

    /// Fulfillment dispatch failure. Never surfaced as a verification
    /// failure; handled by the worker's retry/record path.
    #[error("fulfillment dispatch failed: {0}")]
    Notify(String),

    /// IO error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
