//! HTTP surface: axum router and JSON handlers.
//!
//! Every business-rule rejection maps to a specific status code and
//! machine-readable error code; internal failures never leak detail.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::Error;
use crate::order::Order;
use crate::service::{StorefrontCard, VerificationService, VerifyReceipt};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// The verification service.
    pub service: Arc<VerificationService>,
}

/// Build the service router.
#[must_use]
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/cards", get(cards_handler))
        .route("/orders", post(create_order_handler).get(list_orders_handler))
        .route("/orders/:order_id/verify", post(verify_payment_handler))
        .route("/admin/verify", post(admin_verify_handler))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateOrderRequest {
    email: String,
    card_id: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyRequest {
    txn_id: String,
    email: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdminVerifyRequest {
    order_id: String,
    txn_id: String,
}

async fn healthz_handler() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn cards_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<StorefrontCard>>, Error> {
    Ok(Json(state.service.storefront_cards().await?))
}

async fn create_order_handler(
    State(state): State<AppState>,
    Json(req): Json<CreateOrderRequest>,
) -> Result<Response, Error> {
    let (order, target) = state.service.create_order(&req.email, req.card_id).await?;
    let body = json!({
        "orderId": order.order_id,
        "payTo": target.upi_id,
        "amount": target.payable_inr,
    });
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

async fn verify_payment_handler(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
    Json(req): Json<VerifyRequest>,
) -> Result<Json<Value>, Error> {
    let receipt = state
        .service
        .verify_payment(&order_id, &req.txn_id, &req.email)
        .await?;
    Ok(Json(receipt_body(&receipt)))
}

async fn admin_verify_handler(
    State(state): State<AppState>,
    Json(req): Json<AdminVerifyRequest>,
) -> Result<Json<Value>, Error> {
    let receipt = state
        .service
        .admin_verify(&req.order_id, &req.txn_id)
        .await?;
    Ok(Json(receipt_body(&receipt)))
}

async fn list_orders_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<Order>>, Error> {
    Ok(Json(state.service.list_orders().await?))
}

fn receipt_body(receipt: &VerifyReceipt) -> Value {
    let status = if receipt.already_verified {
        "already-verified"
    } else {
        "verified"
    };
    json!({
        "status": status,
        "orderId": receipt.order_id,
        "downloadRef": receipt.download_ref,
    })
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Self::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid-input"),
            Self::InvalidTransactionFormat(_) => {
                (StatusCode::BAD_REQUEST, "invalid-transaction-format")
            }
            Self::CardNotFound(_) => (StatusCode::NOT_FOUND, "card-not-found"),
            Self::OrderNotFound(_) => (StatusCode::NOT_FOUND, "order-not-found"),
            Self::SoldOut => (StatusCode::CONFLICT, "sold-out"),
            Self::DuplicateTransaction => (StatusCode::CONFLICT, "duplicate-transaction"),
            Self::Retryable(_) => (StatusCode::SERVICE_UNAVAILABLE, "retryable"),
            Self::Config(_) | Self::Store(_) | Self::Notify(_) | Self::Io(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };

        // Internal failures keep their detail in the logs, not the wire.
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("internal error serving request: {self}");
            "internal error".to_string()
        } else {
            self.to_string()
        };

        let body = Json(json!({"error": code, "message": message}));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (Error::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (
                Error::InvalidTransactionFormat("x".into()),
                StatusCode::BAD_REQUEST,
            ),
            (Error::CardNotFound(1), StatusCode::NOT_FOUND),
            (Error::OrderNotFound("x".into()), StatusCode::NOT_FOUND),
            (Error::SoldOut, StatusCode::CONFLICT),
            (Error::DuplicateTransaction, StatusCode::CONFLICT),
            (Error::Retryable("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (Error::Store("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }

    #[test]
    fn test_receipt_body_statuses() {
        let fresh = VerifyReceipt {
            order_id: "ORD-1-abc".to_string(),
            already_verified: false,
            download_ref: "https://cards.example/1.png".to_string(),
        };
        assert_eq!(receipt_body(&fresh)["status"], "verified");

        let replay = VerifyReceipt {
            already_verified: true,
            ..fresh
        };
        assert_eq!(receipt_body(&replay)["status"], "already-verified");
    }
}
