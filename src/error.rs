//! Error taxonomy for the gateway core.
//!
//! Internal error kinds are never exposed as a payment status: `failed` on a
//! payment means settlement failed, not that the gateway had a problem.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Represents all error conditions raised by the reconciliation core.
#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    /// Malformed request: bad amount, unsupported currency/method pairing,
    /// or an unparseable webhook payload. Rejected before any ledger mutation.
    #[error("validation error: {0}")]
    Validation(String),
    /// Signature or API-key verification failure. No payment mutation occurs.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Unknown payment, transaction, or address reference.
    #[error("not found: {0}")]
    NotFound(String),
    /// Idempotency short-circuit: the event was already applied. Carries the
    /// existing outcome and is not a failure.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Chain RPC timeout or processor unavailability. Retried with backoff by
    /// the calling poller; never surfaced to the payer as a payment failure.
    #[error("transient upstream failure: {0}")]
    Transient(String),
    /// An invariant was violated (e.g. confirmations regressed on a confirmed
    /// transaction). The affected payment is frozen pending manual review.
    #[error("fatal inconsistency: {0}")]
    FatalInconsistency(String),
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub error: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            GatewayError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            GatewayError::Auth(_) => (StatusCode::UNAUTHORIZED, "AUTHENTICATION_FAILED"),
            GatewayError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            GatewayError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            GatewayError::Transient(msg) => {
                tracing::warn!("upstream unavailable: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, "UPSTREAM_UNAVAILABLE")
            }
            GatewayError::FatalInconsistency(msg) => {
                tracing::error!("fatal inconsistency: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "FATAL_INCONSISTENCY")
            }
        };
        let body = Json(ErrorBody {
            code,
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}
