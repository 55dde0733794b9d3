//! API error responses
//!
//! Maps ledger errors onto HTTP status codes with a stable JSON body so
//! clients can branch on `error` without parsing prose.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use framely_ledger::LedgerError;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Post-verification webhook failure. Always a 5xx so the provider
    /// keeps redelivering until processing succeeds.
    #[error("processing failed: {0}")]
    Processing(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message, retryable) = match &self {
            ApiError::Ledger(e) => {
                let status = match e {
                    LedgerError::InvalidTarget(_) => StatusCode::BAD_REQUEST,
                    LedgerError::AlreadyOnPlan
                    | LedgerError::DowngradeNotSupported
                    | LedgerError::NoGatewaySubscription
                    | LedgerError::UpgradeNotAvailable => StatusCode::CONFLICT,
                    LedgerError::SignatureInvalid => StatusCode::UNAUTHORIZED,
                    LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
                    LedgerError::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
                    LedgerError::GatewayRejected(_) => StatusCode::BAD_GATEWAY,
                    LedgerError::TransientConflict => StatusCode::SERVICE_UNAVAILABLE,
                    // UnknownPlan only surfaces while processing provider
                    // events; a retry after a plan-table deploy can succeed.
                    LedgerError::UnknownPlan(_)
                    | LedgerError::Database(_)
                    | LedgerError::BalanceViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.kind(), e.to_string(), e.is_retryable())
            }
            ApiError::Unauthorized(msg) => {
                (StatusCode::UNAUTHORIZED, "Unauthorized", msg.clone(), false)
            }
            ApiError::Processing(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "ProcessingFailed",
                msg.clone(),
                true,
            ),
        };

        if status.is_server_error() {
            tracing::error!(status = %status, error, %message, "Request failed");
        }

        // 5xx bodies keep the stable error code but drop internal detail.
        let message = if status.is_server_error() {
            "internal error".to_string()
        } else {
            message
        };

        (
            status,
            Json(json!({ "error": error, "message": message, "retryable": retryable })),
        )
            .into_response()
    }
}
