use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::credits::ledger::LedgerError;
use crate::credits::models::Feature;
use crate::credits::store::StoreError;

/// Application-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized")]
    Unauthorized,

    /// No usable credit for `feature`; `expired` is set when reconciliation
    /// (or the bucket's own expiry) is why the balance is zero.
    #[error("Insufficient {feature} credits")]
    InsufficientCredit { feature: Feature, expired: bool },

    #[error("Invalid feature: {0}")]
    InvalidFeature(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientCredit(feature) => AppError::InsufficientCredit {
                feature,
                expired: false,
            },
            LedgerError::InvalidFeature(name) => AppError::InvalidFeature(name),
            LedgerError::InvalidPlanTier(name) => {
                AppError::Validation(format!("unknown plan tier '{name}'"))
            }
            LedgerError::ExpiryOutOfRange => {
                AppError::Validation("credit expiry is out of range".to_string())
            }
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(user_id) => {
                AppError::NotFound(format!("No subscription for user {user_id}"))
            }
            StoreError::Conflict(user_id) => AppError::Conflict(format!(
                "Subscription for user {user_id} was modified concurrently, retry the request"
            )),
            StoreError::Corrupt(msg) => AppError::Internal(anyhow::anyhow!(msg)),
            StoreError::Ledger(e) => AppError::from(e),
            StoreError::Database(e) => AppError::Database(e),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "Authentication required".to_string(),
            ),
            AppError::InsufficientCredit { feature, expired } => {
                if *expired {
                    (
                        StatusCode::PAYMENT_REQUIRED,
                        "CREDITS_EXPIRED",
                        format!(
                            "Your {feature} credits have expired. Please purchase more credits to continue."
                        ),
                    )
                } else {
                    (
                        StatusCode::PAYMENT_REQUIRED,
                        "INSUFFICIENT_CREDITS",
                        format!(
                            "You have no {feature} credits remaining. Please purchase more credits to continue."
                        ),
                    )
                }
            }
            AppError::InvalidFeature(name) => (
                StatusCode::BAD_REQUEST,
                "INVALID_FEATURE",
                format!("'{name}' is not a metered feature"),
            ),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            AppError::Database(e) => {
                tracing::error!("Database error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "A database error occurred".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal server error occurred".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}
