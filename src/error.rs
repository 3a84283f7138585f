use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Public, bounded messages. Anything that can reach an HTTP client lives here
/// so internal details never leak into responses.
pub mod msg {
    pub const INVALID_SIGNATURE: &str = "Invalid signature";
    pub const UNSUPPORTED_PROVIDER: &str = "Unsupported provider";
    pub const OK: &str = "OK";
    pub const ALREADY_PROCESSED: &str = "Already processed";
    pub const EVENT_NOT_PROCESSABLE: &str = "Event not processable";
    pub const PAYMENT_NOT_FOUND: &str = "Payment not found";
    pub const SUBSCRIPTION_NOT_FOUND: &str = "Subscription not found";
    pub const PRICE_NOT_CONFIGURED: &str = "Tree price not configured";
    pub const PAYMENT_HAS_NO_OWNER: &str = "Payment has no owner";
    pub const DATABASE_ERROR: &str = "Database error";
    pub const INVALID_WEBHOOK_SECRET: &str = "Invalid webhook secret";
    pub const UNSUPPORTED_CURRENCY: &str = "Unsupported currency";
    pub const AMOUNT_MUST_BE_POSITIVE: &str = "Amount must be positive";
    pub const INTERVAL_COUNT_MUST_BE_POSITIVE: &str = "Interval count must be positive";
    pub const USER_NOT_FOUND: &str = "User not found";
    pub const ACHIEVEMENT_NOT_FOUND: &str = "Achievement not found";
    pub const PRICE_NOT_FOUND: &str = "Tree price not found";
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, details) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "Not found", Some(msg.clone())),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "Bad request", Some(msg.clone())),
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", None)
            }
            AppError::Pool(e) => {
                tracing::error!("Pool error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", None)
            }
            AppError::Json(e) => {
                tracing::error!("JSON error: {}", e);
                (StatusCode::BAD_REQUEST, "Invalid JSON", Some(e.to_string()))
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", None)
            }
        };

        let body = ErrorResponse {
            error: error.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
