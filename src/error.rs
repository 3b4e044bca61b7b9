use axum::{http::StatusCode, response::IntoResponse, Json};
use rust_decimal::Decimal;
use thiserror::Error;

/// Closed application error taxonomy, one variant per HTTP-facing error code.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("entity not found: {0}")]
    EntityNotFound(String),
    #[error("insufficient funds: requested {requested_amount}, available {available_amount}")]
    InsufficientFunds {
        requested_amount: Decimal,
        available_amount: Decimal,
    },
    #[error("job already started")]
    JobAlreadyStarted,
    #[error("job already cancelled")]
    JobAlreadyCancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::EntityNotFound(_) => "ENTITY_NOT_FOUND",
            Self::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            Self::JobAlreadyStarted => "JOB_ALREADY_STARTED",
            Self::JobAlreadyCancelled => "JOB_ALREADY_CANCELLED",
            Self::Internal(_) => "INTERNAL",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::EntityNotFound(_) => StatusCode::NOT_FOUND,
            Self::InsufficientFunds { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::JobAlreadyStarted | Self::JobAlreadyCancelled => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        if matches!(self, Self::Internal(_)) {
            tracing::error!(error = %self, "internal error");
        }
        let status = self.status();
        let error_code = self.error_code();
        let details = match &self {
            Self::InsufficientFunds {
                requested_amount,
                available_amount,
            } => serde_json::json!({
                "requested_amount": requested_amount.to_string(),
                "available_amount": available_amount.to_string(),
            }),
            _ => serde_json::json!({}),
        };
        let body = Json(serde_json::json!({
            "error_code": error_code,
            "message": self.to_string(),
            "details": details,
        }));
        (status, body).into_response()
    }
}

/// Error surfaced from inside a queue consumer's `_consume` body.
///
/// Never reaches the HTTP layer. It only decides the Event row's
/// COMPLETED/FAILED marker and whether the message is deleted or left for
/// redelivery (§4.7). `Retriable` covers transient conditions (the
/// referenced job isn't visible yet, a lock could not be acquired);
/// `Permanent` covers conditions redelivery can never fix (schema mismatch,
/// a finished job re-reported as started).
#[derive(Error, Debug)]
pub enum EventError {
    #[error("retriable: {0}")]
    Retriable(String),
    #[error("permanent: {0}")]
    Permanent(String),
}

impl EventError {
    pub fn message(&self) -> String {
        match self {
            Self::Retriable(message) | Self::Permanent(message) => message.clone(),
        }
    }
}
