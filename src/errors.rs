use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::services::payment_gateway::GatewayError;

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

/// Error body returned by every failing endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "Payment Required",
    "message": "Payment declined: Your card has insufficient funds.",
    "code": "card_declined",
    "request_id": "req-abc123xyz",
    "timestamp": "2024-12-09T10:30:00.000Z"
}))]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Payment Required")
    pub error: String,
    /// Human-readable error description
    pub message: String,
    /// Machine-readable code, present for payment failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Client secret to resume an authentication challenge
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Unique request identifier for support and debugging
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// RFC 3339 timestamp when the error occurred
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        sea_orm::error::DbErr,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Payment failed: {0}")]
    PaymentFailed(String),

    #[error("Payment declined: {message}")]
    PaymentDeclined {
        code: Option<String>,
        decline_code: Option<String>,
        message: String,
    },

    #[error("Payment requires additional authentication")]
    PaymentRequiresAction { client_secret: Option<String> },

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<GatewayError> for ServiceError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::CardDeclined {
                code,
                decline_code,
                message,
            } => ServiceError::PaymentDeclined {
                code,
                decline_code,
                message,
            },
            GatewayError::AuthenticationRequired { client_secret } => {
                ServiceError::PaymentRequiresAction { client_secret }
            }
            GatewayError::InvalidRequest { message, .. } => ServiceError::PaymentFailed(message),
            GatewayError::IdempotencyConflict(msg) => ServiceError::Conflict(msg),
            GatewayError::Network(msg) | GatewayError::RateLimited(msg) => {
                ServiceError::ServiceUnavailable(format!("payment gateway: {}", msg))
            }
            GatewayError::Authentication(msg)
            | GatewayError::Api(msg)
            | GatewayError::Decode(msg) => ServiceError::ExternalServiceError(msg),
        }
    }
}

impl ServiceError {
    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_)
            | Self::InvalidOperation(_)
            | Self::InvalidInput(_)
            | Self::InvalidStatus(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::PaymentFailed(_)
            | Self::PaymentDeclined { .. }
            | Self::PaymentRequiresAction { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::ExternalServiceError(_) => StatusCode::BAD_GATEWAY,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::InternalError(_) | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::InternalError(_) | Self::Other(_) => "Internal server error".to_string(),
            Self::ExternalServiceError(_) => "Payment gateway error".to_string(),
            _ => self.to_string(),
        }
    }

    /// Machine-readable code for payment outcomes so clients can pick the right UI
    pub fn error_code(&self) -> Option<String> {
        match self {
            Self::PaymentDeclined {
                code, decline_code, ..
            } => decline_code
                .clone()
                .or_else(|| code.clone())
                .or_else(|| Some("card_declined".to_string())),
            Self::PaymentRequiresAction { .. } => Some("requires_action".to_string()),
            Self::PaymentFailed(_) => Some("payment_failed".to_string()),
            Self::ServiceUnavailable(_) => Some("gateway_unavailable".to_string()),
            _ => None,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let client_secret = match &self {
            Self::PaymentRequiresAction { client_secret } => client_secret.clone(),
            _ => None,
        };

        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            code: self.error_code(),
            client_secret,
            request_id: current_request_id(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}
