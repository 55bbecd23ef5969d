//! Error taxonomy for payment processing
//!
//! Gateway failures are translated into these variants at the adapter boundary;
//! raw provider errors never escape an adapter.

use crate::database::error::DatabaseError;
use crate::payments::money::Money;
use crate::payments::types::Provider;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Generic message shown when a gateway gives no specific reason
pub const GENERIC_FAILURE_MESSAGE: &str = "Payment failed, please try again";

#[derive(Error, Debug)]
pub enum PaymentError {
    /// Bad input from the caller; never retried
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Invariant violation such as re-confirming a terminal intent
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Refund of {requested} exceeds the remaining refundable balance of {remaining}")]
    RefundExceedsBalance { requested: Money, remaining: Money },

    /// The provider explicitly declined
    #[error("Declined by {provider}: {reason}")]
    GatewayRejected {
        provider: Provider,
        reason: String,
        code: Option<String>,
    },

    /// Network failure or 5xx from the provider
    #[error("{provider} unavailable: {message}")]
    GatewayUnavailable { provider: Provider, message: String },

    /// The provider did not answer in time; the outcome is unknown
    #[error("{provider} did not respond in time")]
    GatewayTimeout { provider: Provider },

    #[error("Invalid webhook signature: {0}")]
    InvalidSignature(String),

    #[error("Authentication required")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for payment operations
pub type PaymentResult<T> = Result<T, PaymentError>;

impl PaymentError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether the orchestration layer may retry the call once
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::GatewayUnavailable { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::RefundExceedsBalance { .. })
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            // Resources the caller may not see are reported as missing
            Self::NotFound { .. } | Self::Forbidden(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::RefundExceedsBalance { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::GatewayRejected { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::GatewayUnavailable { .. } | Self::GatewayTimeout { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::InvalidSignature(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Database(e) if e.is_connectivity() => StatusCode::SERVICE_UNAVAILABLE,
            Self::Configuration(_) | Self::Database(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound { .. } | Self::Forbidden(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::RefundExceedsBalance { .. } => "refund_exceeds_balance",
            Self::GatewayRejected { .. } => "gateway_rejected",
            Self::GatewayUnavailable { .. } | Self::GatewayTimeout { .. } => "gateway_unavailable",
            Self::InvalidSignature(_) => "invalid_signature",
            Self::Unauthorized => "unauthorized",
            Self::Database(e) if e.is_connectivity() => "service_unavailable",
            Self::Configuration(_) | Self::Database(_) | Self::Internal(_) => "internal_error",
        }
    }

    /// Message safe to show to the storefront user
    pub fn user_message(&self) -> String {
        match self {
            Self::GatewayRejected { reason, .. } if !reason.trim().is_empty() => reason.clone(),
            Self::GatewayRejected { .. }
            | Self::GatewayUnavailable { .. }
            | Self::GatewayTimeout { .. } => GENERIC_FAILURE_MESSAGE.to_string(),
            Self::InvalidSignature(_) => "Invalid webhook signature".to_string(),
            Self::Forbidden(_) => "Not found".to_string(),
            Self::Configuration(_) | Self::Database(_) | Self::Internal(_) => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for PaymentError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = json!({
            "error": {
                "code": self.code(),
                "message": self.user_message(),
            }
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::money::Currency;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            PaymentError::Validation("bad".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            PaymentError::not_found("payment", "x").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            PaymentError::RefundExceedsBalance {
                requested: Money::new(5000, Currency::USD),
                remaining: Money::new(4000, Currency::USD),
            }
            .status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            PaymentError::InvalidSignature("mismatch".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            PaymentError::Forbidden("staff only".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        let pool = PaymentError::Database(DatabaseError::new(
            crate::database::error::DatabaseErrorKind::PoolExhausted,
        ));
        assert_eq!(pool.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(pool.code(), "service_unavailable");
    }

    #[test]
    fn test_only_unavailable_is_retryable() {
        assert!(PaymentError::GatewayUnavailable {
            provider: Provider::Stripe,
            message: "502".into()
        }
        .is_retryable());
        assert!(!PaymentError::GatewayTimeout {
            provider: Provider::Stripe
        }
        .is_retryable());
        assert!(!PaymentError::GatewayRejected {
            provider: Provider::Stripe,
            reason: "declined".into(),
            code: None
        }
        .is_retryable());
    }

    #[test]
    fn test_user_message_prefers_decline_reason() {
        let declined = PaymentError::GatewayRejected {
            provider: Provider::Stripe,
            reason: "Your card has insufficient funds.".into(),
            code: Some("insufficient_funds".into()),
        };
        assert_eq!(declined.user_message(), "Your card has insufficient funds.");

        let silent = PaymentError::GatewayRejected {
            provider: Provider::PayPal,
            reason: String::new(),
            code: None,
        };
        assert_eq!(silent.user_message(), GENERIC_FAILURE_MESSAGE);
    }
}
