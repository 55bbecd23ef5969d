//! Payment gateway types and data structures
//!
//! Provider-agnostic requests and responses exchanged with the gateway adapters.

use crate::error::PaymentError;
use crate::ledger::models::{CardSnapshot, PaymentMethodKind, RefundReason, SavedMethodType};
use crate::payments::money::Money;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// External payment gateway a payment is routed through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Stripe,
    PayPal,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stripe => "stripe",
            Self::PayPal => "paypal",
        }
    }
}

impl FromStr for Provider {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "stripe" => Ok(Self::Stripe),
            "paypal" => Ok(Self::PayPal),
            other => Err(PaymentError::Validation(format!(
                "unknown payment provider '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request to open a payment intent with a gateway
#[derive(Debug, Clone)]
pub struct IntentRequest {
    pub order_id: Uuid,
    pub amount: Money,
    /// Provider-side id of a saved payment method to attach
    pub saved_method_id: Option<String>,
    /// Shared by the first attempt and its retry
    pub idempotency_key: String,
}

/// Intent opened on the gateway side
#[derive(Debug, Clone)]
pub struct IntentCreated {
    pub intent_id: String,
    /// Client secret (card gateway) or approval URL (wallet gateway)
    pub client_action_token: String,
    pub requires_user_action: bool,
    pub method: PaymentMethodKind,
    pub provider_data: serde_json::Value,
}

/// Request to confirm (or capture) an intent
#[derive(Debug, Clone)]
pub struct ConfirmRequest {
    pub intent_id: String,
    pub payment_method_token: Option<String>,
    pub idempotency_key: String,
}

/// Outcome of a confirm call. A decline is data, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Succeeded {
        transaction_id: String,
        card: Option<CardSnapshot>,
    },
    /// Funds are moving; the final state arrives by webhook
    Processing,
    /// The payer still has to authenticate or approve
    RequiresAction { client_action_token: Option<String> },
    Rejected { reason: String, code: Option<String> },
}

/// Refund request sent to a gateway
#[derive(Debug, Clone)]
pub struct RefundCall {
    pub transaction_id: String,
    pub amount: Money,
    pub reason: RefundReason,
    pub notes: Option<String>,
    /// Internal refund id, doubling as the provider idempotency key
    pub idempotency_key: String,
}

/// Refund status as reported by a gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayRefundStatus {
    Pending,
    Succeeded,
    Failed,
}

/// Refund accepted by a gateway
#[derive(Debug, Clone)]
pub struct RefundSubmitted {
    pub provider_refund_id: String,
    pub status: GatewayRefundStatus,
    pub failure_reason: Option<String>,
}

/// Display details of a vaulted payment method as the gateway knows it
#[derive(Debug, Clone)]
pub struct SavedMethodDetails {
    pub provider_method_id: String,
    pub method_type: SavedMethodType,
    pub card_brand: Option<String>,
    pub card_last4: Option<String>,
    pub exp_month: Option<i32>,
    pub exp_year: Option<i32>,
}

/// How strongly a webhook payload was authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authenticity {
    Verified,
    /// No verification capability is configured for this channel
    Unverified,
}

/// Normalized webhook event
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub event_id: String,
    pub event_type: String,
    pub kind: WebhookEventKind,
    pub authenticity: Authenticity,
    pub payload: serde_json::Value,
}

/// The ledger-relevant meaning of a webhook
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEventKind {
    PaymentProcessing {
        intent_id: String,
    },
    PaymentSucceeded {
        intent_id: String,
        transaction_id: Option<String>,
    },
    PaymentFailed {
        intent_id: String,
        reason: String,
    },
    RefundUpdated {
        provider_refund_id: String,
        /// Internal refund id echoed back from request metadata
        refund_ref: Option<Uuid>,
        status: GatewayRefundStatus,
        failure_reason: Option<String>,
    },
    /// Not relevant to the ledger
    Ignored,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_round_trips_through_str() {
        assert_eq!("Stripe".parse::<Provider>().unwrap(), Provider::Stripe);
        assert_eq!("paypal".parse::<Provider>().unwrap(), Provider::PayPal);
        assert!("braintree".parse::<Provider>().is_err());
        assert_eq!(
            serde_json::to_string(&Provider::PayPal).unwrap(),
            "\"paypal\""
        );
    }
}
