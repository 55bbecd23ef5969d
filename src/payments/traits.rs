//! Payment gateway trait definitions
//!
//! Defines the common interface both gateway adapters implement. The adapter
//! for a payment is picked by the `provider` tag stored on the payment row.

use crate::error::{PaymentError, PaymentResult};
use crate::payments::types::{
    ConfirmOutcome, ConfirmRequest, IntentCreated, IntentRequest, Provider, RefundCall,
    RefundSubmitted, SavedMethodDetails, WebhookEvent,
};
use async_trait::async_trait;
use http::HeaderMap;
use std::sync::Arc;

/// Trait for payment gateway adapters
///
/// Provider errors are translated into [`PaymentError`] inside the adapter.
/// A decline on confirm is reported as [`ConfirmOutcome::Rejected`], not an error.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn provider(&self) -> Provider;

    /// Open an intent (or order) with the provider
    async fn create_intent(&self, request: IntentRequest) -> PaymentResult<IntentCreated>;

    /// Confirm or capture an intent
    ///
    /// # Errors
    /// * `NotFound` if the provider does not know the intent
    /// * `GatewayUnavailable` on network failure or 5xx (retryable)
    /// * `GatewayTimeout` if no answer arrived in time (outcome unknown)
    async fn confirm(&self, request: ConfirmRequest) -> PaymentResult<ConfirmOutcome>;

    /// Refund part or all of a captured charge
    async fn refund(&self, request: RefundCall) -> PaymentResult<RefundSubmitted>;

    /// Verify and normalize a webhook delivery
    ///
    /// Fails with `InvalidSignature` when authenticity checks fail.
    async fn parse_webhook(&self, payload: &[u8], headers: &HeaderMap)
        -> PaymentResult<WebhookEvent>;

    /// Look up the display details of a vaulted payment method
    async fn fetch_payment_method(&self, provider_method_id: &str)
        -> PaymentResult<SavedMethodDetails> {
        let _ = provider_method_id;
        Err(PaymentError::Validation(format!(
            "{} does not support saved payment methods",
            self.provider()
        )))
    }
}

/// The configured adapters, keyed by provider
#[derive(Clone, Default)]
pub struct Gateways {
    stripe: Option<Arc<dyn PaymentGateway>>,
    paypal: Option<Arc<dyn PaymentGateway>>,
}

impl Gateways {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        match gateway.provider() {
            Provider::Stripe => self.stripe = Some(gateway),
            Provider::PayPal => self.paypal = Some(gateway),
        }
        self
    }

    pub fn get(&self, provider: Provider) -> PaymentResult<Arc<dyn PaymentGateway>> {
        let gateway = match provider {
            Provider::Stripe => self.stripe.as_ref(),
            Provider::PayPal => self.paypal.as_ref(),
        };
        gateway.cloned().ok_or_else(|| {
            PaymentError::Validation(format!("payment provider '{}' is not configured", provider))
        })
    }

    pub fn providers(&self) -> Vec<Provider> {
        let mut providers = Vec::new();
        if self.stripe.is_some() {
            providers.push(Provider::Stripe);
        }
        if self.paypal.is_some() {
            providers.push(Provider::PayPal);
        }
        providers
    }
}
