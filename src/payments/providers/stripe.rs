//! Stripe gateway
//!
//! Card payments through the PaymentIntents API: the intent is created
//! server-side, the client secret goes to the browser, and the confirm call
//! (or the `payment_intent.*` webhook) settles it.

use super::{build_client, header_str, malformed_response, map_transport_error};
use crate::error::{PaymentError, PaymentResult};
use crate::ledger::models::{CardSnapshot, PaymentMethodKind, RefundReason, SavedMethodType};
use crate::payments::traits::PaymentGateway;
use crate::payments::types::{
    Authenticity, ConfirmOutcome, ConfirmRequest, GatewayRefundStatus, IntentCreated,
    IntentRequest, Provider, RefundCall, RefundSubmitted, SavedMethodDetails, WebhookEvent,
    WebhookEventKind,
};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use http::HeaderMap;
use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

const DEFAULT_BASE_URL: &str = "https://api.stripe.com/v1";

/// Stripe gateway configuration
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Secret API key (`sk_live_...` / `sk_test_...`)
    pub secret_key: SecretString,
    /// Endpoint signing secret (`whsec_...`)
    pub webhook_secret: Option<SecretString>,
    pub base_url: String,
    pub timeout_secs: u64,
    /// Maximum age of a signed webhook timestamp
    pub webhook_tolerance_secs: i64,
}

impl StripeConfig {
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self {
            secret_key: SecretString::from(secret_key.into()),
            webhook_secret: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: 30,
            webhook_tolerance_secs: 300,
        }
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook_secret = Some(SecretString::from(secret.into()));
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

pub struct StripeGateway {
    config: StripeConfig,
    client: Client,
}

impl StripeGateway {
    pub fn new(config: StripeConfig) -> PaymentResult<Self> {
        let client = build_client(Provider::Stripe, Duration::from_secs(config.timeout_secs))?;
        Ok(Self { config, client })
    }

    fn post(&self, path: &str, idempotency_key: &str) -> RequestBuilder {
        self.client
            .post(format!("{}{}", self.config.base_url, path))
            .bearer_auth(self.config.secret_key.expose_secret())
            .header("Idempotency-Key", idempotency_key)
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.client
            .get(format!("{}{}", self.config.base_url, path))
            .bearer_auth(self.config.secret_key.expose_secret())
    }

    /// Send a request, keeping Stripe's error answer as data
    async fn execute<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> PaymentResult<Result<T, StripeApiError>> {
        let response = request
            .send()
            .await
            .map_err(|e| map_transport_error(Provider::Stripe, e))?;
        let status = response.status();

        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map(Ok)
                .map_err(|e| malformed_response(Provider::Stripe, e));
        }

        let body = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<StripeErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or_default();
        Ok(Err(StripeApiError { status, detail }))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> PaymentResult<T> {
        self.execute(request)
            .await?
            .map_err(|e| stripe_error(e.status, e.detail))
    }

    async fn retrieve_intent(&self, intent_id: &str) -> PaymentResult<StripeIntent> {
        self.send(
            self.get(&format!("/payment_intents/{}", intent_id))
                .query(&[("expand[]", "payment_method")]),
        )
        .await
        .map_err(|e| match e {
            PaymentError::NotFound { .. } => PaymentError::not_found("payment intent", intent_id),
            other => other,
        })
    }

    /// Verify the `Stripe-Signature` header against the raw payload
    fn verify_signature(&self, payload: &[u8], header: &str) -> PaymentResult<()> {
        let secret = self.config.webhook_secret.as_ref().ok_or_else(|| {
            PaymentError::InvalidSignature("webhook signing secret is not configured".into())
        })?;

        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
                Some(("v1", value)) => signatures.push(value),
                _ => {}
            }
        }
        let timestamp = timestamp
            .ok_or_else(|| PaymentError::InvalidSignature("missing timestamp".into()))?;
        if signatures.is_empty() {
            return Err(PaymentError::InvalidSignature("missing v1 signature".into()));
        }

        let age = chrono::Utc::now().timestamp() - timestamp;
        if age.abs() > self.config.webhook_tolerance_secs {
            return Err(PaymentError::InvalidSignature(format!(
                "timestamp outside tolerance ({}s)",
                age
            )));
        }

        let mut mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
            .map_err(|e| PaymentError::Configuration(e.to_string()))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);

        let verified = signatures.iter().any(|candidate| {
            hex::decode(candidate)
                .map(|expected| mac.clone().verify_slice(&expected).is_ok())
                .unwrap_or(false)
        });
        if verified {
            Ok(())
        } else {
            Err(PaymentError::InvalidSignature("signature mismatch".into()))
        }
    }
}

fn stripe_error(status: StatusCode, detail: StripeErrorDetail) -> PaymentError {
    let message = detail
        .message
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));

    // Only card errors are declines; anything else says nothing about the money
    if status == StatusCode::PAYMENT_REQUIRED || detail.error_type.as_deref() == Some("card_error") {
        return PaymentError::GatewayRejected {
            provider: Provider::Stripe,
            reason: message,
            code: detail.decline_code.or(detail.code),
        };
    }
    match status {
        StatusCode::NOT_FOUND => PaymentError::not_found("Stripe object", message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            warn!("Stripe rejected the API key");
            PaymentError::Configuration("Stripe rejected the configured API key".into())
        }
        StatusCode::TOO_MANY_REQUESTS => PaymentError::GatewayUnavailable {
            provider: Provider::Stripe,
            message: "rate limited".into(),
        },
        // Another request with the same idempotency key is still in flight
        StatusCode::CONFLICT => PaymentError::GatewayUnavailable {
            provider: Provider::Stripe,
            message,
        },
        s if s.is_server_error() => PaymentError::GatewayUnavailable {
            provider: Provider::Stripe,
            message,
        },
        _ => {
            warn!(code = ?detail.code, "Stripe refused the request");
            PaymentError::Validation(format!("Stripe refused the request: {}", message))
        }
    }
}

/// `latest_charge` and friends arrive either as an id or an expanded object
fn object_id(value: &Value) -> Option<String> {
    match value {
        Value::String(id) => Some(id.clone()),
        Value::Object(map) => map.get("id").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn card_snapshot(payment_method: &Value) -> Option<CardSnapshot> {
    let card = payment_method.get("card")?;
    Some(CardSnapshot {
        brand: card.get("brand")?.as_str()?.to_string(),
        last4: card.get("last4")?.as_str()?.to_string(),
    })
}

fn refund_status(status: &str) -> GatewayRefundStatus {
    match status {
        "succeeded" => GatewayRefundStatus::Succeeded,
        "failed" | "canceled" => GatewayRefundStatus::Failed,
        _ => GatewayRefundStatus::Pending,
    }
}

fn intent_outcome(intent: StripeIntent) -> ConfirmOutcome {
    match intent.status.as_str() {
        "succeeded" => ConfirmOutcome::Succeeded {
            transaction_id: intent
                .latest_charge
                .as_ref()
                .and_then(object_id)
                .unwrap_or_else(|| intent.id.clone()),
            card: intent.payment_method.as_ref().and_then(card_snapshot),
        },
        "requires_action" | "requires_confirmation" => ConfirmOutcome::RequiresAction {
            client_action_token: intent.client_secret,
        },
        "requires_payment_method" | "canceled" => {
            let error = intent.last_payment_error.unwrap_or_default();
            ConfirmOutcome::Rejected {
                reason: error
                    .message
                    .or(intent.cancellation_reason)
                    .unwrap_or_default(),
                code: error.decline_code.or(error.code),
            }
        }
        _ => ConfirmOutcome::Processing,
    }
}

fn webhook_kind(event_type: &str, object: &Value) -> WebhookEventKind {
    let id = || object.get("id").and_then(Value::as_str).map(str::to_string);
    let str_field = |name: &str| object.get(name).and_then(Value::as_str).map(str::to_string);

    match event_type {
        "payment_intent.succeeded" => match id() {
            Some(intent_id) => {
                // Older API versions list charges instead of `latest_charge`;
                // refunds also accept the intent id itself
                let transaction_id = object
                    .get("latest_charge")
                    .and_then(object_id)
                    .or_else(|| object.pointer("/charges/data/0").and_then(object_id))
                    .unwrap_or_else(|| intent_id.clone());
                WebhookEventKind::PaymentSucceeded {
                    intent_id,
                    transaction_id: Some(transaction_id),
                }
            }
            None => WebhookEventKind::Ignored,
        },
        "payment_intent.processing" => match id() {
            Some(intent_id) => WebhookEventKind::PaymentProcessing { intent_id },
            None => WebhookEventKind::Ignored,
        },
        "payment_intent.payment_failed" | "payment_intent.canceled" => match id() {
            Some(intent_id) => WebhookEventKind::PaymentFailed {
                intent_id,
                reason: object
                    .pointer("/last_payment_error/message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or_else(|| str_field("cancellation_reason"))
                    .unwrap_or_else(|| "Payment failed".to_string()),
            },
            None => WebhookEventKind::Ignored,
        },
        "refund.created" | "refund.updated" | "refund.failed" | "charge.refund.updated" => {
            match id() {
                Some(provider_refund_id) => WebhookEventKind::RefundUpdated {
                    provider_refund_id,
                    refund_ref: object
                        .pointer("/metadata/refund_id")
                        .and_then(Value::as_str)
                        .and_then(|s| Uuid::parse_str(s).ok()),
                    status: refund_status(str_field("status").as_deref().unwrap_or("pending")),
                    failure_reason: str_field("failure_reason"),
                },
                None => WebhookEventKind::Ignored,
            }
        }
        _ => WebhookEventKind::Ignored,
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn provider(&self) -> Provider {
        Provider::Stripe
    }

    async fn create_intent(&self, request: IntentRequest) -> PaymentResult<IntentCreated> {
        info!(
            order_id = %request.order_id,
            amount = request.amount.amount,
            currency = %request.amount.currency,
            "Creating Stripe payment intent"
        );

        let mut params = vec![
            ("amount", request.amount.amount.to_string()),
            ("currency", request.amount.currency.code().to_lowercase()),
            ("metadata[order_id]", request.order_id.to_string()),
        ];
        if let Some(method) = &request.saved_method_id {
            params.push(("payment_method", method.clone()));
        }

        let intent: StripeIntent = self
            .send(
                self.post("/payment_intents", &request.idempotency_key)
                    .form(&params),
            )
            .await?;

        let client_secret = intent
            .client_secret
            .clone()
            .ok_or_else(|| malformed_response(Provider::Stripe, "intent without client_secret"))?;

        info!(intent_id = %intent.id, status = %intent.status, "Stripe payment intent created");

        Ok(IntentCreated {
            requires_user_action: intent.status != "succeeded",
            provider_data: serde_json::json!({ "status": intent.status }),
            intent_id: intent.id,
            client_action_token: client_secret,
            method: PaymentMethodKind::Card,
        })
    }

    async fn confirm(&self, request: ConfirmRequest) -> PaymentResult<ConfirmOutcome> {
        info!(intent_id = %request.intent_id, "Confirming Stripe payment intent");

        let mut params = vec![("expand[]", "payment_method".to_string())];
        if let Some(token) = &request.payment_method_token {
            params.push(("payment_method", token.clone()));
        }

        let answer: Result<StripeIntent, StripeApiError> = self
            .execute(
                self.post(
                    &format!("/payment_intents/{}/confirm", request.intent_id),
                    &request.idempotency_key,
                )
                .form(&params),
            )
            .await?;

        let result = match answer {
            Ok(intent) => Ok(intent),
            // Already confirmed client-side (or succeeded/canceled): read where it stands
            Err(e) if e.detail.code.as_deref() == Some(UNEXPECTED_STATE) => {
                info!(intent_id = %request.intent_id, "intent already past confirmation, re-reading it");
                self.retrieve_intent(&request.intent_id).await
            }
            Err(e) => Err(stripe_error(e.status, e.detail)),
        };

        match result {
            Ok(intent) => {
                info!(intent_id = %intent.id, status = %intent.status, "Stripe confirm answered");
                Ok(intent_outcome(intent))
            }
            Err(PaymentError::GatewayRejected { reason, code, .. }) => {
                info!(intent_id = %request.intent_id, ?code, "Stripe declined payment");
                Ok(ConfirmOutcome::Rejected { reason, code })
            }
            Err(PaymentError::NotFound { .. }) => {
                Err(PaymentError::not_found("payment intent", &request.intent_id))
            }
            Err(other) => Err(other),
        }
    }

    async fn refund(&self, request: RefundCall) -> PaymentResult<RefundSubmitted> {
        info!(
            transaction_id = %request.transaction_id,
            amount = request.amount.amount,
            refund_id = %request.idempotency_key,
            "Submitting Stripe refund"
        );

        let target = if request.transaction_id.starts_with("pi_") {
            "payment_intent"
        } else {
            "charge"
        };
        let mut params = vec![
            (target, request.transaction_id.clone()),
            ("amount", request.amount.amount.to_string()),
            ("metadata[refund_id]", request.idempotency_key.clone()),
        ];
        let reason = match request.reason {
            RefundReason::Duplicate => Some("duplicate"),
            RefundReason::Fraudulent => Some("fraudulent"),
            RefundReason::RequestedByCustomer => Some("requested_by_customer"),
            RefundReason::Defective | RefundReason::Other => None,
        };
        if let Some(reason) = reason {
            params.push(("reason", reason.to_string()));
        }

        let refund: StripeRefund = self
            .send(self.post("/refunds", &request.idempotency_key).form(&params))
            .await?;

        info!(provider_refund_id = %refund.id, status = %refund.status, "Stripe refund accepted");

        Ok(RefundSubmitted {
            status: refund_status(&refund.status),
            provider_refund_id: refund.id,
            failure_reason: refund.failure_reason,
        })
    }

    async fn parse_webhook(
        &self,
        payload: &[u8],
        headers: &HeaderMap,
    ) -> PaymentResult<WebhookEvent> {
        let signature = header_str(headers, SIGNATURE_HEADER)
            .ok_or_else(|| PaymentError::InvalidSignature("missing Stripe-Signature header".into()))?;
        self.verify_signature(payload, signature)?;

        let event: StripeEvent = serde_json::from_slice(payload)
            .map_err(|e| PaymentError::Validation(format!("malformed Stripe event: {}", e)))?;
        let kind = webhook_kind(&event.event_type, &event.data.object);
        let payload = serde_json::from_slice(payload).unwrap_or(Value::Null);

        Ok(WebhookEvent {
            event_id: event.id,
            event_type: event.event_type,
            kind,
            authenticity: Authenticity::Verified,
            payload,
        })
    }

    async fn fetch_payment_method(
        &self,
        provider_method_id: &str,
    ) -> PaymentResult<SavedMethodDetails> {
        let method: StripePaymentMethod = self
            .send(self.get(&format!("/payment_methods/{}", provider_method_id)))
            .await
            .map_err(|e| match e {
                PaymentError::NotFound { .. } => {
                    PaymentError::not_found("payment method", provider_method_id)
                }
                other => other,
            })?;

        let method_type = match method.method_type.as_str() {
            "card" => SavedMethodType::Card,
            "us_bank_account" | "sepa_debit" | "bacs_debit" | "au_becs_debit" | "acss_debit" => {
                SavedMethodType::Bank
            }
            _ => SavedMethodType::Wallet,
        };
        let card = method.card.unwrap_or_default();

        Ok(SavedMethodDetails {
            provider_method_id: method.id,
            method_type,
            card_brand: card.brand,
            card_last4: card.last4,
            exp_month: card.exp_month,
            exp_year: card.exp_year,
        })
    }
}

// Stripe API types

const UNEXPECTED_STATE: &str = "payment_intent_unexpected_state";

/// A non-2xx answer from Stripe
#[derive(Debug)]
struct StripeApiError {
    status: StatusCode,
    detail: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Default, Deserialize)]
struct StripeErrorDetail {
    message: Option<String>,
    #[serde(rename = "type")]
    error_type: Option<String>,
    code: Option<String>,
    decline_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeIntent {
    id: String,
    status: String,
    client_secret: Option<String>,
    latest_charge: Option<Value>,
    payment_method: Option<Value>,
    last_payment_error: Option<StripeErrorDetail>,
    cancellation_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeRefund {
    id: String,
    status: String,
    failure_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: Value,
}

#[derive(Debug, Deserialize)]
struct StripePaymentMethod {
    id: String,
    #[serde(rename = "type")]
    method_type: String,
    card: Option<StripeCard>,
}

#[derive(Debug, Default, Deserialize)]
struct StripeCard {
    brand: Option<String>,
    last4: Option<String>,
    exp_month: Option<i32>,
    exp_year: Option<i32>,
}
