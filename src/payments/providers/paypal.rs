//! PayPal gateway
//!
//! Wallet payments through the Orders v2 API: an order is created, the payer
//! approves it on PayPal, and capture settles it. Every call carries an OAuth2
//! client-credentials token held in a [`TokenCache`].

use super::oauth::{FetchedToken, TokenCache};
use super::{build_client, header_str, malformed_response, map_transport_error};
use crate::error::{PaymentError, PaymentResult};
use crate::ledger::models::PaymentMethodKind;
use crate::payments::traits::PaymentGateway;
use crate::payments::types::{
    Authenticity, ConfirmOutcome, ConfirmRequest, GatewayRefundStatus, IntentCreated,
    IntentRequest, Provider, RefundCall, RefundSubmitted, WebhookEvent, WebhookEventKind,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use http::HeaderMap;
use reqwest::{Client, Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

pub const SANDBOX_BASE_URL: &str = "https://api-m.sandbox.paypal.com";
pub const LIVE_BASE_URL: &str = "https://api-m.paypal.com";

/// Headers PayPal signs every webhook delivery with
const TRANSMISSION_HEADERS: [&str; 5] = [
    "paypal-transmission-id",
    "paypal-transmission-time",
    "paypal-transmission-sig",
    "paypal-cert-url",
    "paypal-auth-algo",
];

/// PayPal gateway configuration
#[derive(Debug, Clone)]
pub struct PayPalConfig {
    pub client_id: String,
    pub client_secret: SecretString,
    pub base_url: String,
    /// Webhook id registered with PayPal; without it deliveries cannot be verified
    pub webhook_id: Option<String>,
    pub return_url: Option<String>,
    pub cancel_url: Option<String>,
    pub timeout_secs: u64,
    pub token_refresh_margin_secs: u64,
}

impl PayPalConfig {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: SecretString::from(client_secret.into()),
            base_url: SANDBOX_BASE_URL.to_string(),
            webhook_id: None,
            return_url: None,
            cancel_url: None,
            timeout_secs: 30,
            token_refresh_margin_secs: 300,
        }
    }

    /// API host for `PAYPAL_MODE`
    pub fn base_url_for_mode(mode: &str) -> Option<&'static str> {
        match mode {
            "sandbox" => Some(SANDBOX_BASE_URL),
            "live" => Some(LIVE_BASE_URL),
            _ => None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_webhook_id(mut self, webhook_id: impl Into<String>) -> Self {
        self.webhook_id = Some(webhook_id.into());
        self
    }
}

pub struct PayPalGateway {
    config: PayPalConfig,
    client: Client,
    tokens: TokenCache,
}

impl PayPalGateway {
    pub fn new(config: PayPalConfig) -> PaymentResult<Self> {
        let client = build_client(Provider::PayPal, Duration::from_secs(config.timeout_secs))?;
        let tokens = TokenCache::new(Duration::from_secs(config.token_refresh_margin_secs));
        Ok(Self {
            config,
            client,
            tokens,
        })
    }

    async fn fetch_token(&self) -> PaymentResult<FetchedToken> {
        let credentials = STANDARD.encode(format!(
            "{}:{}",
            self.config.client_id,
            self.config.client_secret.expose_secret()
        ));

        let response = self
            .client
            .post(format!("{}/v1/oauth2/token", self.config.base_url))
            .header("Authorization", format!("Basic {}", credentials))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| map_transport_error(Provider::PayPal, e))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            warn!("PayPal rejected the client credentials");
            return Err(PaymentError::Configuration(
                "PayPal rejected the configured client credentials".into(),
            ));
        }
        if !status.is_success() {
            return Err(PaymentError::GatewayUnavailable {
                provider: Provider::PayPal,
                message: format!("token exchange failed with HTTP {}", status.as_u16()),
            });
        }

        let token: PayPalTokenResponse = response
            .json()
            .await
            .map_err(|e| malformed_response(Provider::PayPal, e))?;
        info!(expires_in = token.expires_in, "PayPal access token obtained");

        Ok(FetchedToken {
            access_token: token.access_token,
            expires_in: Duration::from_secs(token.expires_in),
        })
    }

    async fn access_token(&self) -> PaymentResult<String> {
        self.tokens.get_or_refresh(|| self.fetch_token()).await
    }

    /// Authenticated JSON call
    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &Value,
        request_id: Option<&str>,
    ) -> PaymentResult<T> {
        let token = self.access_token().await?;
        let mut request = self
            .client
            .request(method, format!("{}{}", self.config.base_url, path))
            .bearer_auth(token)
            .header("Prefer", "return=representation");
        if !body.is_null() {
            request = request.json(body);
        }
        if let Some(request_id) = request_id {
            request = request.header("PayPal-Request-Id", request_id);
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_transport_error(Provider::PayPal, e))?;
        let status = response.status();

        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| malformed_response(Provider::PayPal, e));
        }
        if status == StatusCode::UNAUTHORIZED {
            // Revoked or expired early; the next attempt exchanges a new token
            self.tokens.invalidate().await;
            return Err(PaymentError::GatewayUnavailable {
                provider: Provider::PayPal,
                message: "access token rejected".into(),
            });
        }

        let body = response.text().await.unwrap_or_default();
        let error = serde_json::from_str::<PayPalErrorBody>(&body).unwrap_or_default();
        Err(paypal_error(status, error))
    }

    async fn get_order(&self, order_id: &str) -> PaymentResult<PayPalOrder> {
        self.send(
            Method::GET,
            &format!("/v2/checkout/orders/{}", order_id),
            &Value::Null,
            None,
        )
        .await
    }

    async fn verify_signature(&self, headers: &HeaderMap, event: &Value) -> PaymentResult<()> {
        let Some(webhook_id) = self.config.webhook_id.as_deref() else {
            return Ok(());
        };

        let mut values = Vec::with_capacity(TRANSMISSION_HEADERS.len());
        for name in TRANSMISSION_HEADERS {
            let value = header_str(headers, name).ok_or_else(|| {
                PaymentError::InvalidSignature(format!("missing {} header", name))
            })?;
            values.push(value);
        }

        let body = json!({
            "transmission_id": values[0],
            "transmission_time": values[1],
            "transmission_sig": values[2],
            "cert_url": values[3],
            "auth_algo": values[4],
            "webhook_id": webhook_id,
            "webhook_event": event,
        });
        let result: PayPalVerifyResponse = self
            .send(
                Method::POST,
                "/v1/notifications/verify-webhook-signature",
                &body,
                None,
            )
            .await
            .map_err(|e| match e {
                // PayPal refusing to verify the transmission is a verification failure
                PaymentError::GatewayRejected { reason, .. } | PaymentError::Validation(reason) => {
                    PaymentError::InvalidSignature(format!("PayPal refused verification: {}", reason))
                }
                other => other,
            })?;

        if result.verification_status == "SUCCESS" {
            Ok(())
        } else {
            Err(PaymentError::InvalidSignature(format!(
                "PayPal verification status {}",
                result.verification_status
            )))
        }
    }
}

fn paypal_error(status: StatusCode, error: PayPalErrorBody) -> PaymentError {
    let detail = error.details.into_iter().next().unwrap_or_default();
    let code = detail.issue.or(error.name);
    let message = detail
        .description
        .or(error.message)
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));

    match status {
        StatusCode::NOT_FOUND => PaymentError::not_found("PayPal resource", message),
        StatusCode::TOO_MANY_REQUESTS => PaymentError::GatewayUnavailable {
            provider: Provider::PayPal,
            message: "rate limited".into(),
        },
        s if s.is_server_error() => PaymentError::GatewayUnavailable {
            provider: Provider::PayPal,
            message,
        },
        _ => PaymentError::GatewayRejected {
            provider: Provider::PayPal,
            reason: message,
            code,
        },
    }
}

fn approval_link(order: &PayPalOrder) -> Option<String> {
    order
        .links
        .iter()
        .find(|link| link.rel == "payer-action" || link.rel == "approve")
        .map(|link| link.href.clone())
}

fn first_capture(order: &PayPalOrder) -> Option<&PayPalCapture> {
    order
        .purchase_units
        .iter()
        .filter_map(|unit| unit.payments.as_ref())
        .flat_map(|payments| payments.captures.iter())
        .next()
}

fn order_outcome(order: &PayPalOrder) -> ConfirmOutcome {
    if order.status == "PAYER_ACTION_REQUIRED" {
        return ConfirmOutcome::RequiresAction {
            client_action_token: approval_link(order),
        };
    }
    match first_capture(order) {
        Some(capture) => match capture.status.as_str() {
            "COMPLETED" => ConfirmOutcome::Succeeded {
                transaction_id: capture.id.clone(),
                card: None,
            },
            "DECLINED" | "FAILED" => ConfirmOutcome::Rejected {
                reason: capture
                    .status_details
                    .as_ref()
                    .and_then(|d| d.reason.clone())
                    .unwrap_or_default(),
                code: Some(capture.status.clone()),
            },
            _ => ConfirmOutcome::Processing,
        },
        None if order.status == "APPROVED" || order.status == "CREATED" => {
            ConfirmOutcome::RequiresAction {
                client_action_token: approval_link(order),
            }
        }
        None => ConfirmOutcome::Processing,
    }
}

fn refund_status(status: &str) -> GatewayRefundStatus {
    match status {
        "COMPLETED" => GatewayRefundStatus::Succeeded,
        "FAILED" | "CANCELLED" => GatewayRefundStatus::Failed,
        _ => GatewayRefundStatus::Pending,
    }
}

fn webhook_kind(event_type: &str, resource: &Value) -> WebhookEventKind {
    let str_at = |pointer: &str| resource.pointer(pointer).and_then(Value::as_str).map(str::to_string);
    let related_order = || str_at("/supplementary_data/related_ids/order_id");

    match event_type {
        "PAYMENT.CAPTURE.COMPLETED" => match related_order() {
            Some(intent_id) => WebhookEventKind::PaymentSucceeded {
                intent_id,
                transaction_id: str_at("/id"),
            },
            None => WebhookEventKind::Ignored,
        },
        "PAYMENT.CAPTURE.PENDING" => match related_order() {
            Some(intent_id) => WebhookEventKind::PaymentProcessing { intent_id },
            None => WebhookEventKind::Ignored,
        },
        "PAYMENT.CAPTURE.DENIED" | "PAYMENT.CAPTURE.DECLINED" => match related_order() {
            Some(intent_id) => WebhookEventKind::PaymentFailed {
                intent_id,
                reason: str_at("/status_details/reason")
                    .unwrap_or_else(|| "Payment was declined".to_string()),
            },
            None => WebhookEventKind::Ignored,
        },
        "CHECKOUT.ORDER.COMPLETED" => match str_at("/id") {
            Some(intent_id) => WebhookEventKind::PaymentSucceeded {
                intent_id,
                transaction_id: str_at("/purchase_units/0/payments/captures/0/id"),
            },
            None => WebhookEventKind::Ignored,
        },
        "PAYMENT.CAPTURE.REFUNDED" => match str_at("/id") {
            Some(provider_refund_id) => WebhookEventKind::RefundUpdated {
                provider_refund_id,
                refund_ref: str_at("/custom_id").and_then(|s| Uuid::parse_str(&s).ok()),
                status: refund_status(str_at("/status").as_deref().unwrap_or("COMPLETED")),
                failure_reason: str_at("/status_details/reason"),
            },
            None => WebhookEventKind::Ignored,
        },
        _ => WebhookEventKind::Ignored,
    }
}

#[async_trait]
impl PaymentGateway for PayPalGateway {
    fn provider(&self) -> Provider {
        Provider::PayPal
    }

    async fn create_intent(&self, request: IntentRequest) -> PaymentResult<IntentCreated> {
        if request.saved_method_id.is_some() {
            return Err(PaymentError::Validation(
                "PayPal payments cannot use a saved payment method".into(),
            ));
        }
        info!(
            order_id = %request.order_id,
            amount = %request.amount,
            "Creating PayPal order"
        );

        let mut experience = json!({ "user_action": "PAY_NOW" });
        if let Some(url) = &self.config.return_url {
            experience["return_url"] = json!(url);
        }
        if let Some(url) = &self.config.cancel_url {
            experience["cancel_url"] = json!(url);
        }
        let body = json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "reference_id": request.order_id.to_string(),
                "custom_id": request.order_id.to_string(),
                "amount": {
                    "currency_code": request.amount.currency.code(),
                    "value": request.amount.to_major_string(),
                },
            }],
            "payment_source": { "paypal": { "experience_context": experience } },
        });

        let order: PayPalOrder = self
            .send(
                Method::POST,
                "/v2/checkout/orders",
                &body,
                Some(&request.idempotency_key),
            )
            .await?;
        let approval_url = approval_link(&order)
            .ok_or_else(|| malformed_response(Provider::PayPal, "order without approval link"))?;

        info!(paypal_order_id = %order.id, status = %order.status, "PayPal order created");

        Ok(IntentCreated {
            intent_id: order.id,
            client_action_token: approval_url,
            requires_user_action: true,
            method: PaymentMethodKind::Wallet,
            provider_data: json!({ "status": order.status }),
        })
    }

    async fn confirm(&self, request: ConfirmRequest) -> PaymentResult<ConfirmOutcome> {
        info!(paypal_order_id = %request.intent_id, "Capturing PayPal order");

        let result: PaymentResult<PayPalOrder> = self
            .send(
                Method::POST,
                &format!("/v2/checkout/orders/{}/capture", request.intent_id),
                &json!({}),
                Some(&request.idempotency_key),
            )
            .await;

        match result {
            Ok(order) => Ok(order_outcome(&order)),
            Err(PaymentError::GatewayRejected { code, reason, .. }) => match code.as_deref() {
                Some("ORDER_NOT_APPROVED") | Some("PAYER_ACTION_REQUIRED") => {
                    let order = self.get_order(&request.intent_id).await?;
                    Ok(ConfirmOutcome::RequiresAction {
                        client_action_token: approval_link(&order),
                    })
                }
                Some("ORDER_ALREADY_CAPTURED") => {
                    let order = self.get_order(&request.intent_id).await?;
                    Ok(order_outcome(&order))
                }
                _ => {
                    info!(paypal_order_id = %request.intent_id, ?code, "PayPal declined capture");
                    Ok(ConfirmOutcome::Rejected { reason, code })
                }
            },
            Err(PaymentError::NotFound { .. }) => {
                Err(PaymentError::not_found("PayPal order", &request.intent_id))
            }
            Err(other) => Err(other),
        }
    }

    async fn refund(&self, request: RefundCall) -> PaymentResult<RefundSubmitted> {
        info!(
            capture_id = %request.transaction_id,
            amount = %request.amount,
            refund_id = %request.idempotency_key,
            "Submitting PayPal refund"
        );

        let mut body = json!({
            "amount": {
                "currency_code": request.amount.currency.code(),
                "value": request.amount.to_major_string(),
            },
            "custom_id": request.idempotency_key,
        });
        if let Some(notes) = &request.notes {
            body["note_to_payer"] = json!(notes);
        }

        let refund: PayPalRefund = self
            .send(
                Method::POST,
                &format!("/v2/payments/captures/{}/refund", request.transaction_id),
                &body,
                Some(&request.idempotency_key),
            )
            .await?;

        info!(provider_refund_id = %refund.id, status = %refund.status, "PayPal refund accepted");

        Ok(RefundSubmitted {
            status: refund_status(&refund.status),
            failure_reason: refund.status_details.and_then(|d| d.reason),
            provider_refund_id: refund.id,
        })
    }

    async fn parse_webhook(
        &self,
        payload: &[u8],
        headers: &HeaderMap,
    ) -> PaymentResult<WebhookEvent> {
        let raw: Value = serde_json::from_slice(payload)
            .map_err(|e| PaymentError::Validation(format!("malformed PayPal event: {}", e)))?;
        let event: PayPalEvent = serde_json::from_value(raw.clone())
            .map_err(|e| PaymentError::Validation(format!("malformed PayPal event: {}", e)))?;

        let authenticity = if self.config.webhook_id.is_some() {
            self.verify_signature(headers, &raw).await?;
            Authenticity::Verified
        } else {
            Authenticity::Unverified
        };

        Ok(WebhookEvent {
            kind: webhook_kind(&event.event_type, &event.resource),
            event_id: event.id,
            event_type: event.event_type,
            authenticity,
            payload: raw,
        })
    }
}

// PayPal API types

#[derive(Debug, Deserialize)]
struct PayPalTokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Default, Deserialize)]
struct PayPalErrorBody {
    name: Option<String>,
    message: Option<String>,
    #[serde(default)]
    details: Vec<PayPalErrorDetail>,
}

#[derive(Debug, Default, Deserialize)]
struct PayPalErrorDetail {
    issue: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PayPalOrder {
    id: String,
    status: String,
    #[serde(default)]
    links: Vec<PayPalLink>,
    #[serde(default)]
    purchase_units: Vec<PayPalPurchaseUnit>,
}

#[derive(Debug, Deserialize)]
struct PayPalLink {
    href: String,
    rel: String,
}

#[derive(Debug, Deserialize)]
struct PayPalPurchaseUnit {
    payments: Option<PayPalPayments>,
}

#[derive(Debug, Deserialize)]
struct PayPalPayments {
    #[serde(default)]
    captures: Vec<PayPalCapture>,
}

#[derive(Debug, Deserialize)]
struct PayPalCapture {
    id: String,
    status: String,
    status_details: Option<PayPalStatusDetails>,
}

#[derive(Debug, Deserialize)]
struct PayPalStatusDetails {
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PayPalRefund {
    id: String,
    status: String,
    status_details: Option<PayPalStatusDetails>,
}

#[derive(Debug, Deserialize)]
struct PayPalVerifyResponse {
    verification_status: String,
}

#[derive(Debug, Deserialize)]
struct PayPalEvent {
    id: String,
    event_type: String,
    #[serde(default)]
    resource: Value,
}
