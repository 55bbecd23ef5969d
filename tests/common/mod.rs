//! Shared fixtures: a scripted gateway and services wired on the in-memory ledger

#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use http::{HeaderMap, HeaderValue};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use storefront_payments::api::{self, AppState};
use storefront_payments::collaborators::{AuthUser, InMemoryOrders, OrderRef, StaticTokens};
use storefront_payments::error::{PaymentError, PaymentResult};
use storefront_payments::ledger::{
    CardSnapshot, Ledger, MemoryLedger, Payment, PaymentMethodKind, SavedMethodType,
};
use storefront_payments::payments::types::{
    Authenticity, ConfirmOutcome, ConfirmRequest, GatewayRefundStatus, IntentCreated,
    IntentRequest, Provider, RefundCall, RefundSubmitted, SavedMethodDetails, WebhookEvent,
    WebhookEventKind,
};
use storefront_payments::payments::{
    CreateIntent, Currency, Gateways, Money, PaymentGateway, PaymentService, ServiceConfig,
    VaultService, WebhookReconciler,
};
use uuid::Uuid;

pub const SIGNATURE_HEADER: &str = "x-scripted-signature";
pub const USER_TOKEN: &str = "user-token";
pub const STAFF_TOKEN: &str = "staff-token";
pub const STRANGER_TOKEN: &str = "stranger-token";

/// How the scripted gateway answers refund calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundMode {
    Succeed,
    Pending,
    Unavailable,
    Decline,
}

/// Gateway whose confirm answer is chosen by the payment method token:
///
/// * `tok_visa` (or none): succeeds
/// * `tok_chargeDeclined`: declined with a reason
/// * `tok_silentDecline`: declined without a reason
/// * `tok_processing`: still processing
/// * `tok_3ds`: needs customer authentication
/// * `tok_timeout`: the provider never answers in time
/// * `tok_slow`: succeeds after `slow_confirm`
/// * anything else: the provider refuses the request without declining
pub struct ScriptedGateway {
    provider: Provider,
    intents: AtomicUsize,
    pub confirm_calls: AtomicUsize,
    pub refund_calls: AtomicUsize,
    pub refund_mode: Mutex<RefundMode>,
    pub refund_keys: Mutex<Vec<String>>,
    pub slow_confirm: Duration,
}

impl ScriptedGateway {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            intents: AtomicUsize::new(0),
            confirm_calls: AtomicUsize::new(0),
            refund_calls: AtomicUsize::new(0),
            refund_mode: Mutex::new(RefundMode::Succeed),
            refund_keys: Mutex::new(Vec::new()),
            slow_confirm: Duration::from_millis(150),
        }
    }

    pub fn set_refund_mode(&self, mode: RefundMode) {
        *self.refund_mode.lock().unwrap() = mode;
    }

    pub fn refund_keys(&self) -> Vec<String> {
        self.refund_keys.lock().unwrap().clone()
    }

    fn prefix(&self) -> &'static str {
        match self.provider {
            Provider::Stripe => "pi",
            Provider::PayPal => "ORDER",
        }
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn create_intent(&self, request: IntentRequest) -> PaymentResult<IntentCreated> {
        let n = self.intents.fetch_add(1, Ordering::SeqCst);
        let intent_id = format!("{}_{}_{}", self.prefix(), n, request.order_id.simple());
        Ok(IntentCreated {
            client_action_token: format!("{}_secret", intent_id),
            intent_id,
            requires_user_action: true,
            method: match self.provider {
                Provider::Stripe => PaymentMethodKind::Card,
                Provider::PayPal => PaymentMethodKind::Wallet,
            },
            provider_data: json!({ "saved_method": request.saved_method_id }),
        })
    }

    async fn confirm(&self, request: ConfirmRequest) -> PaymentResult<ConfirmOutcome> {
        self.confirm_calls.fetch_add(1, Ordering::SeqCst);
        let succeeded = ConfirmOutcome::Succeeded {
            transaction_id: format!("ch_{}", request.intent_id),
            card: Some(CardSnapshot {
                brand: "visa".into(),
                last4: "4242".into(),
            }),
        };
        match request.payment_method_token.as_deref() {
            None | Some("tok_visa") => Ok(succeeded),
            Some("tok_chargeDeclined") => Ok(ConfirmOutcome::Rejected {
                reason: "Your card was declined.".into(),
                code: Some("card_declined".into()),
            }),
            Some("tok_silentDecline") => Ok(ConfirmOutcome::Rejected {
                reason: String::new(),
                code: None,
            }),
            Some("tok_processing") => Ok(ConfirmOutcome::Processing),
            Some("tok_3ds") => Ok(ConfirmOutcome::RequiresAction {
                client_action_token: Some("secret_3ds".into()),
            }),
            Some("tok_timeout") => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(succeeded)
            }
            Some("tok_slow") => {
                tokio::time::sleep(self.slow_confirm).await;
                Ok(succeeded)
            }
            Some(other) => Err(PaymentError::Validation(format!(
                "provider refused the request: no such payment method {}",
                other
            ))),
        }
    }

    async fn refund(&self, request: RefundCall) -> PaymentResult<RefundSubmitted> {
        self.refund_calls.fetch_add(1, Ordering::SeqCst);
        self.refund_keys
            .lock()
            .unwrap()
            .push(request.idempotency_key.clone());
        let mode = *self.refund_mode.lock().unwrap();
        let provider_refund_id = format!("re_{}", request.idempotency_key);
        match mode {
            RefundMode::Succeed => Ok(RefundSubmitted {
                provider_refund_id,
                status: GatewayRefundStatus::Succeeded,
                failure_reason: None,
            }),
            RefundMode::Pending => Ok(RefundSubmitted {
                provider_refund_id,
                status: GatewayRefundStatus::Pending,
                failure_reason: None,
            }),
            RefundMode::Unavailable => Err(PaymentError::GatewayUnavailable {
                provider: self.provider,
                message: "503".into(),
            }),
            RefundMode::Decline => Err(PaymentError::GatewayRejected {
                provider: self.provider,
                reason: "Charge already disputed".into(),
                code: Some("charge_disputed".into()),
            }),
        }
    }

    async fn parse_webhook(
        &self,
        payload: &[u8],
        headers: &HeaderMap,
    ) -> PaymentResult<WebhookEvent> {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok());
        if signature != Some("valid") {
            return Err(PaymentError::InvalidSignature("bad scripted signature".into()));
        }
        let body: Value = serde_json::from_slice(payload)
            .map_err(|e| PaymentError::Validation(e.to_string()))?;
        let field = |name: &str| body.get(name).and_then(Value::as_str).map(str::to_string);
        let event_type = field("type").unwrap_or_default();
        let intent_id = field("intent").unwrap_or_default();

        let kind = match event_type.as_str() {
            "payment.processing" => WebhookEventKind::PaymentProcessing { intent_id },
            "payment.succeeded" => WebhookEventKind::PaymentSucceeded {
                intent_id,
                transaction_id: field("transaction"),
            },
            "payment.failed" => WebhookEventKind::PaymentFailed {
                intent_id,
                reason: field("reason").unwrap_or_else(|| "Payment failed".into()),
            },
            "refund.succeeded" | "refund.failed" | "refund.pending" => {
                WebhookEventKind::RefundUpdated {
                    provider_refund_id: field("refund").unwrap_or_default(),
                    refund_ref: field("refund_ref").and_then(|s| Uuid::parse_str(&s).ok()),
                    status: match event_type.as_str() {
                        "refund.succeeded" => GatewayRefundStatus::Succeeded,
                        "refund.failed" => GatewayRefundStatus::Failed,
                        _ => GatewayRefundStatus::Pending,
                    },
                    failure_reason: field("reason"),
                }
            }
            _ => WebhookEventKind::Ignored,
        };
        let authenticity = if body.get("unverified").and_then(Value::as_bool) == Some(true) {
            Authenticity::Unverified
        } else {
            Authenticity::Verified
        };

        Ok(WebhookEvent {
            event_id: field("id").unwrap_or_default(),
            event_type,
            kind,
            authenticity,
            payload: body,
        })
    }

    async fn fetch_payment_method(
        &self,
        provider_method_id: &str,
    ) -> PaymentResult<SavedMethodDetails> {
        if !provider_method_id.starts_with("pm_") {
            return Err(PaymentError::not_found("payment method", provider_method_id));
        }
        Ok(SavedMethodDetails {
            provider_method_id: provider_method_id.to_string(),
            method_type: SavedMethodType::Card,
            card_brand: Some("visa".into()),
            card_last4: Some("4242".into()),
            exp_month: Some(12),
            exp_year: Some(2030),
        })
    }
}

/// Signed scripted webhook delivery
pub fn webhook(body: Value) -> (Vec<u8>, HeaderMap) {
    let mut headers = HeaderMap::new();
    headers.insert(SIGNATURE_HEADER, HeaderValue::from_static("valid"));
    (serde_json::to_vec(&body).unwrap(), headers)
}

pub struct Harness {
    pub memory: Arc<MemoryLedger>,
    pub ledger: Ledger,
    pub orders: Arc<InMemoryOrders>,
    pub stripe: Arc<ScriptedGateway>,
    pub paypal: Arc<ScriptedGateway>,
    pub gateways: Gateways,
    pub service: PaymentService,
    pub vault: VaultService,
    pub reconciler: WebhookReconciler,
    pub user: AuthUser,
    pub staff: AuthUser,
    pub stranger: AuthUser,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ServiceConfig {
            retry_backoff: Duration::from_millis(1),
            gateway_timeout: Duration::from_millis(500),
            ..ServiceConfig::default()
        })
    }

    pub fn with_config(config: ServiceConfig) -> Self {
        let memory = Arc::new(MemoryLedger::new());
        let ledger = Ledger::from_memory(memory.clone());
        let orders = Arc::new(InMemoryOrders::new());
        let stripe = Arc::new(ScriptedGateway::new(Provider::Stripe));
        let paypal = Arc::new(ScriptedGateway::new(Provider::PayPal));
        let gateways = Gateways::new()
            .register(stripe.clone())
            .register(paypal.clone());

        Self {
            service: PaymentService::new(ledger.clone(), orders.clone(), gateways.clone(), config),
            vault: VaultService::new(ledger.clone(), gateways.clone()),
            reconciler: WebhookReconciler::new(ledger.clone(), gateways.clone()),
            memory,
            ledger,
            orders,
            stripe,
            paypal,
            gateways,
            user: AuthUser {
                id: Uuid::new_v4(),
                is_staff: false,
            },
            staff: AuthUser {
                id: Uuid::new_v4(),
                is_staff: true,
            },
            stranger: AuthUser {
                id: Uuid::new_v4(),
                is_staff: false,
            },
        }
    }

    /// An order owned by `user`, priced in USD minor units
    pub fn order(&self, total: i64) -> Uuid {
        let id = Uuid::new_v4();
        self.orders.insert(OrderRef {
            id,
            user_id: self.user.id,
            total: Money::new(total, Currency::USD),
        });
        id
    }

    pub async fn pending_payment(&self, total: i64, provider: Provider) -> Payment {
        let order_id = self.order(total);
        self.service
            .create_intent(
                &self.user,
                CreateIntent {
                    order_id,
                    amount: Money::new(total, Currency::USD),
                    provider: Some(provider),
                    saved_method_id: None,
                },
            )
            .await
            .unwrap()
            .payment
    }

    /// A Stripe payment already confirmed with `tok_visa`
    pub async fn succeeded_payment(&self, total: i64) -> Payment {
        let payment = self.pending_payment(total, Provider::Stripe).await;
        self.service
            .confirm(&self.user, &payment.intent_id, Some("tok_visa".into()))
            .await
            .unwrap()
            .payment
    }

    pub fn app(&self) -> Router {
        let identity = StaticTokens::new()
            .with_token(USER_TOKEN, self.user)
            .with_token(STAFF_TOKEN, self.staff)
            .with_token(STRANGER_TOKEN, self.stranger);
        api::router(AppState {
            payments: self.service.clone(),
            vault: self.vault.clone(),
            reconciler: self.reconciler.clone(),
            identity: Arc::new(identity),
            ledger: self.ledger.clone(),
            environment: "test".into(),
        })
    }
}
