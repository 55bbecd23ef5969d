//! Payment orchestration
//!
//! The façade the HTTP layer calls. It picks the adapter by provider, drives the
//! payment and refund state machines and keeps the ledger authoritative.
//!
//! Gateway round-trips for confirm and refund run on detached tasks: once a
//! request reaches a provider its outcome is recorded even if the caller goes
//! away.

use crate::collaborators::{AuthUser, OrderLookup, OrderRef};
use crate::database::error::DatabaseErrorKind;
use crate::error::{PaymentError, PaymentResult, GENERIC_FAILURE_MESSAGE};
use crate::ledger::{
    refundable_remaining, refunded_total, Ledger, NewPayment, NewRefund, Payment,
    PaymentStatus, PaymentTransition, Refund, RefundReason, RefundStatus, RefundTransition,
    StatusSummary, TransitionOutcome,
};
use crate::payments::money::{Currency, Money};
use crate::payments::traits::{Gateways, PaymentGateway};
use crate::payments::types::{
    ConfirmOutcome, ConfirmRequest, GatewayRefundStatus, IntentRequest, Provider, RefundCall,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Tunables for the orchestration layer
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub default_provider: Provider,
    /// Pause before the single retry of an unavailable gateway
    pub retry_backoff: Duration,
    /// Upper bound on one gateway call
    pub gateway_timeout: Duration,
    pub supported_currencies: Vec<Currency>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_provider: Provider::Stripe,
            retry_backoff: Duration::from_millis(250),
            gateway_timeout: Duration::from_secs(20),
            supported_currencies: vec![Currency::USD, Currency::EUR, Currency::GBP],
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateIntent {
    pub order_id: Uuid,
    pub amount: Money,
    pub provider: Option<Provider>,
    /// Internal id of a vaulted payment method
    pub saved_method_id: Option<Uuid>,
}

/// Pending payment plus what the client needs to continue
#[derive(Debug, Clone)]
pub struct IntentHandle {
    pub payment: Payment,
    pub client_action_token: String,
    pub requires_action: bool,
}

#[derive(Debug, Clone)]
pub struct ConfirmResult {
    pub payment: Payment,
    /// Client secret or approval URL when the payer still has to act
    pub next_action: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RefundCommand {
    pub payment_id: Uuid,
    /// Major units in the payment's currency
    pub amount: Decimal,
    pub reason: RefundReason,
    pub notes: Option<String>,
    pub idempotency_key: Option<String>,
}

/// A payment with its refunds. `refunded_total` is independent of `status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentDetails {
    #[serde(flatten)]
    pub payment: Payment,
    pub refunds: Vec<Refund>,
    pub refunded_total: Money,
    /// Still refundable, with pending refunds counted as spent
    pub refundable: Money,
}

#[derive(Clone)]
pub struct PaymentService {
    ledger: Ledger,
    orders: Arc<dyn OrderLookup>,
    gateways: Gateways,
    config: ServiceConfig,
}

impl PaymentService {
    pub fn new(
        ledger: Ledger,
        orders: Arc<dyn OrderLookup>,
        gateways: Gateways,
        config: ServiceConfig,
    ) -> Self {
        Self {
            ledger,
            orders,
            gateways,
            config,
        }
    }

    pub fn gateways(&self) -> &Gateways {
        &self.gateways
    }

    /// Open an intent with the provider and record a Pending payment
    pub async fn create_intent(
        &self,
        user: &AuthUser,
        request: CreateIntent,
    ) -> PaymentResult<IntentHandle> {
        if !request.amount.is_positive() {
            return Err(PaymentError::Validation("amount must be greater than zero".into()));
        }
        if !self
            .config
            .supported_currencies
            .contains(&request.amount.currency)
        {
            return Err(PaymentError::Validation(format!(
                "currency {} is not supported",
                request.amount.currency
            )));
        }

        let order = self.load_order(user, request.order_id, false).await?;
        if order.total.currency != request.amount.currency {
            return Err(PaymentError::Validation(format!(
                "order is priced in {}, not {}",
                order.total.currency, request.amount.currency
            )));
        }

        let existing = self.ledger.payments.list_payments_for_order(order.id).await?;
        if existing
            .iter()
            .any(|p| p.status == PaymentStatus::Succeeded)
        {
            return Err(PaymentError::Conflict(format!(
                "order {} is already paid",
                order.id
            )));
        }

        let provider = request.provider.unwrap_or(self.config.default_provider);
        let gateway = self.gateways.get(provider)?;

        let saved_method = match request.saved_method_id {
            Some(id) => {
                let method = self
                    .ledger
                    .methods
                    .find_method(id)
                    .await?
                    .filter(|m| m.user_id == user.id && m.is_active)
                    .ok_or_else(|| PaymentError::not_found("payment method", id))?;
                if method.provider != provider {
                    return Err(PaymentError::Validation(format!(
                        "payment method {} belongs to {}",
                        id, method.provider
                    )));
                }
                Some(method)
            }
            None => None,
        };

        let intent_request = IntentRequest {
            order_id: order.id,
            amount: request.amount,
            saved_method_id: saved_method.as_ref().map(|m| m.provider_method_id.clone()),
            idempotency_key: format!("intent-{}-{}", order.id, Uuid::new_v4()),
        };
        let created = self
            .call_gateway(provider, "create_intent", || {
                gateway.create_intent(intent_request.clone())
            })
            .await?;

        let payment = self
            .ledger
            .payments
            .insert_payment(NewPayment {
                order_id: order.id,
                provider,
                method: created.method,
                amount: request.amount,
                intent_id: created.intent_id.clone(),
                metadata: created.provider_data,
            })
            .await?;

        if let Some(method) = saved_method {
            if let Err(e) = self.ledger.methods.touch_method(method.id).await {
                warn!(method_id = %method.id, error = %e, "failed to stamp payment method use");
            }
        }

        info!(
            payment_id = %payment.id,
            order_id = %order.id,
            %provider,
            intent_id = %payment.intent_id,
            "payment intent created"
        );

        Ok(IntentHandle {
            payment,
            client_action_token: created.client_action_token,
            requires_action: created.requires_user_action,
        })
    }

    /// Confirm (or capture) an intent
    ///
    /// A decline comes back as a Failed payment, a timeout as Processing.
    pub async fn confirm(
        &self,
        user: &AuthUser,
        intent_id: &str,
        payment_method_token: Option<String>,
    ) -> PaymentResult<ConfirmResult> {
        let payment = self
            .ledger
            .payments
            .find_payment_by_intent(None, intent_id)
            .await?
            .ok_or_else(|| PaymentError::not_found("payment intent", intent_id))?;
        self.load_order(user, payment.order_id, false).await?;

        if payment.status.is_terminal() {
            return Err(PaymentError::Conflict(format!(
                "payment intent {} is already {}",
                intent_id,
                payment.status.as_str()
            )));
        }

        let service = self.clone();
        tokio::spawn(async move { service.drive_confirm(payment, payment_method_token).await })
            .await
            .map_err(|e| PaymentError::Internal(format!("confirm task failed: {}", e)))?
    }

    async fn drive_confirm(
        &self,
        payment: Payment,
        payment_method_token: Option<String>,
    ) -> PaymentResult<ConfirmResult> {
        let gateway = self.gateways.get(payment.provider)?;
        let (payment, _) = self
            .ledger
            .payments
            .transition_payment(payment.id, &PaymentTransition::BeginProcessing)
            .await?;
        if payment.status.is_terminal() {
            // A webhook settled it while this request was on its way
            return Ok(ConfirmResult {
                payment,
                next_action: None,
            });
        }

        let request = ConfirmRequest {
            intent_id: payment.intent_id.clone(),
            payment_method_token,
            idempotency_key: format!("confirm-{}", payment.id),
        };
        let outcome = self
            .call_gateway(payment.provider, "confirm", || gateway.confirm(request.clone()))
            .await;

        let (transition, next_action) = match outcome {
            Ok(ConfirmOutcome::Succeeded {
                transaction_id,
                card,
            }) => (
                Some(PaymentTransition::Succeed {
                    transaction_id: Some(transaction_id),
                    card,
                }),
                None,
            ),
            Ok(ConfirmOutcome::Rejected { reason, code }) => {
                info!(payment_id = %payment.id, ?code, "payment declined");
                let reason = if reason.trim().is_empty() {
                    GENERIC_FAILURE_MESSAGE.to_string()
                } else {
                    reason
                };
                (Some(PaymentTransition::Fail { reason }), None)
            }
            Ok(ConfirmOutcome::Processing) => (None, None),
            Ok(ConfirmOutcome::RequiresAction {
                client_action_token,
            }) => (None, client_action_token),
            Err(PaymentError::GatewayTimeout { provider }) => {
                warn!(
                    payment_id = %payment.id,
                    %provider,
                    "confirm timed out, leaving payment for webhook reconciliation"
                );
                (None, None)
            }
            Err(e) => return Err(e),
        };

        let payment = match transition {
            Some(transition) => {
                let (payment, outcome) = self
                    .ledger
                    .payments
                    .transition_payment(payment.id, &transition)
                    .await?;
                if outcome == TransitionOutcome::Conflicting {
                    error!(
                        payment_id = %payment.id,
                        stored = payment.status.as_str(),
                        reported = transition.target().as_str(),
                        "gateway outcome contradicts recorded terminal state"
                    );
                }
                payment
            }
            None => payment,
        };

        info!(
            payment_id = %payment.id,
            status = payment.status.as_str(),
            "payment confirm finished"
        );
        Ok(ConfirmResult {
            payment,
            next_action,
        })
    }

    /// Refund part or all of a succeeded payment
    pub async fn refund(&self, user: &AuthUser, command: RefundCommand) -> PaymentResult<Refund> {
        let payment = self
            .ledger
            .payments
            .find_payment(command.payment_id)
            .await?
            .ok_or_else(|| PaymentError::not_found("payment", command.payment_id))?;
        self.load_order(user, payment.order_id, true).await?;

        let amount = Money::from_major(command.amount, payment.amount.currency)?;
        if !amount.is_positive() {
            return Err(PaymentError::Validation(
                "refund amount must be greater than zero".into(),
            ));
        }

        if let Some(key) = command.idempotency_key.as_deref() {
            if let Some(existing) = self
                .ledger
                .refunds
                .find_refund_by_idempotency_key(payment.id, key)
                .await?
            {
                return self.replay_refund(payment, existing, amount).await;
            }
        }

        if payment.status != PaymentStatus::Succeeded {
            return Err(PaymentError::Conflict(format!(
                "payment {} is {}, only succeeded payments can be refunded",
                payment.id,
                payment.status.as_str()
            )));
        }
        if payment.transaction_id.is_none() {
            return Err(PaymentError::Conflict(format!(
                "payment {} has no captured transaction",
                payment.id
            )));
        }

        let reserved = self
            .ledger
            .refunds
            .reserve_refund(NewRefund {
                payment_id: payment.id,
                order_id: payment.order_id,
                provider: payment.provider,
                amount,
                reason: command.reason,
                notes: command.notes.clone(),
                idempotency_key: command.idempotency_key.clone(),
                processed_by_user_id: user.is_staff.then_some(user.id),
            })
            .await;

        let refund = match reserved {
            Ok(refund) => refund,
            Err(e) => match e.kind {
                DatabaseErrorKind::InsufficientBalance { available, .. } => {
                    info!(
                        payment_id = %payment.id,
                        requested = %amount,
                        available,
                        "refund rejected, exceeds refundable balance"
                    );
                    return Err(PaymentError::RefundExceedsBalance {
                        requested: amount,
                        remaining: Money::new(available.max(0), payment.amount.currency),
                    });
                }
                DatabaseErrorKind::UniqueConstraintViolation { .. }
                    if command.idempotency_key.is_some() =>
                {
                    // A concurrent request with the same key won the insert
                    let key = command.idempotency_key.as_deref().unwrap_or_default();
                    let existing = self
                        .ledger
                        .refunds
                        .find_refund_by_idempotency_key(payment.id, key)
                        .await?
                        .ok_or_else(|| PaymentError::Database(e))?;
                    return self.replay_refund(payment, existing, amount).await;
                }
                _ => return Err(e.into()),
            },
        };

        info!(
            refund_id = %refund.id,
            payment_id = %payment.id,
            amount = %refund.amount,
            "refund reserved"
        );
        self.spawn_refund(payment, refund).await
    }

    /// A repeated idempotency key returns the recorded refund, re-driving it
    /// if it never reached the provider
    async fn replay_refund(
        &self,
        payment: Payment,
        existing: Refund,
        amount: Money,
    ) -> PaymentResult<Refund> {
        if existing.amount != amount {
            return Err(PaymentError::Conflict(
                "idempotency key was already used for a different refund amount".into(),
            ));
        }
        if existing.status == RefundStatus::Pending && existing.provider_refund_id.is_none() {
            info!(refund_id = %existing.id, "re-driving pending refund");
            return self.spawn_refund(payment, existing).await;
        }
        Ok(existing)
    }

    async fn spawn_refund(&self, payment: Payment, refund: Refund) -> PaymentResult<Refund> {
        let service = self.clone();
        tokio::spawn(async move { service.drive_refund(payment, refund).await })
            .await
            .map_err(|e| PaymentError::Internal(format!("refund task failed: {}", e)))?
    }

    async fn drive_refund(&self, payment: Payment, refund: Refund) -> PaymentResult<Refund> {
        let gateway = self.gateways.get(payment.provider)?;
        let call = RefundCall {
            transaction_id: payment.transaction_id.clone().unwrap_or_default(),
            amount: refund.amount,
            reason: refund.reason,
            notes: refund.notes.clone(),
            idempotency_key: refund.id.to_string(),
        };
        let result = self
            .call_gateway(payment.provider, "refund", || gateway.refund(call.clone()))
            .await;

        match result {
            Ok(submitted) => {
                let mut refund = self
                    .ledger
                    .refunds
                    .record_provider_refund_id(refund.id, &submitted.provider_refund_id)
                    .await?;
                let transition = match submitted.status {
                    GatewayRefundStatus::Succeeded => Some(RefundTransition::Succeed {
                        provider_refund_id: Some(submitted.provider_refund_id),
                    }),
                    GatewayRefundStatus::Failed => Some(RefundTransition::Fail {
                        reason: submitted
                            .failure_reason
                            .unwrap_or_else(|| "Refund failed".to_string()),
                    }),
                    GatewayRefundStatus::Pending => None,
                };
                if let Some(transition) = transition {
                    refund = self.ledger.refunds.transition_refund(refund.id, &transition).await?.0;
                }
                info!(
                    refund_id = %refund.id,
                    status = refund.status.as_str(),
                    "refund submitted"
                );
                Ok(refund)
            }
            Err(PaymentError::GatewayRejected { reason, code, .. }) => {
                info!(refund_id = %refund.id, ?code, "refund declined by provider");
                let reason = if reason.trim().is_empty() {
                    "Refund failed".to_string()
                } else {
                    reason
                };
                let (refund, _) = self
                    .ledger
                    .refunds
                    .transition_refund(refund.id, &RefundTransition::Fail { reason })
                    .await?;
                Ok(refund)
            }
            Err(e @ (PaymentError::GatewayUnavailable { .. } | PaymentError::GatewayTimeout { .. })) => {
                // Outcome unknown; the reservation holds until a webhook or a
                // replay with the same key settles it
                warn!(refund_id = %refund.id, error = %e, "refund outcome unknown, left pending");
                Ok(refund)
            }
            Err(e) => {
                warn!(refund_id = %refund.id, error = %e, "refund could not be submitted");
                self.ledger
                    .refunds
                    .transition_refund(
                        refund.id,
                        &RefundTransition::Fail {
                            reason: e.user_message(),
                        },
                    )
                    .await?;
                Err(e)
            }
        }
    }

    pub async fn get_payment(&self, user: &AuthUser, id: Uuid) -> PaymentResult<PaymentDetails> {
        let payment = self
            .ledger
            .payments
            .find_payment(id)
            .await?
            .ok_or_else(|| PaymentError::not_found("payment", id))?;
        self.load_order(user, payment.order_id, true).await?;

        let refunds = self.ledger.refunds.list_refunds_for_payment(id).await?;
        let refunded_total = refunded_total(payment.amount.currency, &refunds);
        let refundable = Money::new(
            refundable_remaining(&payment.amount, &refunds).max(0),
            payment.amount.currency,
        );
        Ok(PaymentDetails {
            payment,
            refunds,
            refunded_total,
            refundable,
        })
    }

    pub async fn payments_for_order(
        &self,
        user: &AuthUser,
        order_id: Uuid,
    ) -> PaymentResult<Vec<Payment>> {
        self.load_order(user, order_id, true).await?;
        Ok(self.ledger.payments.list_payments_for_order(order_id).await?)
    }

    /// Staff-only aggregate over payments created in the window
    pub async fn summary(
        &self,
        user: &AuthUser,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> PaymentResult<Vec<StatusSummary>> {
        if !user.is_staff {
            return Err(PaymentError::Forbidden("payment summary is staff only".into()));
        }
        if let (Some(start), Some(end)) = (start, end) {
            if start > end {
                return Err(PaymentError::Validation(
                    "startDate must not be after endDate".into(),
                ));
            }
        }
        Ok(self.ledger.payments.summarize(start, end).await?)
    }

    /// Orders the caller may act on. Not-owned orders read as missing.
    async fn load_order(
        &self,
        user: &AuthUser,
        order_id: Uuid,
        allow_staff: bool,
    ) -> PaymentResult<OrderRef> {
        let order = self
            .orders
            .find_order(order_id)
            .await?
            .ok_or_else(|| PaymentError::not_found("order", order_id))?;
        if order.user_id == user.id || (allow_staff && user.is_staff) {
            Ok(order)
        } else {
            warn!(user_id = %user.id, %order_id, "order access denied");
            Err(PaymentError::not_found("order", order_id))
        }
    }

    /// One gateway call with a timeout and a single retry on `GatewayUnavailable`.
    /// The closure rebuilds the request, reusing the same idempotency key.
    async fn call_gateway<T, F, Fut>(
        &self,
        provider: Provider,
        operation: &'static str,
        mut call: F,
    ) -> PaymentResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PaymentResult<T>>,
    {
        let mut retried = false;
        loop {
            let result = match tokio::time::timeout(self.config.gateway_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(PaymentError::GatewayTimeout { provider }),
            };
            match result {
                Err(e) if e.is_retryable() && !retried => {
                    warn!(%provider, operation, error = %e, "gateway unavailable, retrying once");
                    retried = true;
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::InMemoryOrders;
    use crate::ledger::PaymentMethodKind;
    use crate::payments::types::{IntentCreated, RefundSubmitted, WebhookEvent};
    use async_trait::async_trait;
    use http::HeaderMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails with `GatewayUnavailable` a set number of times before succeeding
    struct FlakyGateway {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PaymentGateway for FlakyGateway {
        fn provider(&self) -> Provider {
            Provider::Stripe
        }

        async fn create_intent(&self, _request: IntentRequest) -> PaymentResult<IntentCreated> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(PaymentError::GatewayUnavailable {
                    provider: Provider::Stripe,
                    message: "502".into(),
                });
            }
            Ok(IntentCreated {
                intent_id: format!("pi_{}", n),
                client_action_token: "secret".into(),
                requires_user_action: true,
                method: PaymentMethodKind::Card,
                provider_data: serde_json::Value::Null,
            })
        }

        async fn confirm(&self, _request: ConfirmRequest) -> PaymentResult<ConfirmOutcome> {
            Ok(ConfirmOutcome::Processing)
        }

        async fn refund(&self, _request: RefundCall) -> PaymentResult<RefundSubmitted> {
            Err(PaymentError::Internal("unused".into()))
        }

        async fn parse_webhook(
            &self,
            _payload: &[u8],
            _headers: &HeaderMap,
        ) -> PaymentResult<WebhookEvent> {
            Err(PaymentError::Internal("unused".into()))
        }
    }

    fn service_with(failures: usize) -> (PaymentService, Arc<FlakyGateway>, AuthUser, Uuid) {
        let gateway = Arc::new(FlakyGateway {
            failures,
            calls: AtomicUsize::new(0),
        });
        let user = AuthUser {
            id: Uuid::new_v4(),
            is_staff: false,
        };
        let orders = Arc::new(InMemoryOrders::new());
        let order_id = Uuid::new_v4();
        orders.insert(OrderRef {
            id: order_id,
            user_id: user.id,
            total: Money::new(10_000, Currency::USD),
        });
        let config = ServiceConfig {
            retry_backoff: Duration::from_millis(1),
            ..ServiceConfig::default()
        };
        let service = PaymentService::new(
            Ledger::in_memory(),
            orders,
            Gateways::new().register(gateway.clone()),
            config,
        );
        (service, gateway, user, order_id)
    }

    fn intent(order_id: Uuid) -> CreateIntent {
        CreateIntent {
            order_id,
            amount: Money::new(10_000, Currency::USD),
            provider: None,
            saved_method_id: None,
        }
    }

    #[tokio::test]
    async fn test_unavailable_gateway_is_retried_once() {
        let (service, gateway, user, order_id) = service_with(1);
        let handle = service.create_intent(&user, intent(order_id)).await.unwrap();
        assert_eq!(handle.payment.status, PaymentStatus::Pending);
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_second_unavailable_is_surfaced() {
        let (service, gateway, user, order_id) = service_with(2);
        let err = service.create_intent(&user, intent(order_id)).await.unwrap_err();
        assert!(matches!(err, PaymentError::GatewayUnavailable { .. }));
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rejects_non_positive_amount_before_gateway() {
        let (service, gateway, user, order_id) = service_with(0);
        let mut request = intent(order_id);
        request.amount = Money::zero(Currency::USD);
        let err = service.create_intent(&user, request).await.unwrap_err();
        assert!(matches!(err, PaymentError::Validation(_)));
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rejects_unsupported_currency() {
        let (service, _, user, order_id) = service_with(0);
        let mut request = intent(order_id);
        request.amount = Money::new(10_000, Currency::JPY);
        let err = service.create_intent(&user, request).await.unwrap_err();
        assert!(matches!(err, PaymentError::Validation(_)));
    }

    #[tokio::test]
    async fn test_order_of_another_user_reads_as_missing() {
        let (service, _, _, order_id) = service_with(0);
        let stranger = AuthUser {
            id: Uuid::new_v4(),
            is_staff: false,
        };
        let err = service.create_intent(&stranger, intent(order_id)).await.unwrap_err();
        assert!(matches!(err, PaymentError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_summary_requires_staff() {
        let (service, _, user, _) = service_with(0);
        let err = service.summary(&user, None, None).await.unwrap_err();
        assert!(matches!(err, PaymentError::Forbidden(_)));
    }
}
