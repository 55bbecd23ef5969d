//! In-process ledger
//!
//! All four stores share one async mutex, so each operation is atomic with
//! respect to every other. Used by tests and by local runs without Postgres.

use crate::database::error::{DatabaseError, DatabaseErrorKind, DbResult};
use crate::ledger::models::{
    refundable_remaining, NewPayment, NewPaymentMethod, NewRefund, Payment, PaymentMethod,
    PaymentTransition, Refund, RefundTransition, StatusSummary, TransitionOutcome, WebhookRecord,
};
use crate::ledger::store::{PaymentMethodStore, PaymentStore, RefundStore, WebhookLog};
use crate::payments::types::Provider;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct State {
    payments: Vec<Payment>,
    refunds: Vec<Refund>,
    methods: Vec<PaymentMethod>,
    webhooks: Vec<WebhookRecord>,
}

#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<State>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

fn unique_violation(constraint: &str) -> DatabaseError {
    DatabaseError::new(DatabaseErrorKind::UniqueConstraintViolation {
        constraint: constraint.to_string(),
    })
}

#[async_trait]
impl PaymentStore for MemoryLedger {
    async fn insert_payment(&self, payment: NewPayment) -> DbResult<Payment> {
        let mut state = self.state.lock().await;
        if state
            .payments
            .iter()
            .any(|p| p.provider == payment.provider && p.intent_id == payment.intent_id)
        {
            return Err(unique_violation("payments_provider_intent_id_key"));
        }
        let payment = payment.into_payment(Uuid::new_v4(), Utc::now());
        state.payments.push(payment.clone());
        debug!(payment_id = %payment.id, "payment recorded in memory ledger");
        Ok(payment)
    }

    async fn find_payment(&self, id: Uuid) -> DbResult<Option<Payment>> {
        let state = self.state.lock().await;
        Ok(state.payments.iter().find(|p| p.id == id).cloned())
    }

    async fn find_payment_by_intent(
        &self,
        provider: Option<Provider>,
        intent_id: &str,
    ) -> DbResult<Option<Payment>> {
        let state = self.state.lock().await;
        Ok(state
            .payments
            .iter()
            .find(|p| p.intent_id == intent_id && provider.map_or(true, |pr| pr == p.provider))
            .cloned())
    }

    async fn list_payments_for_order(&self, order_id: Uuid) -> DbResult<Vec<Payment>> {
        let state = self.state.lock().await;
        Ok(state
            .payments
            .iter()
            .filter(|p| p.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn transition_payment(
        &self,
        id: Uuid,
        transition: &PaymentTransition,
    ) -> DbResult<(Payment, TransitionOutcome)> {
        let mut state = self.state.lock().await;
        let payment = state
            .payments
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| DatabaseError::not_found("Payment", id))?;
        let outcome = payment.apply(transition, Utc::now());
        Ok((payment.clone(), outcome))
    }

    async fn summarize(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> DbResult<Vec<StatusSummary>> {
        let state = self.state.lock().await;
        let mut groups: BTreeMap<(&'static str, &'static str), StatusSummary> = BTreeMap::new();
        for payment in state.payments.iter().filter(|p| {
            start.map_or(true, |s| p.created_at >= s) && end.map_or(true, |e| p.created_at <= e)
        }) {
            let entry = groups
                .entry((payment.status.as_str(), payment.amount.currency.code()))
                .or_insert_with(|| StatusSummary {
                    status: payment.status,
                    currency: payment.amount.currency,
                    count: 0,
                    total: 0,
                });
            entry.count += 1;
            entry.total += payment.amount.amount;
        }
        Ok(groups.into_values().collect())
    }
}

#[async_trait]
impl RefundStore for MemoryLedger {
    async fn reserve_refund(&self, refund: NewRefund) -> DbResult<Refund> {
        let mut state = self.state.lock().await;
        let payment_amount = state
            .payments
            .iter()
            .find(|p| p.id == refund.payment_id)
            .map(|p| p.amount)
            .ok_or_else(|| DatabaseError::not_found("Payment", refund.payment_id))?;

        if let Some(key) = refund.idempotency_key.as_deref() {
            if state.refunds.iter().any(|r| {
                r.payment_id == refund.payment_id && r.idempotency_key.as_deref() == Some(key)
            }) {
                return Err(unique_violation("refunds_payment_id_idempotency_key_key"));
            }
        }

        let existing: Vec<Refund> = state
            .refunds
            .iter()
            .filter(|r| r.payment_id == refund.payment_id)
            .cloned()
            .collect();
        let available = refundable_remaining(&payment_amount, &existing);
        if refund.amount.amount > available {
            return Err(DatabaseError::new(DatabaseErrorKind::InsufficientBalance {
                available,
                required: refund.amount.amount,
            }));
        }

        let refund = refund.into_refund(Uuid::new_v4(), Utc::now());
        state.refunds.push(refund.clone());
        Ok(refund)
    }

    async fn find_refund(&self, id: Uuid) -> DbResult<Option<Refund>> {
        let state = self.state.lock().await;
        Ok(state.refunds.iter().find(|r| r.id == id).cloned())
    }

    async fn find_refund_by_provider_id(
        &self,
        provider: Provider,
        provider_refund_id: &str,
    ) -> DbResult<Option<Refund>> {
        let state = self.state.lock().await;
        Ok(state
            .refunds
            .iter()
            .find(|r| {
                r.provider == provider
                    && r.provider_refund_id.as_deref() == Some(provider_refund_id)
            })
            .cloned())
    }

    async fn find_refund_by_idempotency_key(
        &self,
        payment_id: Uuid,
        key: &str,
    ) -> DbResult<Option<Refund>> {
        let state = self.state.lock().await;
        Ok(state
            .refunds
            .iter()
            .find(|r| r.payment_id == payment_id && r.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn list_refunds_for_payment(&self, payment_id: Uuid) -> DbResult<Vec<Refund>> {
        let state = self.state.lock().await;
        Ok(state
            .refunds
            .iter()
            .filter(|r| r.payment_id == payment_id)
            .cloned()
            .collect())
    }

    async fn record_provider_refund_id(
        &self,
        id: Uuid,
        provider_refund_id: &str,
    ) -> DbResult<Refund> {
        let mut state = self.state.lock().await;
        let refund = state
            .refunds
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| DatabaseError::not_found("Refund", id))?;
        if refund.provider_refund_id.is_none() {
            refund.provider_refund_id = Some(provider_refund_id.to_string());
            refund.updated_at = Utc::now();
        }
        Ok(refund.clone())
    }

    async fn transition_refund(
        &self,
        id: Uuid,
        transition: &RefundTransition,
    ) -> DbResult<(Refund, TransitionOutcome)> {
        let mut state = self.state.lock().await;
        let refund = state
            .refunds
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| DatabaseError::not_found("Refund", id))?;
        let outcome = refund.apply(transition, Utc::now());
        Ok((refund.clone(), outcome))
    }
}

#[async_trait]
impl PaymentMethodStore for MemoryLedger {
    async fn insert_method(&self, method: NewPaymentMethod) -> DbResult<PaymentMethod> {
        let mut state = self.state.lock().await;
        let active: Vec<&PaymentMethod> = state
            .methods
            .iter()
            .filter(|m| m.user_id == method.user_id && m.is_active)
            .collect();
        if active.iter().any(|m| {
            m.provider == method.provider && m.provider_method_id == method.provider_method_id
        }) {
            return Err(unique_violation("payment_methods_user_provider_method_key"));
        }
        let is_default = method.make_default || active.is_empty();

        let now = Utc::now();
        if is_default {
            for existing in state
                .methods
                .iter_mut()
                .filter(|m| m.user_id == method.user_id && m.is_default)
            {
                existing.is_default = false;
                existing.updated_at = now;
            }
        }
        let method = method.into_method(Uuid::new_v4(), is_default, now);
        state.methods.push(method.clone());
        Ok(method)
    }

    async fn find_method(&self, id: Uuid) -> DbResult<Option<PaymentMethod>> {
        let state = self.state.lock().await;
        Ok(state.methods.iter().find(|m| m.id == id).cloned())
    }

    async fn list_active_methods(&self, user_id: Uuid) -> DbResult<Vec<PaymentMethod>> {
        let state = self.state.lock().await;
        Ok(state
            .methods
            .iter()
            .filter(|m| m.user_id == user_id && m.is_active)
            .cloned()
            .collect())
    }

    async fn set_default_method(
        &self,
        user_id: Uuid,
        id: Uuid,
    ) -> DbResult<Option<PaymentMethod>> {
        let mut state = self.state.lock().await;
        if !state
            .methods
            .iter()
            .any(|m| m.id == id && m.user_id == user_id && m.is_active)
        {
            return Ok(None);
        }

        let now = Utc::now();
        let mut updated = None;
        for method in state.methods.iter_mut().filter(|m| m.user_id == user_id) {
            let is_default = method.id == id;
            if method.is_default != is_default {
                method.is_default = is_default;
                method.updated_at = now;
            }
            if is_default {
                updated = Some(method.clone());
            }
        }
        Ok(updated)
    }

    async fn deactivate_method(
        &self,
        user_id: Uuid,
        id: Uuid,
    ) -> DbResult<Option<PaymentMethod>> {
        let mut state = self.state.lock().await;
        let Some(method) = state
            .methods
            .iter_mut()
            .find(|m| m.id == id && m.user_id == user_id && m.is_active)
        else {
            return Ok(None);
        };
        method.is_active = false;
        method.is_default = false;
        method.updated_at = Utc::now();
        Ok(Some(method.clone()))
    }

    async fn touch_method(&self, id: Uuid) -> DbResult<()> {
        let mut state = self.state.lock().await;
        if let Some(method) = state.methods.iter_mut().find(|m| m.id == id) {
            let now = Utc::now();
            method.last_used_at = Some(now);
            method.updated_at = now;
        }
        Ok(())
    }
}

#[async_trait]
impl WebhookLog for MemoryLedger {
    async fn log_event(
        &self,
        provider: Provider,
        event_id: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> DbResult<WebhookRecord> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .webhooks
            .iter_mut()
            .find(|w| w.provider == provider && w.event_id == event_id)
        {
            existing.payload = payload;
            return Ok(existing.clone());
        }
        let record = WebhookRecord {
            id: Uuid::new_v4(),
            provider,
            event_id: event_id.to_string(),
            event_type: event_type.to_string(),
            payload,
            processed: false,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            processed_at: None,
        };
        state.webhooks.push(record.clone());
        Ok(record)
    }

    async fn mark_processed(&self, id: Uuid) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let record = state
            .webhooks
            .iter_mut()
            .find(|w| w.id == id)
            .ok_or_else(|| DatabaseError::not_found("WebhookEvent", id))?;
        if !record.processed {
            record.processed = true;
            record.processed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn record_failure(&self, id: Uuid, error: &str) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let record = state
            .webhooks
            .iter_mut()
            .find(|w| w.id == id)
            .ok_or_else(|| DatabaseError::not_found("WebhookEvent", id))?;
        record.attempts += 1;
        record.last_error = Some(error.to_string());
        Ok(())
    }
}

impl MemoryLedger {
    /// Snapshot of logged webhook deliveries
    pub async fn webhook_records(&self) -> Vec<WebhookRecord> {
        self.state.lock().await.webhooks.clone()
    }
}
