//! Ledger store contracts
//!
//! Every transition method is a single atomic read-modify-write against one
//! record. Implementations: `MemoryLedger` and the Postgres repositories.

use crate::database::error::DbResult;
use crate::ledger::models::{
    NewPayment, NewPaymentMethod, NewRefund, Payment, PaymentMethod, PaymentTransition, Refund,
    RefundTransition, StatusSummary, TransitionOutcome, WebhookRecord,
};
use crate::payments::types::Provider;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Record a new Pending payment. Duplicate `(provider, intent_id)` is a
    /// unique constraint violation.
    async fn insert_payment(&self, payment: NewPayment) -> DbResult<Payment>;

    async fn find_payment(&self, id: Uuid) -> DbResult<Option<Payment>>;

    /// Look up by provider intent id; `None` provider matches any provider
    async fn find_payment_by_intent(
        &self,
        provider: Option<Provider>,
        intent_id: &str,
    ) -> DbResult<Option<Payment>>;

    async fn list_payments_for_order(&self, order_id: Uuid) -> DbResult<Vec<Payment>>;

    /// Apply a forward-only transition under a row lock
    async fn transition_payment(
        &self,
        id: Uuid,
        transition: &PaymentTransition,
    ) -> DbResult<(Payment, TransitionOutcome)>;

    /// Counts and totals grouped by status and currency, over `created_at`
    async fn summarize(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> DbResult<Vec<StatusSummary>>;

    async fn ping(&self) -> DbResult<()> {
        Ok(())
    }
}

#[async_trait]
pub trait RefundStore: Send + Sync {
    /// Check the refundable balance and insert a Pending refund atomically.
    ///
    /// Fails with `InsufficientBalance` when Pending plus Succeeded refunds
    /// would exceed the payment amount.
    async fn reserve_refund(&self, refund: NewRefund) -> DbResult<Refund>;

    async fn find_refund(&self, id: Uuid) -> DbResult<Option<Refund>>;

    async fn find_refund_by_provider_id(
        &self,
        provider: Provider,
        provider_refund_id: &str,
    ) -> DbResult<Option<Refund>>;

    async fn find_refund_by_idempotency_key(
        &self,
        payment_id: Uuid,
        key: &str,
    ) -> DbResult<Option<Refund>>;

    async fn list_refunds_for_payment(&self, payment_id: Uuid) -> DbResult<Vec<Refund>>;

    /// Store the provider refund id if none is recorded yet
    async fn record_provider_refund_id(
        &self,
        id: Uuid,
        provider_refund_id: &str,
    ) -> DbResult<Refund>;

    async fn transition_refund(
        &self,
        id: Uuid,
        transition: &RefundTransition,
    ) -> DbResult<(Refund, TransitionOutcome)>;
}

#[async_trait]
pub trait PaymentMethodStore: Send + Sync {
    /// Insert a method; it becomes default when requested or when the user
    /// has no active method yet
    async fn insert_method(&self, method: NewPaymentMethod) -> DbResult<PaymentMethod>;

    async fn find_method(&self, id: Uuid) -> DbResult<Option<PaymentMethod>>;

    async fn list_active_methods(&self, user_id: Uuid) -> DbResult<Vec<PaymentMethod>>;

    /// Make `id` the only default for `user_id` in one write. `None` when the
    /// method does not belong to the user or is inactive.
    async fn set_default_method(&self, user_id: Uuid, id: Uuid)
        -> DbResult<Option<PaymentMethod>>;

    /// Soft-deactivate; also clears the default flag
    async fn deactivate_method(&self, user_id: Uuid, id: Uuid)
        -> DbResult<Option<PaymentMethod>>;

    /// Stamp `last_used_at`
    async fn touch_method(&self, id: Uuid) -> DbResult<()>;
}

#[async_trait]
pub trait WebhookLog: Send + Sync {
    /// Record a delivery; redeliveries of the same provider event update the
    /// existing row and return it
    async fn log_event(
        &self,
        provider: Provider,
        event_id: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> DbResult<WebhookRecord>;

    async fn mark_processed(&self, id: Uuid) -> DbResult<()>;

    async fn record_failure(&self, id: Uuid, error: &str) -> DbResult<()>;
}
