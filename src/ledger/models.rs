//! Ledger records and their state machines
//!
//! Transitions are pure functions over a record. Stores call them inside one
//! atomic read-modify-write so concurrent confirm and webhook paths converge.

use crate::error::PaymentError;
use crate::payments::money::{Currency, Money};
use crate::payments::types::Provider;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Payment lifecycle: Pending -> Processing -> {Succeeded | Failed}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
}

impl PaymentStatus {
    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Processing => 1,
            Self::Succeeded | Self::Failed => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(PaymentError::Validation(format!(
                "unknown payment status '{}'",
                other
            ))),
        }
    }
}

/// How the payer funded the payment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethodKind {
    Card,
    Wallet,
}

impl PaymentMethodKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Card => "card",
            Self::Wallet => "wallet",
        }
    }
}

impl FromStr for PaymentMethodKind {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "card" => Ok(Self::Card),
            "wallet" => Ok(Self::Wallet),
            other => Err(PaymentError::Validation(format!(
                "unknown payment method '{}'",
                other
            ))),
        }
    }
}

/// Card details kept for display only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardSnapshot {
    pub brand: String,
    pub last4: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: Uuid,
    pub order_id: Uuid,
    pub provider: Provider,
    pub method: PaymentMethodKind,
    pub status: PaymentStatus,
    pub amount: Money,
    /// Provider-assigned intent (or order) id, unique per provider
    pub intent_id: String,
    pub transaction_id: Option<String>,
    pub card_brand: Option<String>,
    pub card_last4: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A payment about to be recorded as Pending
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub order_id: Uuid,
    pub provider: Provider,
    pub method: PaymentMethodKind,
    pub amount: Money,
    pub intent_id: String,
    pub metadata: serde_json::Value,
}

impl NewPayment {
    pub fn into_payment(self, id: Uuid, now: DateTime<Utc>) -> Payment {
        Payment {
            id,
            order_id: self.order_id,
            provider: self.provider,
            method: self.method,
            status: PaymentStatus::Pending,
            amount: self.amount,
            intent_id: self.intent_id,
            transaction_id: None,
            card_brand: None,
            card_last4: None,
            processed_at: None,
            failure_reason: None,
            metadata: self.metadata,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Requested movement of a payment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentTransition {
    BeginProcessing,
    Succeed {
        transaction_id: Option<String>,
        card: Option<CardSnapshot>,
    },
    Fail {
        reason: String,
    },
}

impl PaymentTransition {
    pub fn target(&self) -> PaymentStatus {
        match self {
            Self::BeginProcessing => PaymentStatus::Processing,
            Self::Succeed { .. } => PaymentStatus::Succeeded,
            Self::Fail { .. } => PaymentStatus::Failed,
        }
    }
}

/// Result of applying a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionOutcome {
    /// The record moved forward
    Applied,
    /// The record had already reached or passed the target; nothing changed
    Unchanged,
    /// The record sits in a different terminal state; nothing changed
    Conflicting,
}

impl Payment {
    /// Forward-only, idempotent transition. Terminal fields are written once.
    pub fn apply(&mut self, transition: &PaymentTransition, now: DateTime<Utc>) -> TransitionOutcome {
        let target = transition.target();
        if self.status == target {
            return TransitionOutcome::Unchanged;
        }
        if self.status.is_terminal() {
            return if target.is_terminal() {
                TransitionOutcome::Conflicting
            } else {
                TransitionOutcome::Unchanged
            };
        }
        if target.rank() < self.status.rank() {
            return TransitionOutcome::Unchanged;
        }

        match transition {
            PaymentTransition::BeginProcessing => {}
            PaymentTransition::Succeed {
                transaction_id,
                card,
            } => {
                self.transaction_id = transaction_id.clone();
                if let Some(card) = card {
                    self.card_brand = Some(card.brand.clone());
                    self.card_last4 = Some(card.last4.clone());
                }
                self.processed_at = Some(now);
            }
            PaymentTransition::Fail { reason } => {
                self.failure_reason = Some(reason.clone());
                self.processed_at = Some(now);
            }
        }
        self.status = target;
        self.updated_at = now;
        TransitionOutcome::Applied
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefundStatus {
    Pending,
    Succeeded,
    Failed,
}

impl RefundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// Counts against the refundable balance
    pub fn holds_balance(&self) -> bool {
        matches!(self, Self::Pending | Self::Succeeded)
    }
}

impl FromStr for RefundStatus {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(PaymentError::Validation(format!(
                "unknown refund status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundReason {
    RequestedByCustomer,
    Duplicate,
    Fraudulent,
    Defective,
    Other,
}

impl RefundReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestedByCustomer => "requested_by_customer",
            Self::Duplicate => "duplicate",
            Self::Fraudulent => "fraudulent",
            Self::Defective => "defective",
            Self::Other => "other",
        }
    }
}

impl FromStr for RefundReason {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.replace('-', "_").as_str() {
            "requested_by_customer" => Ok(Self::RequestedByCustomer),
            "duplicate" => Ok(Self::Duplicate),
            "fraudulent" => Ok(Self::Fraudulent),
            "defective" => Ok(Self::Defective),
            "other" => Ok(Self::Other),
            other => Err(PaymentError::Validation(format!(
                "unknown refund reason '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Refund {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub order_id: Uuid,
    pub provider: Provider,
    pub provider_refund_id: Option<String>,
    pub amount: Money,
    pub status: RefundStatus,
    pub reason: RefundReason,
    pub notes: Option<String>,
    pub idempotency_key: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub processed_by_user_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewRefund {
    pub payment_id: Uuid,
    pub order_id: Uuid,
    pub provider: Provider,
    pub amount: Money,
    pub reason: RefundReason,
    pub notes: Option<String>,
    pub idempotency_key: Option<String>,
    pub processed_by_user_id: Option<Uuid>,
}

impl NewRefund {
    pub fn into_refund(self, id: Uuid, now: DateTime<Utc>) -> Refund {
        Refund {
            id,
            payment_id: self.payment_id,
            order_id: self.order_id,
            provider: self.provider,
            provider_refund_id: None,
            amount: self.amount,
            status: RefundStatus::Pending,
            reason: self.reason,
            notes: self.notes,
            idempotency_key: self.idempotency_key,
            processed_at: None,
            failure_reason: None,
            processed_by_user_id: self.processed_by_user_id,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefundTransition {
    Succeed { provider_refund_id: Option<String> },
    Fail { reason: String },
}

impl Refund {
    pub fn apply(&mut self, transition: &RefundTransition, now: DateTime<Utc>) -> TransitionOutcome {
        let target = match transition {
            RefundTransition::Succeed { .. } => RefundStatus::Succeeded,
            RefundTransition::Fail { .. } => RefundStatus::Failed,
        };
        if self.status == target {
            return TransitionOutcome::Unchanged;
        }
        if self.status != RefundStatus::Pending {
            return TransitionOutcome::Conflicting;
        }

        match transition {
            RefundTransition::Succeed { provider_refund_id } => {
                if self.provider_refund_id.is_none() {
                    self.provider_refund_id = provider_refund_id.clone();
                }
            }
            RefundTransition::Fail { reason } => {
                self.failure_reason = Some(reason.clone());
            }
        }
        self.status = target;
        self.processed_at = Some(now);
        self.updated_at = now;
        TransitionOutcome::Applied
    }
}

/// Minor units of `amount` not yet claimed by pending or succeeded refunds
pub fn refundable_remaining(amount: &Money, refunds: &[Refund]) -> i64 {
    let held: i64 = refunds
        .iter()
        .filter(|r| r.status.holds_balance())
        .map(|r| r.amount.amount)
        .sum();
    amount.amount - held
}

/// Sum of succeeded refunds for a payment
pub fn refunded_total(currency: Currency, refunds: &[Refund]) -> Money {
    let total = refunds
        .iter()
        .filter(|r| r.status == RefundStatus::Succeeded)
        .map(|r| r.amount.amount)
        .sum();
    Money::new(total, currency)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SavedMethodType {
    Card,
    Bank,
    Wallet,
}

impl SavedMethodType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Card => "card",
            Self::Bank => "bank",
            Self::Wallet => "wallet",
        }
    }
}

impl FromStr for SavedMethodType {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "card" => Ok(Self::Card),
            "bank" => Ok(Self::Bank),
            "wallet" => Ok(Self::Wallet),
            other => Err(PaymentError::Validation(format!(
                "unknown payment method type '{}'",
                other
            ))),
        }
    }
}

/// A vaulted payment method. Never hard-deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentMethod {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider: Provider,
    pub provider_method_id: String,
    pub method_type: SavedMethodType,
    pub card_brand: Option<String>,
    pub card_last4: Option<String>,
    pub exp_month: Option<i32>,
    pub exp_year: Option<i32>,
    pub is_default: bool,
    pub is_active: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPaymentMethod {
    pub user_id: Uuid,
    pub provider: Provider,
    pub provider_method_id: String,
    pub method_type: SavedMethodType,
    pub card_brand: Option<String>,
    pub card_last4: Option<String>,
    pub exp_month: Option<i32>,
    pub exp_year: Option<i32>,
    /// Also becomes default when the user has no active method
    pub make_default: bool,
}

impl NewPaymentMethod {
    pub fn into_method(self, id: Uuid, is_default: bool, now: DateTime<Utc>) -> PaymentMethod {
        PaymentMethod {
            id,
            user_id: self.user_id,
            provider: self.provider,
            provider_method_id: self.provider_method_id,
            method_type: self.method_type,
            card_brand: self.card_brand,
            card_last4: self.card_last4,
            exp_month: self.exp_month,
            exp_year: self.exp_year,
            is_default,
            is_active: true,
            last_used_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Raw webhook delivery kept for audit and retry diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct WebhookRecord {
    pub id: Uuid,
    pub provider: Provider,
    pub event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub processed: bool,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Aggregate row for the payment summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSummary {
    pub status: PaymentStatus,
    pub currency: Currency,
    pub count: i64,
    /// Minor units
    pub total: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_payment() -> Payment {
        NewPayment {
            order_id: Uuid::new_v4(),
            provider: Provider::Stripe,
            method: PaymentMethodKind::Card,
            amount: Money::new(10000, Currency::USD),
            intent_id: "pi_123".to_string(),
            metadata: serde_json::Value::Null,
        }
        .into_payment(Uuid::new_v4(), Utc::now())
    }

    fn succeed(txn: &str) -> PaymentTransition {
        PaymentTransition::Succeed {
            transaction_id: Some(txn.to_string()),
            card: None,
        }
    }

    #[test]
    fn test_payment_moves_forward() {
        let mut payment = pending_payment();
        let now = Utc::now();
        assert_eq!(
            payment.apply(&PaymentTransition::BeginProcessing, now),
            TransitionOutcome::Applied
        );
        assert_eq!(payment.apply(&succeed("ch_1"), now), TransitionOutcome::Applied);
        assert_eq!(payment.status, PaymentStatus::Succeeded);
        assert_eq!(payment.transaction_id.as_deref(), Some("ch_1"));
        assert_eq!(payment.processed_at, Some(now));
    }

    #[test]
    fn test_pending_can_jump_to_terminal() {
        let mut payment = pending_payment();
        let outcome = payment.apply(
            &PaymentTransition::Fail {
                reason: "card_declined".into(),
            },
            Utc::now(),
        );
        assert_eq!(outcome, TransitionOutcome::Applied);
        assert_eq!(payment.failure_reason.as_deref(), Some("card_declined"));
        assert!(payment.transaction_id.is_none());
    }

    #[test]
    fn test_terminal_fields_are_written_once() {
        let mut payment = pending_payment();
        let first = Utc::now();
        payment.apply(&succeed("ch_1"), first);

        let later = first + chrono::Duration::seconds(5);
        assert_eq!(payment.apply(&succeed("ch_2"), later), TransitionOutcome::Unchanged);
        assert_eq!(payment.transaction_id.as_deref(), Some("ch_1"));
        assert_eq!(payment.processed_at, Some(first));
    }

    #[test]
    fn test_succeeded_never_becomes_failed() {
        let mut payment = pending_payment();
        payment.apply(&succeed("ch_1"), Utc::now());
        let outcome = payment.apply(
            &PaymentTransition::Fail {
                reason: "late failure".into(),
            },
            Utc::now(),
        );
        assert_eq!(outcome, TransitionOutcome::Conflicting);
        assert_eq!(payment.status, PaymentStatus::Succeeded);
        assert!(payment.failure_reason.is_none());
    }

    #[test]
    fn test_processing_after_terminal_is_a_no_op() {
        let mut payment = pending_payment();
        payment.apply(&succeed("ch_1"), Utc::now());
        assert_eq!(
            payment.apply(&PaymentTransition::BeginProcessing, Utc::now()),
            TransitionOutcome::Unchanged
        );
        assert_eq!(payment.status, PaymentStatus::Succeeded);
    }

    #[test]
    fn test_refund_transitions_are_forward_only() {
        let mut refund = NewRefund {
            payment_id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            provider: Provider::Stripe,
            amount: Money::new(6000, Currency::USD),
            reason: RefundReason::RequestedByCustomer,
            notes: None,
            idempotency_key: None,
            processed_by_user_id: None,
        }
        .into_refund(Uuid::new_v4(), Utc::now());

        let succeed = RefundTransition::Succeed {
            provider_refund_id: Some("re_1".into()),
        };
        assert_eq!(refund.apply(&succeed, Utc::now()), TransitionOutcome::Applied);
        assert_eq!(refund.apply(&succeed, Utc::now()), TransitionOutcome::Unchanged);
        assert_eq!(
            refund.apply(
                &RefundTransition::Fail {
                    reason: "late".into()
                },
                Utc::now()
            ),
            TransitionOutcome::Conflicting
        );
        assert_eq!(refund.provider_refund_id.as_deref(), Some("re_1"));
    }

    #[test]
    fn test_refundable_remaining_counts_pending_and_succeeded() {
        let payment_amount = Money::new(10000, Currency::USD);
        let mk = |amount: i64, status: RefundStatus| {
            let mut refund = NewRefund {
                payment_id: Uuid::new_v4(),
                order_id: Uuid::new_v4(),
                provider: Provider::Stripe,
                amount: Money::new(amount, Currency::USD),
                reason: RefundReason::Other,
                notes: None,
                idempotency_key: None,
                processed_by_user_id: None,
            }
            .into_refund(Uuid::new_v4(), Utc::now());
            refund.status = status;
            refund
        };
        let refunds = vec![
            mk(3000, RefundStatus::Succeeded),
            mk(2000, RefundStatus::Pending),
            mk(4000, RefundStatus::Failed),
        ];
        assert_eq!(refundable_remaining(&payment_amount, &refunds), 5000);
        assert_eq!(refunded_total(Currency::USD, &refunds).amount, 3000);
    }

    #[test]
    fn test_refund_reason_accepts_hyphenated_form() {
        assert_eq!(
            "requested-by-customer".parse::<RefundReason>().unwrap(),
            RefundReason::RequestedByCustomer
        );
    }
}
