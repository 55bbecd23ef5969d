//! Storefront payment endpoints under `/payment`

use super::{json_body, state::AppState};
use crate::collaborators::AuthUser;
use crate::error::{PaymentError, PaymentResult};
use crate::ledger::{Payment, PaymentStatus, Refund, RefundReason, RefundStatus, StatusSummary};
use crate::payments::money::{Currency, Money};
use crate::payments::providers::header_str;
use crate::payments::service::{CreateIntent, PaymentDetails, RefundCommand};
use crate::payments::types::Provider;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateIntentBody {
    pub order_id: Uuid,
    /// Major units, e.g. `"100.00"`
    pub amount: Decimal,
    pub currency: String,
    pub provider: Option<Provider>,
    pub saved_method_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateIntentResponse {
    pub payment_id: Uuid,
    pub payment_intent_id: String,
    pub client_secret_or_approval_url: String,
    pub requires_action: bool,
    pub provider: Provider,
    pub status: PaymentStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmBody {
    pub payment_intent_id: String,
    pub payment_method_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmResponse {
    pub payment_id: Uuid,
    pub status: PaymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_action: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundBody {
    pub payment_id: Uuid,
    pub amount: Decimal,
    pub reason: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundResponse {
    pub refund_id: Uuid,
    pub status: RefundStatus,
    pub amount: Money,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_refund_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl From<Refund> for RefundResponse {
    fn from(refund: Refund) -> Self {
        Self {
            refund_id: refund.id,
            status: refund.status,
            amount: refund.amount,
            provider_refund_id: refund.provider_refund_id,
            failure_reason: refund.failure_reason,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryQuery {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryResponse {
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub totals: Vec<StatusSummary>,
}

/// Accepts RFC 3339 timestamps or plain dates. A plain end date covers the
/// whole day.
fn parse_bound(value: Option<&str>, end_of_day: bool) -> PaymentResult<Option<DateTime<Utc>>> {
    let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(Some(ts.with_timezone(&Utc)));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| {
        PaymentError::Validation(format!("invalid date '{}'", value))
    })?;
    let time = if end_of_day {
        date.and_hms_milli_opt(23, 59, 59, 999)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    Ok(time.map(|t| t.and_utc()))
}

pub async fn create_intent(
    State(state): State<AppState>,
    user: AuthUser,
    body: Result<Json<CreateIntentBody>, JsonRejection>,
) -> PaymentResult<Json<CreateIntentResponse>> {
    let body = json_body(body)?;
    let currency: Currency = body.currency.parse()?;
    let amount = Money::from_major(body.amount, currency)?;

    let handle = state
        .payments
        .create_intent(
            &user,
            CreateIntent {
                order_id: body.order_id,
                amount,
                provider: body.provider,
                saved_method_id: body.saved_method_id,
            },
        )
        .await?;

    Ok(Json(CreateIntentResponse {
        payment_id: handle.payment.id,
        payment_intent_id: handle.payment.intent_id,
        client_secret_or_approval_url: handle.client_action_token,
        requires_action: handle.requires_action,
        provider: handle.payment.provider,
        status: handle.payment.status,
    }))
}

pub async fn confirm(
    State(state): State<AppState>,
    user: AuthUser,
    body: Result<Json<ConfirmBody>, JsonRejection>,
) -> PaymentResult<Json<ConfirmResponse>> {
    let body = json_body(body)?;
    let result = state
        .payments
        .confirm(&user, &body.payment_intent_id, body.payment_method_id)
        .await?;

    Ok(Json(ConfirmResponse {
        payment_id: result.payment.id,
        status: result.payment.status,
        transaction_id: result.payment.transaction_id,
        failure_reason: result.payment.failure_reason,
        next_action: result.next_action,
    }))
}

pub async fn refund(
    State(state): State<AppState>,
    user: AuthUser,
    headers: HeaderMap,
    body: Result<Json<RefundBody>, JsonRejection>,
) -> PaymentResult<Json<RefundResponse>> {
    let body = json_body(body)?;
    let reason = match body.reason.as_deref() {
        Some(reason) => reason.parse()?,
        None => RefundReason::RequestedByCustomer,
    };

    let refund = state
        .payments
        .refund(
            &user,
            RefundCommand {
                payment_id: body.payment_id,
                amount: body.amount,
                reason,
                notes: body.notes,
                idempotency_key: header_str(&headers, IDEMPOTENCY_KEY_HEADER).map(str::to_string),
            },
        )
        .await?;

    Ok(Json(refund.into()))
}

pub async fn get_payment(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> PaymentResult<Json<PaymentDetails>> {
    Ok(Json(state.payments.get_payment(&user, id).await?))
}

pub async fn payments_for_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(order_id): Path<Uuid>,
) -> PaymentResult<Json<Vec<Payment>>> {
    Ok(Json(state.payments.payments_for_order(&user, order_id).await?))
}

pub async fn summary(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<SummaryQuery>,
) -> PaymentResult<Json<SummaryResponse>> {
    let start_date = parse_bound(query.start_date.as_deref(), false)?;
    let end_date = parse_bound(query.end_date.as_deref(), true)?;
    let totals = state.payments.summary(&user, start_date, end_date).await?;
    Ok(Json(SummaryResponse {
        start_date,
        end_date,
        totals,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_end_date_covers_whole_day() {
        let end = parse_bound(Some("2024-03-01"), true).unwrap().unwrap();
        assert_eq!(end.to_rfc3339(), "2024-03-01T23:59:59.999+00:00");
        let start = parse_bound(Some("2024-03-01"), false).unwrap().unwrap();
        assert_eq!(start.to_rfc3339(), "2024-03-01T00:00:00+00:00");
    }

    #[test]
    fn test_rfc3339_bound_and_garbage() {
        let ts = parse_bound(Some("2024-03-01T10:00:00Z"), false).unwrap().unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-03-01T10:00:00+00:00");
        assert!(parse_bound(Some("yesterday"), false).is_err());
        assert_eq!(parse_bound(None, false).unwrap(), None);
    }
}
