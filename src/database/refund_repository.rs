use crate::database::error::{DatabaseError, DatabaseErrorKind, DbResult};
use crate::database::parse_column;
use crate::database::transaction::DatabaseTransaction;
use crate::ledger::models::{NewRefund, Refund, RefundTransition, TransitionOutcome};
use crate::ledger::store::RefundStore;
use crate::payments::money::Money;
use crate::payments::types::Provider;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::{debug, warn};
use uuid::Uuid;

const REFUND_COLUMNS: &str = "id, payment_id, order_id, provider, provider_refund_id, amount, currency, \
     status, reason, notes, idempotency_key, processed_at, failure_reason, processed_by_user_id, \
     created_at, updated_at";

#[derive(Debug, Clone, FromRow)]
struct RefundRow {
    id: Uuid,
    payment_id: Uuid,
    order_id: Uuid,
    provider: String,
    provider_refund_id: Option<String>,
    amount: i64,
    currency: String,
    status: String,
    reason: String,
    notes: Option<String>,
    idempotency_key: Option<String>,
    processed_at: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
    processed_by_user_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RefundRow> for Refund {
    type Error = DatabaseError;

    fn try_from(row: RefundRow) -> Result<Self, Self::Error> {
        Ok(Refund {
            id: row.id,
            payment_id: row.payment_id,
            order_id: row.order_id,
            provider: parse_column("provider", &row.provider)?,
            provider_refund_id: row.provider_refund_id,
            amount: Money::new(row.amount, parse_column("currency", &row.currency)?),
            status: parse_column("status", &row.status)?,
            reason: parse_column("reason", &row.reason)?,
            notes: row.notes,
            idempotency_key: row.idempotency_key,
            processed_at: row.processed_at,
            failure_reason: row.failure_reason,
            processed_by_user_id: row.processed_by_user_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Postgres-backed refund ledger
pub struct RefundRepository {
    pool: PgPool,
}

impl RefundRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RefundStore for RefundRepository {
    async fn reserve_refund(&self, refund: NewRefund) -> DbResult<Refund> {
        let mut tx = DatabaseTransaction::begin(&self.pool).await?;

        // Serializes concurrent reservations against the same payment
        let payment_amount: i64 =
            sqlx::query_scalar("SELECT amount FROM payments WHERE id = $1 FOR UPDATE")
                .bind(refund.payment_id)
                .fetch_optional(tx.conn()?)
                .await
                .map_err(DatabaseError::from_sqlx)?
                .ok_or_else(|| DatabaseError::not_found("Payment", refund.payment_id))?;

        let held: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount), 0)::BIGINT FROM refunds \
             WHERE payment_id = $1 AND status IN ('pending', 'succeeded') AND is_deleted = false",
        )
        .bind(refund.payment_id)
        .fetch_one(tx.conn()?)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        let available = payment_amount - held;
        if refund.amount.amount > available {
            warn!(
                payment_id = %refund.payment_id,
                available,
                requested = refund.amount.amount,
                "refund reservation rejected"
            );
            return Err(DatabaseError::new(DatabaseErrorKind::InsufficientBalance {
                available,
                required: refund.amount.amount,
            }));
        }

        let sql = format!(
            "INSERT INTO refunds (id, payment_id, order_id, provider, amount, currency, status, reason, \
                                  notes, idempotency_key, processed_by_user_id) \
             VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $8, $9, $10) \
             RETURNING {}",
            REFUND_COLUMNS
        );
        let row = sqlx::query_as::<_, RefundRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(refund.payment_id)
            .bind(refund.order_id)
            .bind(refund.provider.as_str())
            .bind(refund.amount.amount)
            .bind(refund.amount.currency.code())
            .bind(refund.reason.as_str())
            .bind(&refund.notes)
            .bind(&refund.idempotency_key)
            .bind(refund.processed_by_user_id)
            .fetch_one(tx.conn()?)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        tx.commit().await?;
        row.try_into()
    }

    async fn find_refund(&self, id: Uuid) -> DbResult<Option<Refund>> {
        let sql = format!("SELECT {} FROM refunds WHERE id = $1", REFUND_COLUMNS);
        sqlx::query_as::<_, RefundRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(Refund::try_from)
            .transpose()
    }

    async fn find_refund_by_provider_id(
        &self,
        provider: Provider,
        provider_refund_id: &str,
    ) -> DbResult<Option<Refund>> {
        let sql = format!(
            "SELECT {} FROM refunds WHERE provider = $1 AND provider_refund_id = $2",
            REFUND_COLUMNS
        );
        sqlx::query_as::<_, RefundRow>(&sql)
            .bind(provider.as_str())
            .bind(provider_refund_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(Refund::try_from)
            .transpose()
    }

    async fn find_refund_by_idempotency_key(
        &self,
        payment_id: Uuid,
        key: &str,
    ) -> DbResult<Option<Refund>> {
        let sql = format!(
            "SELECT {} FROM refunds WHERE payment_id = $1 AND idempotency_key = $2",
            REFUND_COLUMNS
        );
        sqlx::query_as::<_, RefundRow>(&sql)
            .bind(payment_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(Refund::try_from)
            .transpose()
    }

    async fn list_refunds_for_payment(&self, payment_id: Uuid) -> DbResult<Vec<Refund>> {
        let sql = format!(
            "SELECT {} FROM refunds WHERE payment_id = $1 AND is_deleted = false ORDER BY created_at ASC",
            REFUND_COLUMNS
        );
        sqlx::query_as::<_, RefundRow>(&sql)
            .bind(payment_id)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .into_iter()
            .map(Refund::try_from)
            .collect()
    }

    async fn record_provider_refund_id(
        &self,
        id: Uuid,
        provider_refund_id: &str,
    ) -> DbResult<Refund> {
        let sql = format!(
            "UPDATE refunds \
             SET provider_refund_id = COALESCE(provider_refund_id, $2), updated_at = NOW() \
             WHERE id = $1 \
             RETURNING {}",
            REFUND_COLUMNS
        );
        sqlx::query_as::<_, RefundRow>(&sql)
            .bind(id)
            .bind(provider_refund_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .ok_or_else(|| DatabaseError::not_found("Refund", id))?
            .try_into()
    }

    async fn transition_refund(
        &self,
        id: Uuid,
        transition: &RefundTransition,
    ) -> DbResult<(Refund, TransitionOutcome)> {
        let mut tx = DatabaseTransaction::begin(&self.pool).await?;

        let sql = format!("SELECT {} FROM refunds WHERE id = $1 FOR UPDATE", REFUND_COLUMNS);
        let row = sqlx::query_as::<_, RefundRow>(&sql)
            .bind(id)
            .fetch_optional(tx.conn()?)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .ok_or_else(|| DatabaseError::not_found("Refund", id))?;
        let mut refund = Refund::try_from(row)?;

        let outcome = refund.apply(transition, Utc::now());
        if outcome == TransitionOutcome::Applied {
            sqlx::query(
                "UPDATE refunds \
                 SET status = $2, provider_refund_id = $3, processed_at = $4, failure_reason = $5, updated_at = $6 \
                 WHERE id = $1",
            )
            .bind(refund.id)
            .bind(refund.status.as_str())
            .bind(&refund.provider_refund_id)
            .bind(refund.processed_at)
            .bind(&refund.failure_reason)
            .bind(refund.updated_at)
            .execute(tx.conn()?)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        }

        tx.commit().await?;
        debug!(refund_id = %id, status = refund.status.as_str(), ?outcome, "refund transition");
        Ok((refund, outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::models::{RefundReason, RefundStatus};

    #[test]
    fn test_row_decodes_into_refund() {
        let row = RefundRow {
            id: Uuid::new_v4(),
            payment_id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            provider: "stripe".into(),
            provider_refund_id: Some("re_1".into()),
            amount: 6000,
            currency: "USD".into(),
            status: "succeeded".into(),
            reason: "requested_by_customer".into(),
            notes: None,
            idempotency_key: Some("key-1".into()),
            processed_at: Some(Utc::now()),
            failure_reason: None,
            processed_by_user_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let refund = Refund::try_from(row).unwrap();
        assert_eq!(refund.status, RefundStatus::Succeeded);
        assert_eq!(refund.reason, RefundReason::RequestedByCustomer);
        assert_eq!(refund.amount.amount, 6000);
    }
}
