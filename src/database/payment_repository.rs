use crate::database::error::{DatabaseError, DbResult};
use crate::database::parse_column;
use crate::database::transaction::DatabaseTransaction;
use crate::ledger::models::{
    NewPayment, Payment, PaymentTransition, StatusSummary, TransitionOutcome,
};
use crate::ledger::store::PaymentStore;
use crate::payments::money::Money;
use crate::payments::types::Provider;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::debug;
use uuid::Uuid;

const PAYMENT_COLUMNS: &str = "id, order_id, provider, method, status, amount, currency, intent_id, \
     transaction_id, card_brand, card_last4, processed_at, failure_reason, metadata, created_at, updated_at";

#[derive(Debug, Clone, FromRow)]
struct PaymentRow {
    id: Uuid,
    order_id: Uuid,
    provider: String,
    method: String,
    status: String,
    amount: i64,
    currency: String,
    intent_id: String,
    transaction_id: Option<String>,
    card_brand: Option<String>,
    card_last4: Option<String>,
    processed_at: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = DatabaseError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(Payment {
            id: row.id,
            order_id: row.order_id,
            provider: parse_column("provider", &row.provider)?,
            method: parse_column("method", &row.method)?,
            status: parse_column("status", &row.status)?,
            amount: Money::new(row.amount, parse_column("currency", &row.currency)?),
            intent_id: row.intent_id,
            transaction_id: row.transaction_id,
            card_brand: row.card_brand,
            card_last4: row.card_last4,
            processed_at: row.processed_at,
            failure_reason: row.failure_reason,
            metadata: row.metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct SummaryRow {
    status: String,
    currency: String,
    count: i64,
    total: i64,
}

/// Postgres-backed payment ledger
pub struct PaymentRepository {
    pool: PgPool,
}

impl PaymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PaymentStore for PaymentRepository {
    async fn insert_payment(&self, payment: NewPayment) -> DbResult<Payment> {
        let sql = format!(
            "INSERT INTO payments (id, order_id, provider, method, status, amount, currency, intent_id, metadata) \
             VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, $8) \
             RETURNING {}",
            PAYMENT_COLUMNS
        );
        let row = sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(payment.order_id)
            .bind(payment.provider.as_str())
            .bind(payment.method.as_str())
            .bind(payment.amount.amount)
            .bind(payment.amount.currency.code())
            .bind(&payment.intent_id)
            .bind(&payment.metadata)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        row.try_into()
    }

    async fn find_payment(&self, id: Uuid) -> DbResult<Option<Payment>> {
        let sql = format!(
            "SELECT {} FROM payments WHERE id = $1 AND is_deleted = false",
            PAYMENT_COLUMNS
        );
        sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(Payment::try_from)
            .transpose()
    }

    async fn find_payment_by_intent(
        &self,
        provider: Option<Provider>,
        intent_id: &str,
    ) -> DbResult<Option<Payment>> {
        let sql = format!(
            "SELECT {} FROM payments \
             WHERE intent_id = $1 AND ($2::text IS NULL OR provider = $2) AND is_deleted = false \
             ORDER BY created_at ASC LIMIT 1",
            PAYMENT_COLUMNS
        );
        sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(intent_id)
            .bind(provider.map(|p| p.as_str()))
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(Payment::try_from)
            .transpose()
    }

    async fn list_payments_for_order(&self, order_id: Uuid) -> DbResult<Vec<Payment>> {
        let sql = format!(
            "SELECT {} FROM payments WHERE order_id = $1 AND is_deleted = false ORDER BY created_at ASC",
            PAYMENT_COLUMNS
        );
        sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(order_id)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .into_iter()
            .map(Payment::try_from)
            .collect()
    }

    async fn transition_payment(
        &self,
        id: Uuid,
        transition: &PaymentTransition,
    ) -> DbResult<(Payment, TransitionOutcome)> {
        let mut tx = DatabaseTransaction::begin(&self.pool).await?;

        let sql = format!(
            "SELECT {} FROM payments WHERE id = $1 FOR UPDATE",
            PAYMENT_COLUMNS
        );
        let row = sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(id)
            .fetch_optional(tx.conn()?)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .ok_or_else(|| DatabaseError::not_found("Payment", id))?;
        let mut payment = Payment::try_from(row)?;

        let outcome = payment.apply(transition, Utc::now());
        if outcome == TransitionOutcome::Applied {
            sqlx::query(
                "UPDATE payments \
                 SET status = $2, transaction_id = $3, card_brand = $4, card_last4 = $5, \
                     processed_at = $6, failure_reason = $7, updated_at = $8 \
                 WHERE id = $1",
            )
            .bind(payment.id)
            .bind(payment.status.as_str())
            .bind(&payment.transaction_id)
            .bind(&payment.card_brand)
            .bind(&payment.card_last4)
            .bind(payment.processed_at)
            .bind(&payment.failure_reason)
            .bind(payment.updated_at)
            .execute(tx.conn()?)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        }

        tx.commit().await?;
        debug!(payment_id = %id, status = payment.status.as_str(), ?outcome, "payment transition");
        Ok((payment, outcome))
    }

    async fn summarize(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> DbResult<Vec<StatusSummary>> {
        let rows = sqlx::query_as::<_, SummaryRow>(
            "SELECT status, currency, COUNT(*) AS count, COALESCE(SUM(amount), 0)::BIGINT AS total \
             FROM payments \
             WHERE ($1::timestamptz IS NULL OR created_at >= $1) \
               AND ($2::timestamptz IS NULL OR created_at <= $2) \
               AND is_deleted = false \
             GROUP BY status, currency \
             ORDER BY status, currency",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        rows.into_iter()
            .map(|row| {
                Ok(StatusSummary {
                    status: parse_column("status", &row.status)?,
                    currency: parse_column("currency", &row.currency)?,
                    count: row.count,
                    total: row.total,
                })
            })
            .collect()
    }

    async fn ping(&self) -> DbResult<()> {
        crate::database::health_check(&self.pool).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::models::{PaymentMethodKind, PaymentStatus};
    use crate::payments::money::Currency;

    fn row() -> PaymentRow {
        PaymentRow {
            id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            provider: "paypal".into(),
            method: "wallet".into(),
            status: "processing".into(),
            amount: 2500,
            currency: "EUR".into(),
            intent_id: "5O190127TN364715T".into(),
            transaction_id: None,
            card_brand: None,
            card_last4: None,
            processed_at: None,
            failure_reason: None,
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_row_decodes_into_payment() {
        let payment = Payment::try_from(row()).unwrap();
        assert_eq!(payment.provider, Provider::PayPal);
        assert_eq!(payment.method, PaymentMethodKind::Wallet);
        assert_eq!(payment.status, PaymentStatus::Processing);
        assert_eq!(payment.amount, Money::new(2500, Currency::EUR));
    }

    #[test]
    fn test_unknown_status_is_a_decode_error() {
        let mut bad = row();
        bad.status = "refunded".into();
        let err = Payment::try_from(bad).unwrap_err();
        assert!(err.to_string().contains("status"));
    }

    #[tokio::test]
    #[ignore] // Requires database running
    async fn test_transition_is_forward_only_in_postgres() {
        let url = std::env::var("DATABASE_URL").unwrap();
        let pool = crate::database::init_pool(&url, None).await.unwrap();
        crate::database::run_migrations(&pool).await.unwrap();
        let repo = PaymentRepository::new(pool);

        let payment = repo
            .insert_payment(NewPayment {
                order_id: Uuid::new_v4(),
                provider: Provider::Stripe,
                method: PaymentMethodKind::Card,
                amount: Money::new(10000, Currency::USD),
                intent_id: format!("pi_{}", Uuid::new_v4().simple()),
                metadata: serde_json::json!({}),
            })
            .await
            .unwrap();

        let succeed = PaymentTransition::Succeed {
            transaction_id: Some("ch_1".into()),
            card: None,
        };
        let (_, first) = repo.transition_payment(payment.id, &succeed).await.unwrap();
        let (after, second) = repo
            .transition_payment(payment.id, &PaymentTransition::Fail { reason: "x".into() })
            .await
            .unwrap();
        assert_eq!(first, TransitionOutcome::Applied);
        assert_eq!(second, TransitionOutcome::Conflicting);
        assert_eq!(after.status, PaymentStatus::Succeeded);
    }
}
