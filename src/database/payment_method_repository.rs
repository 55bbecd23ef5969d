use crate::database::error::{DatabaseError, DbResult};
use crate::database::parse_column;
use crate::database::transaction::DatabaseTransaction;
use crate::ledger::models::{NewPaymentMethod, PaymentMethod};
use crate::ledger::store::PaymentMethodStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection, PgPool};
use uuid::Uuid;

const METHOD_COLUMNS: &str = "id, user_id, provider, provider_method_id, method_type, card_brand, \
     card_last4, exp_month, exp_year, is_default, is_active, last_used_at, created_at, updated_at";

#[derive(Debug, Clone, FromRow)]
struct PaymentMethodRow {
    id: Uuid,
    user_id: Uuid,
    provider: String,
    provider_method_id: String,
    method_type: String,
    card_brand: Option<String>,
    card_last4: Option<String>,
    exp_month: Option<i32>,
    exp_year: Option<i32>,
    is_default: bool,
    is_active: bool,
    last_used_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PaymentMethodRow> for PaymentMethod {
    type Error = DatabaseError;

    fn try_from(row: PaymentMethodRow) -> Result<Self, Self::Error> {
        Ok(PaymentMethod {
            id: row.id,
            user_id: row.user_id,
            provider: parse_column("provider", &row.provider)?,
            provider_method_id: row.provider_method_id,
            method_type: parse_column("method_type", &row.method_type)?,
            card_brand: row.card_brand,
            card_last4: row.card_last4,
            exp_month: row.exp_month,
            exp_year: row.exp_year,
            is_default: row.is_default,
            is_active: row.is_active,
            last_used_at: row.last_used_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Postgres-backed payment-method vault. Rows are soft-deactivated, never deleted.
pub struct PaymentMethodRepository {
    pool: PgPool,
}

impl PaymentMethodRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Serialize default-flag writes for one user until the transaction ends
async fn lock_user(conn: &mut PgConnection, user_id: Uuid) -> DbResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1::text))")
        .bind(user_id.to_string())
        .execute(conn)
        .await
        .map_err(DatabaseError::from_sqlx)?;
    Ok(())
}

#[async_trait]
impl PaymentMethodStore for PaymentMethodRepository {
    async fn insert_method(&self, method: NewPaymentMethod) -> DbResult<PaymentMethod> {
        let mut tx = DatabaseTransaction::begin(&self.pool).await?;
        lock_user(tx.conn()?, method.user_id).await?;

        let has_active: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM payment_methods WHERE user_id = $1 AND is_active)",
        )
        .bind(method.user_id)
        .fetch_one(tx.conn()?)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        let is_default = method.make_default || !has_active;

        if is_default {
            sqlx::query(
                "UPDATE payment_methods SET is_default = false, updated_at = NOW() \
                 WHERE user_id = $1 AND is_default",
            )
            .bind(method.user_id)
            .execute(tx.conn()?)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        }

        let sql = format!(
            "INSERT INTO payment_methods (id, user_id, provider, provider_method_id, method_type, \
                                          card_brand, card_last4, exp_month, exp_year, is_default) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             RETURNING {}",
            METHOD_COLUMNS
        );
        let row = sqlx::query_as::<_, PaymentMethodRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(method.user_id)
            .bind(method.provider.as_str())
            .bind(&method.provider_method_id)
            .bind(method.method_type.as_str())
            .bind(&method.card_brand)
            .bind(&method.card_last4)
            .bind(method.exp_month)
            .bind(method.exp_year)
            .bind(is_default)
            .fetch_one(tx.conn()?)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        tx.commit().await?;
        row.try_into()
    }

    async fn find_method(&self, id: Uuid) -> DbResult<Option<PaymentMethod>> {
        let sql = format!("SELECT {} FROM payment_methods WHERE id = $1", METHOD_COLUMNS);
        sqlx::query_as::<_, PaymentMethodRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(PaymentMethod::try_from)
            .transpose()
    }

    async fn list_active_methods(&self, user_id: Uuid) -> DbResult<Vec<PaymentMethod>> {
        let sql = format!(
            "SELECT {} FROM payment_methods \
             WHERE user_id = $1 AND is_active AND is_deleted = false \
             ORDER BY is_default DESC, created_at ASC",
            METHOD_COLUMNS
        );
        sqlx::query_as::<_, PaymentMethodRow>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .into_iter()
            .map(PaymentMethod::try_from)
            .collect()
    }

    async fn set_default_method(
        &self,
        user_id: Uuid,
        id: Uuid,
    ) -> DbResult<Option<PaymentMethod>> {
        let mut tx = DatabaseTransaction::begin(&self.pool).await?;
        lock_user(tx.conn()?, user_id).await?;

        // One statement flips the old default off and the new one on
        let sql = format!(
            "UPDATE payment_methods SET is_default = (id = $2), updated_at = NOW() \
             WHERE user_id = $1 AND (is_default OR id = $2) \
               AND EXISTS (SELECT 1 FROM payment_methods WHERE id = $2 AND user_id = $1 AND is_active) \
             RETURNING {}",
            METHOD_COLUMNS
        );
        let rows = sqlx::query_as::<_, PaymentMethodRow>(&sql)
            .bind(user_id)
            .bind(id)
            .fetch_all(tx.conn()?)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        tx.commit().await?;
        rows.into_iter()
            .find(|row| row.id == id)
            .map(PaymentMethod::try_from)
            .transpose()
    }

    async fn deactivate_method(
        &self,
        user_id: Uuid,
        id: Uuid,
    ) -> DbResult<Option<PaymentMethod>> {
        let sql = format!(
            "UPDATE payment_methods SET is_active = false, is_default = false, updated_at = NOW() \
             WHERE id = $1 AND user_id = $2 AND is_active \
             RETURNING {}",
            METHOD_COLUMNS
        );
        sqlx::query_as::<_, PaymentMethodRow>(&sql)
            .bind(id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(PaymentMethod::try_from)
            .transpose()
    }

    async fn touch_method(&self, id: Uuid) -> DbResult<()> {
        sqlx::query(
            "UPDATE payment_methods SET last_used_at = NOW(), updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }
}
