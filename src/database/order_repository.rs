use crate::collaborators::{OrderLookup, OrderRef};
use crate::database::error::DatabaseError;
use crate::database::parse_column;
use crate::error::PaymentResult;
use crate::payments::money::Money;
use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(Debug, FromRow)]
struct OrderRow {
    id: Uuid,
    user_id: Uuid,
    total_amount: i64,
    currency: String,
}

/// Reads the storefront `orders` table
pub struct OrderRepository {
    pool: PgPool,
}

impl OrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderLookup for OrderRepository {
    async fn find_order(&self, id: Uuid) -> PaymentResult<Option<OrderRef>> {
        let row = sqlx::query_as::<_, OrderRow>(
            "SELECT id, user_id, total_amount, currency FROM orders WHERE id = $1 AND is_deleted = false",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        match row {
            Some(row) => Ok(Some(OrderRef {
                id: row.id,
                user_id: row.user_id,
                total: Money::new(row.total_amount, parse_column("currency", &row.currency)?),
            })),
            None => Ok(None),
        }
    }
}
