use crate::database::error::{DatabaseError, DbResult};
use crate::database::parse_column;
use crate::ledger::models::WebhookRecord;
use crate::ledger::store::WebhookLog;
use crate::payments::types::Provider;
use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// Webhook event row
#[derive(Debug, Clone, FromRow)]
struct WebhookEventRow {
    id: Uuid,
    provider: String,
    event_id: String,
    event_type: String,
    payload: serde_json::Value,
    processed: bool,
    attempts: i32,
    last_error: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    processed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl TryFrom<WebhookEventRow> for WebhookRecord {
    type Error = DatabaseError;

    fn try_from(row: WebhookEventRow) -> Result<Self, Self::Error> {
        Ok(WebhookRecord {
            id: row.id,
            provider: parse_column("provider", &row.provider)?,
            event_id: row.event_id,
            event_type: row.event_type,
            payload: row.payload,
            processed: row.processed,
            attempts: row.attempts,
            last_error: row.last_error,
            created_at: row.created_at,
            processed_at: row.processed_at,
        })
    }
}

/// Webhook Repository for webhook event storage and tracking
pub struct WebhookRepository {
    pool: PgPool,
}

impl WebhookRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookLog for WebhookRepository {
    async fn log_event(
        &self,
        provider: Provider,
        event_id: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> DbResult<WebhookRecord> {
        sqlx::query_as::<_, WebhookEventRow>(
            "INSERT INTO webhook_events (id, provider, event_id, event_type, payload)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (provider, event_id)
             DO UPDATE SET payload = EXCLUDED.payload, updated_at = NOW()
             RETURNING id, provider, event_id, event_type, payload, processed, attempts, last_error, created_at, processed_at",
        )
        .bind(Uuid::new_v4())
        .bind(provider.as_str())
        .bind(event_id)
        .bind(event_type)
        .bind(payload)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .try_into()
    }

    async fn mark_processed(&self, id: Uuid) -> DbResult<()> {
        sqlx::query(
            "UPDATE webhook_events
             SET processed = true, processed_at = COALESCE(processed_at, NOW()), updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn record_failure(&self, id: Uuid, error: &str) -> DbResult<()> {
        sqlx::query(
            "UPDATE webhook_events
             SET attempts = attempts + 1, last_error = $2, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }
}
