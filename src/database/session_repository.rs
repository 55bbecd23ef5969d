use crate::collaborators::{AuthUser, IdentityService};
use crate::database::error::DatabaseError;
use crate::error::PaymentResult;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(Debug, FromRow)]
struct SessionRow {
    user_id: Uuid,
    is_staff: bool,
}

/// Resolves bearer tokens against the storefront session table.
/// Sessions store the SHA-256 of the token, never the token itself.
pub struct SessionRepository {
    pool: PgPool,
}

impl SessionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

pub(crate) fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[async_trait]
impl IdentityService for SessionRepository {
    async fn authenticate(&self, token: &str) -> PaymentResult<Option<AuthUser>> {
        let row = sqlx::query_as::<_, SessionRow>(
            "SELECT s.user_id, u.is_staff
             FROM user_sessions s
             JOIN users u ON u.id = s.user_id
             WHERE s.token_hash = $1 AND s.expires_at > NOW() AND u.is_active",
        )
        .bind(token_digest(token))
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(row.map(|row| AuthUser {
            id: row.user_id,
            is_staff: row.is_staff,
        }))
    }
}
