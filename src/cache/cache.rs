//! Redis-backed markers for processed webhook events
//!
//! Every operation degrades gracefully: a pool that cannot hand out a
//! connection reads as "not processed" and marker writes are dropped. The
//! ledger's own event log stays the source of truth.

use super::{error::CacheResult, keys, RedisPool};
use crate::payments::reconciler::ProcessedEvents;
use crate::payments::types::Provider;
use async_trait::async_trait;
use bb8::PooledConnection;
use bb8_redis::RedisConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, warn};

type RedisConnection<'a> = PooledConnection<'a, RedisConnectionManager>;

/// Provider redelivery windows are shorter than a day
pub const MARKER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone)]
pub struct WebhookMarkerCache {
    pool: RedisPool,
}

impl WebhookMarkerCache {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    async fn connection(&self) -> Option<RedisConnection<'_>> {
        match self.pool.get().await {
            Ok(conn) => Some(conn),
            Err(e) => {
                warn!("Failed to get Redis connection: {}", e);
                None
            }
        }
    }

    /// Whether a marker exists for the key
    pub async fn contains(&self, key: &str) -> CacheResult<bool> {
        let Some(mut conn) = self.connection().await else {
            return Ok(false);
        };
        let found: bool = conn.exists(key).await?;
        debug!(key, found, "webhook marker lookup");
        Ok(found)
    }

    /// Write a marker. Returns false when it was already present.
    pub async fn insert(&self, key: &str) -> CacheResult<bool> {
        let Some(mut conn) = self.connection().await else {
            return Ok(false);
        };
        let written: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(chrono::Utc::now().timestamp())
            .arg("NX")
            .arg("EX")
            .arg(MARKER_TTL.as_secs())
            .query_async(&mut *conn)
            .await?;
        Ok(written.is_some())
    }

    pub async fn remove(&self, key: &str) -> CacheResult<bool> {
        let Some(mut conn) = self.connection().await else {
            return Ok(false);
        };
        let removed: i32 = conn.del(key).await?;
        Ok(removed > 0)
    }
}

#[async_trait]
impl ProcessedEvents for WebhookMarkerCache {
    async fn is_processed(&self, provider: Provider, event_id: &str) -> bool {
        let key = keys::webhook_event(provider, event_id);
        match self.contains(&key).await {
            Ok(found) => found,
            Err(e) => {
                warn!(%provider, error = %e, "webhook marker lookup failed, using ledger");
                false
            }
        }
    }

    async fn mark_processed(&self, provider: Provider, event_id: &str) {
        let key = keys::webhook_event(provider, event_id);
        if let Err(e) = self.insert(&key).await {
            warn!(%provider, error = %e, "failed to write webhook marker");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{init_cache_pool, CacheConfig};

    // Run with: REDIS_URL=redis://localhost:6379 cargo test -- --ignored

    async fn cache() -> WebhookMarkerCache {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        WebhookMarkerCache::new(init_cache_pool(CacheConfig::new(url)).await.unwrap())
    }

    #[tokio::test]
    #[ignore]
    async fn test_insert_is_first_writer_wins() {
        let cache = cache().await;
        let key = format!("test:marker:{}", uuid::Uuid::new_v4());
        assert!(cache.insert(&key).await.unwrap());
        assert!(!cache.insert(&key).await.unwrap());
        assert!(cache.contains(&key).await.unwrap());

        assert!(cache.remove(&key).await.unwrap());
        assert!(!cache.contains(&key).await.unwrap());
    }

    #[tokio::test]
    #[ignore]
    async fn test_webhook_markers() {
        let cache = cache().await;
        let event_id = format!("evt_{}", uuid::Uuid::new_v4());
        assert!(!cache.is_processed(Provider::Stripe, &event_id).await);
        cache.mark_processed(Provider::Stripe, &event_id).await;
        assert!(cache.is_processed(Provider::Stripe, &event_id).await);
        assert!(!cache.is_processed(Provider::PayPal, &event_id).await);
    }
}
