//! In-process cache for OAuth2 client-credentials tokens
//!
//! The token is refreshed ahead of expiry. The mutex is held across the fetch
//! so concurrent callers wait for one exchange instead of racing their own.

use crate::error::PaymentResult;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Token as returned by the provider's token endpoint
#[derive(Debug, Clone)]
pub struct FetchedToken {
    pub access_token: String,
    pub expires_in: Duration,
}

#[derive(Debug)]
struct CachedToken {
    access_token: String,
    refresh_at: Instant,
}

#[derive(Debug)]
pub struct TokenCache {
    margin: Duration,
    slot: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    /// `margin` is how long before expiry the token is replaced. It is capped
    /// at half the token lifetime so very short-lived tokens still get reused.
    pub fn new(margin: Duration) -> Self {
        Self {
            margin,
            slot: Mutex::new(None),
        }
    }

    pub async fn get_or_refresh<F, Fut>(&self, fetch: F) -> PaymentResult<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PaymentResult<FetchedToken>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(token) = slot.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.access_token.clone());
            }
        }

        let fetched = fetch().await?;
        let margin = self.margin.min(fetched.expires_in / 2);
        let refresh_at = Instant::now() + fetched.expires_in - margin;
        debug!(expires_in = ?fetched.expires_in, "access token refreshed");

        *slot = Some(CachedToken {
            access_token: fetched.access_token.clone(),
            refresh_at,
        });
        Ok(fetched.access_token)
    }

    /// Drop the cached token, e.g. after the provider rejected it
    pub async fn invalidate(&self) {
        *self.slot.lock().await = None;
    }
}
