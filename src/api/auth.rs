//! Bearer-token authentication for storefront routes

use super::state::AppState;
use crate::collaborators::AuthUser;
use crate::error::PaymentError;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = PaymentError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(PaymentError::Unauthorized)?;

        state
            .identity
            .authenticate(token)
            .await?
            .ok_or(PaymentError::Unauthorized)
    }
}
