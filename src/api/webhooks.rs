//! Provider webhook entry points
//!
//! The raw body is handed to the adapter untouched; signatures are computed
//! over the exact bytes received.

use super::state::AppState;
use crate::error::PaymentResult;
use crate::payments::reconciler::WebhookDisposition;
use crate::payments::types::Provider;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub disposition: WebhookDisposition,
}

async fn receive(
    state: &AppState,
    provider: Provider,
    headers: &HeaderMap,
    body: &[u8],
) -> PaymentResult<Json<WebhookAck>> {
    let disposition = state.reconciler.handle(provider, body, headers).await?;
    Ok(Json(WebhookAck {
        received: true,
        disposition,
    }))
}

pub async fn stripe(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> PaymentResult<Json<WebhookAck>> {
    receive(&state, Provider::Stripe, &headers, &body).await
}

pub async fn paypal(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> PaymentResult<Json<WebhookAck>> {
    receive(&state, Provider::PayPal, &headers, &body).await
}
