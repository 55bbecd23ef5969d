//! Saved payment method endpoints under `/payment-method`

use super::{json_body, state::AppState};
use crate::collaborators::AuthUser;
use crate::error::PaymentResult;
use crate::ledger::PaymentMethod;
use crate::payments::types::Provider;
use crate::payments::vault::SaveMethod;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveMethodBody {
    pub provider: Option<Provider>,
    /// Gateway token produced by client-side tokenization
    pub payment_method_id: String,
    #[serde(default)]
    pub set_default: bool,
}

pub async fn list(
    State(state): State<AppState>,
    user: AuthUser,
) -> PaymentResult<Json<Vec<PaymentMethod>>> {
    Ok(Json(state.vault.list(&user).await?))
}

pub async fn add(
    State(state): State<AppState>,
    user: AuthUser,
    body: Result<Json<SaveMethodBody>, JsonRejection>,
) -> PaymentResult<(StatusCode, Json<PaymentMethod>)> {
    let body = json_body(body)?;
    let method = state
        .vault
        .add(
            &user,
            SaveMethod {
                provider: body.provider.unwrap_or(Provider::Stripe),
                provider_method_id: body.payment_method_id,
                make_default: body.set_default,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(method)))
}

pub async fn remove(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> PaymentResult<StatusCode> {
    state.vault.remove(&user, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn set_default(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> PaymentResult<Json<PaymentMethod>> {
    Ok(Json(state.vault.set_default(&user, id).await?))
}
