use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};

use super::state::AppState;
use crate::payments::types::Provider;

#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub environment: String,
    pub providers: Vec<Provider>,
    pub ledger_reachable: bool,
}

pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let version = env!("CARGO_PKG_VERSION").to_string();

    let ledger_reachable = match state.ledger.payments.ping().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "ledger health check failed");
            false
        }
    };

    let (code, status) = if ledger_reachable {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    let response = HealthResponse {
        status: status.to_string(),
        version,
        environment: state.environment.clone(),
        providers: state.payments.gateways().providers(),
        ledger_reachable,
    };

    (code, Json(response))
}
