//! HTTP surface

pub mod auth;
pub mod health;
pub mod payment_methods;
pub mod payments;
pub mod state;
pub mod webhooks;

pub use state::AppState;

use crate::error::{PaymentError, PaymentResult};
use axum::extract::rejection::JsonRejection;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

/// Malformed JSON is a validation error like any other
pub(crate) fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> PaymentResult<T> {
    body.map(|Json(value)| value)
        .map_err(|rejection| PaymentError::Validation(rejection.body_text()))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/payment/create-intent", post(payments::create_intent))
        .route("/payment/confirm", post(payments::confirm))
        .route("/payment/refund", post(payments::refund))
        .route("/payment/summary", get(payments::summary))
        .route("/payment/order/:order_id", get(payments::payments_for_order))
        .route("/payment/:id", get(payments::get_payment))
        .route(
            "/payment-method",
            get(payment_methods::list).post(payment_methods::add),
        )
        .route("/payment-method/:id", delete(payment_methods::remove))
        .route(
            "/payment-method/:id/set-default",
            put(payment_methods::set_default),
        )
        .route("/webhook/stripe", post(webhooks::stripe))
        .route("/webhook/paypal", post(webhooks::paypal))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
        .with_state(state)
}
