//! HTTP surface driven through the router with `oneshot`

mod common;

use axum::body::{to_bytes, Body};
use axum::Router;
use common::{Harness, SIGNATURE_HEADER, STAFF_TOKEN, STRANGER_TOKEN, USER_TOKEN};
use http::{Method, Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        request = request.header("Authorization", format!("Bearer {}", token));
    }
    let request = match body {
        Some(body) => request
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string())),
        None => request.body(Body::empty()),
    }
    .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn create_intent(app: &Router, order_id: uuid::Uuid) -> Value {
    let (status, body) = send(
        app,
        Method::POST,
        "/payment/create-intent",
        Some(USER_TOKEN),
        Some(json!({ "orderId": order_id, "amount": "100.00", "currency": "USD" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    body
}

#[tokio::test]
async fn test_create_intent_requires_authentication() {
    let h = Harness::new();
    let app = h.app();
    let order_id = h.order(10_000);

    let (status, body) = send(
        &app,
        Method::POST,
        "/payment/create-intent",
        None,
        Some(json!({ "orderId": order_id, "amount": "100.00", "currency": "USD" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "unauthorized");

    let (status, _) = send(
        &app,
        Method::POST,
        "/payment/create-intent",
        Some("expired"),
        Some(json!({ "orderId": order_id, "amount": "100.00", "currency": "USD" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_create_intent_for_foreign_order_is_not_found() {
    let h = Harness::new();
    let app = h.app();
    let order_id = h.order(10_000);

    let (status, body) = send(
        &app,
        Method::POST,
        "/payment/create-intent",
        Some(STRANGER_TOKEN),
        Some(json!({ "orderId": order_id, "amount": "100.00", "currency": "USD" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_create_intent_validation() {
    let h = Harness::new();
    let app = h.app();
    let order_id = h.order(10_000);

    for body in [
        json!({ "orderId": order_id, "amount": "-5.00", "currency": "USD" }),
        json!({ "orderId": order_id, "amount": "100.00", "currency": "XYZ" }),
        json!({ "orderId": order_id, "amount": "100.001", "currency": "USD" }),
        json!({ "orderId": order_id, "amount": "79228162514264337593543950335", "currency": "USD" }),
        json!({ "orderId": order_id }),
    ] {
        let (status, response) = send(
            &app,
            Method::POST,
            "/payment/create-intent",
            Some(USER_TOKEN),
            Some(body),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", response);
        assert_eq!(response["error"]["code"], "validation_error");
    }
}

#[tokio::test]
async fn test_pay_confirm_and_read_back() {
    let h = Harness::new();
    let app = h.app();
    let order_id = h.order(10_000);

    let created = create_intent(&app, order_id).await;
    assert_eq!(created["requiresAction"], true);
    assert_eq!(created["status"], "pending");
    assert_eq!(created["provider"], "stripe");
    let intent_id = created["paymentIntentId"].as_str().unwrap().to_string();
    assert!(created["clientSecretOrApprovalUrl"].as_str().is_some());

    let (status, confirmed) = send(
        &app,
        Method::POST,
        "/payment/confirm",
        Some(USER_TOKEN),
        Some(json!({ "paymentIntentId": intent_id, "paymentMethodId": "tok_visa" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(confirmed["status"], "succeeded");
    assert!(confirmed["transactionId"].as_str().is_some());

    let (status, _) = send(
        &app,
        Method::POST,
        "/payment/confirm",
        Some(USER_TOKEN),
        Some(json!({ "paymentIntentId": intent_id, "paymentMethodId": "tok_visa" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let payment_id = created["paymentId"].as_str().unwrap();
    let (status, details) = send(
        &app,
        Method::GET,
        &format!("/payment/{}", payment_id),
        Some(USER_TOKEN),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(details["status"], "succeeded");
    assert_eq!(details["amount"]["amount"], 10_000);
    assert_eq!(details["amount"]["currency"], "USD");
    assert!(details["processedAt"].as_str().is_some());
    assert_eq!(details["refunds"], json!([]));

    let (status, payments) = send(
        &app,
        Method::GET,
        &format!("/payment/order/{}", order_id),
        Some(USER_TOKEN),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payments.as_array().unwrap().len(), 1);

    let (status, _) = send(
        &app,
        Method::GET,
        &format!("/payment/{}", payment_id),
        Some(STRANGER_TOKEN),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_declined_confirm_reports_failure_reason() {
    let h = Harness::new();
    let app = h.app();
    let created = create_intent(&app, h.order(10_000)).await;

    let (status, confirmed) = send(
        &app,
        Method::POST,
        "/payment/confirm",
        Some(USER_TOKEN),
        Some(json!({
            "paymentIntentId": created["paymentIntentId"],
            "paymentMethodId": "tok_chargeDeclined",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(confirmed["status"], "failed");
    assert_eq!(confirmed["failureReason"], "Your card was declined.");
    assert!(confirmed.get("transactionId").is_none());
}

#[tokio::test]
async fn test_refund_over_balance_is_unprocessable() {
    let h = Harness::new();
    let app = h.app();
    let payment = h.succeeded_payment(10_000).await;

    let (status, refund) = send(
        &app,
        Method::POST,
        "/payment/refund",
        Some(STAFF_TOKEN),
        Some(json!({ "paymentId": payment.id, "amount": "60.00", "reason": "requested_by_customer" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", refund);
    assert_eq!(refund["status"], "succeeded");
    assert!(refund["refundId"].as_str().is_some());

    let (status, body) = send(
        &app,
        Method::POST,
        "/payment/refund",
        Some(STAFF_TOKEN),
        Some(json!({ "paymentId": payment.id, "amount": "50.00" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "refund_exceeds_balance");

    let (status, body) = send(
        &app,
        Method::POST,
        "/payment/refund",
        Some(STAFF_TOKEN),
        Some(json!({ "paymentId": payment.id, "amount": "10.00", "reason": "changed_mind" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");
}

#[tokio::test]
async fn test_refund_idempotency_header() {
    let h = Harness::new();
    let app = h.app();
    let payment = h.succeeded_payment(10_000).await;

    let mut ids = Vec::new();
    for _ in 0..2 {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/payment/refund")
            .header("Authorization", format!("Bearer {}", STAFF_TOKEN))
            .header("Content-Type", "application/json")
            .header("Idempotency-Key", "refund-once")
            .body(Body::from(
                json!({ "paymentId": payment.id, "amount": "30.00" }).to_string(),
            ))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        ids.push(body["refundId"].clone());
    }
    assert_eq!(ids[0], ids[1]);
    assert_eq!(
        h.stripe
            .refund_calls
            .load(std::sync::atomic::Ordering::SeqCst),
        1
    );
}

#[tokio::test]
async fn test_summary_is_staff_only() {
    let h = Harness::new();
    let app = h.app();
    h.succeeded_payment(10_000).await;

    let (status, _) = send(&app, Method::GET, "/payment/summary", Some(USER_TOKEN), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(
        &app,
        Method::GET,
        "/payment/summary?startDate=2000-01-01&endDate=2999-12-31",
        Some(STAFF_TOKEN),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let totals = body["totals"].as_array().unwrap();
    assert_eq!(totals.len(), 1);
    assert_eq!(totals[0]["status"], "succeeded");
    assert_eq!(totals[0]["count"], 1);
    assert_eq!(totals[0]["total"], 10_000);

    let (status, _) = send(
        &app,
        Method::GET,
        "/payment/summary?startDate=2024-02-01&endDate=2024-01-01",
        Some(STAFF_TOKEN),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_payment_method_routes() {
    let h = Harness::new();
    let app = h.app();

    let (status, first) = send(
        &app,
        Method::POST,
        "/payment-method",
        Some(USER_TOKEN),
        Some(json!({ "paymentMethodId": "pm_card_visa" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["isDefault"], true);
    assert_eq!(first["cardLast4"], "4242");

    let (_, second) = send(
        &app,
        Method::POST,
        "/payment-method",
        Some(USER_TOKEN),
        Some(json!({ "paymentMethodId": "pm_card_mastercard", "provider": "stripe" })),
    )
    .await;
    let second_id = second["id"].as_str().unwrap();

    let (status, promoted) = send(
        &app,
        Method::PUT,
        &format!("/payment-method/{}/set-default", second_id),
        Some(USER_TOKEN),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(promoted["isDefault"], true);

    let (_, listed) = send(&app, Method::GET, "/payment-method", Some(USER_TOKEN), None).await;
    let listed = listed.as_array().unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed.iter().filter(|m| m["isDefault"] == true).count(), 1);

    let (status, _) = send(
        &app,
        Method::DELETE,
        &format!("/payment-method/{}", second_id),
        Some(STRANGER_TOKEN),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app,
        Method::DELETE,
        &format!("/payment-method/{}", second_id),
        Some(USER_TOKEN),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, listed) = send(&app, Method::GET, "/payment-method", Some(USER_TOKEN), None).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_webhook_signature_failure_is_bad_request() {
    let h = Harness::new();
    let app = h.app();

    let request = Request::builder()
        .method(Method::POST)
        .uri("/webhook/stripe")
        .header(SIGNATURE_HEADER, "forged")
        .body(Body::from(json!({ "id": "evt_1", "type": "payment.succeeded" }).to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"]["code"], "invalid_signature");
}

#[tokio::test]
async fn test_webhook_acknowledges_processing() {
    let h = Harness::new();
    let app = h.app();
    let payment = h.pending_payment(10_000, storefront_payments::payments::Provider::PayPal).await;

    let deliver = |body: Value| {
        Request::builder()
            .method(Method::POST)
            .uri("/webhook/paypal")
            .header(SIGNATURE_HEADER, "valid")
            .body(Body::from(body.to_string()))
            .unwrap()
    };
    let event = json!({
        "id": "WH-captured",
        "type": "payment.succeeded",
        "intent": payment.intent_id,
        "transaction": "CAPTURE-1",
    });

    for expected in ["applied", "duplicate"] {
        let response = app.clone().oneshot(deliver(event.clone())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["received"], true);
        assert_eq!(body["disposition"], expected);
    }
}

#[tokio::test]
async fn test_health_reports_providers() {
    let h = Harness::new();
    let (status, body) = send(&h.app(), Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["environment"], "test");
    assert_eq!(body["providers"], json!(["stripe", "paypal"]));
    assert_eq!(body["ledger_reachable"], true);
}
