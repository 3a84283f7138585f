//! HTTP surface tests: routing, header extraction, JSON responses

mod common;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use common::*;
use grove::handlers;
use serde_json::{Value, json};
use tower::ServiceExt;

fn app(state: AppState) -> Router {
    Router::new()
        .merge(handlers::public::router())
        .merge(handlers::webhooks::router())
        .with_state(state)
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn webhook_request(path: &str, header: Option<(&str, String)>, body: Vec<u8>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json");
    if let Some((name, value)) = header {
        builder = builder.header(name, value);
    }
    builder.body(Body::from(body)).unwrap()
}

fn seeded_state() -> AppState {
    let state = create_test_app_state();
    {
        let conn = state.db.get().unwrap();
        set_tree_price(&conn, Currency::Rub, RUB_TREE_PRICE);
        let user = create_test_user(&conn, "http@example.com");
        create_test_payment(&conn, Some(&user.id), "7001", 9_500, Currency::Rub, json!({}));
    }
    state
}

#[tokio::test]
async fn test_health() {
    let response = app(create_test_app_state())
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_webhook_with_content_hmac_header() {
    let state = seeded_state();
    let body = payment_payload("7001", "95.00", "RUB", "Succeeded");
    let signature = compute_signature(&body, TEST_SECRET);

    let response = app(state.clone())
        .oneshot(webhook_request(
            "/webhooks/cloudpayments",
            Some(("Content-HMAC", signature)),
            body,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "OK");

    let conn = state.db.get().unwrap();
    assert_eq!(donation_count(&conn), 1);
}

#[tokio::test]
async fn test_webhook_with_fallback_header() {
    let state = seeded_state();
    let body = payment_payload("7001", "95.00", "RUB", "Succeeded");
    let signature = compute_signature(&body, TEST_SECRET);

    let response = app(state)
        .oneshot(webhook_request(
            "/webhooks/cloudpayments",
            Some(("X-Content-HMAC", signature)),
            body,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_webhook_without_signature_is_unauthorized() {
    let state = seeded_state();
    let body = payment_payload("7001", "95.00", "RUB", "Succeeded");

    let response = app(state.clone())
        .oneshot(webhook_request("/webhooks/cloudpayments", None, body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_string(response).await, "Invalid signature");

    let conn = state.db.get().unwrap();
    assert_eq!(donation_count(&conn), 0);
    assert_eq!(webhook_event_count(&conn), 1);
}

#[tokio::test]
async fn test_webhook_for_unsupported_provider() {
    let response = app(create_test_app_state())
        .oneshot(webhook_request("/webhooks/tribute", None, b"{}".to_vec()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_string(response).await, "Unsupported provider");
}

#[tokio::test]
async fn test_webhook_failure_body_is_bounded() {
    let state = create_test_app_state();
    let body = payment_payload("no-such-tx", "95.00", "RUB", "Succeeded");
    let signature = compute_signature(&body, TEST_SECRET);

    let response = app(state)
        .oneshot(webhook_request(
            "/webhooks/cloudpayments",
            Some(("Content-HMAC", signature)),
            body,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let text = body_string(response).await;
    assert_eq!(text, "Payment not found");
    assert!(!text.contains("no-such-tx"));
}

#[tokio::test]
async fn test_list_prices() {
    let state = create_test_app_state();
    {
        let conn = state.db.get().unwrap();
        set_tree_price(&conn, Currency::Rub, RUB_TREE_PRICE);
        set_tree_price(&conn, Currency::Usd, 2_500);
    }

    let response = app(state)
        .oneshot(Request::builder().uri("/v1/prices").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
    let prices = body.as_array().unwrap();
    assert_eq!(prices.len(), 2);
    let rub = prices.iter().find(|p| p["currency"] == "RUB").unwrap();
    assert_eq!(rub["price_minor"], 1_900);
    assert_eq!(rub["price"], "19.00");
}

#[tokio::test]
async fn test_get_price() {
    let state = create_test_app_state();
    {
        let conn = state.db.get().unwrap();
        set_tree_price(&conn, Currency::Kzt, 950);
    }
    let app = app(state);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/v1/prices/kzt").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["currency"], "KZT");
    assert_eq!(body["price"], "9.50");

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/v1/prices/EUR").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .oneshot(Request::builder().uri("/v1/prices/GBP").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
