//! Cart endpoints and the service-level routes around them.

mod common;

use axum::http::Method;
use common::{response_json, TestApp};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;

#[tokio::test]
async fn test_cart_add_merge_and_clear() {
    let app = TestApp::new().await;

    let created = app
        .request(Method::POST, "/api/v1/carts", Some(json!({})), None)
        .await;
    assert_eq!(created.status(), 201);
    let created = response_json(created).await;
    let cart_id = created["data"]["id"].as_str().unwrap().to_string();
    assert_eq!(created["data"]["status"], "active");
    assert_eq!(created["data"]["currency"], "usd");

    let variant = Uuid::new_v4();
    let line = json!({
        "variant_id": variant,
        "product_name": "Linen apron",
        "quantity": 1,
        "unit_price": "18.50"
    });
    let items_uri = format!("/api/v1/carts/{}/items", cart_id);

    let first = app
        .request(Method::POST, &items_uri, Some(line.clone()), None)
        .await;
    assert_eq!(first.status(), 200);

    let second = app.request(Method::POST, &items_uri, Some(line), None).await;
    assert_eq!(second.status(), 200);
    let cart = response_json(second).await;
    let items = cart["data"]["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["quantity"], 2);
    let subtotal: Decimal = cart["data"]["subtotal"].as_str().unwrap().parse().unwrap();
    assert_eq!(subtotal, dec!(37.00));

    let cleared = app.request(Method::DELETE, &items_uri, None, None).await;
    assert_eq!(cleared.status(), 204);

    // clearing an empty cart is a no-op
    let again = app.request(Method::DELETE, &items_uri, None, None).await;
    assert_eq!(again.status(), 204);

    let cart = app
        .request(Method::GET, &format!("/api/v1/carts/{}", cart_id), None, None)
        .await;
    assert_eq!(cart.status(), 200);
    let cart = response_json(cart).await;
    assert!(cart["data"]["items"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_cart_rejects_invalid_quantity() {
    let app = TestApp::new().await;
    let created = app
        .request(Method::POST, "/api/v1/carts", Some(json!({})), None)
        .await;
    let cart_id = response_json(created).await["data"]["id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/carts/{}/items", cart_id),
            Some(json!({
                "variant_id": Uuid::new_v4(),
                "product_name": "Linen apron",
                "quantity": 0,
                "unit_price": "18.50"
            })),
            None,
        )
        .await;

    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_missing_cart_is_not_found() {
    let app = TestApp::new().await;

    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/carts/{}", Uuid::new_v4()),
            None,
            None,
        )
        .await;

    assert_eq!(response.status(), 404);
    let body = response_json(response).await;
    assert_eq!(body["error"], "Not Found");
}

#[tokio::test]
async fn test_health_reports_database() {
    let app = TestApp::new().await;

    let response = app.request(Method::GET, "/health", None, None).await;

    assert_eq!(response.status(), 200);
    assert!(response.headers().contains_key("x-request-id"));
    let body = response_json(response).await;
    assert_eq!(body["data"]["status"], "healthy");
    assert_eq!(body["data"]["checks"]["database"], "healthy");
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let app = TestApp::new().await;

    let response = app
        .request_with_headers(
            Method::GET,
            "/health",
            None,
            None,
            &[("x-request-id", "req-checkout-7")],
        )
        .await;

    assert_eq!(response.headers()["x-request-id"], "req-checkout-7");
}

#[tokio::test]
async fn test_openapi_document_is_served() {
    let app = TestApp::new().await;

    let response = app
        .request(Method::GET, "/api-docs/openapi.json", None, None)
        .await;

    assert_eq!(response.status(), 200);
    let doc = response_json(response).await;
    assert!(doc["paths"]["/api/v1/orders/confirm-after-payment"].is_object());
    assert!(doc["components"]["securitySchemes"]["Bearer"].is_object());
}
