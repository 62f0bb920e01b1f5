use std::time::Duration;

use assert_matches::assert_matches;
use rust_decimal_macros::dec;
use serde_json::json;
use storefront_api::{
    errors::ServiceError,
    gateways::{CaptureStatus, PayPalGateway, PaymentGateway},
};
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer, ResponseTemplate,
};

async fn server_with_token() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "A21-token",
            "token_type": "Bearer",
            "expires_in": 32400
        })))
        .expect(1)
        .mount(&server)
        .await;
    server
}

fn gateway(server: &MockServer) -> PayPalGateway {
    PayPalGateway::new(server.uri(), "client", "secret", Duration::from_secs(5))
        .expect("client builds")
}

#[tokio::test]
async fn creates_and_captures_an_order_with_one_token() {
    let server = server_with_token().await;
    Mock::given(method("POST"))
        .and(path("/v2/checkout/orders"))
        .and(header("authorization", "Bearer A21-token"))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(json!({ "id": "5O190127TN364715T", "status": "CREATED" })),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/checkout/orders/5O190127TN364715T/capture"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "5O190127TN364715T",
            "status": "COMPLETED",
            "payer": { "email_address": "buyer@example.com" },
            "purchase_units": [{
                "payments": { "captures": [{ "id": "3C679366HH908993F", "status": "COMPLETED" }] }
            }]
        })))
        .mount(&server)
        .await;

    let paypal = gateway(&server);
    let external_id = paypal
        .create_order(dec!(49.19), "USD", "ORD-20250601-ABCD1234")
        .await
        .unwrap();
    assert_eq!(external_id, "5O190127TN364715T");

    let capture = paypal.capture_payment(&external_id).await.unwrap();
    assert_eq!(capture.id, "3C679366HH908993F");
    assert_eq!(capture.status, CaptureStatus::Completed);
    assert_eq!(capture.payer_email.as_deref(), Some("buyer@example.com"));

    let requests = server.received_requests().await.unwrap();
    let create: serde_json::Value = serde_json::from_slice(&requests[1].body).unwrap();
    assert_eq!(create["purchase_units"][0]["amount"]["value"], json!("49.19"));
}

#[tokio::test]
async fn refused_capture_is_a_payment_failure() {
    let server = server_with_token().await;
    Mock::given(method("POST"))
        .and(path("/v2/checkout/orders/ORDER-X/capture"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({
            "name": "UNPROCESSABLE_ENTITY",
            "details": [{ "issue": "INSTRUMENT_DECLINED" }]
        })))
        .mount(&server)
        .await;

    let err = gateway(&server).capture_payment("ORDER-X").await.unwrap_err();
    assert_matches!(err, ServiceError::PaymentFailed(ref msg) if msg.contains("INSTRUMENT_DECLINED"));
}

#[tokio::test]
async fn provider_outage_is_an_external_error() {
    let server = server_with_token().await;
    Mock::given(method("POST"))
        .and(path("/v2/checkout/orders/ORDER-Y/capture"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = gateway(&server).capture_payment("ORDER-Y").await.unwrap_err();
    assert_matches!(err, ServiceError::ExternalServiceError(_));
}
