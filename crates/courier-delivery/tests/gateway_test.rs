//! HTTP send gateway classification tests.
//!
//! The gateway's job is to turn opaque HTTP responses into the delivery
//! error taxonomy; these tests pin the classification ladder against a
//! mock server.

use std::time::Duration;

use chrono::Utc;
use courier_core::{JobId, MessagePayload, OutboundMessageJob};
use courier_delivery::{DeliveryError, GatewayConfig, HttpSendGateway, SendGateway};
use wiremock::{
    matchers::{header_exists, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn sample_job() -> OutboundMessageJob {
    let mut job = OutboundMessageJob::new(
        JobId::new(),
        "support-line",
        "+15550100",
        MessagePayload::text("hello"),
        Utc::now(),
    );
    job.begin_attempt(Utc::now());
    job
}

async fn gateway_for(server: &MockServer) -> HttpSendGateway {
    gateway_with_timeout(server, Duration::from_secs(5)).await
}

async fn gateway_with_timeout(server: &MockServer, timeout: Duration) -> HttpSendGateway {
    HttpSendGateway::new(GatewayConfig {
        url: format!("{}/send", server.uri()),
        timeout,
        user_agent: "courier-test/1.0".to_string(),
    })
    .expect("gateway should build")
}

#[tokio::test]
async fn success_returns_provider_message_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/send"))
        .and(header_exists("X-Courier-Job-Id"))
        .and(header_exists("X-Courier-Attempt"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"messageId": "WA-123"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let gateway = gateway_for(&server).await;
    let ack = gateway.send_message(&sample_job()).await.expect("send should succeed");

    assert_eq!(ack.status_code, 200);
    assert_eq!(ack.provider_message_id.as_deref(), Some("WA-123"));
    server.verify().await;
}

#[tokio::test]
async fn success_without_body_still_acks() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/send"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let gateway = gateway_for(&server).await;
    let ack = gateway.send_message(&sample_job()).await.expect("send should succeed");

    assert_eq!(ack.status_code, 204);
    assert!(ack.provider_message_id.is_none());
}

#[tokio::test]
async fn client_error_is_permanent_rejection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/send"))
        .respond_with(ResponseTemplate::new(422).set_body_string("invalid recipient"))
        .mount(&server)
        .await;

    let gateway = gateway_for(&server).await;
    let err = gateway.send_message(&sample_job()).await.expect_err("should be rejected");

    match &err {
        DeliveryError::GatewayRejected { status, reason } => {
            assert_eq!(*status, 422);
            assert!(reason.contains("invalid recipient"));
        },
        other => panic!("expected GatewayRejected, got {other:?}"),
    }
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn server_error_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/send"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .mount(&server)
        .await;

    let gateway = gateway_for(&server).await;
    let err = gateway.send_message(&sample_job()).await.expect_err("should fail");

    assert!(matches!(err, DeliveryError::GatewayServer { status: 503, .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn rate_limit_carries_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/send"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "120"))
        .mount(&server)
        .await;

    let gateway = gateway_for(&server).await;
    let err = gateway.send_message(&sample_job()).await.expect_err("should fail");

    assert!(err.is_retryable());
    assert_eq!(err.retry_after_seconds(), Some(120));
}

#[tokio::test]
async fn slow_gateway_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/send"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let gateway = gateway_with_timeout(&server, Duration::from_millis(200)).await;
    let err = gateway.send_message(&sample_job()).await.expect_err("should time out");

    assert!(matches!(err, DeliveryError::Timeout { .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn unreachable_gateway_is_network_error() {
    // Bind-then-drop guarantees nothing is listening on the port.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let gateway = HttpSendGateway::new(GatewayConfig {
        url: format!("http://{addr}/send"),
        timeout: Duration::from_secs(2),
        user_agent: "courier-test/1.0".to_string(),
    })
    .expect("gateway should build");

    let err = gateway.send_message(&sample_job()).await.expect_err("should fail");
    assert!(matches!(err, DeliveryError::Network { .. }));
    assert!(err.is_retryable());
}
