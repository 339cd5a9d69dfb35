//! HTTP surface tests over the in-memory pipeline.

use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use courier_api::{create_router, AppState};
use courier_testing::{eventually, TestEnv};
use http_body_util::BodyExt;
use tower::ServiceExt;

const WAIT: Duration = Duration::from_secs(10);

struct Harness {
    env: TestEnv,
    engine: Arc<courier_delivery::Engine>,
    router: Router,
}

fn harness() -> Harness {
    let env = TestEnv::new();
    let engine = Arc::new(env.engine());
    let router = create_router(AppState::new(engine.clone()));
    Harness { env, engine, router }
}

async fn get_json(router: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = router
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).expect("request"))
        .await
        .expect("response");

    let status = response.status();
    let bytes = response.into_body().collect().await.expect("body").to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

async fn post_json(router: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");

    let status = response.status();
    let bytes = response.into_body().collect().await.expect("body").to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

#[tokio::test]
async fn status_reports_camel_case_shape() {
    let h = harness();
    h.engine.start().await.expect("start");

    assert!(
        eventually(WAIT, || async {
            let (_, body) = get_json(&h.router, "/status").await;
            body["processorsRunning"]["outbound"] == serde_json::json!(true)
        })
        .await,
        "processors should come up"
    );

    let (code, body) = get_json(&h.router, "/status").await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["initialized"], serde_json::json!(true));
    assert_eq!(body["started"], serde_json::json!(true));
    assert_eq!(body["brokerConnected"], serde_json::json!(true));
    assert_eq!(body["processorsRunning"]["webhook"], serde_json::json!(true));
    assert_eq!(body["processorsRunning"]["retryManager"], serde_json::json!(true));

    h.engine.stop().await.expect("stop");
}

#[tokio::test]
async fn queue_stats_lists_all_four_queues() {
    let h = harness();
    h.engine.start().await.expect("start");

    let (code, body) = get_json(&h.router, "/queue-stats").await;
    assert_eq!(code, StatusCode::OK);

    let map = body.as_object().expect("object");
    assert_eq!(map.len(), 4);
    for queue in ["courier.outbound", "courier.webhook", "courier.retry", "courier.dead-letter"] {
        let snapshot = &map[queue];
        assert!(snapshot["messageCount"].is_u64(), "messageCount missing for {queue}");
        assert!(snapshot["consumerCount"].is_u64(), "consumerCount missing for {queue}");
    }

    h.engine.stop().await.expect("stop");
}

#[tokio::test]
async fn queue_stats_unavailable_while_disconnected() {
    let h = harness();

    // Engine never started: the manager refuses to issue channels.
    let (code, _body) = get_json(&h.router, "/queue-stats").await;
    assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn retry_stats_start_at_zero() {
    let h = harness();
    h.engine.start().await.expect("start");

    let (code, body) = get_json(&h.router, "/retry-stats").await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["totalRetries"], serde_json::json!(0));
    assert_eq!(body["successfulRetries"], serde_json::json!(0));
    assert_eq!(body["failedRetries"], serde_json::json!(0));
    assert_eq!(body["deadLetterCount"], serde_json::json!(0));

    h.engine.stop().await.expect("stop");
}

#[tokio::test]
async fn restart_returns_updated_status() {
    let h = harness();
    h.engine.start().await.expect("start");

    let (code, body) = post_json(&h.router, "/restart").await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["started"], serde_json::json!(true));
    assert_eq!(body["brokerConnected"], serde_json::json!(true));

    h.engine.stop().await.expect("stop");
}

#[tokio::test]
async fn dead_letters_surface_failed_jobs() {
    let h = harness();
    h.env.gateway.push_outcome(Err(courier_delivery::DeliveryError::gateway_rejected(
        410,
        "recipient opted out",
    )));
    h.engine.start().await.expect("start");

    let job = h.env.outbound_job("+15550100", "bounce");
    h.engine.producer().enqueue_outbound(&job).await.expect("enqueue");

    assert!(
        eventually(WAIT, || async {
            let (_, body) = get_json(&h.router, "/dead-letters").await;
            body.as_array().is_some_and(|entries| entries.len() == 1)
        })
        .await,
        "dead letter should appear"
    );

    let (code, body) = get_json(&h.router, "/dead-letters?limit=5").await;
    assert_eq!(code, StatusCode::OK);
    let entry = &body[0];
    assert_eq!(entry["source_queue"], serde_json::json!("courier.outbound"));
    assert!(entry["reason"].as_str().is_some_and(|r| r.contains("recipient opted out")));

    h.engine.stop().await.expect("stop");
}

#[tokio::test]
async fn health_tracks_broker_connectivity() {
    let h = harness();
    h.engine.start().await.expect("start");

    let (code, body) = get_json(&h.router, "/health").await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["status"], serde_json::json!("healthy"));
    assert_eq!(body["checks"]["broker"]["status"], serde_json::json!("up"));

    h.env.broker.set_unreachable(true);
    assert!(
        eventually(WAIT, || async {
            let (code, _) = get_json(&h.router, "/health").await;
            code == StatusCode::SERVICE_UNAVAILABLE
        })
        .await,
        "health should go unhealthy during an outage"
    );

    h.env.broker.set_unreachable(false);
    h.engine.stop().await.expect("stop");
}

#[tokio::test]
async fn liveness_always_answers() {
    let h = harness();

    let (code, body) = get_json(&h.router, "/live").await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["status"], serde_json::json!("alive"));
}

#[tokio::test]
async fn responses_carry_request_ids() {
    let h = harness();

    let response = h
        .router
        .clone()
        .oneshot(Request::builder().uri("/live").body(Body::empty()).expect("request"))
        .await
        .expect("response");

    assert!(response.headers().contains_key("X-Request-Id"));
}
