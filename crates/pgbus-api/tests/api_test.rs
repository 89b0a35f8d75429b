//! HTTP API driven through the router with `tower::ServiceExt::oneshot`.
//!
//! Database-backed tests are skipped when `DATABASE_URL` is not set.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    body::Body,
    http::{header, HeaderMap, Method, Request, StatusCode},
    Router,
};
use pgbus_api::{create_router, server::REQUEST_ID_HEADER, AppState};
use pgbus_core::{
    models::{ClientId, DeliveryKey, DeliveryMode, DeliveryStatus, MessageId},
    Storage,
};
use pgbus_delivery::PullConfig;
use pgbus_testing::{require_database, SubscriptionBuilder, TestClock, TestEnv};
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use tower::ServiceExt;

fn router_for(env: &TestEnv) -> Router {
    let state = AppState::new(
        env.storage.clone(),
        None,
        PullConfig::default(),
        Arc::new(env.clock.clone()),
    );
    create_router(state, Duration::from_secs(5))
}

/// Router over a pool that never connects, for requests rejected before
/// touching the store.
fn offline_router() -> Result<Router> {
    let pool = PgPoolOptions::new()
        .acquire_timeout(Duration::from_millis(200))
        .connect_lazy("postgresql://127.0.0.1:1/unreachable")?;
    let state = AppState::new(
        Storage::new(pool),
        None,
        PullConfig::default(),
        Arc::new(TestClock::new()),
    );
    Ok(create_router(state, Duration::from_secs(5)))
}

async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> Result<(StatusCode, HeaderMap, Value)> {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&body)?))?,
        None => builder.body(Body::empty())?,
    };

    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes)? };
    Ok((status, headers, value))
}

#[tokio::test]
async fn malformed_json_is_a_validation_error() -> Result<()> {
    let app = offline_router()?;
    let request = Request::builder()
        .method(Method::POST)
        .uri("/messages")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))?;

    let response = app.oneshot(request).await?;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(response.headers().contains_key(REQUEST_ID_HEADER));
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    let body: Value = serde_json::from_slice(&bytes)?;
    assert_eq!(body["error"]["code"], "validation_error");
    Ok(())
}

#[tokio::test]
async fn blank_client_id_is_rejected() -> Result<()> {
    let app = offline_router()?;

    let (status, _, body) =
        send(&app, Method::POST, "/clients/%20/ack", Some(json!({"message_ids": [1]}))).await?;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");
    Ok(())
}

#[tokio::test]
async fn non_numeric_message_id_is_rejected() -> Result<()> {
    let app = offline_router()?;

    let (status, _, body) = send(&app, Method::GET, "/messages/abc", None).await?;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");
    Ok(())
}

#[tokio::test]
async fn unreachable_store_reports_unhealthy() -> Result<()> {
    let app = offline_router()?;

    let (status, _, body) = send(&app, Method::GET, "/health", None).await?;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["database"]["up"], false);
    Ok(())
}

#[tokio::test]
async fn health_reports_healthy_database() -> Result<()> {
    let env = require_database!();
    let app = router_for(&env);

    let (status, headers, body) = send(&app, Method::GET, "/health", None).await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["database"]["up"], true);
    assert!(headers.contains_key(REQUEST_ID_HEADER));

    env.cleanup().await
}

#[tokio::test]
async fn publish_then_pull_over_http() -> Result<()> {
    let env = require_database!();
    env.subscribe(SubscriptionBuilder::new("c1").namespace("orders").build()).await?;
    let app = router_for(&env);

    let (status, _, receipt) = send(
        &app,
        Method::POST,
        "/messages",
        Some(json!({
            "type": "order.created",
            "namespace": "orders",
            "payload": {"order_id": 7},
            "tracking_id": "trk-1",
        })),
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(receipt["tracking_id"], "trk-1");
    assert_eq!(receipt["delivery_stats"]["pull"], 1);
    let message_id = receipt["message_id"].as_i64().unwrap_or_default();

    let (status, _, message) =
        send(&app, Method::GET, &format!("/messages/{message_id}"), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(message["type"], "order.created");
    assert_eq!(message["payload"], json!({"order_id": 7}));

    let (status, _, batch) = send(&app, Method::POST, "/clients/c1/dequeue", None).await?;
    assert_eq!(status, StatusCode::OK);
    let deliveries = batch["deliveries"].as_array().cloned().unwrap_or_default();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0]["message"]["id"], message_id);
    assert_eq!(deliveries[0]["record"]["status"], "in_flight");

    let (status, _, acked) = send(
        &app,
        Method::POST,
        "/clients/c1/ack",
        Some(json!({"message_ids": [message_id]})),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(acked["updated"], 1);

    let (_, _, batch) =
        send(&app, Method::POST, "/clients/c1/dequeue", Some(json!({"batch_size": 5}))).await?;
    assert_eq!(batch["deliveries"], json!([]));

    let (status, _, records) =
        send(&app, Method::GET, &format!("/messages/{message_id}/deliveries"), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(records[0]["status"], "delivered");
    assert_eq!(records[0]["client_id"], "c1");

    env.cleanup().await
}

#[tokio::test]
async fn release_returns_records_to_the_queue() -> Result<()> {
    let env = require_database!();
    env.subscribe(SubscriptionBuilder::new("c1").build()).await?;
    let app = router_for(&env);

    let (_, _, receipt) = send(
        &app,
        Method::POST,
        "/messages",
        Some(json!({"type": "t", "namespace": "n", "payload": {}})),
    )
    .await?;
    let message_id = receipt["message_id"].clone();

    send(&app, Method::POST, "/clients/c1/dequeue", None).await?;
    let (status, _, released) = send(
        &app,
        Method::POST,
        "/clients/c1/release",
        Some(json!({"message_ids": [message_id]})),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(released["updated"], 1);

    let (_, _, batch) = send(&app, Method::POST, "/clients/c1/dequeue", None).await?;
    assert_eq!(batch["deliveries"][0]["message"]["id"], message_id);

    env.cleanup().await
}

#[tokio::test]
async fn blank_type_is_rejected_without_persisting() -> Result<()> {
    let env = require_database!();
    env.subscribe(SubscriptionBuilder::new("c1").build()).await?;
    let app = router_for(&env);

    let (status, _, body) = send(
        &app,
        Method::POST,
        "/messages",
        Some(json!({"type": "  ", "namespace": "orders", "payload": {}})),
    )
    .await?;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");
    assert_eq!(env.record_count().await?, 0);

    env.cleanup().await
}

#[tokio::test]
async fn unknown_message_is_not_found() -> Result<()> {
    let env = require_database!();
    let app = router_for(&env);

    let (status, _, body) = send(&app, Method::GET, "/messages/999999", None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");

    let (status, _, _) = send(&app, Method::GET, "/messages/999999/deliveries", None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    env.cleanup().await
}

#[tokio::test]
async fn requeue_moves_failed_record_back_to_new() -> Result<()> {
    let env = require_database!();
    env.subscribe(SubscriptionBuilder::new("c1").build()).await?;
    let app = router_for(&env);

    let (_, _, receipt) = send(
        &app,
        Method::POST,
        "/messages",
        Some(json!({"type": "t", "namespace": "n", "payload": {}})),
    )
    .await?;
    let message_id = MessageId(receipt["message_id"].as_i64().unwrap_or_default());
    let key = DeliveryKey { message_id, client_id: ClientId::new("c1"), mode: DeliveryMode::Pull };
    let request = json!({"message_id": message_id, "client_id": "c1", "mode": "pull"});

    let (status, _, body) =
        send(&app, Method::POST, "/deliveries/requeue", Some(request.clone())).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");

    send(&app, Method::POST, "/clients/c1/dequeue", None).await?;
    let held = env.records(message_id).await?[0].lease_expires_at.expect("dequeue sets a lease");
    assert!(env.storage.deliveries.mark_failed(&key, held, 3, "gave up").await?);

    let (status, _, body) = send(&app, Method::POST, "/deliveries/requeue", Some(request)).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["requeued"], true);

    let records = env.records(message_id).await?;
    assert_eq!(records[0].status, DeliveryStatus::New);
    assert_eq!(records[0].attempts, 0);
    assert_eq!(records[0].last_error, None);

    env.cleanup().await
}
