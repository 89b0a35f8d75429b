//! Push engine against PostgreSQL and a mock webhook.
//!
//! Skipped when `DATABASE_URL` is not set.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use pgbus_core::models::{ClientId, DeliveryKey, DeliveryMode, DeliveryStatus, MessageId};
use pgbus_delivery::{
    retry::RetryPolicy,
    storage::{PostgresPushStorage, PushStorage},
    ClientConfig, DeliveryConfig, DeliveryEngine, PushClient, PushDriver, PushOutcome, Publisher,
};
use pgbus_testing::{require_database, Invariants, MessageBuilder, SubscriptionBuilder, TestEnv};
use serde_json::json;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

fn fast_config(max_attempts: u32) -> DeliveryConfig {
    DeliveryConfig {
        worker_count: 2,
        poll_interval: Duration::from_millis(10),
        retry_policy: RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        },
        ..DeliveryConfig::default()
    }
}

fn push_key(message_id: MessageId, client: &str) -> DeliveryKey {
    DeliveryKey { message_id, client_id: ClientId::new(client), mode: DeliveryMode::Push }
}

async fn status_of(env: &TestEnv, key: &DeliveryKey) -> Result<DeliveryStatus> {
    let record = env.storage.deliveries.find(key).await?.expect("record exists");
    Ok(record.status)
}

#[tokio::test]
async fn running_engine_delivers_every_record() -> Result<()> {
    let env = require_database!();
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/hook"))
        .and(matchers::header("X-Pgbus-Client-Id", "hooks"))
        .and(matchers::header_exists("X-Pgbus-Message-Id"))
        .respond_with(ResponseTemplate::new(204))
        .expect(3)
        .mount(&server)
        .await;

    env.subscribe(SubscriptionBuilder::new("hooks").push(format!("{}/hook", server.uri())).build())
        .await?;

    let publisher = Publisher::new(env.storage.clone(), None);
    let mut keys = Vec::new();
    for n in 0..3 {
        let receipt = publisher.publish(&MessageBuilder::new().payload(json!({"n": n})).build()).await?;
        keys.push(push_key(receipt.message_id, "hooks"));
    }

    let mut engine = DeliveryEngine::new(
        Arc::new(env.storage.clone()),
        fast_config(3),
        Arc::new(env.clock.clone()),
    )?;
    engine.start().await?;
    assert_eq!(engine.stats().await.active_workers, 2);

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if engine.stats().await.successful_deliveries >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await?;

    engine.shutdown().await?;

    for key in &keys {
        assert_eq!(status_of(&env, key).await?, DeliveryStatus::Delivered);
    }
    server.verify().await;

    env.cleanup().await
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() -> Result<()> {
    let env = require_database!();
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    env.subscribe(SubscriptionBuilder::new("hooks").push(server.uri()).build()).await?;
    let receipt =
        Publisher::new(env.storage.clone(), None).publish(&MessageBuilder::new().build()).await?;
    let key = push_key(receipt.message_id, "hooks");

    let engine = DeliveryEngine::new(
        Arc::new(env.storage.clone()),
        fast_config(5),
        Arc::new(env.clock.clone()),
    )?;

    for expected in [DeliveryStatus::New, DeliveryStatus::New, DeliveryStatus::Delivered] {
        env.make_retries_due().await?;
        assert_eq!(engine.process_batch().await?, 1);
        assert_eq!(status_of(&env, &key).await?, expected);
    }

    let record = env.storage.deliveries.find(&key).await?.expect("record exists");
    assert_eq!(record.attempts, 3);
    assert!(record.delivered_at.is_some());

    let stats = engine.stats().await;
    assert_eq!(stats.retries_scheduled, 2);
    assert_eq!(stats.successful_deliveries, 1);

    env.cleanup().await
}

#[tokio::test]
async fn client_errors_exhaust_attempts_then_fail() -> Result<()> {
    let env = require_database!();
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such hook"))
        .expect(2)
        .mount(&server)
        .await;

    env.subscribe(SubscriptionBuilder::new("hooks").push(server.uri()).build()).await?;
    let receipt =
        Publisher::new(env.storage.clone(), None).publish(&MessageBuilder::new().build()).await?;
    let key = push_key(receipt.message_id, "hooks");

    let engine = DeliveryEngine::new(
        Arc::new(env.storage.clone()),
        fast_config(2),
        Arc::new(env.clock.clone()),
    )?;

    for _ in 0..3 {
        env.make_retries_due().await?;
        engine.process_batch().await?;
    }

    let record = env.storage.deliveries.find(&key).await?.expect("record exists");
    assert_eq!(record.status, DeliveryStatus::Failed);
    assert_eq!(record.attempts, 2);
    assert!(record.last_error.as_deref().is_some_and(|e| e.contains("no such hook")));
    Invariants::attempts_bounded(&[record], 2)?;
    server.verify().await;

    env.cleanup().await
}

#[tokio::test]
async fn invalid_webhook_url_fails_on_first_attempt() -> Result<()> {
    let env = require_database!();
    env.subscribe(SubscriptionBuilder::new("hooks").push("ftp://example.com/hook").build()).await?;
    let receipt =
        Publisher::new(env.storage.clone(), None).publish(&MessageBuilder::new().build()).await?;
    let key = push_key(receipt.message_id, "hooks");

    let engine = DeliveryEngine::new(
        Arc::new(env.storage.clone()),
        fast_config(5),
        Arc::new(env.clock.clone()),
    )?;
    assert_eq!(engine.process_batch().await?, 1);

    let record = env.storage.deliveries.find(&key).await?.expect("record exists");
    assert_eq!(record.status, DeliveryStatus::Failed);
    assert_eq!(record.attempts, 1);
    assert_eq!(engine.stats().await.permanent_failures, 1);

    env.cleanup().await
}

#[tokio::test]
async fn operator_requeue_gives_a_failed_record_new_attempts() -> Result<()> {
    let env = require_database!();
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    env.subscribe(SubscriptionBuilder::new("hooks").push(server.uri()).build()).await?;
    let receipt =
        Publisher::new(env.storage.clone(), None).publish(&MessageBuilder::new().build()).await?;
    let key = push_key(receipt.message_id, "hooks");

    let engine = DeliveryEngine::new(
        Arc::new(env.storage.clone()),
        fast_config(1),
        Arc::new(env.clock.clone()),
    )?;

    engine.process_batch().await?;
    assert_eq!(status_of(&env, &key).await?, DeliveryStatus::Failed);

    assert!(env.storage.deliveries.requeue_failed(&key).await?);
    engine.process_batch().await?;
    assert_eq!(status_of(&env, &key).await?, DeliveryStatus::Delivered);

    env.cleanup().await
}

#[tokio::test]
async fn slow_batch_keeps_its_leases_past_the_claim_lease() -> Result<()> {
    let env = require_database!();
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(500).set_delay(Duration::from_millis(900)))
        .expect(3)
        .mount(&server)
        .await;

    env.subscribe(SubscriptionBuilder::new("hooks").push(server.uri()).build()).await?;
    let publisher = Publisher::new(env.storage.clone(), None);
    let mut keys = Vec::new();
    for n in 0..3 {
        let receipt = publisher.publish(&MessageBuilder::new().payload(json!({"n": n})).build()).await?;
        keys.push(push_key(receipt.message_id, "hooks"));
    }

    let config = DeliveryConfig {
        lease_timeout: Duration::from_secs(2),
        client_config: ClientConfig { timeout: Duration::from_secs(1), ..ClientConfig::default() },
        ..fast_config(1)
    };
    let storage = Arc::new(env.storage.clone());
    let first = DeliveryEngine::new(storage.clone(), config.clone(), Arc::new(env.clock.clone()))?;
    let batch = tokio::spawn(async move { first.process_batch().await });

    tokio::time::sleep(Duration::from_millis(2200)).await;
    let released = env.storage.deliveries.release_expired_leases().await?;
    let second = DeliveryEngine::new(storage, config, Arc::new(env.clock.clone()))?;
    let claimed_by_second = second.process_batch().await?;

    assert_eq!(batch.await??, 3);
    assert_eq!(released, 0);
    assert_eq!(claimed_by_second, 0);
    for key in &keys {
        let record = env.storage.deliveries.find(key).await?.expect("record exists");
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert_eq!(record.attempts, 1);
    }
    server.verify().await;

    env.cleanup().await
}

#[tokio::test]
async fn stale_claim_after_reaping_is_not_posted() -> Result<()> {
    let env = require_database!();
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    env.subscribe(SubscriptionBuilder::new("hooks").push(server.uri()).build()).await?;
    let publisher = Publisher::new(env.storage.clone(), None);
    let mut keys = Vec::new();
    for n in 0..2 {
        let receipt = publisher.publish(&MessageBuilder::new().payload(json!({"n": n})).build()).await?;
        keys.push(push_key(receipt.message_id, "hooks"));
    }

    let storage = Arc::new(env.storage.clone());
    let stale_storage = Arc::new(PostgresPushStorage::new(storage.clone(), Duration::from_secs(30)));
    let stale = stale_storage.claim_due(10).await?;
    assert_eq!(stale.len(), 2);

    env.expire_leases().await?;
    assert_eq!(env.storage.deliveries.release_expired_leases().await?, 2);

    let engine = DeliveryEngine::new(storage, fast_config(3), Arc::new(env.clock.clone()))?;
    assert_eq!(engine.process_batch().await?, 2);

    let driver = PushDriver::new(
        stale_storage,
        Arc::new(PushClient::with_defaults()?),
        RetryPolicy::default(),
        Arc::new(env.clock.clone()),
    );
    for delivery in &stale {
        assert_eq!(driver.push(delivery).await?, PushOutcome::LeaseLost { attempts: 0 });
    }

    for key in &keys {
        let record = env.storage.deliveries.find(key).await?.expect("record exists");
        assert_eq!(record.status, DeliveryStatus::Delivered);
        assert_eq!(record.attempts, 1);
    }
    server.verify().await;

    env.cleanup().await
}
