//! Pull driver against PostgreSQL: competing consumers, acks and leases.
//!
//! Skipped when `DATABASE_URL` is not set.

use std::time::Duration;

use anyhow::Result;
use pgbus_core::models::{ClientId, DeliveryStatus, MessageId};
use pgbus_delivery::{Publisher, PullConfig, PullDriver};
use pgbus_testing::{require_database, Invariants, MessageBuilder, SubscriptionBuilder, TestEnv};
use serde_json::json;

async fn publish_many(env: &TestEnv, count: usize) -> Result<Vec<MessageId>> {
    let publisher = Publisher::new(env.storage.clone(), None);
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        ids.push(publisher.publish(&MessageBuilder::new().build()).await?.message_id);
    }
    Ok(ids)
}

#[tokio::test]
async fn dequeue_ack_then_queue_is_empty() -> Result<()> {
    let env = require_database!();
    env.subscribe(SubscriptionBuilder::new("c1").namespace("orders").build()).await?;

    let publisher = Publisher::new(env.storage.clone(), None);
    let receipt = publisher
        .publish(
            &MessageBuilder::new()
                .message_type("order.created")
                .namespace("orders")
                .payload(json!({"order_id": 7}))
                .build(),
        )
        .await?;

    let driver = PullDriver::new(env.storage.clone(), PullConfig::default());
    let client = ClientId::new("c1");

    let batch = driver.dequeue(&client, 10).await?;
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].message.id, receipt.message_id);
    assert_eq!(batch[0].message.payload, json!({"order_id": 7}));
    assert_eq!(batch[0].record.status, DeliveryStatus::InFlight);

    assert_eq!(driver.ack(&client, &[receipt.message_id]).await?, 1);
    assert!(driver.dequeue(&client, 10).await?.is_empty());

    let records = env.records(receipt.message_id).await?;
    assert_eq!(records[0].status, DeliveryStatus::Delivered);
    Invariants::delivered_records_consistent(&records)?;

    env.cleanup().await
}

#[tokio::test]
async fn concurrent_dequeues_split_the_work() -> Result<()> {
    let env = require_database!();
    env.subscribe(SubscriptionBuilder::new("X").build()).await?;
    let published = publish_many(&env, 5).await?;

    let driver = PullDriver::new(env.storage.clone(), PullConfig::default());
    let client = ClientId::new("X");

    let first = tokio::spawn({
        let (driver, client) = (driver.clone(), client.clone());
        async move { driver.dequeue(&client, 5).await }
    });
    let second = tokio::spawn({
        let (driver, client) = (driver.clone(), client.clone());
        async move { driver.dequeue(&client, 5).await }
    });

    let batches: Vec<Vec<MessageId>> = vec![
        first.await??.iter().map(|d| d.message.id).collect(),
        second.await??.iter().map(|d| d.message.id).collect(),
    ];

    Invariants::batches_disjoint(&batches)?;
    let mut union: Vec<MessageId> = batches.concat();
    union.sort_unstable();
    assert_eq!(union, published);

    env.cleanup().await
}

#[tokio::test]
async fn batches_are_fifo_and_bounded() -> Result<()> {
    let env = require_database!();
    env.subscribe(SubscriptionBuilder::new("c1").build()).await?;
    let published = publish_many(&env, 7).await?;

    let config = PullConfig { max_batch_size: 3, ..PullConfig::default() };
    let driver = PullDriver::new(env.storage.clone(), config);
    let client = ClientId::new("c1");

    let first = driver.dequeue(&client, 100).await?;
    assert_eq!(first.len(), 3);
    Invariants::fifo_order(&first)?;
    assert_eq!(first.iter().map(|d| d.message.id).collect::<Vec<_>>(), published[..3]);

    let second = driver.dequeue(&client, 0).await?;
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].message.id, published[3]);

    env.cleanup().await
}

#[tokio::test]
async fn ack_ignores_ids_owned_by_other_clients() -> Result<()> {
    let env = require_database!();
    env.subscribe(SubscriptionBuilder::new("c1").build()).await?;
    env.subscribe(SubscriptionBuilder::new("c2").build()).await?;
    let published = publish_many(&env, 1).await?;

    let driver = PullDriver::new(env.storage.clone(), PullConfig::default());
    let (c1, c2) = (ClientId::new("c1"), ClientId::new("c2"));

    assert_eq!(driver.dequeue(&c1, 10).await?.len(), 1);
    assert_eq!(driver.ack(&c2, &[MessageId(i64::MAX)]).await?, 0);

    // c2's own record is acknowledged, c1's lease is untouched
    assert_eq!(driver.ack(&c2, &published).await?, 1);
    let records = env.records(published[0]).await?;
    let c1_record = records.iter().find(|r| r.client_id == c1).expect("c1 record");
    assert_eq!(c1_record.status, DeliveryStatus::InFlight);

    assert_eq!(driver.ack(&c1, &published).await?, 1);
    assert_eq!(driver.ack(&c1, &published).await?, 0);

    env.cleanup().await
}

#[tokio::test]
async fn release_returns_records_but_never_reverts_delivered() -> Result<()> {
    let env = require_database!();
    env.subscribe(SubscriptionBuilder::new("c1").build()).await?;
    let published = publish_many(&env, 2).await?;

    let driver = PullDriver::new(env.storage.clone(), PullConfig::default());
    let client = ClientId::new("c1");

    assert_eq!(driver.dequeue(&client, 10).await?.len(), 2);
    assert_eq!(driver.ack(&client, &published[..1]).await?, 1);

    assert_eq!(driver.release(&client, &published).await?, 1);

    let again = driver.dequeue(&client, 10).await?;
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].message.id, published[1]);

    env.expire_leases().await?;
    env.storage.deliveries.release_expired_leases().await?;
    let records = env.records(published[0]).await?;
    assert_eq!(records[0].status, DeliveryStatus::Delivered);

    env.cleanup().await
}

#[tokio::test]
async fn dropped_transaction_lease_makes_records_available() -> Result<()> {
    let env = require_database!();
    env.subscribe(SubscriptionBuilder::new("c1").build()).await?;
    publish_many(&env, 3).await?;

    let driver = PullDriver::new(env.storage.clone(), PullConfig::default());
    let client = ClientId::new("c1");

    let lease = driver.lease(&client, 10).await?;
    assert_eq!(lease.deliveries().len(), 3);

    // Locked rows are skipped while the lease is open
    assert!(driver.dequeue(&client, 10).await?.is_empty());

    // The rollback is issued when the connection returns to the pool
    drop(lease);
    let reclaimed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let batch = driver.dequeue(&client, 10).await?;
            if !batch.is_empty() {
                return anyhow::Ok(batch);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await??;
    assert_eq!(reclaimed.len(), 3);

    env.cleanup().await
}

#[tokio::test]
async fn transaction_lease_ack_commits() -> Result<()> {
    let env = require_database!();
    env.subscribe(SubscriptionBuilder::new("c1").build()).await?;
    let published = publish_many(&env, 2).await?;

    let driver = PullDriver::new(env.storage.clone(), PullConfig::default());
    let client = ClientId::new("c1");

    let lease = driver.lease(&client, 10).await?;
    assert_eq!(lease.message_ids(), published);
    assert_eq!(lease.ack().await?, 2);

    assert!(driver.dequeue(&client, 10).await?.is_empty());
    for id in published {
        let records = env.records(id).await?;
        assert_eq!(records[0].status, DeliveryStatus::Delivered);
    }

    let empty = driver.lease(&client, 10).await?;
    assert!(empty.is_empty());
    empty.rollback().await?;

    env.cleanup().await
}
