//! Invariant checks and property-based testing strategies.
//!
//! Each check returns an `anyhow::Result` so tests can chain them with `?`
//! and get a descriptive failure message.

use std::collections::HashSet;

use anyhow::{ensure, Result};
use pgbus_core::models::{
    ClientId, Delivery, DeliveryMode, DeliveryRecord, DeliveryStatus, MessageId, Subscription,
};

/// Tracker invariants that must hold in every reachable state.
pub struct Invariants;

impl Invariants {
    /// No two records share a `(message_id, client_id, delivery_mode)` key.
    pub fn records_unique(records: &[DeliveryRecord]) -> Result<()> {
        let mut seen = HashSet::new();
        for record in records {
            ensure!(
                seen.insert(record.key()),
                "duplicate delivery record for message {} client {} mode {}",
                record.message_id,
                record.client_id,
                record.delivery_mode
            );
        }
        Ok(())
    }

    /// Delivered records carry a delivery timestamp and no lease.
    pub fn delivered_records_consistent(records: &[DeliveryRecord]) -> Result<()> {
        for record in records.iter().filter(|r| r.status == DeliveryStatus::Delivered) {
            ensure!(
                record.delivered_at.is_some(),
                "record {}/{} delivered without delivered_at",
                record.message_id,
                record.client_id
            );
            ensure!(
                record.lease_expires_at.is_none(),
                "record {}/{} delivered but still leased",
                record.message_id,
                record.client_id
            );
        }
        Ok(())
    }

    /// Push attempts never exceed the configured maximum.
    pub fn attempts_bounded(records: &[DeliveryRecord], max_attempts: u32) -> Result<()> {
        for record in records {
            let attempts = u32::try_from(record.attempts).unwrap_or(u32::MAX);
            ensure!(
                attempts <= max_attempts,
                "record {}/{} made {} attempts, limit {}",
                record.message_id,
                record.client_id,
                attempts,
                max_attempts
            );
            if record.status == DeliveryStatus::Failed {
                ensure!(
                    attempts == max_attempts || record.last_error.is_some(),
                    "record {}/{} failed without exhausting attempts or an error",
                    record.message_id,
                    record.client_id
                );
            }
        }
        Ok(())
    }

    /// Concurrent claims never hand the same message to two callers.
    pub fn batches_disjoint(batches: &[Vec<MessageId>]) -> Result<()> {
        let mut seen = HashSet::new();
        for (index, batch) in batches.iter().enumerate() {
            for id in batch {
                ensure!(seen.insert(*id), "message {id} granted twice (batch {index})");
            }
        }
        Ok(())
    }

    /// A claimed batch is ordered by message creation.
    pub fn fifo_order(deliveries: &[Delivery]) -> Result<()> {
        for pair in deliveries.windows(2) {
            let (a, b) = (&pair[0].message, &pair[1].message);
            ensure!(
                (a.created_at, a.id) <= (b.created_at, b.id),
                "batch out of order: {} before {}",
                a.id,
                b.id
            );
        }
        Ok(())
    }

    /// Fan-out produced exactly one record per expected subscription.
    pub fn fanout_matches(expected: &[Subscription], records: &[DeliveryRecord]) -> Result<()> {
        let want: HashSet<(ClientId, DeliveryMode)> =
            expected.iter().map(|s| (s.client_id.clone(), s.mode())).collect();
        let got: HashSet<(ClientId, DeliveryMode)> =
            records.iter().map(|r| (r.client_id.clone(), r.delivery_mode)).collect();

        ensure!(
            records.len() == expected.len(),
            "expected {} records, found {}",
            expected.len(),
            records.len()
        );
        ensure!(want == got, "record targets differ: expected {want:?}, found {got:?}");

        for subscription in expected {
            ensure!(
                records.iter().any(|r| r.subscription_id == subscription.id),
                "no record references subscription {}",
                subscription.id
            );
        }
        Ok(())
    }
}

/// Proptest strategies over small alphabets so collisions are frequent.
pub mod strategies {
    use chrono::{Duration, TimeZone, Utc};
    use pgbus_core::{
        models::{ClientId, DeliveryTarget, Subscription, SubscriptionId},
        routing::{Pattern, Predicate},
    };
    use proptest::{
        bool::weighted,
        collection::vec,
        prelude::{any, prop_oneof, Just, Strategy},
        sample::{select, subsequence},
    };
    use uuid::Uuid;

    /// Message types used by the strategies.
    pub static TYPES: [&str; 3] = ["created", "updated", "deleted"];

    /// Namespaces used by the strategies.
    pub static NAMESPACES: [&str; 3] = ["orders", "billing", "users"];

    /// Client names used by the strategies.
    pub static CLIENTS: [&str; 4] = ["alpha", "bravo", "charlie", "delta"];

    fn pattern_strategy(alphabet: &'static [&'static str]) -> impl Strategy<Value = Pattern> {
        prop_oneof![
            Just(Pattern::Any),
            select(alphabet).prop_map(Pattern::exact),
            subsequence(alphabet, 1..=alphabet.len()).prop_map(Pattern::one_of),
        ]
    }

    /// Random predicate over [`TYPES`] and [`NAMESPACES`].
    pub fn predicate_strategy() -> impl Strategy<Value = Predicate> {
        (pattern_strategy(&TYPES), pattern_strategy(&NAMESPACES))
            .prop_map(|(message_type, namespace)| Predicate::new(message_type, namespace))
    }

    /// Random delivery target.
    pub fn target_strategy() -> impl Strategy<Value = DeliveryTarget> {
        prop_oneof![
            Just(DeliveryTarget::Pull),
            Just(DeliveryTarget::Push { url: "http://127.0.0.1:9/hook".to_string() }),
            Just(DeliveryTarget::Notify { channel: "pgbus_test".to_string() }),
        ]
    }

    /// Random active or inactive subscription.
    pub fn subscription_strategy() -> impl Strategy<Value = Subscription> {
        (
            select(&CLIENTS[..]),
            predicate_strategy(),
            target_strategy(),
            weighted(0.75),
            0i64..1_000,
            any::<u128>(),
        )
            .prop_map(|(client, predicate, target, active, offset, id)| Subscription {
                id: SubscriptionId(Uuid::from_u128(id)),
                client_id: ClientId::new(client),
                predicate,
                target,
                active,
                created_at: Utc.timestamp_opt(1_700_000_000, 0).single().unwrap_or_default()
                    + Duration::seconds(offset),
            })
    }

    /// Random subscription set.
    pub fn subscription_set_strategy() -> impl Strategy<Value = Vec<Subscription>> {
        vec(subscription_strategy(), 0..24)
    }

    /// Random message class drawn from the same alphabets.
    pub fn message_class_strategy() -> impl Strategy<Value = (String, String)> {
        (select(&TYPES[..]), select(&NAMESPACES[..]))
            .prop_map(|(t, n)| (t.to_string(), n.to_string()))
    }
}
