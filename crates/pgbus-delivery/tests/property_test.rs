//! Property tests for fan-out cardinality.
//!
//! The in-memory matcher used by fan-out is checked against a brute-force
//! reference over random subscription sets drawn from small alphabets, so
//! overlapping predicates and precedence ties are common. The database
//! variant registers the set through the repository, publishes, and checks
//! the stored records against the same reference. It is skipped when
//! `DATABASE_URL` is not set.

use std::collections::BTreeSet;

use pgbus_core::{
    models::{ClientId, DeliveryMode, NewSubscription, Subscription},
    routing::select_matches,
};
use pgbus_delivery::Publisher;
use pgbus_testing::{
    strategies::{message_class_strategy, subscription_set_strategy, CLIENTS},
    Invariants, MessageBuilder, TestEnv,
};
use proptest::prelude::*;

/// Winner for one `(client, mode)` group, found by exhaustive comparison.
fn reference_winner<'a>(group: &[&'a Subscription]) -> Option<&'a Subscription> {
    group.iter().copied().find(|candidate| {
        group.iter().all(|other| {
            let (a, b) = (candidate.predicate.specificity(), other.predicate.specificity());
            a > b || (a == b && (candidate.created_at, candidate.id) <= (other.created_at, other.id))
        })
    })
}

fn reference_matches(
    subscriptions: &[Subscription],
    message_type: &str,
    namespace: &str,
) -> Vec<Subscription> {
    let eligible: Vec<&Subscription> = subscriptions
        .iter()
        .filter(|s| s.active && s.predicate.matches(message_type, namespace))
        .collect();

    let groups: BTreeSet<(ClientId, DeliveryMode)> =
        eligible.iter().map(|s| (s.client_id.clone(), s.mode())).collect();

    groups
        .into_iter()
        .filter_map(|(client_id, mode)| {
            let group: Vec<&Subscription> = eligible
                .iter()
                .copied()
                .filter(|s| s.client_id == client_id && s.mode() == mode)
                .collect();
            reference_winner(&group).cloned()
        })
        .collect()
}

/// Registers `subscriptions`, publishes one message and compares the stored
/// records with the reference over what the registry actually holds.
async fn database_fan_out_matches_reference(
    subscriptions: Vec<Subscription>,
    message_type: String,
    namespace: String,
) -> anyhow::Result<()> {
    let Some(env) = TestEnv::new().await? else {
        return Ok(());
    };

    for subscription in &subscriptions {
        let stored = env
            .subscribe(NewSubscription::new(
                subscription.client_id.clone(),
                subscription.predicate.clone(),
                subscription.target.clone(),
            ))
            .await?;
        if !subscription.active {
            env.storage.subscriptions.deactivate(stored.id).await?;
        }
    }

    let mut registry = Vec::new();
    for client in CLIENTS {
        registry.extend(env.storage.subscriptions.list_for_client(&ClientId::new(client)).await?);
    }
    let expected = reference_matches(&registry, &message_type, &namespace);

    let receipt = Publisher::new(env.storage.clone(), None)
        .publish(&MessageBuilder::new().message_type(&message_type).namespace(&namespace).build())
        .await?;

    let expected_count = i64::try_from(expected.len())?;
    anyhow::ensure!(
        env.record_count().await? == expected_count,
        "record count differs from reference"
    );
    anyhow::ensure!(
        receipt.delivery_stats.values().sum::<i64>() == expected_count,
        "receipt stats differ from reference"
    );
    Invariants::fanout_matches(&expected, &env.records(receipt.message_id).await?)?;

    env.cleanup().await
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn database_fan_out_agrees_with_reference(
        subscriptions in subscription_set_strategy(),
        (message_type, namespace) in message_class_strategy(),
    ) {
        let runtime = tokio::runtime::Runtime::new().map_err(|e| TestCaseError::fail(e.to_string()))?;
        runtime
            .block_on(database_fan_out_matches_reference(subscriptions, message_type, namespace))
            .map_err(|e| TestCaseError::fail(format!("{e:#}")))?;
    }
}

proptest! {
    #[test]
    fn matcher_agrees_with_reference(
        subscriptions in subscription_set_strategy(),
        (message_type, namespace) in message_class_strategy(),
    ) {
        let actual = select_matches(subscriptions.clone(), &message_type, &namespace);
        let expected = reference_matches(&subscriptions, &message_type, &namespace);
        prop_assert_eq!(actual, expected);
    }

    #[test]
    fn one_match_per_client_and_mode(
        subscriptions in subscription_set_strategy(),
        (message_type, namespace) in message_class_strategy(),
    ) {
        let matches = select_matches(subscriptions, &message_type, &namespace);
        let keys: BTreeSet<(ClientId, DeliveryMode)> =
            matches.iter().map(|s| (s.client_id.clone(), s.mode())).collect();

        prop_assert_eq!(keys.len(), matches.len());
        prop_assert!(matches.iter().all(|s| s.active));
        prop_assert!(matches.iter().all(|s| s.predicate.matches(&message_type, &namespace)));
    }

    #[test]
    fn input_order_does_not_change_the_result(
        subscriptions in subscription_set_strategy(),
        (message_type, namespace) in message_class_strategy(),
    ) {
        let forward = select_matches(subscriptions.clone(), &message_type, &namespace);
        let reversed = select_matches(subscriptions.into_iter().rev(), &message_type, &namespace);
        prop_assert_eq!(forward, reversed);
    }

    #[test]
    fn matching_is_idempotent(
        subscriptions in subscription_set_strategy(),
        (message_type, namespace) in message_class_strategy(),
    ) {
        let once = select_matches(subscriptions, &message_type, &namespace);
        let twice = select_matches(once.clone(), &message_type, &namespace);
        prop_assert_eq!(once, twice);
    }
}
