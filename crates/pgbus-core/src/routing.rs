//! Subscription predicates and precedence resolution.
//!
//! A predicate constrains the `(message_type, namespace)` pair of a message
//! with one [`Pattern`] per axis. When several subscriptions of the same
//! client and delivery mode match a message, only the most specific one
//! produces a delivery record. Resolution lives here as a pure function so the
//! storage layer and the property tests share one definition of "matches".

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    error::{CoreError, Result},
    models::{ClientId, DeliveryMode, Subscription},
};

/// Constraint on a single axis of a message class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Pattern {
    /// Matches every value. Stored as SQL `NULL`.
    Any,
    /// Matches exactly one value.
    Exact(String),
    /// Matches any member of a set. Kept sorted and de-duplicated.
    OneOf(Vec<String>),
}

impl Pattern {
    /// Exact match on `value`.
    pub fn exact(value: impl Into<String>) -> Self {
        Self::Exact(value.into())
    }

    /// Set membership. A single-element set collapses to [`Pattern::Exact`].
    pub fn one_of<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut values: Vec<String> = values.into_iter().map(Into::into).collect();
        values.sort();
        values.dedup();

        if values.len() == 1 {
            return Self::Exact(values.remove(0));
        }
        Self::OneOf(values)
    }

    /// Rebuilds a pattern from its `TEXT[]` column form.
    pub fn from_column(column: Option<Vec<String>>) -> Self {
        match column {
            None => Self::Any,
            Some(values) => Self::one_of(values),
        }
    }

    /// Column form: `NULL` for [`Pattern::Any`], a sorted array otherwise.
    pub fn to_column(&self) -> Option<Vec<String>> {
        match self {
            Self::Any => None,
            Self::Exact(value) => Some(vec![value.clone()]),
            Self::OneOf(values) => Some(values.clone()),
        }
    }

    /// Returns true if `value` satisfies this pattern.
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(expected) => expected == value,
            Self::OneOf(values) => values.iter().any(|v| v == value),
        }
    }

    /// Anything but a wildcard counts as specific.
    pub const fn is_specific(&self) -> bool {
        !matches!(self, Self::Any)
    }

    fn validate(&self, axis: &str) -> Result<()> {
        let values: &[String] = match self {
            Self::Any => return Ok(()),
            Self::Exact(value) => std::slice::from_ref(value),
            Self::OneOf(values) => values,
        };

        if values.is_empty() {
            return Err(CoreError::validation(format!("{axis} set must not be empty")));
        }
        if values.iter().any(|v| v.trim().is_empty()) {
            return Err(CoreError::validation(format!("{axis} must not contain empty values")));
        }
        Ok(())
    }
}

/// Matching predicate over `(message_type, namespace)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Predicate {
    /// Constraint on the message type.
    pub message_type: Pattern,
    /// Constraint on the namespace.
    pub namespace: Pattern,
}

impl Predicate {
    /// Creates a predicate from two patterns.
    pub fn new(message_type: Pattern, namespace: Pattern) -> Self {
        Self { message_type, namespace }
    }

    /// Matches every message.
    pub fn any() -> Self {
        Self::new(Pattern::Any, Pattern::Any)
    }

    /// Matches one exact `(message_type, namespace)` pair.
    pub fn exact(message_type: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self::new(Pattern::exact(message_type), Pattern::exact(namespace))
    }

    /// Returns true if both axes match.
    pub fn matches(&self, message_type: &str, namespace: &str) -> bool {
        self.message_type.matches(message_type) && self.namespace.matches(namespace)
    }

    /// Precedence rank, higher wins.
    ///
    /// 3: specific type and namespace, 2: specific type only,
    /// 1: specific namespace only, 0: both wildcard.
    pub const fn specificity(&self) -> u8 {
        match (self.message_type.is_specific(), self.namespace.is_specific()) {
            (true, true) => 3,
            (true, false) => 2,
            (false, true) => 1,
            (false, false) => 0,
        }
    }

    /// Rejects empty sets and blank values.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Validation` describing the offending axis.
    pub fn validate(&self) -> Result<()> {
        self.message_type.validate("message_type")?;
        self.namespace.validate("namespace")
    }

    /// Canonical string used by the uniqueness index.
    ///
    /// Two predicates that match the same messages produce the same key.
    pub fn canonical_key(&self) -> String {
        serde_json::json!([self.message_type.to_column(), self.namespace.to_column()]).to_string()
    }
}

/// Applies predicates and precedence to a set of candidate subscriptions.
///
/// Inactive and non-matching candidates are discarded. For each
/// `(client_id, delivery_mode)` the most specific predicate survives; ties
/// go to the oldest subscription, then to the smallest id. The result is
/// ordered by `(client_id, delivery_mode)` and does not depend on input order.
pub fn select_matches<I>(candidates: I, message_type: &str, namespace: &str) -> Vec<Subscription>
where
    I: IntoIterator<Item = Subscription>,
{
    let mut winners: BTreeMap<(ClientId, DeliveryMode), Subscription> = BTreeMap::new();

    for candidate in candidates {
        if !candidate.active || !candidate.predicate.matches(message_type, namespace) {
            continue;
        }

        let key = (candidate.client_id.clone(), candidate.mode());
        match winners.get(&key) {
            Some(current) if !outranks(&candidate, current) => {},
            _ => {
                winners.insert(key, candidate);
            },
        }
    }

    winners.into_values().collect()
}

fn outranks(candidate: &Subscription, current: &Subscription) -> bool {
    let (a, b) = (candidate.predicate.specificity(), current.predicate.specificity());
    if a != b {
        return a > b;
    }
    (candidate.created_at, candidate.id) < (current.created_at, current.id)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::models::{DeliveryTarget, SubscriptionId};

    fn subscription(client: &str, predicate: Predicate, target: DeliveryTarget) -> Subscription {
        Subscription {
            id: SubscriptionId::new(),
            client_id: ClientId::new(client),
            predicate,
            target,
            active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn one_of_normalizes_and_collapses() {
        assert_eq!(Pattern::one_of(["b", "a", "b"]), Pattern::OneOf(vec!["a".into(), "b".into()]));
        assert_eq!(Pattern::one_of(["x", "x"]), Pattern::exact("x"));
        assert_eq!(Pattern::from_column(None), Pattern::Any);
    }

    #[test]
    fn specificity_ranks_axes() {
        assert_eq!(Predicate::exact("t", "n").specificity(), 3);
        assert_eq!(Predicate::new(Pattern::exact("t"), Pattern::Any).specificity(), 2);
        assert_eq!(Predicate::new(Pattern::Any, Pattern::one_of(["a", "b"])).specificity(), 1);
        assert_eq!(Predicate::any().specificity(), 0);
    }

    #[test]
    fn canonical_key_ignores_set_order() {
        let a = Predicate::new(Pattern::one_of(["y", "x"]), Pattern::Any);
        let b = Predicate::new(Pattern::one_of(["x", "y"]), Pattern::Any);
        assert_eq!(a.canonical_key(), b.canonical_key());
        assert_ne!(a.canonical_key(), Predicate::any().canonical_key());
    }

    #[test]
    fn validate_rejects_blank_values() {
        assert!(Predicate::exact("", "orders").validate().is_err());
        assert!(Predicate::new(Pattern::OneOf(vec![]), Pattern::Any).validate().is_err());
        assert!(Predicate::any().validate().is_ok());
    }

    #[test]
    fn most_specific_predicate_wins_per_client_and_mode() {
        let wildcard = subscription("c1", Predicate::any(), DeliveryTarget::Pull);
        let by_namespace = subscription(
            "c1",
            Predicate::new(Pattern::Any, Pattern::exact("orders")),
            DeliveryTarget::Pull,
        );
        let exact = subscription("c1", Predicate::exact("created", "orders"), DeliveryTarget::Pull);

        let selected = select_matches(
            vec![wildcard, by_namespace.clone(), exact.clone()],
            "created",
            "orders",
        );
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, exact.id);

        let selected = select_matches(vec![by_namespace.clone()], "deleted", "orders");
        assert_eq!(selected[0].id, by_namespace.id);
    }

    #[test]
    fn distinct_modes_each_produce_a_match() {
        let pull = subscription("c1", Predicate::any(), DeliveryTarget::Pull);
        let push = subscription(
            "c1",
            Predicate::any(),
            DeliveryTarget::Push { url: "http://localhost/hook".into() },
        );
        let other = subscription("c0", Predicate::exact("t", "n"), DeliveryTarget::Pull);

        let selected = select_matches(vec![push, pull, other], "t", "n");
        let keys: Vec<_> =
            selected.iter().map(|s| (s.client_id.as_str().to_string(), s.mode())).collect();
        assert_eq!(
            keys,
            vec![
                ("c0".to_string(), DeliveryMode::Pull),
                ("c1".to_string(), DeliveryMode::Pull),
                ("c1".to_string(), DeliveryMode::Push),
            ]
        );
    }

    #[test]
    fn ties_go_to_the_oldest_subscription() {
        let mut older = subscription("c1", Predicate::exact("t", "n"), DeliveryTarget::Pull);
        older.created_at = Utc::now() - Duration::minutes(5);
        let mut newer = subscription(
            "c1",
            Predicate::new(Pattern::one_of(["t", "u"]), Pattern::exact("n")),
            DeliveryTarget::Pull,
        );
        newer.created_at = Utc::now();

        let forward = select_matches(vec![older.clone(), newer.clone()], "t", "n");
        let backward = select_matches(vec![newer, older.clone()], "t", "n");
        assert_eq!(forward[0].id, older.id);
        assert_eq!(backward[0].id, older.id);
    }

    #[test]
    fn inactive_subscriptions_never_match() {
        let mut sub = subscription("c1", Predicate::any(), DeliveryTarget::Pull);
        sub.active = false;
        assert!(select_matches(vec![sub], "t", "n").is_empty());
    }
}
