//! ---
//! ads_section: "02-adapter-core"
//! ads_subsection: "module"
//! ads_type: "source"
//! ads_scope: "code"
//! ads_description: "Reference-counted fan-out of push subscriptions over shared upstream topics."
//! ads_version: "v0.0.0-prealpha"
//! ads_owner: "tbd"
//! ---
//! Push subscriptions.
//!
//! A [`SubscriptionManager`] owns the upstream topic subscriptions of one push feature.
//! Any number of [`Subscription`]s can be interested in a topic; the adapter's
//! [`TopicSubscriptionHandler`] sees exactly one subscribe when the first subscriber
//! arrives and exactly one unsubscribe when the last one leaves.
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

mod channel;
mod manager;
mod subscription;

pub use manager::{SubscriptionManager, SubscriptionManagerBuilder};
pub use subscription::{Subscription, SubscriptionHandle};

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique subscription identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Allocate the next identifier.
    pub fn next() -> Self {
        SubscriptionId(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Subscribable subject. Equality and hashing ignore case; the original spelling is kept
/// for display and for upstream calls.
#[derive(Debug, Clone)]
pub struct Topic {
    name: String,
    key: String,
}

impl Topic {
    /// Create a topic from its name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let key = name.to_lowercase();
        Self { name, key }
    }

    /// Name as first spelled by the caller.
    pub fn as_str(&self) -> &str {
        &self.name
    }
}

impl PartialEq for Topic {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Topic {}

impl Hash for Topic {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl From<&str> for Topic {
    fn from(value: &str) -> Self {
        Topic::new(value)
    }
}

impl From<String> for Topic {
    fn from(value: String) -> Self {
        Topic::new(value)
    }
}

impl From<&String> for Topic {
    fn from(value: &String) -> Self {
        Topic::new(value.as_str())
    }
}

/// Item routed by topic to interested subscribers.
pub trait TopicItem: Clone + Send + Sync + 'static {
    /// Topic the item belongs to.
    fn topic(&self) -> &str;
}

/// Upstream side of a push feature, implemented by the adapter.
///
/// Calls are serialised per manager and only issued on reference-count transitions.
#[async_trait]
pub trait TopicSubscriptionHandler: Send + Sync + 'static {
    /// Start receiving upstream values for topics that gained their first subscriber.
    async fn on_topics_added(&self, topics: &[Topic]) -> anyhow::Result<()>;

    /// Stop receiving upstream values for topics that lost their last subscriber.
    async fn on_topics_removed(&self, topics: &[Topic]) -> anyhow::Result<()>;
}

/// Caller-written change to the topic set of a live subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionUpdate {
    /// Add interest in topics.
    Add(Vec<String>),
    /// Drop interest in topics.
    Remove(Vec<String>),
}

/// Stream of topic updates consumed for the lifetime of a subscription.
pub type UpdateStream = BoxStream<'static, SubscriptionUpdate>;

/// Lifecycle of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    /// Registered without topics.
    Created,
    /// Has received at least one topic.
    Active,
    /// Cancelled by its owner.
    Cancelled,
    /// Ended by an upstream fault.
    Faulted,
    /// Completed by the adapter.
    Completed,
    /// Topics released and output closed.
    Disposed,
}

impl SubscriptionState {
    /// Whether the state ends the subscription.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SubscriptionState::Created | SubscriptionState::Active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn topics_compare_case_insensitively() {
        let mut set = HashSet::new();
        set.insert(Topic::new("Sensor1"));
        assert!(set.contains(&Topic::new("SENSOR1")));
        assert!(!set.insert(Topic::from("sensor1")));
        assert_eq!(set.iter().next().map(Topic::as_str), Some("Sensor1"));
    }

    #[test]
    fn subscription_ids_are_unique() {
        let a = SubscriptionId::next();
        let b = SubscriptionId::next();
        assert_ne!(a, b);
        assert!(b.value() > a.value());
    }

    #[test]
    fn update_messages_serialize_as_tagged_lists() {
        let update = SubscriptionUpdate::Add(vec!["Sensor1".into()]);
        assert_eq!(
            serde_json::to_value(&update).unwrap(),
            serde_json::json!({ "add": ["Sensor1"] })
        );
        assert!(SubscriptionState::Faulted.is_terminal());
        assert!(!SubscriptionState::Active.is_terminal());
    }
}
