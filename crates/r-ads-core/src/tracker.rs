//! ---
//! ads_section: "02-adapter-core"
//! ads_subsection: "module"
//! ads_type: "source"
//! ads_scope: "code"
//! ads_description: "Per-connection index of live subscriptions for teardown on disconnect."
//! ads_version: "v0.0.0-prealpha"
//! ads_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use r_ads_logging::{ads_debug, ads_info, LogContext};
use tokio_util::sync::CancellationToken;

use crate::subscriptions::{SubscriptionHandle, SubscriptionId, Topic, TopicItem};

/// Anything the tracker can dispose when its connection goes away.
#[async_trait]
pub trait TrackedSubscription: Send + Sync {
    /// Identifier used as the tracker key.
    fn subscription_id(&self) -> SubscriptionId;

    /// Release the subscription. Must tolerate repeated calls.
    async fn dispose(&self);
}

#[async_trait]
impl<T: TopicItem> TrackedSubscription for SubscriptionHandle<T> {
    fn subscription_id(&self) -> SubscriptionId {
        self.id()
    }

    async fn dispose(&self) {
        SubscriptionHandle::dispose(self).await;
    }
}

/// Tracks a cancellable stream such as a relayed feature stream.
#[derive(Debug, Clone)]
pub struct CancellableSubscription {
    id: SubscriptionId,
    token: CancellationToken,
}

impl CancellableSubscription {
    /// Pair an id with the token that stops the stream.
    pub fn new(id: SubscriptionId, token: CancellationToken) -> Self {
        Self { id, token }
    }
}

#[async_trait]
impl TrackedSubscription for CancellableSubscription {
    fn subscription_id(&self) -> SubscriptionId {
        self.id
    }

    async fn dispose(&self) {
        self.token.cancel();
    }
}

struct TrackedEntry {
    subscription: Arc<dyn TrackedSubscription>,
    topic_channels: HashMap<Topic, CancellationToken>,
}

impl TrackedEntry {
    fn cancel_channels(&mut self) {
        for (_, token) in self.topic_channels.drain() {
            token.cancel();
        }
    }
}

/// Subscriptions grouped by the connection that opened them.
///
/// One instance per host; call [`ConnectionSubscriptionTracker::remove_all_subscriptions`]
/// when a connection terminates.
#[derive(Default)]
pub struct ConnectionSubscriptionTracker {
    connections: Mutex<HashMap<String, HashMap<SubscriptionId, TrackedEntry>>>,
}

impl std::fmt::Debug for ConnectionSubscriptionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSubscriptionTracker")
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl ConnectionSubscriptionTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a subscription under `connection_id`. Returns `false` when the id is
    /// already tracked for that connection.
    pub fn add_subscription(
        &self,
        connection_id: &str,
        subscription: Arc<dyn TrackedSubscription>,
    ) -> bool {
        let id = subscription.subscription_id();
        let mut connections = self.connections.lock();
        let owned = connections.entry(connection_id.to_owned()).or_default();
        if owned.contains_key(&id) {
            return false;
        }
        owned.insert(
            id,
            TrackedEntry {
                subscription,
                topic_channels: HashMap::new(),
            },
        );
        ads_debug!(
            context = LogContext::default()
                .with_connection(connection_id)
                .with_subscription(id.value()),
            "subscription tracked"
        );
        true
    }

    /// Stop tracking and dispose one subscription. Returns `false` when it was not
    /// tracked for that connection.
    pub async fn remove_subscription(&self, connection_id: &str, id: SubscriptionId) -> bool {
        let removed = {
            let mut connections = self.connections.lock();
            let Some(owned) = connections.get_mut(connection_id) else {
                return false;
            };
            let removed = owned.remove(&id);
            if owned.is_empty() {
                connections.remove(connection_id);
            }
            removed
        };
        match removed {
            Some(mut entry) => {
                entry.cancel_channels();
                entry.subscription.dispose().await;
                true
            }
            None => false,
        }
    }

    /// Dispose every subscription of a terminating connection and forget it.
    /// Returns the number of subscriptions disposed; a second call returns 0.
    pub async fn remove_all_subscriptions(&self, connection_id: &str) -> usize {
        let owned = self.connections.lock().remove(connection_id);
        let Some(owned) = owned else {
            return 0;
        };
        let count = owned.len();
        for (_, mut entry) in owned {
            entry.cancel_channels();
            entry.subscription.dispose().await;
        }
        ads_info!(
            context = LogContext::default().with_connection(connection_id),
            "connection closed; {} subscription(s) disposed",
            count
        );
        count
    }

    /// Tracked subscription by id.
    pub fn get_subscription(
        &self,
        connection_id: &str,
        id: SubscriptionId,
    ) -> Option<Arc<dyn TrackedSubscription>> {
        self.connections
            .lock()
            .get(connection_id)
            .and_then(|owned| owned.get(&id))
            .map(|entry| entry.subscription.clone())
    }

    /// Ids tracked for a connection.
    pub fn subscription_ids(&self, connection_id: &str) -> Vec<SubscriptionId> {
        let mut ids: Vec<SubscriptionId> = self
            .connections
            .lock()
            .get(connection_id)
            .map(|owned| owned.keys().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Connections with at least one tracked subscription.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Attach a per-topic sub-channel to a tracked subscription. The token is cancelled
    /// when the channel is removed or the subscription is released. Returns `false`
    /// when the subscription is not tracked.
    pub fn add_topic_channel(
        &self,
        connection_id: &str,
        id: SubscriptionId,
        topic: impl Into<Topic>,
        token: CancellationToken,
    ) -> bool {
        let mut connections = self.connections.lock();
        let Some(entry) = connections
            .get_mut(connection_id)
            .and_then(|owned| owned.get_mut(&id))
        else {
            return false;
        };
        if let Some(previous) = entry.topic_channels.insert(topic.into(), token) {
            previous.cancel();
        }
        true
    }

    /// Cancel and forget a per-topic sub-channel.
    pub fn remove_topic_channel(
        &self,
        connection_id: &str,
        id: SubscriptionId,
        topic: impl Into<Topic>,
    ) -> bool {
        let mut connections = self.connections.lock();
        let removed = connections
            .get_mut(connection_id)
            .and_then(|owned| owned.get_mut(&id))
            .and_then(|entry| entry.topic_channels.remove(&topic.into()));
        match removed {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}
