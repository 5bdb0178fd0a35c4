//! ---
//! ads_section: "04-simulation"
//! ads_subsection: "module"
//! ads_type: "source"
//! ads_scope: "code"
//! ads_description: "Simulated upstream connection and call counters."
//! ads_version: "v0.0.0-prealpha"
//! ads_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::bail;
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use r_ads_core::{Topic, TopicSubscriptionHandler};
use tracing::debug;

#[derive(Debug, Default)]
struct UpstreamState {
    subscribes: IndexMap<String, usize>,
    unsubscribes: IndexMap<String, usize>,
    active: HashSet<String>,
}

/// Stand-in for the upstream system's subscription API. Records every call and can be
/// told to refuse topics.
#[derive(Debug, Default)]
pub struct UpstreamRecorder {
    name: String,
    state: Mutex<UpstreamState>,
    refused: HashSet<String>,
}

impl UpstreamRecorder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Refuse subscribe calls that include any of `topics`.
    pub fn refusing<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.refused = topics
            .into_iter()
            .map(|topic| topic.as_ref().to_lowercase())
            .collect();
        self
    }

    /// Upstream subscribe calls issued for `topic`.
    pub fn subscribe_count(&self, topic: &str) -> usize {
        self.state
            .lock()
            .subscribes
            .get(&topic.to_lowercase())
            .copied()
            .unwrap_or(0)
    }

    /// Upstream unsubscribe calls issued for `topic`.
    pub fn unsubscribe_count(&self, topic: &str) -> usize {
        self.state
            .lock()
            .unsubscribes
            .get(&topic.to_lowercase())
            .copied()
            .unwrap_or(0)
    }

    /// Whether the upstream currently delivers `topic`.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.state.lock().active.contains(&topic.to_lowercase())
    }

    /// Topics currently delivered, sorted.
    pub fn active_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.state.lock().active.iter().cloned().collect();
        topics.sort();
        topics
    }
}

#[async_trait]
impl TopicSubscriptionHandler for UpstreamRecorder {
    async fn on_topics_added(&self, topics: &[Topic]) -> anyhow::Result<()> {
        if let Some(refused) = topics
            .iter()
            .find(|topic| self.refused.contains(&topic.as_str().to_lowercase()))
        {
            bail!("{}: upstream refused topic '{}'", self.name, refused);
        }
        let mut state = self.state.lock();
        for topic in topics {
            let key = topic.as_str().to_lowercase();
            *state.subscribes.entry(key.clone()).or_default() += 1;
            state.active.insert(key);
        }
        debug!(upstream = %self.name, count = topics.len(), "upstream subscribe");
        Ok(())
    }

    async fn on_topics_removed(&self, topics: &[Topic]) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        for topic in topics {
            let key = topic.as_str().to_lowercase();
            *state.unsubscribes.entry(key.clone()).or_default() += 1;
            state.active.remove(&key);
        }
        debug!(upstream = %self.name, count = topics.len(), "upstream unsubscribe");
        Ok(())
    }
}

/// Number of times adapter code ran, per call kind.
#[derive(Debug, Default)]
pub struct CallCounters {
    reads: AtomicUsize,
    subscriptions: AtomicUsize,
    invocations: AtomicUsize,
}

impl CallCounters {
    pub(crate) fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_subscription(&self) {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_invocation(&self) {
        self.invocations.fetch_add(1, Ordering::SeqCst);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Every call that reached adapter code.
    pub fn total(&self) -> usize {
        self.reads() + self.subscriptions() + self.invocations()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_calls_and_refuses_configured_topics() {
        let upstream = UpstreamRecorder::new("values").refusing(["Forbidden"]);
        upstream
            .on_topics_added(&[Topic::new("Sensor1")])
            .await
            .unwrap();
        assert!(upstream.is_subscribed("SENSOR1"));
        assert!(upstream
            .on_topics_added(&[Topic::new("Sensor2"), Topic::new("forbidden")])
            .await
            .is_err());
        assert!(!upstream.is_subscribed("Sensor2"));

        upstream
            .on_topics_removed(&[Topic::new("sensor1")])
            .await
            .unwrap();
        assert_eq!(upstream.subscribe_count("Sensor1"), 1);
        assert_eq!(upstream.unsubscribe_count("Sensor1"), 1);
        assert!(upstream.active_topics().is_empty());
    }
}
