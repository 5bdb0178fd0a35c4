//! ---
//! ads_section: "04-simulation"
//! ads_subsection: "module"
//! ads_type: "source"
//! ads_scope: "code"
//! ads_description: "Simulated adapter implementing every standard feature."
//! ads_version: "v0.0.0-prealpha"
//! ads_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use r_ads_common::SimulationConfig;
use r_ads_core::features::{
    ConfigurationChanges, EventMessagePush, ItemStream, ReadSnapshotTagValues,
    SnapshotTagValuePush,
};
use r_ads_core::model::{
    ConfigurationChange, CreateConfigurationChangesSubscriptionRequest,
    CreateEventMessageSubscriptionRequest, CreateSnapshotTagValueSubscriptionRequest, EventMessage,
    ReadSnapshotTagValuesRequest, TagValue, TagValueQueryResult, TagValueStatus,
};
use r_ads_core::{
    Adapter, AdapterDescriptor, AdapterHost, AdapterResult, BackgroundDispatcher, CallContext,
    FeatureSet, Subscription, SubscriptionManager, TopicItem, UpdateStream,
};
use r_ads_logging::{ads_debug, ads_info, LogContext};
use tokio_util::sync::CancellationToken;

use crate::extension::CustomExtension;
use crate::generator::TagValueGenerator;
use crate::upstream::{CallCounters, UpstreamRecorder};

/// Builder for [`SimulatedAdapter`].
#[derive(Debug, Clone)]
pub struct SimulatedAdapterBuilder {
    id: String,
    name: String,
    config: SimulationConfig,
    generate: bool,
    refused_topics: Vec<String>,
}

impl SimulatedAdapterBuilder {
    /// Simulation settings (tags, interval, seed).
    pub fn config(mut self, config: SimulationConfig) -> Self {
        self.config = config;
        self
    }

    /// Display name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Run the value generator while the adapter is started. Enabled by default.
    pub fn generate(mut self, generate: bool) -> Self {
        self.generate = generate;
        self
    }

    /// Topics every upstream refuses to subscribe.
    pub fn refuse_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.refused_topics = topics.into_iter().map(Into::into).collect();
        self
    }

    /// Create the adapter with subscription managers owned by `host`'s dispatcher.
    pub fn build(self, host: &AdapterHost) -> Arc<SimulatedAdapter> {
        let values_upstream =
            Arc::new(UpstreamRecorder::new("values").refusing(&self.refused_topics));
        let events_upstream =
            Arc::new(UpstreamRecorder::new("events").refusing(&self.refused_topics));
        let changes_upstream =
            Arc::new(UpstreamRecorder::new("configuration").refusing(&self.refused_topics));
        let counters = Arc::new(CallCounters::default());
        let core = Arc::new(SimulatedCore {
            descriptor: AdapterDescriptor::new(self.id.clone(), self.name)
                .with_description("Simulated adapter producing seeded tag values."),
            running: AtomicBool::new(false),
            values: host.subscription_manager(format!("{}-values", self.id), values_upstream.clone()),
            events: host.subscription_manager(format!("{}-events", self.id), events_upstream.clone()),
            changes: host
                .subscription_manager(format!("{}-configuration", self.id), changes_upstream.clone()),
            values_upstream,
            events_upstream,
            changes_upstream,
            latest: RwLock::new(IndexMap::new()),
            extension: Arc::new(CustomExtension::new(counters.clone())),
            counters,
            dispatcher: host.dispatcher().clone(),
            config: self.config,
            generate: self.generate,
            generator: Mutex::new(None),
        });
        Arc::new(SimulatedAdapter { core })
    }
}

struct SimulatedCore {
    descriptor: AdapterDescriptor,
    running: AtomicBool,
    values: SubscriptionManager<TagValueQueryResult>,
    events: SubscriptionManager<EventMessage>,
    changes: SubscriptionManager<ConfigurationChange>,
    values_upstream: Arc<UpstreamRecorder>,
    events_upstream: Arc<UpstreamRecorder>,
    changes_upstream: Arc<UpstreamRecorder>,
    latest: RwLock<IndexMap<String, TagValueQueryResult>>,
    extension: Arc<CustomExtension>,
    counters: Arc<CallCounters>,
    dispatcher: BackgroundDispatcher,
    config: SimulationConfig,
    generate: bool,
    generator: Mutex<Option<CancellationToken>>,
}

impl SimulatedCore {
    fn log_context(&self) -> LogContext<'_> {
        LogContext::new().with_adapter(&self.descriptor.id)
    }

    async fn publish_value(&self, value: TagValueQueryResult) -> AdapterResult<()> {
        self.latest
            .write()
            .insert(value.tag_id.to_lowercase(), value.clone());
        self.values.publish(value).await
    }

    fn snapshot(&self, tag: &str) -> TagValueQueryResult {
        self.latest
            .read()
            .get(&tag.to_lowercase())
            .cloned()
            .unwrap_or_else(|| {
                TagValueQueryResult::new(
                    tag,
                    TagValue::new(Utc::now(), serde_json::Value::Null)
                        .with_status(TagValueStatus::Bad),
                )
            })
    }

    /// Open a subscription on `manager`, add the initial topics and start its update loop.
    async fn open<T: TopicItem>(
        &self,
        manager: &SubscriptionManager<T>,
        ctx: &CallContext,
        topics: Vec<String>,
        updates: UpdateStream,
        cancel: CancellationToken,
    ) -> anyhow::Result<Subscription<T>> {
        self.counters.record_subscription();
        let subscription = manager.create_subscription(ctx);
        if !topics.is_empty() {
            subscription.handle().add_topics(topics).await?;
        }
        manager.spawn_update_loop(subscription.handle(), updates, cancel);
        ads_debug!(
            context = self.log_context().with_subscription(subscription.id().value()),
            "{} subscription opened",
            manager.name()
        );
        Ok(subscription)
    }
}

#[async_trait]
impl ReadSnapshotTagValues for SimulatedCore {
    async fn read_snapshot_tag_values(
        &self,
        _ctx: &CallContext,
        request: ReadSnapshotTagValuesRequest,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ItemStream<TagValueQueryResult>> {
        self.counters.record_read();
        let values: Vec<_> = request
            .tags
            .iter()
            .map(|tag| Ok(self.snapshot(tag)))
            .collect();
        Ok(stream::iter(values).boxed())
    }
}

#[async_trait]
impl SnapshotTagValuePush for SimulatedCore {
    async fn subscribe_snapshot_tag_values(
        &self,
        ctx: &CallContext,
        request: CreateSnapshotTagValueSubscriptionRequest,
        updates: UpdateStream,
        cancel: CancellationToken,
    ) -> anyhow::Result<Subscription<TagValueQueryResult>> {
        self.open(&self.values, ctx, request.tags, updates, cancel)
            .await
    }
}

#[async_trait]
impl EventMessagePush for SimulatedCore {
    async fn subscribe_event_messages(
        &self,
        ctx: &CallContext,
        request: CreateEventMessageSubscriptionRequest,
        updates: UpdateStream,
        cancel: CancellationToken,
    ) -> anyhow::Result<Subscription<EventMessage>> {
        self.open(&self.events, ctx, request.topics, updates, cancel)
            .await
    }
}

#[async_trait]
impl ConfigurationChanges for SimulatedCore {
    async fn subscribe_configuration_changes(
        &self,
        ctx: &CallContext,
        request: CreateConfigurationChangesSubscriptionRequest,
        updates: UpdateStream,
        cancel: CancellationToken,
    ) -> anyhow::Result<Subscription<ConfigurationChange>> {
        self.open(&self.changes, ctx, request.item_types, updates, cancel)
            .await
    }
}

/// Adapter backed by in-memory upstreams. Values are pushed by the built-in generator or
/// by tests through [`SimulatedAdapter::publish_value`].
pub struct SimulatedAdapter {
    core: Arc<SimulatedCore>,
}

impl std::fmt::Debug for SimulatedAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedAdapter")
            .field("id", &self.core.descriptor.id)
            .field("running", &self.is_running())
            .finish()
    }
}

impl SimulatedAdapter {
    /// Start configuring an adapter registered under `id`.
    pub fn builder(id: impl Into<String>) -> SimulatedAdapterBuilder {
        let id = id.into();
        SimulatedAdapterBuilder {
            name: format!("Simulated adapter {}", id),
            id,
            config: SimulationConfig::default(),
            generate: true,
            refused_topics: Vec::new(),
        }
    }

    /// Push a tag value to subscribers and remember it for snapshot reads.
    pub async fn publish_value(&self, tag: &str, value: TagValue) -> AdapterResult<()> {
        self.core
            .publish_value(TagValueQueryResult::new(tag, value))
            .await
    }

    /// Push an event message.
    pub async fn publish_event(&self, event: EventMessage) -> AdapterResult<()> {
        self.core.events.publish(event).await
    }

    /// Push a configuration change.
    pub async fn publish_configuration_change(
        &self,
        change: ConfigurationChange,
    ) -> AdapterResult<()> {
        self.core.changes.publish(change).await
    }

    /// Counters of calls that reached adapter code.
    pub fn counters(&self) -> &CallCounters {
        &self.core.counters
    }

    /// Upstream behind the tag value push feature.
    pub fn values_upstream(&self) -> &UpstreamRecorder {
        &self.core.values_upstream
    }

    /// Upstream behind the event push feature.
    pub fn events_upstream(&self) -> &UpstreamRecorder {
        &self.core.events_upstream
    }

    /// Upstream behind the configuration-change feature.
    pub fn changes_upstream(&self) -> &UpstreamRecorder {
        &self.core.changes_upstream
    }

    /// Manager multiplexing tag value subscriptions.
    pub fn value_subscriptions(&self) -> &SubscriptionManager<TagValueQueryResult> {
        &self.core.values
    }

    /// Manager multiplexing event subscriptions.
    pub fn event_subscriptions(&self) -> &SubscriptionManager<EventMessage> {
        &self.core.events
    }

    fn start_generator(&self) -> anyhow::Result<()> {
        let mut generator = TagValueGenerator::new(
            &self.core.config.tags,
            self.core.config.publish_interval,
            self.core.config.random_seed,
        )?;
        let stop = self.core.dispatcher.child_token();
        if let Some(previous) = self.core.generator.lock().replace(stop.clone()) {
            previous.cancel();
        }
        let interval = self.core.config.publish_interval;
        let core: Weak<SimulatedCore> = Arc::downgrade(&self.core);
        self.core.dispatcher.spawn(
            format!("{}-generator", self.core.descriptor.id),
            move |shutdown| async move {
                let mut ticker = tokio::time::interval(interval);
                let mut tick = 0u64;
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = stop.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    let Some(live) = core.upgrade() else { break };
                    for value in generator.next_values(tick) {
                        if !live.values_upstream.is_subscribed(&value.tag_id) {
                            continue;
                        }
                        if live.publish_value(value).await.is_err() {
                            return;
                        }
                    }
                    tick += 1;
                }
            },
        );
        Ok(())
    }
}

#[async_trait]
impl Adapter for SimulatedAdapter {
    fn descriptor(&self) -> AdapterDescriptor {
        self.core.descriptor.clone()
    }

    fn features(&self) -> FeatureSet {
        FeatureSet::new()
            .with_read_snapshot_tag_values(self.core.clone())
            .with_snapshot_tag_value_push(self.core.clone())
            .with_event_message_push(self.core.clone())
            .with_configuration_changes(self.core.clone())
            .with_extension(self.core.extension.clone())
    }

    fn is_running(&self) -> bool {
        self.core.running.load(Ordering::SeqCst)
    }

    async fn start(&self) -> anyhow::Result<()> {
        if self.core.generate {
            self.start_generator()?;
        }
        self.core.running.store(true, Ordering::SeqCst);
        ads_info!(
            context = self.core.log_context(),
            "simulated adapter started with {} tag(s)",
            self.core.config.tags.len()
        );
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.core.running.store(false, Ordering::SeqCst);
        if let Some(generator) = self.core.generator.lock().take() {
            generator.cancel();
        }
        ads_info!(context = self.core.log_context(), "simulated adapter stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use r_ads_common::SdkConfig;

    #[tokio::test]
    async fn snapshot_reads_return_the_latest_value() {
        let host = AdapterHost::builder(&SdkConfig::default()).build();
        let adapter = SimulatedAdapter::builder("sim").generate(false).build(&host);
        adapter
            .publish_value("Sensor1", TagValue::new(Utc::now(), 42))
            .await
            .unwrap();

        let ctx = CallContext::anonymous();
        let values: Vec<_> = adapter
            .core
            .read_snapshot_tag_values(
                &ctx,
                ReadSnapshotTagValuesRequest::new(["sensor1", "Unknown"]),
                CancellationToken::new(),
            )
            .await
            .unwrap()
            .map(|value| value.unwrap())
            .collect()
            .await;
        assert_eq!(values[0].value.value, serde_json::json!(42));
        assert_eq!(values[1].value.status, TagValueStatus::Bad);
        assert_eq!(adapter.counters().reads(), 1);
    }

    #[tokio::test]
    async fn generator_publishes_only_subscribed_tags() {
        let host = AdapterHost::builder(&SdkConfig::default()).build();
        let mut config = SimulationConfig::default();
        config.publish_interval = std::time::Duration::from_millis(10);
        let adapter = SimulatedAdapter::builder("sim").config(config).build(&host);
        adapter.start().await.unwrap();

        let ctx = CallContext::anonymous();
        let mut subscription = adapter
            .core
            .subscribe_snapshot_tag_values(
                &ctx,
                CreateSnapshotTagValueSubscriptionRequest {
                    tags: vec!["Sensor2".to_owned()],
                },
                stream::pending().boxed(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let value = tokio::time::timeout(std::time::Duration::from_secs(2), subscription.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(value.tag_id, "Sensor2");
        assert!(!adapter.values_upstream().is_subscribed("Sensor1"));

        adapter.stop().await.unwrap();
        host.shutdown().await;
    }
}
