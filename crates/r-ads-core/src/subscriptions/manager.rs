//! ---
//! ads_section: "02-adapter-core"
//! ads_subsection: "module"
//! ads_type: "source"
//! ads_scope: "code"
//! ads_description: "Topic reference counting, upstream subscription control and fan-out pump."
//! ads_version: "v0.0.0-prealpha"
//! ads_owner: "tbd"
//! ---
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use futures::StreamExt;
use parking_lot::RwLock;
use r_ads_common::SubscriptionConfig;
use r_ads_logging::ads_debug;
use r_ads_logging::LogContext;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, field, info_span, trace, warn};

use super::channel::{output_channel, Delivery, OutputSender};
use super::subscription::{Subscription, SubscriptionHandle, SubscriptionShared};
use super::{SubscriptionId, Topic, TopicItem, TopicSubscriptionHandler, UpdateStream};
use crate::context::CallContext;
use crate::dispatch::BackgroundDispatcher;
use crate::error::{AdapterError, AdapterResult};
use crate::metrics::SdkMetrics;

struct SubscriberEntry<T> {
    topics: HashSet<Topic>,
    output: OutputSender<T>,
    shared: Arc<SubscriptionShared>,
}

/// Reference-count table: the count of a topic is the size of its subscriber set.
struct TopicTable<T> {
    topics: HashMap<Topic, HashSet<SubscriptionId>>,
    subscribers: HashMap<SubscriptionId, SubscriberEntry<T>>,
}

impl<T> Default for TopicTable<T> {
    fn default() -> Self {
        Self {
            topics: HashMap::new(),
            subscribers: HashMap::new(),
        }
    }
}

/// Drop `id`'s interest in `topic`. Returns the topic when its count reached zero.
fn release_interest(
    topics: &mut HashMap<Topic, HashSet<SubscriptionId>>,
    id: SubscriptionId,
    topic: Topic,
) -> Option<Topic> {
    let interested = topics.get_mut(&topic)?;
    interested.remove(&id);
    if interested.is_empty() {
        topics.remove(&topic);
        return Some(topic);
    }
    None
}

enum ManagerCommand {
    Release(SubscriptionId),
}

pub(crate) struct ManagerInner<T: TopicItem> {
    name: String,
    handler: Arc<dyn TopicSubscriptionHandler>,
    options: SubscriptionConfig,
    table: RwLock<TopicTable<T>>,
    // Serialises topic operations together with their upstream calls.
    topic_ops: Mutex<()>,
    publish_tx: mpsc::Sender<T>,
    commands: mpsc::UnboundedSender<ManagerCommand>,
    dispatcher: BackgroundDispatcher,
    metrics: Option<SdkMetrics>,
}

impl<T: TopicItem> ManagerInner<T> {
    /// Run a table transition and its upstream call as one dispatcher task. Dropping the
    /// returned future does not abort the task.
    async fn detached<R, F, Fut>(
        self: &Arc<Self>,
        op: &'static str,
        id: SubscriptionId,
        run: F,
    ) -> AdapterResult<R>
    where
        R: Send + 'static,
        F: FnOnce(Arc<Self>) -> Fut,
        Fut: Future<Output = AdapterResult<R>> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let task = run(self.clone());
        self.dispatcher
            .spawn(format!("{}-{}-{}", self.name, op, id), move |_| async move {
                if done_tx.send(task.await).is_err() {
                    trace!(subscription = %id, op, "caller stopped waiting; transition completed");
                }
            });
        done_rx
            .await
            .map_err(|_| AdapterError::UpstreamFault(format!("{} {} aborted", self.name, op)))?
    }

    pub(crate) async fn add_topics(
        self: &Arc<Self>,
        id: SubscriptionId,
        topics: Vec<Topic>,
    ) -> AdapterResult<()> {
        self.detached("add", id, move |inner| async move {
            inner.apply_add(id, topics).await
        })
        .await
    }

    pub(crate) async fn remove_topics(
        self: &Arc<Self>,
        id: SubscriptionId,
        topics: Vec<Topic>,
    ) -> AdapterResult<()> {
        self.detached("remove", id, move |inner| async move {
            inner.apply_remove(id, topics).await
        })
        .await
    }

    /// Dispose a subscription: release all topics and drop its output. Runs once.
    pub(crate) async fn release(self: &Arc<Self>, shared: &Arc<SubscriptionShared>) {
        let shared = shared.clone();
        let id = shared.id;
        let outcome = self
            .detached("release", id, move |inner| async move {
                inner.release_now(&shared).await;
                Ok(())
            })
            .await;
        if let Err(err) = outcome {
            warn!(manager = %self.name, subscription = %id, error = %err, "release did not complete");
        }
    }

    async fn apply_add(&self, id: SubscriptionId, topics: Vec<Topic>) -> AdapterResult<()> {
        let _ops = self.topic_ops.lock().await;
        let (added, first) = {
            let mut guard = self.table.write();
            let table = &mut *guard;
            let entry = table
                .subscribers
                .get_mut(&id)
                .ok_or(AdapterError::SubscriptionNotFound(id))?;
            let mut added = Vec::new();
            let mut first = Vec::new();
            for topic in topics {
                if !entry.topics.insert(topic.clone()) {
                    continue;
                }
                let interested = table.topics.entry(topic.clone()).or_default();
                interested.insert(id);
                if interested.len() == 1 {
                    first.push(topic.clone());
                }
                added.push(topic);
            }
            (added, first)
        };

        if !first.is_empty() {
            if let Err(err) = self.handler.on_topics_added(&first).await {
                self.rollback(id, added);
                let err = AdapterError::classify(err);
                warn!(manager = %self.name, subscription = %id, error = %err, "upstream subscribe failed; topic additions rolled back");
                return Err(match err {
                    AdapterError::UpstreamFault(_) => err,
                    other => AdapterError::UpstreamFault(other.to_string()),
                });
            }
            if let Some(metrics) = &self.metrics {
                metrics.upstream_topics_added(first.len());
            }
        }

        debug!(
            manager = %self.name,
            subscription = %id,
            added = added.len(),
            upstream = first.len(),
            "topics added"
        );
        Ok(())
    }

    fn rollback(&self, id: SubscriptionId, added: Vec<Topic>) {
        let mut guard = self.table.write();
        let table = &mut *guard;
        if let Some(entry) = table.subscribers.get_mut(&id) {
            for topic in &added {
                entry.topics.remove(topic);
            }
        }
        for topic in added {
            release_interest(&mut table.topics, id, topic);
        }
    }

    async fn apply_remove(&self, id: SubscriptionId, topics: Vec<Topic>) -> AdapterResult<()> {
        let _ops = self.topic_ops.lock().await;
        let released = {
            let mut guard = self.table.write();
            let table = &mut *guard;
            let entry = table
                .subscribers
                .get_mut(&id)
                .ok_or(AdapterError::SubscriptionNotFound(id))?;
            let mut released = Vec::new();
            for topic in topics {
                if entry.topics.remove(&topic) {
                    released.extend(release_interest(&mut table.topics, id, topic));
                }
            }
            released
        };
        debug!(manager = %self.name, subscription = %id, upstream = released.len(), "topics removed");
        self.notify_released(released).await;
        Ok(())
    }

    async fn notify_released(&self, released: Vec<Topic>) {
        if released.is_empty() {
            return;
        }
        if let Some(metrics) = &self.metrics {
            metrics.upstream_topics_removed(released.len());
        }
        // Counts are already zero; the topics are gone whatever the adapter answers.
        if let Err(err) = self.handler.on_topics_removed(&released).await {
            warn!(manager = %self.name, topics = released.len(), error = %err, "upstream unsubscribe failed");
        }
    }

    pub(crate) async fn release_now(&self, shared: &Arc<SubscriptionShared>) {
        if !shared.claim_release() {
            return;
        }
        let id = shared.id;
        let _ops = self.topic_ops.lock().await;
        let released = {
            let mut guard = self.table.write();
            let table = &mut *guard;
            match table.subscribers.remove(&id) {
                Some(entry) => {
                    let mut released = Vec::new();
                    for topic in entry.topics {
                        released.extend(release_interest(&mut table.topics, id, topic));
                    }
                    released
                }
                None => Vec::new(),
            }
        };
        self.notify_released(released).await;
        shared.mark_disposed();
        shared.close_span();
        if let Some(metrics) = &self.metrics {
            metrics.subscription_closed();
        }
        let context = LogContext::new().with_subscription(id.value());
        let context = match shared.connection_id.as_deref() {
            Some(connection) => context.with_connection(connection),
            None => context,
        };
        ads_debug!(context = context, "subscription {} disposed by {}", id, self.name);
    }

    /// Queue a release on the fan-out pump. Returns `false` once the pump has stopped.
    pub(crate) fn request_release(&self, id: SubscriptionId) -> bool {
        if self.commands.send(ManagerCommand::Release(id)).is_err() {
            trace!(manager = %self.name, subscription = %id, "release requested after pump stopped");
            return false;
        }
        true
    }

    pub(crate) fn record_lag(&self, id: SubscriptionId, skipped: u64) {
        debug!(manager = %self.name, subscription = %id, skipped, "subscriber lagged; oldest items dropped");
        if let Some(metrics) = &self.metrics {
            metrics.observe_dropped(skipped);
        }
    }

    pub(crate) fn subscription_topics(&self, id: SubscriptionId) -> Vec<Topic> {
        self.table
            .read()
            .subscribers
            .get(&id)
            .map(|entry| entry.topics.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn fan_out(&self, item: T) {
        let topic = Topic::new(item.topic());
        let mut delivered = 0usize;
        let mut dropped = 0u64;
        {
            let table = self.table.read();
            let Some(interested) = table.topics.get(&topic) else {
                trace!(manager = %self.name, topic = %topic, "no subscribers for item");
                return;
            };
            for id in interested {
                let Some(entry) = table.subscribers.get(id) else {
                    continue;
                };
                match entry.output.deliver(item.clone()) {
                    Delivery::Delivered => delivered += 1,
                    Delivery::Dropped => dropped += 1,
                    Delivery::Closed => {}
                }
            }
        }
        trace!(manager = %self.name, topic = %topic, delivered, "item fanned out");
        if dropped > 0 {
            debug!(manager = %self.name, topic = %topic, dropped, "subscriber queues full; newest item dropped");
            if let Some(metrics) = &self.metrics {
                metrics.observe_dropped(dropped);
            }
        }
    }
}

fn handle_command<T: TopicItem>(inner: &Arc<ManagerInner<T>>, command: ManagerCommand) {
    match command {
        ManagerCommand::Release(id) => {
            let shared = inner
                .table
                .read()
                .subscribers
                .get(&id)
                .map(|entry| entry.shared.clone());
            if let Some(shared) = shared {
                let owner = inner.clone();
                inner
                    .dispatcher
                    .spawn(format!("{}-release-{}", inner.name, id), move |_| async move {
                        owner.release_now(&shared).await;
                    });
            }
        }
    }
}

async fn run_pump<T: TopicItem>(
    inner: Weak<ManagerInner<T>>,
    mut publish_rx: mpsc::Receiver<T>,
    mut commands: mpsc::UnboundedReceiver<ManagerCommand>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            Some(command) = commands.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                handle_command(&inner, command);
            }
            item = publish_rx.recv() => match item {
                Some(item) => {
                    let Some(inner) = inner.upgrade() else { break };
                    inner.fan_out(item);
                }
                None => break,
            },
        }
    }
    trace!("fan-out pump stopped");
}

async fn run_update_loop<T: TopicItem>(
    handle: SubscriptionHandle<T>,
    mut updates: UpdateStream,
    cancel: CancellationToken,
    shutdown: CancellationToken,
) {
    let closed = handle.closed_token();
    let mut updates_open = true;
    loop {
        tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            _ = cancel.cancelled() => {
                handle.cancel().await;
                break;
            }
            _ = shutdown.cancelled() => {
                handle.cancel().await;
                break;
            }
            update = updates.next(), if updates_open => match update {
                Some(update) => match handle.apply_update(update).await {
                    Ok(()) => {}
                    Err(AdapterError::SubscriptionNotFound(_)) => break,
                    Err(err) => {
                        warn!(subscription = %handle.id(), error = %err, "topic update failed; faulting subscription");
                        handle.fault(err).await;
                        break;
                    }
                },
                // The caller stopped writing updates; the subscription stays live.
                None => updates_open = false,
            },
        }
    }
}

/// Builder for [`SubscriptionManager`].
pub struct SubscriptionManagerBuilder<T> {
    name: String,
    handler: Arc<dyn TopicSubscriptionHandler>,
    options: SubscriptionConfig,
    metrics: Option<SdkMetrics>,
    _item: PhantomData<fn() -> T>,
}

impl<T: TopicItem> SubscriptionManagerBuilder<T> {
    /// Override channel capacities and the overflow policy.
    pub fn options(mut self, options: SubscriptionConfig) -> Self {
        self.options = options;
        self
    }

    /// Report subscriptions, upstream topics and drops to `metrics`.
    pub fn metrics(mut self, metrics: Option<SdkMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Build the manager and start its fan-out pump on `dispatcher`.
    pub fn build(self, dispatcher: &BackgroundDispatcher) -> SubscriptionManager<T> {
        let (publish_tx, publish_rx) = mpsc::channel(self.options.publish_capacity.max(1));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ManagerInner {
            name: self.name,
            handler: self.handler,
            options: self.options,
            table: RwLock::new(TopicTable::default()),
            topic_ops: Mutex::new(()),
            publish_tx,
            commands: command_tx,
            dispatcher: dispatcher.clone(),
            metrics: self.metrics,
        });
        let weak = Arc::downgrade(&inner);
        dispatcher.spawn(format!("{}-fanout", inner.name), move |shutdown| {
            run_pump(weak, publish_rx, command_rx, shutdown)
        });
        SubscriptionManager { inner }
    }
}

/// Shared upstream subscriptions of one push feature, fanned out to many subscribers.
pub struct SubscriptionManager<T: TopicItem> {
    inner: Arc<ManagerInner<T>>,
}

impl<T: TopicItem> Clone for SubscriptionManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: TopicItem> std::fmt::Debug for SubscriptionManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("name", &self.inner.name)
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

impl<T: TopicItem> SubscriptionManager<T> {
    /// Start building a manager whose upstream calls go to `handler`.
    pub fn builder(
        name: impl Into<String>,
        handler: Arc<dyn TopicSubscriptionHandler>,
    ) -> SubscriptionManagerBuilder<T> {
        SubscriptionManagerBuilder {
            name: name.into(),
            handler,
            options: SubscriptionConfig::default(),
            metrics: None,
            _item: PhantomData,
        }
    }

    /// Manager name used in logs and task names.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Register a subscription with no topics.
    pub fn create_subscription(&self, ctx: &CallContext) -> Subscription<T> {
        let id = SubscriptionId::next();
        let span = info_span!(
            "push_subscription",
            manager = %self.inner.name,
            subscription = %id,
            connection = ctx.connection_id().unwrap_or(""),
            items = field::Empty,
        );
        let shared = Arc::new(SubscriptionShared::new(
            id,
            ctx.connection_id().map(str::to_owned),
            span,
        ));
        let (output, receiver) =
            output_channel(self.inner.options.overflow, self.inner.options.channel_capacity);
        self.inner.table.write().subscribers.insert(
            id,
            SubscriberEntry {
                topics: HashSet::new(),
                output,
                shared: shared.clone(),
            },
        );
        if let Some(metrics) = &self.inner.metrics {
            metrics.subscription_opened();
        }
        debug!(manager = %self.inner.name, subscription = %id, connection = ?ctx.connection_id(), "subscription created");
        Subscription::new(SubscriptionHandle::new(self.inner.clone(), shared), receiver)
    }

    /// Consume `updates` for the subscription's lifetime.
    ///
    /// The loop ends when the subscription is disposed. Cancelling `cancel` (or shutting
    /// the dispatcher down) cancels the subscription. A failed topic update faults it.
    pub fn spawn_update_loop(
        &self,
        handle: SubscriptionHandle<T>,
        updates: UpdateStream,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let name = format!("{}-updates-{}", self.inner.name, handle.id());
        self.inner.dispatcher.spawn(name, move |shutdown| {
            run_update_loop(handle, updates, cancel, shutdown)
        })
    }

    /// Publish an upstream item, waiting while the publish channel is full.
    pub async fn publish(&self, item: T) -> AdapterResult<()> {
        self.inner
            .publish_tx
            .send(item)
            .await
            .map_err(|_| AdapterError::UpstreamFault(format!("{} fan-out stopped", self.inner.name)))
    }

    /// Publish without waiting. Returns `false` when the item was not accepted.
    pub fn try_publish(&self, item: T) -> bool {
        self.inner.publish_tx.try_send(item).is_ok()
    }

    /// Number of subscribers interested in `topic`.
    pub fn topic_ref_count(&self, topic: &str) -> usize {
        self.inner
            .table
            .read()
            .topics
            .get(&Topic::new(topic))
            .map(HashSet::len)
            .unwrap_or(0)
    }

    /// Topics currently held upstream.
    pub fn topics(&self) -> Vec<Topic> {
        self.inner.table.read().topics.keys().cloned().collect()
    }

    /// Live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.table.read().subscribers.len()
    }

    /// Whether the subscription is still registered.
    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.inner.table.read().subscribers.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriptions::{SubscriptionState, SubscriptionUpdate};
    use async_trait::async_trait;
    use futures::stream;
    use r_ads_common::OverflowPolicy;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct Sample {
        tag: String,
        value: i64,
    }

    impl Sample {
        fn new(tag: &str, value: i64) -> Self {
            Self {
                tag: tag.to_owned(),
                value,
            }
        }
    }

    impl TopicItem for Sample {
        fn topic(&self) -> &str {
            &self.tag
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        added: parking_lot::Mutex<Vec<String>>,
        removed: parking_lot::Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl TopicSubscriptionHandler for RecordingHandler {
        async fn on_topics_added(&self, topics: &[Topic]) -> anyhow::Result<()> {
            if let Some(fail_on) = &self.fail_on {
                if topics.iter().any(|t| t.as_str() == fail_on) {
                    anyhow::bail!("device rejected {}", fail_on);
                }
            }
            self.added
                .lock()
                .extend(topics.iter().map(|t| t.as_str().to_owned()));
            Ok(())
        }

        async fn on_topics_removed(&self, topics: &[Topic]) -> anyhow::Result<()> {
            self.removed
                .lock()
                .extend(topics.iter().map(|t| t.as_str().to_owned()));
            Ok(())
        }
    }

    fn manager(
        handler: Arc<RecordingHandler>,
        dispatcher: &BackgroundDispatcher,
    ) -> SubscriptionManager<Sample> {
        SubscriptionManager::builder("samples", handler).build(dispatcher)
    }

    async fn next_value(subscription: &mut Subscription<Sample>) -> Sample {
        tokio::time::timeout(Duration::from_secs(2), subscription.next())
            .await
            .expect("item within timeout")
            .expect("subscription open")
            .expect("item is not a fault")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shared_topic_subscribes_upstream_once() {
        let dispatcher = BackgroundDispatcher::new();
        let handler = Arc::new(RecordingHandler::default());
        let manager = manager(handler.clone(), &dispatcher);
        let ctx = CallContext::anonymous();

        let mut a = manager.create_subscription(&ctx);
        let mut b = manager.create_subscription(&ctx);
        a.handle().add_topics(["Sensor1"]).await.unwrap();
        b.handle().add_topics(["sensor1"]).await.unwrap();
        assert_eq!(*handler.added.lock(), vec!["Sensor1".to_owned()]);
        assert_eq!(manager.topic_ref_count("SENSOR1"), 2);
        assert_eq!(a.state(), SubscriptionState::Active);

        manager.publish(Sample::new("SENSOR1", 42)).await.unwrap();
        assert_eq!(next_value(&mut a).await.value, 42);
        assert_eq!(next_value(&mut b).await.value, 42);

        a.handle().dispose().await;
        assert!(handler.removed.lock().is_empty());
        b.handle().remove_topics(["Sensor1"]).await.unwrap();
        assert_eq!(*handler.removed.lock(), vec!["Sensor1".to_owned()]);
        assert!(manager.topics().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disposing_one_subscriber_keeps_the_other_flowing() {
        let dispatcher = BackgroundDispatcher::new();
        let handler = Arc::new(RecordingHandler::default());
        let manager = manager(handler.clone(), &dispatcher);
        let ctx = CallContext::anonymous();

        let mut a = manager.create_subscription(&ctx);
        let mut b = manager.create_subscription(&ctx);
        a.handle().add_topics(["Pump1"]).await.unwrap();
        b.handle().add_topics(["Pump1"]).await.unwrap();

        a.handle().dispose().await;
        a.handle().dispose().await;
        assert!(a.next().await.is_none());
        assert_eq!(a.state(), SubscriptionState::Disposed);

        manager.publish(Sample::new("Pump1", 7)).await.unwrap();
        assert_eq!(next_value(&mut b).await.value, 7);
        assert_eq!(manager.topic_ref_count("Pump1"), 1);
        assert!(handler.removed.lock().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_upstream_subscribe_rolls_back() {
        let dispatcher = BackgroundDispatcher::new();
        let handler = Arc::new(RecordingHandler {
            fail_on: Some("Broken".into()),
            ..Default::default()
        });
        let manager = manager(handler.clone(), &dispatcher);
        let subscription = manager.create_subscription(&CallContext::anonymous());

        let err = subscription
            .handle()
            .add_topics(["Good", "Broken"])
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::UpstreamFault(_)));
        assert_eq!(manager.topic_ref_count("Good"), 0);
        assert_eq!(manager.topic_ref_count("Broken"), 0);
        assert!(subscription.handle().topics().is_empty());

        subscription.handle().add_topics(["Good"]).await.unwrap();
        assert_eq!(manager.topic_ref_count("Good"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fault_is_delivered_once_and_manager_stays_usable() {
        let dispatcher = BackgroundDispatcher::new();
        let handler = Arc::new(RecordingHandler::default());
        let manager = manager(handler.clone(), &dispatcher);
        let ctx = CallContext::anonymous();

        let mut faulty = manager.create_subscription(&ctx);
        faulty.handle().add_topics(["Valve"]).await.unwrap();
        faulty
            .handle()
            .fault(AdapterError::upstream("device offline"))
            .await;
        assert!(matches!(
            faulty.next().await,
            Some(Err(AdapterError::UpstreamFault(_)))
        ));
        assert!(faulty.next().await.is_none());
        assert_eq!(*handler.removed.lock(), vec!["Valve".to_owned()]);

        let mut healthy = manager.create_subscription(&ctx);
        healthy.handle().add_topics(["Valve"]).await.unwrap();
        manager.publish(Sample::new("Valve", 1)).await.unwrap();
        assert_eq!(next_value(&mut healthy).await.value, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropping_the_receiver_releases_topics() {
        let dispatcher = BackgroundDispatcher::new();
        let handler = Arc::new(RecordingHandler::default());
        let manager = manager(handler.clone(), &dispatcher);
        let subscription = manager.create_subscription(&CallContext::anonymous());
        subscription.handle().add_topics(["Meter"]).await.unwrap();
        let closed = subscription.handle().closed_token();
        drop(subscription);

        tokio::time::timeout(Duration::from_secs(2), closed.cancelled())
            .await
            .expect("released after drop");
        assert_eq!(manager.subscription_count(), 0);
        assert_eq!(*handler.removed.lock(), vec!["Meter".to_owned()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn update_loop_applies_changes_and_cancels() {
        let dispatcher = BackgroundDispatcher::new();
        let handler = Arc::new(RecordingHandler::default());
        let manager = manager(handler.clone(), &dispatcher);
        let mut subscription = manager.create_subscription(&CallContext::anonymous());
        let (tx, rx) = mpsc::unbounded_channel();
        let updates = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|update| (update, rx))
        })
        .boxed();
        let cancel = CancellationToken::new();
        manager.spawn_update_loop(subscription.handle(), updates, cancel.clone());

        tx.send(SubscriptionUpdate::Add(vec!["A".into(), "B".into()]))
            .unwrap();
        tx.send(SubscriptionUpdate::Remove(vec!["A".into()])).unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while manager.topic_ref_count("A") != 0 || manager.topic_ref_count("B") != 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("updates applied");
        assert_eq!(*handler.removed.lock(), vec!["A".to_owned()]);

        manager.publish(Sample::new("A", 0)).await.unwrap();
        manager.publish(Sample::new("B", 2)).await.unwrap();
        let received = next_value(&mut subscription).await;
        assert_eq!(received, Sample::new("B", 2));

        cancel.cancel();
        let end = tokio::time::timeout(Duration::from_secs(2), subscription.next())
            .await
            .expect("cancellation ends the subscription");
        assert!(end.is_none());
        assert_eq!(subscription.state(), SubscriptionState::Disposed);
        assert_eq!(manager.topic_ref_count("B"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn drop_newest_policy_counts_overflow() {
        let dispatcher = BackgroundDispatcher::new();
        let handler = Arc::new(RecordingHandler::default());
        let registry = prometheus::Registry::new();
        let metrics = SdkMetrics::register(&registry).unwrap();
        let manager: SubscriptionManager<Sample> = SubscriptionManager::builder("bounded", handler)
            .options(SubscriptionConfig {
                channel_capacity: 1,
                publish_capacity: 8,
                overflow: OverflowPolicy::DropNewest,
            })
            .metrics(Some(metrics))
            .build(&dispatcher);
        let mut subscription = manager.create_subscription(&CallContext::anonymous());
        subscription.handle().add_topics(["T"]).await.unwrap();

        for value in 0..3 {
            manager.publish(Sample::new("T", value)).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let dropped = registry
                    .gather()
                    .into_iter()
                    .find(|f| f.get_name() == "ads_dropped_items_total")
                    .map(|f| f.get_metric()[0].get_counter().get_value())
                    .unwrap_or_default();
                if dropped >= 2.0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("overflow recorded");
        assert_eq!(next_value(&mut subscription).await.value, 0);
    }

    struct SlowHandler {
        delay: Duration,
        added: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TopicSubscriptionHandler for SlowHandler {
        async fn on_topics_added(&self, topics: &[Topic]) -> anyhow::Result<()> {
            tokio::time::sleep(self.delay).await;
            self.added
                .lock()
                .extend(topics.iter().map(|t| t.as_str().to_owned()));
            Ok(())
        }

        async fn on_topics_removed(&self, _topics: &[Topic]) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandoned_topic_add_still_subscribes_upstream() {
        let dispatcher = BackgroundDispatcher::new();
        let handler = Arc::new(SlowHandler {
            delay: Duration::from_millis(200),
            added: Default::default(),
        });
        let manager: SubscriptionManager<Sample> =
            SubscriptionManager::builder("slow", handler.clone()).build(&dispatcher);
        let ctx = CallContext::anonymous();
        let a = manager.create_subscription(&ctx);
        let b = manager.create_subscription(&ctx);

        let first =
            tokio::time::timeout(Duration::from_millis(20), a.handle().add_topics(["X"])).await;
        assert!(first.is_err());

        b.handle().add_topics(["X"]).await.unwrap();
        assert_eq!(*handler.added.lock(), vec!["X".to_owned()]);
        assert_eq!(manager.topic_ref_count("X"), 2);
        assert_eq!(a.handle().topics().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_receiver_is_released_after_dispatcher_shutdown() {
        let dispatcher = BackgroundDispatcher::new();
        let handler = Arc::new(RecordingHandler::default());
        let manager = manager(handler.clone(), &dispatcher);
        let subscription = manager.create_subscription(&CallContext::anonymous());
        subscription.handle().add_topics(["Y"]).await.unwrap();
        let closed = subscription.handle().closed_token();

        dispatcher.shutdown().await;
        drop(subscription);

        tokio::time::timeout(Duration::from_secs(2), closed.cancelled())
            .await
            .expect("released without the pump");
        assert_eq!(manager.subscription_count(), 0);
        assert_eq!(manager.topic_ref_count("Y"), 0);
        assert_eq!(*handler.removed.lock(), vec!["Y".to_owned()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delivered_items_are_counted_per_subscription() {
        let dispatcher = BackgroundDispatcher::new();
        let handler = Arc::new(RecordingHandler::default());
        let manager = manager(handler, &dispatcher);
        let mut subscription = manager.create_subscription(&CallContext::anonymous());
        let handle = subscription.handle();
        handle.add_topics(["Flow"]).await.unwrap();

        manager.publish(Sample::new("Flow", 1)).await.unwrap();
        manager.publish(Sample::new("Flow", 2)).await.unwrap();
        next_value(&mut subscription).await;
        next_value(&mut subscription).await;
        assert_eq!(handle.delivered(), 2);

        handle.dispose().await;
        assert!(handle.is_disposed());
        assert!(subscription.next().await.is_none());
        assert_eq!(handle.delivered(), 2);
    }
}
