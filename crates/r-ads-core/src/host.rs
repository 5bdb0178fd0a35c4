//! ---
//! ads_section: "02-adapter-core"
//! ads_subsection: "module"
//! ads_type: "source"
//! ads_scope: "code"
//! ads_description: "In-process host binding callers to registered adapters."
//! ads_version: "v0.0.0-prealpha"
//! ads_owner: "tbd"
//! ---
//! In-process binding of the SDK.
//!
//! [`AdapterHost`] is what a transport layer calls into: every method resolves the
//! adapter and feature, checks authorization, and runs the adapter through a
//! [`FeatureCall`]. Push subscriptions opened by a caller with a connection id are
//! tracked so [`AdapterHost::disconnect`] can release them.
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use r_ads_common::SdkConfig;
use r_ads_logging::{ads_warn, log_system_event, LogContext, SystemEventOutcome};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::adapter::{Adapter, AdapterDescriptor, AdapterDescriptorExtended};
use crate::context::CallContext;
use crate::dispatch::BackgroundDispatcher;
use crate::error::{AdapterError, AdapterResult};
use crate::extensions::{
    ExtensionEngine, InvocationInput, InvocationResponse, OperationDescriptor, OperationUri,
};
use crate::features::{
    ConfigurationChanges, EventMessagePush, FeatureDescriptor, ReadSnapshotTagValues,
    SnapshotTagValuePush, StandardFeature,
};
use crate::metrics::{SdkMetrics, UNRESOLVED_FEATURE};
use crate::model::{
    ConfigurationChange, CreateConfigurationChangesSubscriptionRequest,
    CreateEventMessageSubscriptionRequest, CreateSnapshotTagValueSubscriptionRequest, EventMessage,
    ReadSnapshotTagValuesRequest, TagValueQueryResult,
};
use crate::registry::{AdapterRegistry, FeatureAuthorizer, RoleFeatureAuthorizer};
use crate::subscriptions::{
    Subscription, SubscriptionHandle, SubscriptionManager, SubscriptionManagerBuilder, TopicItem,
    TopicSubscriptionHandler, UpdateStream,
};
use crate::tracker::{ConnectionSubscriptionTracker, TrackedSubscription};
use crate::wrapper::{FeatureCall, FeatureStream};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Builder for [`AdapterHost`].
pub struct AdapterHostBuilder {
    config: SdkConfig,
    registry: Option<Arc<AdapterRegistry>>,
    authorizer: Option<Arc<dyn FeatureAuthorizer>>,
    dispatcher: Option<BackgroundDispatcher>,
    tracker: Option<Arc<ConnectionSubscriptionTracker>>,
    metrics: Option<SdkMetrics>,
}

impl AdapterHostBuilder {
    /// Start from a loaded configuration.
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            config: config.clone(),
            registry: None,
            authorizer: None,
            dispatcher: None,
            tracker: None,
            metrics: None,
        }
    }

    /// Share an existing registry.
    pub fn with_registry(mut self, registry: Arc<AdapterRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Replace the role-based authorizer built from `[authorization]`.
    pub fn with_authorizer(mut self, authorizer: Arc<dyn FeatureAuthorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Share an existing dispatcher.
    pub fn with_dispatcher(mut self, dispatcher: BackgroundDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Share an existing connection tracker.
    pub fn with_tracker(mut self, tracker: Arc<ConnectionSubscriptionTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Export metrics. Ignored when `[metrics] enabled = false`.
    pub fn with_metrics(mut self, metrics: SdkMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Assemble the host.
    pub fn build(self) -> AdapterHost {
        let authorizer = self.authorizer.unwrap_or_else(|| {
            Arc::new(RoleFeatureAuthorizer::from_config(&self.config.authorization))
        });
        let metrics = self.metrics.filter(|_| self.config.metrics.enabled);
        AdapterHost {
            registry: self.registry.unwrap_or_default(),
            authorizer,
            dispatcher: self.dispatcher.unwrap_or_default(),
            tracker: self.tracker.unwrap_or_default(),
            metrics,
            config: Arc::new(self.config),
        }
    }
}

/// Caller-facing entry point of the SDK.
#[derive(Clone)]
pub struct AdapterHost {
    registry: Arc<AdapterRegistry>,
    authorizer: Arc<dyn FeatureAuthorizer>,
    dispatcher: BackgroundDispatcher,
    tracker: Arc<ConnectionSubscriptionTracker>,
    metrics: Option<SdkMetrics>,
    config: Arc<SdkConfig>,
}

impl std::fmt::Debug for AdapterHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterHost")
            .field("registry", &self.registry)
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}

impl AdapterHost {
    /// Builder seeded with `config`.
    pub fn builder(config: &SdkConfig) -> AdapterHostBuilder {
        AdapterHostBuilder::new(config)
    }

    /// Adapter registry.
    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    /// Background dispatcher shared with adapters.
    pub fn dispatcher(&self) -> &BackgroundDispatcher {
        &self.dispatcher
    }

    /// Connection tracker.
    pub fn tracker(&self) -> &Arc<ConnectionSubscriptionTracker> {
        &self.tracker
    }

    /// Metrics, when enabled.
    pub fn metrics(&self) -> Option<&SdkMetrics> {
        self.metrics.as_ref()
    }

    /// Configuration the host was built from.
    pub fn config(&self) -> &SdkConfig {
        &self.config
    }

    /// Subscription manager wired to this host's dispatcher, metrics and
    /// `[subscriptions]` settings.
    pub fn subscription_manager<T: TopicItem>(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn TopicSubscriptionHandler>,
    ) -> SubscriptionManager<T> {
        self.subscription_manager_builder(name, handler)
            .build(&self.dispatcher)
    }

    /// Like [`AdapterHost::subscription_manager`] but leaves the builder open.
    pub fn subscription_manager_builder<T: TopicItem>(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn TopicSubscriptionHandler>,
    ) -> SubscriptionManagerBuilder<T> {
        SubscriptionManager::builder(name, handler)
            .options(self.config.subscriptions.clone())
            .metrics(self.metrics.clone())
    }

    /// Register an adapter.
    pub fn register(&self, adapter: Arc<dyn Adapter>) -> anyhow::Result<()> {
        self.registry.register(adapter)
    }

    /// Start every registered adapter that is not running yet.
    pub async fn start_all(&self) -> anyhow::Result<()> {
        for adapter in self.registry.adapters() {
            if adapter.is_running() {
                continue;
            }
            let id = adapter.id();
            let context = LogContext::new().with_adapter(&id);
            match adapter.start().await {
                Ok(()) => log_system_event(
                    Some(&context),
                    "adapter_start",
                    "adapter started",
                    SystemEventOutcome::Success,
                ),
                Err(err) => {
                    log_system_event(
                        Some(&context),
                        "adapter_start",
                        &format!("{:#}", err),
                        SystemEventOutcome::Fault,
                    );
                    return Err(err).with_context(|| format!("starting adapter '{}'", id));
                }
            }
        }
        Ok(())
    }

    /// Descriptors of every registered adapter.
    pub fn list_adapters(&self) -> Vec<AdapterDescriptor> {
        self.registry
            .adapters()
            .iter()
            .map(|adapter| adapter.descriptor())
            .collect()
    }

    /// Adapter descriptor plus the descriptors of its features.
    pub fn describe_adapter(
        &self,
        _ctx: &CallContext,
        adapter_id: &str,
    ) -> AdapterResult<AdapterDescriptorExtended> {
        self.registry
            .get(adapter_id)
            .map(|adapter| adapter.describe())
            .ok_or_else(|| AdapterError::AdapterNotFound(adapter_id.to_owned()))
    }

    /// Resolve a standard feature for `ctx`, applying every check before adapter code runs.
    pub async fn resolve_feature<F>(
        &self,
        ctx: &CallContext,
        adapter_id: &str,
    ) -> AdapterResult<FeatureCall<F>>
    where
        F: StandardFeature + ?Sized,
    {
        let resolution = self
            .registry
            .resolve::<F>(ctx, adapter_id, self.authorizer.as_ref())
            .await;
        let resolved = resolution
            .into_result()
            .map_err(|error| self.rejected(ctx, adapter_id, F::URI, error))?;
        Ok(self.wrap(adapter_id, resolved.descriptor, resolved.feature))
    }

    /// Resolve an extension feature by URI.
    pub async fn resolve_extension(
        &self,
        ctx: &CallContext,
        adapter_id: &str,
        feature_uri: &str,
    ) -> AdapterResult<ExtensionEngine> {
        let resolution = self
            .registry
            .resolve_extension(ctx, adapter_id, feature_uri, self.authorizer.as_ref())
            .await;
        // Caller-supplied URIs only become metric labels once they name a registered feature.
        let label = resolution
            .feature
            .as_ref()
            .map(|(_, descriptor)| descriptor.uri.clone());
        let resolved = resolution.into_result().map_err(|error| {
            self.rejected(
                ctx,
                adapter_id,
                label.as_deref().unwrap_or(UNRESOLVED_FEATURE),
                error,
            )
        })?;
        Ok(ExtensionEngine::new(self.wrap(
            adapter_id,
            resolved.descriptor,
            resolved.feature,
        )))
    }

    /// Read the current value of tags.
    pub async fn read_snapshot_tag_values(
        &self,
        ctx: &CallContext,
        adapter_id: &str,
        request: ReadSnapshotTagValuesRequest,
        cancel: CancellationToken,
    ) -> AdapterResult<FeatureStream<TagValueQueryResult>> {
        let call = self
            .resolve_feature::<dyn ReadSnapshotTagValues>(ctx, adapter_id)
            .await?;
        call.stream(ctx, request, cancel, |feature, ctx, request, cancel| async move {
            feature.read_snapshot_tag_values(&ctx, request, cancel).await
        })
        .await
    }

    /// Subscribe to tag value changes.
    pub async fn subscribe_snapshot_tag_values(
        &self,
        ctx: &CallContext,
        adapter_id: &str,
        request: CreateSnapshotTagValueSubscriptionRequest,
        updates: UpdateStream,
        cancel: CancellationToken,
    ) -> AdapterResult<Subscription<TagValueQueryResult>> {
        let call = self
            .resolve_feature::<dyn SnapshotTagValuePush>(ctx, adapter_id)
            .await?;
        let subscription = call
            .subscribe(ctx, request, cancel, |feature, ctx, request, cancel| async move {
                feature
                    .subscribe_snapshot_tag_values(&ctx, request, updates, cancel)
                    .await
            })
            .await?;
        self.track(ctx, subscription.handle());
        Ok(subscription)
    }

    /// Subscribe to event messages.
    pub async fn subscribe_event_messages(
        &self,
        ctx: &CallContext,
        adapter_id: &str,
        request: CreateEventMessageSubscriptionRequest,
        updates: UpdateStream,
        cancel: CancellationToken,
    ) -> AdapterResult<Subscription<EventMessage>> {
        let call = self
            .resolve_feature::<dyn EventMessagePush>(ctx, adapter_id)
            .await?;
        let subscription = call
            .subscribe(ctx, request, cancel, |feature, ctx, request, cancel| async move {
                feature
                    .subscribe_event_messages(&ctx, request, updates, cancel)
                    .await
            })
            .await?;
        self.track(ctx, subscription.handle());
        Ok(subscription)
    }

    /// Subscribe to configuration changes.
    pub async fn subscribe_configuration_changes(
        &self,
        ctx: &CallContext,
        adapter_id: &str,
        request: CreateConfigurationChangesSubscriptionRequest,
        updates: UpdateStream,
        cancel: CancellationToken,
    ) -> AdapterResult<Subscription<ConfigurationChange>> {
        let call = self
            .resolve_feature::<dyn ConfigurationChanges>(ctx, adapter_id)
            .await?;
        let subscription = call
            .subscribe(ctx, request, cancel, |feature, ctx, request, cancel| async move {
                feature
                    .subscribe_configuration_changes(&ctx, request, updates, cancel)
                    .await
            })
            .await?;
        self.track(ctx, subscription.handle());
        Ok(subscription)
    }

    /// Descriptor of an extension feature.
    pub async fn get_extension_descriptor(
        &self,
        ctx: &CallContext,
        adapter_id: &str,
        feature_uri: &str,
        cancel: CancellationToken,
    ) -> AdapterResult<FeatureDescriptor> {
        self.resolve_extension(ctx, adapter_id, feature_uri)
            .await?
            .descriptor(ctx, cancel)
            .await
    }

    /// Operations of an extension feature.
    pub async fn get_extension_operations(
        &self,
        ctx: &CallContext,
        adapter_id: &str,
        feature_uri: &str,
        cancel: CancellationToken,
    ) -> AdapterResult<Vec<OperationDescriptor>> {
        self.resolve_extension(ctx, adapter_id, feature_uri)
            .await?
            .operations(ctx, cancel)
            .await
    }

    /// Run a unary extension operation.
    pub async fn invoke_extension(
        &self,
        ctx: &CallContext,
        adapter_id: &str,
        operation_uri: &str,
        arguments: Value,
        cancel: CancellationToken,
    ) -> AdapterResult<InvocationResponse> {
        let operation = OperationUri::parse(operation_uri)?;
        let mut engine = self
            .resolve_extension(ctx, adapter_id, operation.feature_uri())
            .await?;
        engine.invoke(ctx, &operation, arguments, cancel).await
    }

    /// Run a server-stream extension operation.
    pub async fn stream_extension(
        &self,
        ctx: &CallContext,
        adapter_id: &str,
        operation_uri: &str,
        arguments: Value,
        cancel: CancellationToken,
    ) -> AdapterResult<FeatureStream<InvocationResponse>> {
        let operation = OperationUri::parse(operation_uri)?;
        let mut engine = self
            .resolve_extension(ctx, adapter_id, operation.feature_uri())
            .await?;
        let stream = engine.stream(ctx, &operation, arguments, cancel).await?;
        self.track_stream(ctx, &stream);
        Ok(stream)
    }

    /// Run a client-stream extension operation.
    pub async fn client_stream_extension(
        &self,
        ctx: &CallContext,
        adapter_id: &str,
        operation_uri: &str,
        input: InvocationInput,
        cancel: CancellationToken,
    ) -> AdapterResult<InvocationResponse> {
        let operation = OperationUri::parse(operation_uri)?;
        let mut engine = self
            .resolve_extension(ctx, adapter_id, operation.feature_uri())
            .await?;
        engine.client_stream(ctx, &operation, input, cancel).await
    }

    /// Run a duplex extension operation.
    pub async fn duplex_extension(
        &self,
        ctx: &CallContext,
        adapter_id: &str,
        operation_uri: &str,
        input: InvocationInput,
        cancel: CancellationToken,
    ) -> AdapterResult<FeatureStream<InvocationResponse>> {
        let operation = OperationUri::parse(operation_uri)?;
        let mut engine = self
            .resolve_extension(ctx, adapter_id, operation.feature_uri())
            .await?;
        let stream = engine.duplex(ctx, &operation, input, cancel).await?;
        self.track_stream(ctx, &stream);
        Ok(stream)
    }

    /// Release everything a terminating connection still holds.
    pub async fn disconnect(&self, connection_id: &str) -> usize {
        self.tracker.remove_all_subscriptions(connection_id).await
    }

    /// Stop adapters and background tasks.
    pub async fn shutdown(&self) {
        for adapter in self.registry.adapters() {
            if !adapter.is_running() {
                continue;
            }
            let id = adapter.id();
            let context = LogContext::new().with_adapter(&id);
            let (message, outcome) = match adapter.stop().await {
                Ok(()) => ("adapter stopped".to_owned(), SystemEventOutcome::Success),
                Err(err) => (format!("{:#}", err), SystemEventOutcome::Fault),
            };
            log_system_event(Some(&context), "adapter_stop", &message, outcome);
        }
        self.dispatcher.shutdown_with_timeout(SHUTDOWN_GRACE).await;
    }

    fn wrap<F: ?Sized + Send + Sync + 'static>(
        &self,
        adapter_id: &str,
        descriptor: FeatureDescriptor,
        feature: Arc<F>,
    ) -> FeatureCall<F> {
        FeatureCall::new(adapter_id, descriptor, feature, self.dispatcher.clone())
            .with_relay_capacity(self.config.relay.capacity)
            .with_metrics(self.metrics.clone())
    }

    fn rejected(
        &self,
        ctx: &CallContext,
        adapter_id: &str,
        feature_uri: &str,
        error: AdapterError,
    ) -> AdapterError {
        if let Some(metrics) = &self.metrics {
            metrics.observe_call(feature_uri, error.label());
        }
        if matches!(error, AdapterError::NotAuthorized { .. }) {
            let mut context = LogContext::new()
                .with_adapter(adapter_id)
                .with_feature(feature_uri);
            if let Some(connection) = ctx.connection_id() {
                context = context.with_connection(connection);
            }
            ads_warn!(
                context = context,
                "caller '{}' denied",
                ctx.principal().map(|p| p.id.as_str()).unwrap_or("anonymous")
            );
        }
        error
    }

    fn track<T: TopicItem>(&self, ctx: &CallContext, handle: SubscriptionHandle<T>) {
        let Some(connection) = ctx.connection_id() else {
            return;
        };
        let closed = handle.closed_token();
        self.track_until(connection, Arc::new(handle), closed);
    }

    fn track_stream<T>(&self, ctx: &CallContext, stream: &FeatureStream<T>) {
        let Some(connection) = ctx.connection_id() else {
            return;
        };
        self.track_until(connection, Arc::new(stream.tracked()), stream.cancellation_token());
    }

    /// Track `subscription` and forget it again once `closed` fires.
    fn track_until(
        &self,
        connection: &str,
        subscription: Arc<dyn TrackedSubscription>,
        closed: CancellationToken,
    ) {
        let id = subscription.subscription_id();
        if !self.tracker.add_subscription(connection, subscription) {
            return;
        }
        let tracker = self.tracker.clone();
        let connection = connection.to_owned();
        self.dispatcher
            .spawn(format!("untrack-{}", id), move |shutdown| async move {
                tokio::select! {
                    _ = closed.cancelled() => {
                        tracker.remove_subscription(&connection, id).await;
                    }
                    _ = shutdown.cancelled() => {}
                }
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureSet;
    use crate::subscriptions::Topic;
    use async_trait::async_trait;
    use futures::stream::{self, StreamExt};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Upstream {
        added: Mutex<Vec<String>>,
        removed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TopicSubscriptionHandler for Upstream {
        async fn on_topics_added(&self, topics: &[Topic]) -> anyhow::Result<()> {
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

    struct Events {
        manager: SubscriptionManager<EventMessage>,
    }

    #[async_trait]
    impl EventMessagePush for Events {
        async fn subscribe_event_messages(
            &self,
            ctx: &CallContext,
            request: CreateEventMessageSubscriptionRequest,
            updates: UpdateStream,
            cancel: CancellationToken,
        ) -> anyhow::Result<Subscription<EventMessage>> {
            let subscription = self.manager.create_subscription(ctx);
            subscription.handle().add_topics(request.topics).await?;
            self.manager
                .spawn_update_loop(subscription.handle(), updates, cancel);
            Ok(subscription)
        }
    }

    struct EventAdapter {
        running: AtomicBool,
        events: Arc<Events>,
    }

    #[async_trait]
    impl Adapter for EventAdapter {
        fn descriptor(&self) -> AdapterDescriptor {
            AdapterDescriptor::new("events", "Events")
        }

        fn features(&self) -> FeatureSet {
            FeatureSet::new().with_event_message_push(self.events.clone())
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        async fn start(&self) -> anyhow::Result<()> {
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> anyhow::Result<()> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    fn host_with_events() -> (AdapterHost, Arc<Upstream>, SubscriptionManager<EventMessage>) {
        let host = AdapterHost::builder(&SdkConfig::default()).build();
        let upstream = Arc::new(Upstream::default());
        let manager = host.subscription_manager::<EventMessage>("events", upstream.clone());
        let adapter = Arc::new(EventAdapter {
            running: AtomicBool::new(false),
            events: Arc::new(Events {
                manager: manager.clone(),
            }),
        });
        host.register(adapter).unwrap();
        (host, upstream, manager)
    }

    #[tokio::test]
    async fn adapters_must_be_started_before_use() {
        let (host, _, _) = host_with_events();
        let ctx = CallContext::anonymous();
        let request = CreateEventMessageSubscriptionRequest {
            topics: vec!["alarms".to_owned()],
        };
        let error = host
            .subscribe_event_messages(&ctx, "events", request, stream::empty().boxed(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(error, AdapterError::AdapterNotRunning(_)));

        host.start_all().await.unwrap();
        let described = host.describe_adapter(&ctx, "events").unwrap();
        assert_eq!(described.features.len(), 1);
        assert!(matches!(
            host.describe_adapter(&ctx, "missing"),
            Err(AdapterError::AdapterNotFound(_))
        ));
    }

    #[tokio::test]
    async fn disconnect_releases_tracked_subscriptions() {
        let (host, upstream, manager) = host_with_events();
        host.start_all().await.unwrap();
        let ctx = CallContext::anonymous().with_connection("conn-1");
        let request = CreateEventMessageSubscriptionRequest {
            topics: vec!["alarms".to_owned()],
        };
        let mut subscription = host
            .subscribe_event_messages(&ctx, "events", request, stream::pending().boxed(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(host.tracker().subscription_ids("conn-1"), vec![subscription.id()]);
        assert_eq!(manager.topic_ref_count("alarms"), 1);

        assert_eq!(host.disconnect("conn-1").await, 1);
        assert_eq!(manager.topic_ref_count("alarms"), 0);
        assert_eq!(*upstream.removed.lock(), vec!["alarms".to_owned()]);
        assert!(subscription.next().await.is_none());
        assert_eq!(host.disconnect("conn-1").await, 0);
    }
}
