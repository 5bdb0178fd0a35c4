//! ---
//! ads_section: "02-adapter-core"
//! ads_subsection: "module"
//! ads_type: "source"
//! ads_scope: "code"
//! ads_description: "Feature traits, descriptors and the compile-time feature dispatch table."
//! ads_version: "v0.0.0-prealpha"
//! ads_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::context::CallContext;
use crate::extensions::ExtensionFeature;
use crate::model::{
    ConfigurationChange, CreateConfigurationChangesSubscriptionRequest,
    CreateEventMessageSubscriptionRequest, CreateSnapshotTagValueSubscriptionRequest, EventMessage,
    ReadSnapshotTagValuesRequest, TagValueQueryResult,
};
use crate::subscriptions::{Subscription, UpdateStream};

/// Stream of items produced by adapter code.
pub type ItemStream<T> = BoxStream<'static, anyhow::Result<T>>;

/// URIs of the standard features.
pub mod uris {
    /// Read the current value of tags.
    pub const READ_SNAPSHOT_TAG_VALUES: &str = "asc:features/real-time-data/values/read/snapshot/";
    /// Push snapshot tag values as they change.
    pub const SNAPSHOT_TAG_VALUE_PUSH: &str = "asc:features/real-time-data/values/push/snapshot/";
    /// Push alarm and event messages.
    pub const EVENT_MESSAGE_PUSH: &str = "asc:features/events/push/";
    /// Push configuration changes.
    pub const CONFIGURATION_CHANGES: &str = "asc:features/diagnostics/configuration-changes/";
}

/// Normalise a feature URI: trimmed and ending in `/`.
pub fn normalize_feature_uri(uri: &str) -> String {
    let trimmed = uri.trim();
    if trimmed.ends_with('/') {
        trimmed.to_owned()
    } else {
        format!("{}/", trimmed)
    }
}

/// Whether a feature is part of the standard set or adapter specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeatureCategory {
    /// One of the standard features.
    Standard,
    /// URI-addressed extension feature.
    Extension,
}

/// Metadata describing one capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureDescriptor {
    /// Feature URI.
    pub uri: String,
    /// Display name.
    pub display_name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Standard or extension.
    pub category: FeatureCategory,
}

impl FeatureDescriptor {
    /// Descriptor of a standard feature.
    pub fn standard(uri: &str, display_name: &str, description: &str) -> Self {
        Self {
            uri: uri.to_owned(),
            display_name: display_name.to_owned(),
            description: Some(description.to_owned()),
            category: FeatureCategory::Standard,
        }
    }

    /// Descriptor of an extension feature. The URI is normalised to end in `/`.
    pub fn extension(uri: &str, display_name: impl Into<String>) -> Self {
        Self {
            uri: normalize_feature_uri(uri),
            display_name: display_name.into(),
            description: None,
            category: FeatureCategory::Extension,
        }
    }

    /// Attach a description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Read the current value of one or more tags.
#[async_trait]
pub trait ReadSnapshotTagValues: Send + Sync {
    /// Stream one result per requested tag.
    async fn read_snapshot_tag_values(
        &self,
        ctx: &CallContext,
        request: ReadSnapshotTagValuesRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<ItemStream<TagValueQueryResult>>;
}

/// Push tag values to subscribers as they change.
#[async_trait]
pub trait SnapshotTagValuePush: Send + Sync {
    /// Open a subscription for the requested tags; `updates` changes the tag set later.
    async fn subscribe_snapshot_tag_values(
        &self,
        ctx: &CallContext,
        request: CreateSnapshotTagValueSubscriptionRequest,
        updates: UpdateStream,
        cancel: CancellationToken,
    ) -> anyhow::Result<Subscription<TagValueQueryResult>>;
}

/// Push alarm and event messages to subscribers.
#[async_trait]
pub trait EventMessagePush: Send + Sync {
    /// Open a subscription for the requested event topics.
    async fn subscribe_event_messages(
        &self,
        ctx: &CallContext,
        request: CreateEventMessageSubscriptionRequest,
        updates: UpdateStream,
        cancel: CancellationToken,
    ) -> anyhow::Result<Subscription<EventMessage>>;
}

/// Push configuration changes to subscribers.
#[async_trait]
pub trait ConfigurationChanges: Send + Sync {
    /// Open a subscription for the requested item types.
    async fn subscribe_configuration_changes(
        &self,
        ctx: &CallContext,
        request: CreateConfigurationChangesSubscriptionRequest,
        updates: UpdateStream,
        cancel: CancellationToken,
    ) -> anyhow::Result<Subscription<ConfigurationChange>>;
}

/// Compile-time dispatch entry for a standard feature trait object.
pub trait StandardFeature: Send + Sync + 'static {
    /// Feature URI.
    const URI: &'static str;
    /// Display name.
    const DISPLAY_NAME: &'static str;
    /// One-line description.
    const DESCRIPTION: &'static str;

    /// Implementation registered in `features`, if any.
    fn lookup(features: &FeatureSet) -> Option<Arc<Self>>;

    /// Descriptor built from the constants.
    fn descriptor() -> FeatureDescriptor {
        FeatureDescriptor::standard(Self::URI, Self::DISPLAY_NAME, Self::DESCRIPTION)
    }
}

impl StandardFeature for dyn ReadSnapshotTagValues {
    const URI: &'static str = uris::READ_SNAPSHOT_TAG_VALUES;
    const DISPLAY_NAME: &'static str = "Read Snapshot Tag Values";
    const DESCRIPTION: &'static str = "Reads the current value of tags.";

    fn lookup(features: &FeatureSet) -> Option<Arc<Self>> {
        features.read_snapshot_tag_values.clone()
    }
}

impl StandardFeature for dyn SnapshotTagValuePush {
    const URI: &'static str = uris::SNAPSHOT_TAG_VALUE_PUSH;
    const DISPLAY_NAME: &'static str = "Snapshot Tag Value Push";
    const DESCRIPTION: &'static str = "Pushes tag values to subscribers as they change.";

    fn lookup(features: &FeatureSet) -> Option<Arc<Self>> {
        features.snapshot_tag_value_push.clone()
    }
}

impl StandardFeature for dyn EventMessagePush {
    const URI: &'static str = uris::EVENT_MESSAGE_PUSH;
    const DISPLAY_NAME: &'static str = "Event Message Push";
    const DESCRIPTION: &'static str = "Pushes alarm and event messages to subscribers.";

    fn lookup(features: &FeatureSet) -> Option<Arc<Self>> {
        features.event_message_push.clone()
    }
}

impl StandardFeature for dyn ConfigurationChanges {
    const URI: &'static str = uris::CONFIGURATION_CHANGES;
    const DISPLAY_NAME: &'static str = "Configuration Changes";
    const DESCRIPTION: &'static str = "Pushes adapter configuration changes to subscribers.";

    fn lookup(features: &FeatureSet) -> Option<Arc<Self>> {
        features.configuration_changes.clone()
    }
}

/// The features one adapter implements.
#[derive(Clone, Default)]
pub struct FeatureSet {
    read_snapshot_tag_values: Option<Arc<dyn ReadSnapshotTagValues>>,
    snapshot_tag_value_push: Option<Arc<dyn SnapshotTagValuePush>>,
    event_message_push: Option<Arc<dyn EventMessagePush>>,
    configuration_changes: Option<Arc<dyn ConfigurationChanges>>,
    extensions: IndexMap<String, Arc<dyn ExtensionFeature>>,
}

impl FeatureSet {
    /// Empty feature set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the snapshot read feature.
    pub fn with_read_snapshot_tag_values(mut self, feature: Arc<dyn ReadSnapshotTagValues>) -> Self {
        self.read_snapshot_tag_values = Some(feature);
        self
    }

    /// Register the snapshot push feature.
    pub fn with_snapshot_tag_value_push(mut self, feature: Arc<dyn SnapshotTagValuePush>) -> Self {
        self.snapshot_tag_value_push = Some(feature);
        self
    }

    /// Register the event push feature.
    pub fn with_event_message_push(mut self, feature: Arc<dyn EventMessagePush>) -> Self {
        self.event_message_push = Some(feature);
        self
    }

    /// Register the configuration-change feature.
    pub fn with_configuration_changes(mut self, feature: Arc<dyn ConfigurationChanges>) -> Self {
        self.configuration_changes = Some(feature);
        self
    }

    /// Register an extension feature under its descriptor URI.
    pub fn with_extension(mut self, feature: Arc<dyn ExtensionFeature>) -> Self {
        let uri = feature.descriptor().uri;
        self.extensions.insert(normalize_feature_uri(&uri), feature);
        self
    }

    /// Extension registered under `uri`. Matching ignores ASCII case.
    pub fn extension(&self, uri: &str) -> Option<Arc<dyn ExtensionFeature>> {
        let wanted = normalize_feature_uri(uri);
        self.extensions
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(&wanted))
            .map(|(_, feature)| feature.clone())
    }

    /// Descriptors of every implemented feature, standard ones first.
    pub fn descriptors(&self) -> Vec<FeatureDescriptor> {
        let mut descriptors = Vec::new();
        if self.read_snapshot_tag_values.is_some() {
            descriptors.push(<dyn ReadSnapshotTagValues as StandardFeature>::descriptor());
        }
        if self.snapshot_tag_value_push.is_some() {
            descriptors.push(<dyn SnapshotTagValuePush as StandardFeature>::descriptor());
        }
        if self.event_message_push.is_some() {
            descriptors.push(<dyn EventMessagePush as StandardFeature>::descriptor());
        }
        if self.configuration_changes.is_some() {
            descriptors.push(<dyn ConfigurationChanges as StandardFeature>::descriptor());
        }
        descriptors.extend(self.extensions.values().map(|feature| feature.descriptor()));
        descriptors
    }

    /// Whether a feature with `uri` is implemented.
    pub fn implements(&self, uri: &str) -> bool {
        let wanted = normalize_feature_uri(uri);
        self.descriptors()
            .iter()
            .any(|descriptor| descriptor.uri.eq_ignore_ascii_case(&wanted))
    }
}

impl fmt::Debug for FeatureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.descriptors().iter().map(|descriptor| &descriptor.uri))
            .finish()
    }
}
