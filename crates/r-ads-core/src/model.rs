//! ---
//! ads_section: "02-adapter-core"
//! ads_subsection: "module"
//! ads_type: "source"
//! ads_scope: "code"
//! ads_description: "Request and value types exchanged with standard features."
//! ads_version: "v0.0.0-prealpha"
//! ads_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::subscriptions::TopicItem;

/// Quality flag attached to a tag value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TagValueStatus {
    /// Value is trustworthy.
    #[default]
    Good,
    /// Value may be stale or interpolated.
    Uncertain,
    /// Value could not be obtained.
    Bad,
}

/// A single timestamped tag value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagValue {
    /// Sample time (UTC).
    pub timestamp: DateTime<Utc>,
    /// Sample payload.
    pub value: Value,
    /// Quality flag.
    #[serde(default)]
    pub status: TagValueStatus,
    /// Engineering units, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
}

impl TagValue {
    /// Good-quality value without units.
    pub fn new(timestamp: DateTime<Utc>, value: impl Into<Value>) -> Self {
        Self {
            timestamp,
            value: value.into(),
            status: TagValueStatus::Good,
            units: None,
        }
    }

    /// Attach engineering units.
    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    /// Override the quality flag.
    pub fn with_status(mut self, status: TagValueStatus) -> Self {
        self.status = status;
        self
    }
}

/// Tag value together with the tag it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagValueQueryResult {
    /// Tag identifier used for routing.
    pub tag_id: String,
    /// Display name of the tag.
    pub tag_name: String,
    /// The sample.
    pub value: TagValue,
}

impl TagValueQueryResult {
    /// Result whose name equals its identifier.
    pub fn new(tag: impl Into<String>, value: TagValue) -> Self {
        let tag = tag.into();
        Self {
            tag_name: tag.clone(),
            tag_id: tag,
            value,
        }
    }
}

impl TopicItem for TagValueQueryResult {
    fn topic(&self) -> &str {
        &self.tag_id
    }
}

/// Alarm or event notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    /// Unique event id.
    pub id: Uuid,
    /// Topic the event is published on.
    pub topic: String,
    /// Time the event was raised.
    pub timestamp: DateTime<Utc>,
    /// Event text.
    pub message: String,
    /// Priority, higher is more urgent.
    #[serde(default)]
    pub priority: u8,
    /// Optional category (alarm class, source system, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl EventMessage {
    /// New event stamped with the current time.
    pub fn new(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            timestamp: Utc::now(),
            message: message.into(),
            priority: 0,
            category: None,
        }
    }

    /// Override the priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

impl TopicItem for EventMessage {
    fn topic(&self) -> &str {
        &self.topic
    }
}

/// Kind of change applied to a configuration item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigurationChangeType {
    /// Item was created.
    Created,
    /// Item was modified.
    Updated,
    /// Item was removed.
    Deleted,
}

/// Notification that an adapter configuration item changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationChange {
    /// Item type, used as the topic (`tag`, `asset`, ...).
    pub item_type: String,
    /// Item identifier.
    pub item_id: String,
    /// Display name of the item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_name: Option<String>,
    /// What happened.
    pub change_type: ConfigurationChangeType,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
}

impl ConfigurationChange {
    /// Change stamped with the current time.
    pub fn new(
        item_type: impl Into<String>,
        item_id: impl Into<String>,
        change_type: ConfigurationChangeType,
    ) -> Self {
        Self {
            item_type: item_type.into(),
            item_id: item_id.into(),
            item_name: None,
            change_type,
            timestamp: Utc::now(),
        }
    }

    /// Attach a display name.
    pub fn with_item_name(mut self, name: impl Into<String>) -> Self {
        self.item_name = Some(name.into());
        self
    }
}

impl TopicItem for ConfigurationChange {
    fn topic(&self) -> &str {
        &self.item_type
    }
}

/// Request for the current value of one or more tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ReadSnapshotTagValuesRequest {
    /// Tags to read.
    #[validate(length(min = 1, message = "at least one tag is required"))]
    pub tags: Vec<String>,
}

impl ReadSnapshotTagValuesRequest {
    /// Request for the given tags.
    pub fn new<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }
}

/// Request to open a snapshot tag-value push subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSnapshotTagValueSubscriptionRequest {
    /// Initial tags. More can be added later through the update channel.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Request to open an event push subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateEventMessageSubscriptionRequest {
    /// Initial event topics.
    #[serde(default)]
    pub topics: Vec<String>,
}

/// Request to open a configuration-change push subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateConfigurationChangesSubscriptionRequest {
    /// Initial item types.
    #[serde(default)]
    pub item_types: Vec<String>,
}

/// Push subscriptions may start empty, but every listed topic must be named.
fn validate_topic_names(field: &'static str, topics: &[String]) -> Result<(), ValidationErrors> {
    if topics.iter().any(|topic| topic.trim().is_empty()) {
        let mut error = ValidationError::new("blank_topic");
        error.message = Some("topic names must not be blank".into());
        let mut errors = ValidationErrors::new();
        errors.add(field, error);
        return Err(errors);
    }
    Ok(())
}

impl Validate for CreateSnapshotTagValueSubscriptionRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        validate_topic_names("tags", &self.tags)
    }
}

impl Validate for CreateEventMessageSubscriptionRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        validate_topic_names("topics", &self.topics)
    }
}

impl Validate for CreateConfigurationChangesSubscriptionRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        validate_topic_names("item_types", &self.item_types)
    }
}
