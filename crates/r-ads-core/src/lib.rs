//! ---
//! ads_section: "02-adapter-core"
//! ads_subsection: "module"
//! ads_type: "source"
//! ads_scope: "code"
//! ads_description: "Adapter SDK core: capability resolution, invocation wrapping and subscription fan-out."
//! ads_version: "v0.0.0-prealpha"
//! ads_owner: "tbd"
//! ---
//! Transport-agnostic core of the R-ADS adapter SDK.
//!
//! Hosts register [`adapter::Adapter`] implementations in an
//! [`registry::AdapterRegistry`] and serve callers through an [`host::AdapterHost`].
//! Every call is resolved and authorized before adapter code runs, then executed
//! through a [`wrapper::FeatureCall`] that validates, traces and normalises errors.
//! Push features multiplex callers over shared upstream topics with a
//! [`subscriptions::SubscriptionManager`].
#![warn(missing_docs)]

pub mod adapter;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod extensions;
pub mod features;
pub mod host;
pub mod metrics;
pub mod model;
pub mod registry;
pub mod subscriptions;
pub mod tracker;
pub mod wrapper;

pub use adapter::{Adapter, AdapterDescriptor, AdapterDescriptorExtended};
pub use context::{CallContext, Principal};
pub use dispatch::BackgroundDispatcher;
pub use error::{AdapterError, AdapterResult, FieldViolation};
pub use extensions::{
    ExtensionEngine, ExtensionFeature, InvocationInput, InvocationRequest, InvocationResponse,
    InvocationStreamItem, OperationDescriptor, OperationType, OperationUri,
};
pub use features::{
    ConfigurationChanges, EventMessagePush, FeatureCategory, FeatureDescriptor, FeatureSet,
    ItemStream, ReadSnapshotTagValues, SnapshotTagValuePush, StandardFeature,
};
pub use host::{AdapterHost, AdapterHostBuilder};
pub use metrics::{SdkMetrics, UNRESOLVED_FEATURE};
pub use registry::{
    AdapterRegistry, AllowAllAuthorizer, FeatureAuthorizer, Resolution, ResolvedFeature,
    RoleFeatureAuthorizer,
};
pub use subscriptions::{
    Subscription, SubscriptionHandle, SubscriptionId, SubscriptionManager,
    SubscriptionManagerBuilder, SubscriptionState, SubscriptionUpdate, Topic, TopicItem,
    TopicSubscriptionHandler, UpdateStream,
};
pub use tracker::{CancellableSubscription, ConnectionSubscriptionTracker, TrackedSubscription};
pub use wrapper::{FeatureCall, FeatureStream};
