//! ---
//! ads_section: "02-adapter-core"
//! ads_subsection: "module"
//! ads_type: "source"
//! ads_scope: "code"
//! ads_description: "Adapter trait and descriptors exposed through the registry."
//! ads_version: "v0.0.0-prealpha"
//! ads_owner: "tbd"
//! ---
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::features::{FeatureDescriptor, FeatureSet};

/// Identity of an adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterDescriptor {
    /// Registry key.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl AdapterDescriptor {
    /// Descriptor without a description.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
        }
    }

    /// Attach a description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Adapter identity plus the features it implements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterDescriptorExtended {
    /// Adapter identity.
    pub adapter: AdapterDescriptor,
    /// Implemented features, standard ones first.
    pub features: Vec<FeatureDescriptor>,
}

/// An integration with one upstream system.
#[async_trait]
pub trait Adapter: Send + Sync + 'static {
    /// Identity used for registration and logging.
    fn descriptor(&self) -> AdapterDescriptor;

    /// Registry key.
    fn id(&self) -> String {
        self.descriptor().id
    }

    /// Features this adapter implements.
    fn features(&self) -> FeatureSet;

    /// Whether the host may route calls to this adapter at all.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Whether the adapter currently accepts calls.
    fn is_running(&self) -> bool;

    /// Connect to the upstream system.
    async fn start(&self) -> anyhow::Result<()>;

    /// Disconnect from the upstream system.
    async fn stop(&self) -> anyhow::Result<()>;

    /// Identity plus implemented features.
    fn describe(&self) -> AdapterDescriptorExtended {
        AdapterDescriptorExtended {
            adapter: self.descriptor(),
            features: self.features().descriptors(),
        }
    }
}
