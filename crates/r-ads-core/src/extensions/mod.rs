//! ---
//! ads_section: "02-adapter-core"
//! ads_subsection: "module"
//! ads_type: "source"
//! ads_scope: "code"
//! ads_description: "URI-addressed extension features and their invocation envelopes."
//! ads_version: "v0.0.0-prealpha"
//! ads_owner: "tbd"
//! ---
//! Extension features.
//!
//! An extension feature groups operations under a feature URI such as `vendor/custom/`.
//! Operations are addressed by `<feature-uri><name>` and declare their call shape and
//! an optional JSON schema for their arguments.
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use validator::Validate;

use crate::context::CallContext;
use crate::error::{AdapterError, AdapterResult};
use crate::features::{FeatureDescriptor, ItemStream};

mod engine;

pub use engine::ExtensionEngine;

/// Parsed operation URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationUri {
    uri: String,
    feature_uri: String,
    name: String,
}

impl OperationUri {
    /// Split `vendor/custom/double` into feature `vendor/custom/` and name `double`.
    pub fn parse(raw: &str) -> AdapterResult<Self> {
        let trimmed = raw.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(AdapterError::validation(
                "operation_id",
                "operation URI must not be empty",
            ));
        }
        match trimmed.rsplit_once('/') {
            Some((feature, name)) if !feature.is_empty() && !name.is_empty() => Ok(Self {
                uri: trimmed.to_owned(),
                feature_uri: format!("{}/", feature),
                name: name.to_owned(),
            }),
            _ => Err(AdapterError::validation(
                "operation_id",
                format!("'{}' does not name an operation under a feature URI", raw.trim()),
            )),
        }
    }

    /// Full operation URI without a trailing `/`.
    pub fn as_str(&self) -> &str {
        &self.uri
    }

    /// URI of the owning feature, ending in `/`.
    pub fn feature_uri(&self) -> &str {
        &self.feature_uri
    }

    /// Last path segment.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether `operation_id` names this operation. Ignores a trailing `/` and ASCII case.
    pub fn matches(&self, operation_id: &str) -> bool {
        operation_id
            .trim()
            .trim_end_matches('/')
            .eq_ignore_ascii_case(&self.uri)
    }
}

impl FromStr for OperationUri {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationUri::parse(s)
    }
}

impl fmt::Display for OperationUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}

/// Call shape of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationType {
    /// One request, one response.
    Invoke,
    /// One request, streamed responses.
    Stream,
    /// Streamed requests, one response.
    ClientStream,
    /// Streamed requests and responses.
    DuplexStream,
}

impl OperationType {
    /// Stable label used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Invoke => "invoke",
            OperationType::Stream => "stream",
            OperationType::ClientStream => "client-stream",
            OperationType::DuplexStream => "duplex-stream",
        }
    }
}

/// Metadata of one extension operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDescriptor {
    /// Full operation URI.
    pub operation_id: String,
    /// Display name.
    pub name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Call shape.
    pub operation_type: OperationType,
    /// JSON schema the arguments must satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_schema: Option<Value>,
    /// JSON schema of the results. Informational.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<Value>,
}

impl OperationDescriptor {
    /// Descriptor without schemas.
    pub fn new(
        operation_id: impl Into<String>,
        name: impl Into<String>,
        operation_type: OperationType,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            name: name.into(),
            description: None,
            operation_type,
            request_schema: None,
            response_schema: None,
        }
    }

    /// Attach a description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Require arguments to satisfy `schema`.
    pub fn with_request_schema(mut self, schema: Value) -> Self {
        self.request_schema = Some(schema);
        self
    }

    /// Document the shape of the results.
    pub fn with_response_schema(mut self, schema: Value) -> Self {
        self.response_schema = Some(schema);
        self
    }
}

/// Unary or server-stream invocation envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct InvocationRequest {
    /// Full operation URI.
    #[validate(length(min = 1, message = "operation id is required"))]
    pub operation_id: String,
    /// Operation arguments.
    #[serde(default)]
    pub arguments: Value,
}

/// Result envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResponse {
    /// Operation results.
    pub results: Value,
    /// Free-form diagnostics emitted by the adapter.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,
}

impl InvocationResponse {
    /// Response without diagnostics.
    pub fn new(results: impl Into<Value>) -> Self {
        Self {
            results: results.into(),
            diagnostics: Vec::new(),
        }
    }

    /// Append a diagnostic line.
    pub fn with_diagnostic(mut self, diagnostic: impl Into<String>) -> Self {
        self.diagnostics.push(diagnostic.into());
        self
    }
}

/// One item of a streamed input sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationStreamItem {
    /// Operation arguments.
    pub arguments: Value,
}

impl InvocationStreamItem {
    /// Wrap arguments.
    pub fn new(arguments: impl Into<Value>) -> Self {
        Self {
            arguments: arguments.into(),
        }
    }
}

/// Streamed invocation input.
pub type InvocationInput = BoxStream<'static, InvocationStreamItem>;

/// An adapter-specific feature exposing named operations.
///
/// The SDK validates arguments against the operation's request schema before any of
/// the invocation methods run. Shapes an extension does not implement keep their
/// default, which reports the operation as unsupported.
#[async_trait]
pub trait ExtensionFeature: Send + Sync {
    /// Descriptor of the feature; its URI is the registration key.
    fn descriptor(&self) -> FeatureDescriptor;

    /// Descriptor lookup as served to remote callers.
    async fn get_descriptor(
        &self,
        _ctx: &CallContext,
        _cancel: CancellationToken,
    ) -> anyhow::Result<FeatureDescriptor> {
        Ok(self.descriptor())
    }

    /// Operations this feature exposes.
    async fn get_operations(
        &self,
        ctx: &CallContext,
        cancel: CancellationToken,
    ) -> anyhow::Result<Vec<OperationDescriptor>>;

    /// Run an [`OperationType::Invoke`] operation.
    async fn invoke(
        &self,
        _ctx: &CallContext,
        request: InvocationRequest,
        _cancel: CancellationToken,
    ) -> anyhow::Result<InvocationResponse> {
        Err(unsupported(&request.operation_id))
    }

    /// Run an [`OperationType::Stream`] operation.
    async fn stream(
        &self,
        _ctx: &CallContext,
        request: InvocationRequest,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ItemStream<InvocationResponse>> {
        Err(unsupported(&request.operation_id))
    }

    /// Run an [`OperationType::ClientStream`] operation.
    async fn client_stream(
        &self,
        _ctx: &CallContext,
        operation_id: String,
        _input: InvocationInput,
        _cancel: CancellationToken,
    ) -> anyhow::Result<InvocationResponse> {
        Err(unsupported(&operation_id))
    }

    /// Run an [`OperationType::DuplexStream`] operation.
    async fn duplex_stream(
        &self,
        _ctx: &CallContext,
        operation_id: String,
        _input: InvocationInput,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ItemStream<InvocationResponse>> {
        Err(unsupported(&operation_id))
    }
}

/// The wrapper fills in the adapter id.
fn unsupported(operation_id: &str) -> anyhow::Error {
    AdapterError::FeatureNotSupported {
        adapter: String::new(),
        feature: operation_id.to_owned(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_uris_split_at_the_last_segment() {
        let operation = OperationUri::parse(" vendor/custom/double/ ").unwrap();
        assert_eq!(operation.as_str(), "vendor/custom/double");
        assert_eq!(operation.feature_uri(), "vendor/custom/");
        assert_eq!(operation.name(), "double");
        assert!(operation.matches("Vendor/Custom/Double/"));
        assert!(!operation.matches("vendor/custom/doubles"));
    }

    #[test]
    fn malformed_operation_uris_are_validation_failures() {
        for raw in ["", "   ", "double", "/double"] {
            let error = OperationUri::parse(raw).unwrap_err();
            assert_eq!(error.violations()[0].field, "operation_id", "input {:?}", raw);
        }
    }

    #[test]
    fn descriptors_serialize_with_kebab_case_shapes() {
        let descriptor = OperationDescriptor::new("vendor/custom/sum", "Sum", OperationType::ClientStream);
        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["operation_type"], "client-stream");
        assert!(json.get("request_schema").is_none());
    }
}
