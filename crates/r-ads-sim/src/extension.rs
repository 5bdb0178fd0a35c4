//! ---
//! ads_section: "04-simulation"
//! ads_subsection: "module"
//! ads_type: "source"
//! ads_scope: "code"
//! ads_description: "Demo extension feature with one operation per call shape."
//! ads_version: "v0.0.0-prealpha"
//! ads_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use r_ads_core::extensions::{
    ExtensionFeature, InvocationInput, InvocationRequest, InvocationResponse, OperationDescriptor,
    OperationType, OperationUri,
};
use r_ads_core::features::ItemStream;
use r_ads_core::{AdapterError, CallContext, FeatureDescriptor};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::upstream::CallCounters;

/// URI of the demo extension feature.
pub const CUSTOM_EXTENSION_URI: &str = "vendor/custom/";

/// `vendor/custom/` operations:
///
/// | operation | shape | arguments |
/// |---|---|---|
/// | `double` | invoke | integer, returns it doubled |
/// | `count` | stream | `{ "to": n }`, streams `1..=n` |
/// | `sum` | client stream | numbers, returns their sum |
/// | `echo` | duplex | strings, echoed back as they arrive |
pub struct CustomExtension {
    counters: Arc<CallCounters>,
}

impl CustomExtension {
    pub fn new(counters: Arc<CallCounters>) -> Self {
        Self { counters }
    }

    fn operation_id(name: &str) -> String {
        format!("{}{}", CUSTOM_EXTENSION_URI, name)
    }
}

fn operation_name(operation_id: &str) -> anyhow::Result<String> {
    Ok(OperationUri::parse(operation_id)?.name().to_ascii_lowercase())
}

fn unsupported(operation_id: &str) -> anyhow::Error {
    AdapterError::FeatureNotSupported {
        adapter: String::new(),
        feature: operation_id.to_owned(),
    }
    .into()
}

#[async_trait]
impl ExtensionFeature for CustomExtension {
    fn descriptor(&self) -> FeatureDescriptor {
        FeatureDescriptor::extension(CUSTOM_EXTENSION_URI, "Custom operations")
            .with_description("Demo operations covering every call shape.")
    }

    async fn get_operations(
        &self,
        _ctx: &CallContext,
        _cancel: CancellationToken,
    ) -> anyhow::Result<Vec<OperationDescriptor>> {
        Ok(vec![
            OperationDescriptor::new(Self::operation_id("double"), "Double", OperationType::Invoke)
                .with_description("Returns the argument multiplied by two.")
                .with_request_schema(json!({ "type": "integer" }))
                .with_response_schema(json!({ "type": "integer" })),
            OperationDescriptor::new(Self::operation_id("count"), "Count", OperationType::Stream)
                .with_description("Streams the integers from 1 up to `to`.")
                .with_request_schema(json!({
                    "type": "object",
                    "properties": { "to": { "type": "integer", "minimum": 0, "maximum": 10000 } },
                    "required": ["to"]
                })),
            OperationDescriptor::new(Self::operation_id("sum"), "Sum", OperationType::ClientStream)
                .with_description("Adds up the streamed numbers.")
                .with_request_schema(json!({ "type": "number" })),
            OperationDescriptor::new(Self::operation_id("echo"), "Echo", OperationType::DuplexStream)
                .with_description("Echoes every streamed string.")
                .with_request_schema(json!({ "type": "string" })),
        ])
    }

    async fn invoke(
        &self,
        _ctx: &CallContext,
        request: InvocationRequest,
        _cancel: CancellationToken,
    ) -> anyhow::Result<InvocationResponse> {
        self.counters.record_invocation();
        match operation_name(&request.operation_id)?.as_str() {
            "double" => {
                let value = request
                    .arguments
                    .as_i64()
                    .context("double expects an integer")?;
                let doubled = value.checked_mul(2).context("double overflowed")?;
                Ok(InvocationResponse::new(doubled))
            }
            _ => Err(unsupported(&request.operation_id)),
        }
    }

    async fn stream(
        &self,
        _ctx: &CallContext,
        request: InvocationRequest,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ItemStream<InvocationResponse>> {
        self.counters.record_invocation();
        match operation_name(&request.operation_id)?.as_str() {
            "count" => {
                let to = request
                    .arguments
                    .get("to")
                    .and_then(Value::as_u64)
                    .context("count expects { \"to\": <integer> }")?;
                Ok(stream::iter((1..=to).map(|n| Ok(InvocationResponse::new(n)))).boxed())
            }
            _ => Err(unsupported(&request.operation_id)),
        }
    }

    async fn client_stream(
        &self,
        _ctx: &CallContext,
        operation_id: String,
        mut input: InvocationInput,
        cancel: CancellationToken,
    ) -> anyhow::Result<InvocationResponse> {
        self.counters.record_invocation();
        if operation_name(&operation_id)? != "sum" {
            return Err(unsupported(&operation_id));
        }
        let mut total = 0.0;
        let mut count = 0u64;
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return Err(AdapterError::OperationCancelled.into()),
                item = input.next() => item,
            };
            let Some(item) = item else { break };
            total += item.arguments.as_f64().context("sum expects numbers")?;
            count += 1;
        }
        Ok(InvocationResponse::new(total).with_diagnostic(format!("{} item(s)", count)))
    }

    async fn duplex_stream(
        &self,
        _ctx: &CallContext,
        operation_id: String,
        input: InvocationInput,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ItemStream<InvocationResponse>> {
        self.counters.record_invocation();
        if operation_name(&operation_id)? != "echo" {
            return Err(unsupported(&operation_id));
        }
        Ok(input
            .map(|item| Ok(InvocationResponse::new(item.arguments)))
            .boxed())
    }
}
