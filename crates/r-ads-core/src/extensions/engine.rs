//! ---
//! ads_section: "02-adapter-core"
//! ads_subsection: "module"
//! ads_type: "source"
//! ads_scope: "code"
//! ads_description: "Operation lookup, schema validation and dispatch of extension invocations."
//! ads_version: "v0.0.0-prealpha"
//! ads_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;

use futures::future;
use futures::stream::{self, StreamExt};
use jsonschema::JSONSchema;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    ExtensionFeature, InvocationInput, InvocationRequest, InvocationResponse, OperationDescriptor,
    OperationType, OperationUri,
};
use crate::context::CallContext;
use crate::error::{AdapterError, AdapterResult, FieldViolation};
use crate::features::FeatureDescriptor;
use crate::wrapper::{FeatureCall, FeatureStream};

#[derive(Clone)]
struct CachedOperation {
    descriptor: OperationDescriptor,
    schema: Option<Arc<JSONSchema>>,
}

/// Runs invocations against one resolved extension feature.
///
/// Operation descriptors and compiled schemas are cached for the lifetime of the
/// engine, which the host creates per call.
pub struct ExtensionEngine {
    call: FeatureCall<dyn ExtensionFeature>,
    cache: HashMap<String, CachedOperation>,
}

impl std::fmt::Debug for ExtensionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionEngine")
            .field("call", &self.call)
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl ExtensionEngine {
    /// Engine over a resolved extension feature.
    pub fn new(call: FeatureCall<dyn ExtensionFeature>) -> Self {
        Self {
            call,
            cache: HashMap::new(),
        }
    }

    /// Descriptor as reported by the feature.
    pub async fn descriptor(
        &self,
        ctx: &CallContext,
        cancel: CancellationToken,
    ) -> AdapterResult<FeatureDescriptor> {
        self.call
            .execute("get_descriptor", ctx, cancel, |feature, ctx, cancel| async move {
                feature.get_descriptor(&ctx, cancel).await
            })
            .await
    }

    /// Operations exposed by the feature.
    pub async fn operations(
        &self,
        ctx: &CallContext,
        cancel: CancellationToken,
    ) -> AdapterResult<Vec<OperationDescriptor>> {
        self.call
            .execute("get_operations", ctx, cancel, |feature, ctx, cancel| async move {
                feature.get_operations(&ctx, cancel).await
            })
            .await
    }

    /// Validate `arguments` and run a unary operation.
    pub async fn invoke(
        &mut self,
        ctx: &CallContext,
        operation: &OperationUri,
        arguments: Value,
        cancel: CancellationToken,
    ) -> AdapterResult<InvocationResponse> {
        let cached = self
            .operation(ctx, operation, OperationType::Invoke, cancel.clone())
            .await?;
        if let Some(schema) = &cached.schema {
            validate_arguments(schema, &arguments)?;
        }
        let request = InvocationRequest {
            operation_id: operation.as_str().to_owned(),
            arguments,
        };
        self.call
            .unary(ctx, request, cancel, |feature, ctx, request, cancel| async move {
                feature.invoke(&ctx, request, cancel).await
            })
            .await
    }

    /// Validate `arguments` and run a server-stream operation.
    pub async fn stream(
        &mut self,
        ctx: &CallContext,
        operation: &OperationUri,
        arguments: Value,
        cancel: CancellationToken,
    ) -> AdapterResult<FeatureStream<InvocationResponse>> {
        let cached = match self
            .operation(ctx, operation, OperationType::Stream, cancel.clone())
            .await
        {
            Err(AdapterError::OperationCancelled) => return Ok(FeatureStream::finished(cancel)),
            found => found?,
        };
        if let Some(schema) = &cached.schema {
            validate_arguments(schema, &arguments)?;
        }
        let request = InvocationRequest {
            operation_id: operation.as_str().to_owned(),
            arguments,
        };
        self.call
            .stream(ctx, request, cancel, |feature, ctx, request, cancel| async move {
                feature.stream(&ctx, request, cancel).await
            })
            .await
    }

    /// Run a client-stream operation. Input items are validated as the adapter reads
    /// them; an invalid item ends the input and fails the call.
    pub async fn client_stream(
        &mut self,
        ctx: &CallContext,
        operation: &OperationUri,
        input: InvocationInput,
        cancel: CancellationToken,
    ) -> AdapterResult<InvocationResponse> {
        let cached = self
            .operation(ctx, operation, OperationType::ClientStream, cancel.clone())
            .await?;
        let checked = CheckedInput::new(input, cached.schema);
        let violation = checked.violation.clone();
        let operation_id = operation.as_str().to_owned();
        let response = self
            .call
            .client_stream(ctx, checked.input, cancel, |feature, ctx, input, cancel| async move {
                feature.client_stream(&ctx, operation_id, input, cancel).await
            })
            .await;
        let rejected = violation.lock().take();
        match rejected {
            Some(error) => Err(error),
            None => response,
        }
    }

    /// Run a duplex operation. Output is relayed as the adapter produces it; an invalid
    /// input item completes the output with a validation failure.
    pub async fn duplex(
        &mut self,
        ctx: &CallContext,
        operation: &OperationUri,
        input: InvocationInput,
        cancel: CancellationToken,
    ) -> AdapterResult<FeatureStream<InvocationResponse>> {
        let cached = match self
            .operation(ctx, operation, OperationType::DuplexStream, cancel.clone())
            .await
        {
            Err(AdapterError::OperationCancelled) => return Ok(FeatureStream::finished(cancel)),
            found => found?,
        };
        let checked = CheckedInput::new(input, cached.schema);
        let violation = checked.violation.clone();
        let tripped = checked.tripped.clone();
        let operation_id = operation.as_str().to_owned();
        self.call
            .duplex(ctx, checked.input, cancel, |feature, ctx, input, cancel| async move {
                let output = feature
                    .duplex_stream(&ctx, operation_id, input, cancel)
                    .await?;
                let tail = stream::once(async move { violation.lock().take() }).filter_map(
                    |violation| async move { violation.map(|error| Err(anyhow::Error::from(error))) },
                );
                anyhow::Ok(
                    output
                        .take_until(tripped.cancelled_owned())
                        .chain(tail)
                        .boxed(),
                )
            })
            .await
    }

    async fn operation(
        &mut self,
        ctx: &CallContext,
        operation: &OperationUri,
        expected: OperationType,
        cancel: CancellationToken,
    ) -> AdapterResult<CachedOperation> {
        let key = operation.as_str().to_ascii_lowercase();
        let cached = match self.cache.get(&key) {
            Some(cached) => cached.clone(),
            None => {
                let cached = self.fetch(ctx, operation, cancel).await?;
                self.cache.insert(key, cached.clone());
                cached
            }
        };
        if cached.descriptor.operation_type != expected {
            debug!(
                operation = %operation,
                declared = cached.descriptor.operation_type.as_str(),
                requested = expected.as_str(),
                "operation called with the wrong shape"
            );
            return Err(self.unsupported(operation));
        }
        Ok(cached)
    }

    async fn fetch(
        &self,
        ctx: &CallContext,
        operation: &OperationUri,
        cancel: CancellationToken,
    ) -> AdapterResult<CachedOperation> {
        let descriptor = self
            .operations(ctx, cancel)
            .await?
            .into_iter()
            .find(|descriptor| operation.matches(&descriptor.operation_id))
            .ok_or_else(|| self.unsupported(operation))?;
        let schema = match &descriptor.request_schema {
            Some(schema) => Some(Arc::new(compile_schema(operation, schema)?)),
            None => None,
        };
        Ok(CachedOperation { descriptor, schema })
    }

    fn unsupported(&self, operation: &OperationUri) -> AdapterError {
        AdapterError::FeatureNotSupported {
            adapter: self.call.adapter_id().to_owned(),
            feature: operation.as_str().to_owned(),
        }
    }
}

fn compile_schema(operation: &OperationUri, schema: &Value) -> AdapterResult<JSONSchema> {
    JSONSchema::compile(schema).map_err(|err| {
        AdapterError::UpstreamFault(format!(
            "operation '{}' declares an invalid request schema: {}",
            operation, err
        ))
    })
}

fn validate_arguments(schema: &JSONSchema, arguments: &Value) -> AdapterResult<()> {
    if let Err(errors) = schema.validate(arguments) {
        let violations = errors
            .map(|error| {
                let path = error.instance_path.to_string();
                FieldViolation::new(format!("arguments{}", path), error.to_string())
            })
            .collect();
        return Err(AdapterError::ValidationFailed(violations));
    }
    Ok(())
}

/// Input stream that stops at the first item violating the schema.
struct CheckedInput {
    input: InvocationInput,
    violation: Arc<Mutex<Option<AdapterError>>>,
    tripped: CancellationToken,
}

impl CheckedInput {
    fn new(input: InvocationInput, schema: Option<Arc<JSONSchema>>) -> Self {
        let violation = Arc::new(Mutex::new(None));
        let tripped = CancellationToken::new();
        let Some(schema) = schema else {
            return Self {
                input,
                violation,
                tripped,
            };
        };
        let slot = violation.clone();
        let trip = tripped.clone();
        let input = input
            .take_while(move |item| {
                let keep = match validate_arguments(&schema, &item.arguments) {
                    Ok(()) => true,
                    Err(error) => {
                        *slot.lock() = Some(error);
                        trip.cancel();
                        false
                    }
                };
                future::ready(keep)
            })
            .boxed();
        Self {
            input,
            violation,
            tripped,
        }
    }
}
