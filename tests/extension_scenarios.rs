//! ---
//! ads_section: "15-testing-qa-runbook"
//! ads_subsection: "integration-tests"
//! ads_type: "source"
//! ads_scope: "code"
//! ads_description: "Extension invocation scenarios against the simulated adapter."
//! ads_version: "v0.0.0-prealpha"
//! ads_owner: "tbd"
//! ---
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use r_ads_common::SdkConfig;
use r_ads_core::{
    AdapterError, AdapterHost, CallContext, InvocationInput, InvocationStreamItem, OperationType,
};
use r_ads_sim::{SimulatedAdapter, CUSTOM_EXTENSION_URI};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

async fn started_host() -> (AdapterHost, Arc<SimulatedAdapter>) {
    let host = AdapterHost::builder(&SdkConfig::default()).build();
    let adapter = SimulatedAdapter::builder("sim").generate(false).build(&host);
    host.register(adapter.clone()).unwrap();
    host.start_all().await.unwrap();
    (host, adapter)
}

fn input(values: Vec<Value>) -> InvocationInput {
    stream::iter(values.into_iter().map(InvocationStreamItem::new)).boxed()
}

#[tokio::test]
async fn double_validates_its_argument_before_dispatch() {
    let (host, adapter) = started_host().await;
    let ctx = CallContext::anonymous();

    let response = host
        .invoke_extension(&ctx, "sim", "vendor/custom/double", json!(21), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response.results, json!(42));
    assert_eq!(adapter.counters().invocations(), 1);

    let err = host
        .invoke_extension(&ctx, "sim", "vendor/custom/double", json!("abc"), CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        AdapterError::ValidationFailed(violations) => {
            assert_eq!(violations[0].field, "arguments");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(adapter.counters().invocations(), 1);
    host.shutdown().await;
}

#[tokio::test]
async fn operations_are_listed_with_their_shapes() {
    let (host, _adapter) = started_host().await;
    let ctx = CallContext::anonymous();
    let operations = host
        .get_extension_operations(&ctx, "sim", CUSTOM_EXTENSION_URI, CancellationToken::new())
        .await
        .unwrap();
    let shapes: Vec<_> = operations
        .iter()
        .map(|operation| (operation.name.as_str(), operation.operation_type))
        .collect();
    assert_eq!(
        shapes,
        vec![
            ("Double", OperationType::Invoke),
            ("Count", OperationType::Stream),
            ("Sum", OperationType::ClientStream),
            ("Echo", OperationType::DuplexStream),
        ]
    );

    let descriptor = host
        .get_extension_descriptor(&ctx, "sim", "VENDOR/CUSTOM", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(descriptor.uri, CUSTOM_EXTENSION_URI);
    host.shutdown().await;
}

#[tokio::test]
async fn count_streams_every_value() {
    let (host, _adapter) = started_host().await;
    let ctx = CallContext::anonymous();
    let stream = host
        .stream_extension(&ctx, "sim", "vendor/custom/count", json!({ "to": 4 }), CancellationToken::new())
        .await
        .unwrap();
    let values: Vec<Value> = stream
        .collect_all()
        .await
        .unwrap()
        .into_iter()
        .map(|response| response.results)
        .collect();
    assert_eq!(values, vec![json!(1), json!(2), json!(3), json!(4)]);

    let err = host
        .stream_extension(&ctx, "sim", "vendor/custom/count", json!({ "to": -1 }), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::ValidationFailed(_)));
    host.shutdown().await;
}

#[tokio::test]
async fn sum_reduces_the_client_stream() {
    let (host, _adapter) = started_host().await;
    let ctx = CallContext::anonymous();
    let response = host
        .client_stream_extension(
            &ctx,
            "sim",
            "vendor/custom/sum",
            input(vec![json!(1), json!(2), json!(3.5)]),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(response.results, json!(6.5));
    assert_eq!(response.diagnostics, vec!["3 item(s)".to_owned()]);

    let err = host
        .client_stream_extension(
            &ctx,
            "sim",
            "vendor/custom/sum",
            input(vec![json!(1), json!("two")]),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::ValidationFailed(_)));
    host.shutdown().await;
}

#[tokio::test]
async fn echo_completes_on_empty_input() {
    let (host, _adapter) = started_host().await;
    let ctx = CallContext::anonymous();
    let stream = host
        .duplex_extension(&ctx, "sim", "vendor/custom/echo", input(Vec::new()), CancellationToken::new())
        .await
        .unwrap();
    assert!(stream.collect_all().await.unwrap().is_empty());
    host.shutdown().await;
}

#[tokio::test]
async fn echo_stops_at_the_first_invalid_item() {
    let (host, _adapter) = started_host().await;
    let ctx = CallContext::anonymous();
    let mut stream = host
        .duplex_extension(
            &ctx,
            "sim",
            "vendor/custom/echo",
            input(vec![json!("a"), json!(5), json!("b")]),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    let first = stream.recv().await.unwrap().unwrap();
    assert_eq!(first.results, json!("a"));
    assert!(matches!(
        stream.recv().await,
        Some(Err(AdapterError::ValidationFailed(_)))
    ));
    assert!(stream.recv().await.is_none());
    host.shutdown().await;
}

#[tokio::test]
async fn wrong_shape_and_unknown_operations_are_unsupported() {
    let (host, adapter) = started_host().await;
    let ctx = CallContext::anonymous();

    let err = host
        .invoke_extension(&ctx, "sim", "vendor/custom/count", json!({ "to": 1 }), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(
        matches!(&err, AdapterError::FeatureNotSupported { adapter, .. } if adapter == "sim"),
        "{err:?}"
    );

    let err = host
        .invoke_extension(&ctx, "sim", "vendor/custom/triple", json!(1), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::FeatureNotSupported { .. }));

    let err = host
        .invoke_extension(&ctx, "sim", "vendor/other/double", json!(1), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::FeatureNotSupported { .. }));

    let err = host
        .invoke_extension(&ctx, "sim", "double", json!(1), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::ValidationFailed(_)));

    assert_eq!(adapter.counters().invocations(), 0);
    host.shutdown().await;
}

#[tokio::test]
async fn cancelled_invocations_report_cancellation() {
    let (host, _adapter) = started_host().await;
    let ctx = CallContext::anonymous();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = host
        .client_stream_extension(
            &ctx,
            "sim",
            "vendor/custom/sum",
            stream::pending().boxed(),
            cancel,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::OperationCancelled));
    host.shutdown().await;
}

#[tokio::test]
async fn cancelled_streams_end_without_an_error() {
    let (host, adapter) = started_host().await;
    let ctx = CallContext::anonymous();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let stream = host
        .stream_extension(&ctx, "sim", "vendor/custom/count", json!({ "to": 3 }), cancel.clone())
        .await
        .unwrap();
    assert!(stream.collect_all().await.unwrap().is_empty());

    let stream = host
        .duplex_extension(&ctx, "sim", "vendor/custom/echo", input(vec![json!("a")]), cancel)
        .await
        .unwrap();
    assert!(stream.collect_all().await.unwrap().is_empty());
    assert_eq!(adapter.counters().invocations(), 0);
    host.shutdown().await;
}
