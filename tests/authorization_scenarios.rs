//! ---
//! ads_section: "15-testing-qa-runbook"
//! ads_subsection: "integration-tests"
//! ads_type: "source"
//! ads_scope: "code"
//! ads_description: "Resolution and authorization gate scenarios."
//! ads_version: "v0.0.0-prealpha"
//! ads_owner: "tbd"
//! ---
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use prometheus::Registry;
use r_ads_common::SdkConfig;
use r_ads_core::features::uris;
use r_ads_core::model::{
    CreateSnapshotTagValueSubscriptionRequest, ReadSnapshotTagValuesRequest, TagValue,
};
use r_ads_core::{
    AdapterError, AdapterHost, AllowAllAuthorizer, CallContext, Principal, SdkMetrics,
    UNRESOLVED_FEATURE,
};
use r_ads_sim::{SimulatedAdapter, CUSTOM_EXTENSION_URI};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn restricted_config() -> SdkConfig {
    let mut config = SdkConfig::default();
    config.authorization.default_allow = false;
    config.authorization.roles.insert(
        "operator".to_owned(),
        vec![uris::READ_SNAPSHOT_TAG_VALUES.to_owned()],
    );
    config
        .authorization
        .roles
        .insert("engineer".to_owned(), vec!["*".to_owned()]);
    config
}

async fn restricted_host() -> (AdapterHost, Arc<SimulatedAdapter>, SdkMetrics) {
    let metrics = SdkMetrics::register(&Registry::new()).unwrap();
    let host = AdapterHost::builder(&restricted_config())
        .with_metrics(metrics.clone())
        .build();
    let adapter = SimulatedAdapter::builder("sim").generate(false).build(&host);
    host.register(adapter.clone()).unwrap();
    host.start_all().await.unwrap();
    (host, adapter, metrics)
}

fn caller(role: &str) -> CallContext {
    CallContext::for_principal(Principal::new(format!("{}-1", role)).with_role(role))
}

#[tokio::test]
async fn denied_callers_never_reach_adapter_code() {
    let (host, adapter, metrics) = restricted_host().await;
    let ctx = CallContext::anonymous().with_connection("conn-a");

    let err = host
        .read_snapshot_tag_values(
            &ctx,
            "sim",
            ReadSnapshotTagValuesRequest::new(["Sensor1"]),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::NotAuthorized { .. }), "{err:?}");

    let err = host
        .subscribe_snapshot_tag_values(
            &ctx,
            "sim",
            CreateSnapshotTagValueSubscriptionRequest {
                tags: vec!["Sensor1".to_owned()],
            },
            stream::pending().boxed(),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::NotAuthorized { .. }));

    let err = host
        .invoke_extension(&ctx, "sim", "vendor/custom/double", json!(21), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::NotAuthorized { .. }));

    assert_eq!(adapter.counters().total(), 0);
    assert_eq!(adapter.values_upstream().subscribe_count("Sensor1"), 0);
    assert!(host.tracker().subscription_ids("conn-a").is_empty());
    assert_eq!(
        metrics.call_count(uris::SNAPSHOT_TAG_VALUE_PUSH, "not_authorized"),
        1
    );
    host.shutdown().await;
}

#[tokio::test]
async fn roles_grant_only_their_features() {
    let (host, adapter, metrics) = restricted_host().await;
    adapter
        .publish_value("Sensor1", TagValue::new(Utc::now(), 42))
        .await
        .unwrap();

    let operator = caller("operator");
    let values = host
        .read_snapshot_tag_values(
            &operator,
            "sim",
            ReadSnapshotTagValuesRequest::new(["Sensor1"]),
            CancellationToken::new(),
        )
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    assert_eq!(values[0].value.value, json!(42));
    assert_eq!(metrics.call_count(uris::READ_SNAPSHOT_TAG_VALUES, "ok"), 1);

    let err = host
        .invoke_extension(&operator, "sim", "vendor/custom/double", json!(1), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::NotAuthorized { .. }));
    assert_eq!(adapter.counters().invocations(), 0);

    let engineer = caller("ENGINEER");
    let response = host
        .invoke_extension(&engineer, "sim", "vendor/custom/double", json!(4), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response.results, json!(8));
    host.shutdown().await;
}

#[tokio::test]
async fn resolution_failures_precede_authorization() {
    let (host, adapter, _metrics) = restricted_host().await;
    let ctx = CallContext::anonymous();

    let err = host
        .read_snapshot_tag_values(
            &ctx,
            "missing",
            ReadSnapshotTagValuesRequest::new(["Sensor1"]),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::AdapterNotFound(id) if id == "missing"));

    let err = host
        .invoke_extension(&ctx, "sim", "vendor/absent/op", json!(1), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::FeatureNotSupported { .. }), "{err:?}");

    let err = host
        .read_snapshot_tag_values(
            &caller("operator"),
            "sim",
            ReadSnapshotTagValuesRequest::new(Vec::<String>::new()),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::ValidationFailed(_)));
    assert_eq!(adapter.counters().total(), 0);
    host.shutdown().await;
}

#[tokio::test]
async fn custom_authorizer_replaces_role_table() {
    let host = AdapterHost::builder(&restricted_config())
        .with_authorizer(Arc::new(AllowAllAuthorizer))
        .build();
    let adapter = SimulatedAdapter::builder("sim").generate(false).build(&host);
    host.register(adapter.clone()).unwrap();
    host.start_all().await.unwrap();

    let response = host
        .invoke_extension(
            &CallContext::anonymous(),
            "sim",
            "vendor/custom/double",
            json!(21),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(response.results, json!(42));
    assert_eq!(adapter.counters().invocations(), 1);
    host.shutdown().await;
}

#[tokio::test]
async fn unknown_feature_uris_share_one_metric_label() {
    let (host, _adapter, metrics) = restricted_host().await;
    let ctx = CallContext::anonymous();

    for uri in ["vendor/absent-1/op", "vendor/absent-2/op"] {
        let err = host
            .invoke_extension(&ctx, "sim", uri, json!(1), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::FeatureNotSupported { .. }));
    }
    let err = host
        .invoke_extension(&ctx, "missing", "vendor/custom/double", json!(1), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::AdapterNotFound(_)));
    let err = host
        .invoke_extension(&ctx, "sim", "vendor/custom/double", json!(1), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::NotAuthorized { .. }));

    assert_eq!(metrics.call_count(UNRESOLVED_FEATURE, "feature_not_supported"), 2);
    assert_eq!(metrics.call_count(UNRESOLVED_FEATURE, "adapter_not_found"), 1);
    assert_eq!(metrics.call_count(CUSTOM_EXTENSION_URI, "not_authorized"), 1);
    host.shutdown().await;
}
