//! ---
//! ads_section: "02-adapter-core"
//! ads_subsection: "module"
//! ads_type: "source"
//! ads_scope: "code"
//! ads_description: "Adapter registry, feature resolution and authorization."
//! ads_version: "v0.0.0-prealpha"
//! ads_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::RwLock;
use r_ads_common::AuthorizationConfig;

use crate::adapter::{Adapter, AdapterDescriptor};
use crate::context::CallContext;
use crate::error::{AdapterError, AdapterResult};
use crate::extensions::ExtensionFeature;
use crate::features::{normalize_feature_uri, FeatureDescriptor, StandardFeature};

/// Decides whether a caller may use a feature of an adapter.
#[async_trait]
pub trait FeatureAuthorizer: Send + Sync {
    /// `true` when the call may proceed.
    async fn authorize(
        &self,
        ctx: &CallContext,
        adapter: &AdapterDescriptor,
        feature_uri: &str,
    ) -> bool;
}

/// Authorizer that admits every caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllAuthorizer;

#[async_trait]
impl FeatureAuthorizer for AllowAllAuthorizer {
    async fn authorize(&self, _: &CallContext, _: &AdapterDescriptor, _: &str) -> bool {
        true
    }
}

/// Role-based authorizer.
///
/// A caller holding at least one configured role is admitted when one of those roles
/// grants the feature URI or `*`. Callers without configured roles, anonymous ones
/// included, get `default_allow`.
#[derive(Debug, Clone)]
pub struct RoleFeatureAuthorizer {
    default_allow: bool,
    grants: IndexMap<String, Vec<String>>,
}

impl RoleFeatureAuthorizer {
    /// Build from the `[authorization]` table.
    pub fn from_config(config: &AuthorizationConfig) -> Self {
        let grants = config
            .roles
            .iter()
            .map(|(role, uris)| {
                let uris = uris
                    .iter()
                    .map(|uri| match uri.trim() {
                        "*" => "*".to_owned(),
                        other => normalize_feature_uri(other).to_lowercase(),
                    })
                    .collect();
                (role.to_lowercase(), uris)
            })
            .collect();
        Self {
            default_allow: config.default_allow,
            grants,
        }
    }
}

#[async_trait]
impl FeatureAuthorizer for RoleFeatureAuthorizer {
    async fn authorize(
        &self,
        ctx: &CallContext,
        _adapter: &AdapterDescriptor,
        feature_uri: &str,
    ) -> bool {
        let wanted = normalize_feature_uri(feature_uri).to_lowercase();
        let mut has_configured_role = false;
        for role in ctx.roles() {
            if let Some(uris) = self.grants.get(&role.to_lowercase()) {
                has_configured_role = true;
                if uris.iter().any(|uri| uri == "*" || *uri == wanted) {
                    return true;
                }
            }
        }
        !has_configured_role && self.default_allow
    }
}

/// Raw outcome of a resolution attempt.
///
/// Authorization is only evaluated once the adapter is running and implements the
/// feature; otherwise `authorized` stays `false`.
pub struct Resolution<F: ?Sized> {
    /// Requested adapter id.
    pub adapter_id: String,
    /// Requested feature URI.
    pub feature_uri: String,
    /// Adapter, when registered.
    pub adapter: Option<Arc<dyn Adapter>>,
    /// Whether the adapter is enabled and running.
    pub running: bool,
    /// Feature implementation and its descriptor, when implemented.
    pub feature: Option<(Arc<F>, FeatureDescriptor)>,
    /// Authorization outcome.
    pub authorized: bool,
}

/// Successful resolution.
pub struct ResolvedFeature<F: ?Sized> {
    /// Owning adapter.
    pub adapter: Arc<dyn Adapter>,
    /// Feature implementation.
    pub feature: Arc<F>,
    /// Feature descriptor.
    pub descriptor: FeatureDescriptor,
}

impl<F: ?Sized> Resolution<F> {
    /// Apply the ordered checks: registered, running, implemented, authorized.
    pub fn into_result(self) -> AdapterResult<ResolvedFeature<F>> {
        let adapter = self
            .adapter
            .ok_or_else(|| AdapterError::AdapterNotFound(self.adapter_id.clone()))?;
        if !self.running {
            return Err(AdapterError::AdapterNotRunning(self.adapter_id));
        }
        let (feature, descriptor) = self.feature.ok_or_else(|| AdapterError::FeatureNotSupported {
            adapter: self.adapter_id.clone(),
            feature: self.feature_uri.clone(),
        })?;
        if !self.authorized {
            return Err(AdapterError::NotAuthorized {
                adapter: self.adapter_id,
                feature: self.feature_uri,
            });
        }
        Ok(ResolvedFeature {
            adapter,
            feature,
            descriptor,
        })
    }
}

/// Registered adapters keyed by id, in registration order.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: RwLock<IndexMap<String, Arc<dyn Adapter>>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapters", &self.ids())
            .finish()
    }
}

impl AdapterRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its id. Fails when the id is taken.
    pub fn register(&self, adapter: Arc<dyn Adapter>) -> anyhow::Result<()> {
        let id = adapter.id();
        if id.trim().is_empty() {
            bail!("adapter id must not be empty");
        }
        let mut adapters = self.adapters.write();
        if adapters.contains_key(&id) {
            bail!("adapter '{}' is already registered", id);
        }
        adapters.insert(id, adapter);
        Ok(())
    }

    /// Remove an adapter, returning it when it was registered.
    pub fn unregister(&self, id: &str) -> Option<Arc<dyn Adapter>> {
        self.adapters.write().shift_remove(id)
    }

    /// Adapter registered under `id`.
    pub fn get(&self, id: &str) -> Option<Arc<dyn Adapter>> {
        self.adapters.read().get(id).cloned()
    }

    /// Registered ids in registration order.
    pub fn ids(&self) -> Vec<String> {
        self.adapters.read().keys().cloned().collect()
    }

    /// Registered adapters in registration order.
    pub fn adapters(&self) -> Vec<Arc<dyn Adapter>> {
        self.adapters.read().values().cloned().collect()
    }

    /// Number of registered adapters.
    pub fn len(&self) -> usize {
        self.adapters.read().len()
    }

    /// Whether no adapter is registered.
    pub fn is_empty(&self) -> bool {
        self.adapters.read().is_empty()
    }

    /// Resolve a standard feature.
    pub async fn resolve<F>(
        &self,
        ctx: &CallContext,
        adapter_id: &str,
        authorizer: &dyn FeatureAuthorizer,
    ) -> Resolution<F>
    where
        F: StandardFeature + ?Sized,
    {
        let adapter = self.get(adapter_id);
        let feature = adapter
            .as_ref()
            .and_then(|adapter| F::lookup(&adapter.features()))
            .map(|feature| (feature, F::descriptor()));
        self.finish(ctx, adapter_id, F::URI.to_owned(), adapter, feature, authorizer)
            .await
    }

    /// Resolve an extension feature by URI.
    pub async fn resolve_extension(
        &self,
        ctx: &CallContext,
        adapter_id: &str,
        feature_uri: &str,
        authorizer: &dyn FeatureAuthorizer,
    ) -> Resolution<dyn ExtensionFeature> {
        let feature_uri = normalize_feature_uri(feature_uri);
        let adapter = self.get(adapter_id);
        let feature = adapter
            .as_ref()
            .and_then(|adapter| adapter.features().extension(&feature_uri))
            .map(|feature| {
                let descriptor = feature.descriptor();
                (feature, descriptor)
            });
        self.finish(ctx, adapter_id, feature_uri, adapter, feature, authorizer)
            .await
    }

    async fn finish<F: ?Sized>(
        &self,
        ctx: &CallContext,
        adapter_id: &str,
        feature_uri: String,
        adapter: Option<Arc<dyn Adapter>>,
        feature: Option<(Arc<F>, FeatureDescriptor)>,
        authorizer: &dyn FeatureAuthorizer,
    ) -> Resolution<F> {
        let running = adapter
            .as_ref()
            .map(|adapter| adapter.is_enabled() && adapter.is_running())
            .unwrap_or(false);
        let authorized = match (&adapter, &feature) {
            (Some(adapter), Some(_)) if running => {
                authorizer
                    .authorize(ctx, &adapter.descriptor(), &feature_uri)
                    .await
            }
            _ => false,
        };
        Resolution {
            adapter_id: adapter_id.to_owned(),
            feature_uri,
            adapter,
            running,
            feature,
            authorized,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Principal;
    use crate::features::{FeatureSet, ItemStream, ReadSnapshotTagValues};
    use crate::model::{ReadSnapshotTagValuesRequest, TagValueQueryResult};
    use futures::stream::{self, StreamExt};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    struct Reader;

    #[async_trait]
    impl ReadSnapshotTagValues for Reader {
        async fn read_snapshot_tag_values(
            &self,
            _ctx: &CallContext,
            _request: ReadSnapshotTagValuesRequest,
            _cancel: CancellationToken,
        ) -> anyhow::Result<ItemStream<TagValueQueryResult>> {
            Ok(stream::empty().boxed())
        }
    }

    struct StubAdapter {
        id: &'static str,
        running: AtomicBool,
        features: FeatureSet,
    }

    impl StubAdapter {
        fn new(id: &'static str, running: bool, features: FeatureSet) -> Arc<Self> {
            Arc::new(Self {
                id,
                running: AtomicBool::new(running),
                features,
            })
        }
    }

    #[async_trait]
    impl Adapter for StubAdapter {
        fn descriptor(&self) -> AdapterDescriptor {
            AdapterDescriptor::new(self.id, "Stub")
        }

        fn features(&self) -> FeatureSet {
            self.features.clone()
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

    #[derive(Default)]
    struct CountingAuthorizer {
        calls: AtomicUsize,
        allow: bool,
    }

    #[async_trait]
    impl FeatureAuthorizer for CountingAuthorizer {
        async fn authorize(&self, _: &CallContext, _: &AdapterDescriptor, _: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.allow
        }
    }

    fn reader_features() -> FeatureSet {
        FeatureSet::new().with_read_snapshot_tag_values(Arc::new(Reader))
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let registry = AdapterRegistry::new();
        registry
            .register(StubAdapter::new("sim", true, FeatureSet::new()))
            .unwrap();
        assert!(registry
            .register(StubAdapter::new("sim", true, FeatureSet::new()))
            .is_err());
        assert_eq!(registry.ids(), vec!["sim".to_owned()]);
        assert!(registry.unregister("sim").is_some());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn checks_run_in_order_and_skip_authorization_on_failure() {
        let registry = AdapterRegistry::new();
        registry
            .register(StubAdapter::new("stopped", false, reader_features()))
            .unwrap();
        registry
            .register(StubAdapter::new("bare", true, FeatureSet::new()))
            .unwrap();
        registry
            .register(StubAdapter::new("sim", true, reader_features()))
            .unwrap();
        let deny = CountingAuthorizer::default();
        let ctx = CallContext::anonymous();

        let missing = registry
            .resolve::<dyn ReadSnapshotTagValues>(&ctx, "nope", &deny)
            .await;
        assert!(matches!(
            missing.into_result().err(),
            Some(AdapterError::AdapterNotFound(_))
        ));

        let stopped = registry
            .resolve::<dyn ReadSnapshotTagValues>(&ctx, "stopped", &deny)
            .await;
        assert!(matches!(
            stopped.into_result().err(),
            Some(AdapterError::AdapterNotRunning(_))
        ));

        let bare = registry
            .resolve::<dyn ReadSnapshotTagValues>(&ctx, "bare", &deny)
            .await;
        assert!(matches!(
            bare.into_result().err(),
            Some(AdapterError::FeatureNotSupported { .. })
        ));
        assert_eq!(deny.calls.load(Ordering::SeqCst), 0);

        let denied = registry
            .resolve::<dyn ReadSnapshotTagValues>(&ctx, "sim", &deny)
            .await;
        assert!(matches!(
            denied.into_result().err(),
            Some(AdapterError::NotAuthorized { .. })
        ));
        assert_eq!(deny.calls.load(Ordering::SeqCst), 1);

        let resolved = registry
            .resolve::<dyn ReadSnapshotTagValues>(&ctx, "sim", &AllowAllAuthorizer)
            .await
            .into_result()
            .unwrap();
        assert_eq!(resolved.descriptor.uri, crate::features::uris::READ_SNAPSHOT_TAG_VALUES);
    }

    #[tokio::test]
    async fn roles_grant_feature_uris() {
        let mut config = AuthorizationConfig::default();
        config.default_allow = false;
        config.roles.insert(
            "Operator".to_owned(),
            vec!["asc:features/real-time-data/values/read/snapshot".to_owned()],
        );
        config.roles.insert("admin".to_owned(), vec!["*".to_owned()]);
        let authorizer = RoleFeatureAuthorizer::from_config(&config);
        let adapter = AdapterDescriptor::new("sim", "Sim");
        let read = crate::features::uris::READ_SNAPSHOT_TAG_VALUES;
        let push = crate::features::uris::EVENT_MESSAGE_PUSH;

        let operator = CallContext::for_principal(Principal::new("op").with_role("operator"));
        assert!(authorizer.authorize(&operator, &adapter, read).await);
        assert!(!authorizer.authorize(&operator, &adapter, push).await);

        let admin = CallContext::for_principal(Principal::new("root").with_role("admin"));
        assert!(authorizer.authorize(&admin, &adapter, push).await);

        assert!(!authorizer.authorize(&CallContext::anonymous(), &adapter, read).await);
    }
}
