//! ---
//! ads_section: "02-adapter-core"
//! ads_subsection: "module"
//! ads_type: "source"
//! ads_scope: "code"
//! ads_description: "Prometheus instrumentation for feature calls and subscriptions."
//! ads_version: "v0.0.0-prealpha"
//! ads_owner: "tbd"
//! ---
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// `feature` label recorded for calls whose URI matched no registered feature.
pub const UNRESOLVED_FEATURE: &str = "unresolved";

/// Prometheus metric handles shared by wrappers and subscription managers.
#[derive(Clone)]
pub struct SdkMetrics {
    calls: IntCounterVec,
    items: IntCounterVec,
    active_subscriptions: IntGauge,
    upstream_topics: IntGauge,
    dropped_items: IntCounter,
}

impl std::fmt::Debug for SdkMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SdkMetrics").finish_non_exhaustive()
    }
}

impl SdkMetrics {
    /// Register the SDK metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let calls = IntCounterVec::new(
            Opts::new("ads_feature_calls_total", "Feature calls by outcome"),
            &["feature", "outcome"],
        )?;
        let items = IntCounterVec::new(
            Opts::new(
                "ads_stream_items_total",
                "Items relayed to callers by streaming calls",
            ),
            &["feature"],
        )?;
        let active_subscriptions = IntGauge::with_opts(Opts::new(
            "ads_active_subscriptions",
            "Push subscriptions that have not been disposed",
        ))?;
        let upstream_topics = IntGauge::with_opts(Opts::new(
            "ads_upstream_topics",
            "Topics with an upstream subscription held by the adapter",
        ))?;
        let dropped_items = IntCounter::with_opts(Opts::new(
            "ads_dropped_items_total",
            "Items discarded because a subscriber channel was full",
        ))?;

        registry.register(Box::new(calls.clone()))?;
        registry.register(Box::new(items.clone()))?;
        registry.register(Box::new(active_subscriptions.clone()))?;
        registry.register(Box::new(upstream_topics.clone()))?;
        registry.register(Box::new(dropped_items.clone()))?;

        Ok(Self {
            calls,
            items,
            active_subscriptions,
            upstream_topics,
            dropped_items,
        })
    }

    /// Record the outcome of one feature call.
    pub fn observe_call(&self, feature: &str, outcome: &str) {
        self.calls.with_label_values(&[feature, outcome]).inc();
    }

    /// Record items relayed by a streaming call.
    pub fn observe_items(&self, feature: &str, count: u64) {
        self.items.with_label_values(&[feature]).inc_by(count);
    }

    /// A subscription was created.
    pub fn subscription_opened(&self) {
        self.active_subscriptions.inc();
    }

    /// A subscription was disposed.
    pub fn subscription_closed(&self) {
        self.active_subscriptions.dec();
    }

    /// Upstream subscriptions were issued for `count` topics.
    pub fn upstream_topics_added(&self, count: usize) {
        self.upstream_topics.add(count as i64);
    }

    /// Upstream subscriptions were released for `count` topics.
    pub fn upstream_topics_removed(&self, count: usize) {
        self.upstream_topics.sub(count as i64);
    }

    /// Items dropped by an overflow policy.
    pub fn observe_dropped(&self, count: u64) {
        self.dropped_items.inc_by(count);
    }

    /// Calls recorded for `feature` with `outcome`.
    pub fn call_count(&self, feature: &str, outcome: &str) -> u64 {
        self.calls.with_label_values(&[feature, outcome]).get()
    }

    /// Items relayed for `feature`.
    pub fn item_count(&self, feature: &str) -> u64 {
        self.items.with_label_values(&[feature]).get()
    }

    /// Subscriptions not yet disposed.
    pub fn active_subscriptions(&self) -> i64 {
        self.active_subscriptions.get()
    }

    /// Items dropped so far.
    pub fn dropped_items(&self) -> u64 {
        self.dropped_items.get()
    }
}
