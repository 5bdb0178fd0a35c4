//! ---
//! ads_section: "03-logging"
//! ads_subsection: "module"
//! ads_type: "source"
//! ads_scope: "code"
//! ads_description: "Structured logging context shared by adapters and hosts."
//! ads_version: "v0.0.0-prealpha"
//! ads_owner: "tbd"
//! ---
#![warn(missing_docs)]

pub mod macros;

/// Structured logging context propagated by the convenience macros.
#[derive(Debug, Default, Clone)]
pub struct LogContext<'a> {
    /// Adapter identifier associated with the log event.
    pub adapter: Option<&'a str>,
    /// Feature URI associated with the log event.
    pub feature: Option<&'a str>,
    /// Owning connection identifier.
    pub connection: Option<&'a str>,
    /// Subscription identifier.
    pub subscription: Option<u64>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an adapter identifier.
    pub fn with_adapter(mut self, adapter: &'a str) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Attach a feature URI.
    pub fn with_feature(mut self, feature: &'a str) -> Self {
        self.feature = Some(feature);
        self
    }

    /// Attach a connection identifier.
    pub fn with_connection(mut self, connection: &'a str) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Attach a subscription identifier.
    pub fn with_subscription(mut self, subscription: u64) -> Self {
        self.subscription = Some(subscription);
        self
    }
}

/// High-level outcome used when emitting lifecycle log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEventOutcome {
    /// The operation completed successfully.
    Success,
    /// The operation failed or was aborted.
    Fault,
}

impl SystemEventOutcome {
    /// Stable label used in the `outcome` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemEventOutcome::Success => "success",
            SystemEventOutcome::Fault => "fault",
        }
    }
}

/// Emit a standardized lifecycle event (adapter start, connection teardown, ...).
pub fn log_system_event(
    context: Option<&LogContext>,
    event: &str,
    message: &str,
    outcome: SystemEventOutcome,
) {
    let ctx = context.cloned().unwrap_or_default();
    match outcome {
        SystemEventOutcome::Success => tracing::info!(
            event,
            outcome = outcome.as_str(),
            adapter = ctx.adapter.unwrap_or(""),
            feature = ctx.feature.unwrap_or(""),
            connection = ctx.connection.unwrap_or(""),
            subscription = ctx.subscription.unwrap_or_default(),
            message = %message
        ),
        SystemEventOutcome::Fault => tracing::error!(
            event,
            outcome = outcome.as_str(),
            adapter = ctx.adapter.unwrap_or(""),
            feature = ctx.feature.unwrap_or(""),
            connection = ctx.connection.unwrap_or(""),
            subscription = ctx.subscription.unwrap_or_default(),
            message = %message
        ),
    }
}
