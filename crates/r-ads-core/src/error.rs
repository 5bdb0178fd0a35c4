//! ---
//! ads_section: "02-adapter-core"
//! ads_subsection: "module"
//! ads_type: "source"
//! ads_scope: "code"
//! ads_description: "Caller-facing error taxonomy and classification of adapter failures."
//! ads_version: "v0.0.0-prealpha"
//! ads_owner: "tbd"
//! ---
use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::subscriptions::SubscriptionId;

/// Convenience alias for results surfaced to callers.
pub type AdapterResult<T> = Result<T, AdapterError>;

/// A single constraint violated by a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldViolation {
    /// Path of the offending field (`tags`, `arguments/value`, ...).
    pub field: String,
    /// Human readable reason.
    pub message: String,
}

impl FieldViolation {
    /// Build a violation for `field`.
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Every error kind a caller of the SDK can observe.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdapterError {
    /// No adapter is registered under the identifier.
    #[error("adapter '{0}' was not found")]
    AdapterNotFound(String),
    /// The adapter exists but is disabled or stopped.
    #[error("adapter '{0}' is not running")]
    AdapterNotRunning(String),
    /// The adapter does not implement the feature or operation.
    #[error("adapter '{adapter}' does not support '{feature}'")]
    FeatureNotSupported {
        /// Adapter identifier.
        adapter: String,
        /// Feature or operation URI.
        feature: String,
    },
    /// The caller may not use the feature.
    #[error("caller is not authorized to use '{feature}' on adapter '{adapter}'")]
    NotAuthorized {
        /// Adapter identifier.
        adapter: String,
        /// Feature URI.
        feature: String,
    },
    /// The request failed validation before dispatch.
    #[error("request validation failed: {}", join_violations(.0))]
    ValidationFailed(Vec<FieldViolation>),
    /// The call was cancelled by the caller.
    #[error("operation cancelled")]
    OperationCancelled,
    /// Adapter code failed or panicked.
    #[error("upstream fault: {0}")]
    UpstreamFault(String),
    /// The subscription is unknown or already disposed.
    #[error("subscription {0} was not found")]
    SubscriptionNotFound(SubscriptionId),
}

fn join_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl AdapterError {
    /// Single-field validation failure.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        AdapterError::ValidationFailed(vec![FieldViolation::new(field, message)])
    }

    /// Upstream fault carrying the display form of `err`.
    pub fn upstream(err: impl fmt::Display) -> Self {
        AdapterError::UpstreamFault(err.to_string())
    }

    /// Stable label used for metrics and log fields.
    pub fn label(&self) -> &'static str {
        match self {
            AdapterError::AdapterNotFound(_) => "adapter_not_found",
            AdapterError::AdapterNotRunning(_) => "adapter_not_running",
            AdapterError::FeatureNotSupported { .. } => "feature_not_supported",
            AdapterError::NotAuthorized { .. } => "not_authorized",
            AdapterError::ValidationFailed(_) => "validation_failed",
            AdapterError::OperationCancelled => "cancelled",
            AdapterError::UpstreamFault(_) => "upstream_fault",
            AdapterError::SubscriptionNotFound(_) => "subscription_not_found",
        }
    }

    /// Field violations carried by a validation failure.
    pub fn violations(&self) -> &[FieldViolation] {
        match self {
            AdapterError::ValidationFailed(violations) => violations,
            _ => &[],
        }
    }

    /// Map an adapter error into the taxonomy.
    ///
    /// An [`AdapterError`] raised on purpose by adapter code passes through unchanged;
    /// anything else becomes [`AdapterError::UpstreamFault`].
    pub fn classify(err: anyhow::Error) -> Self {
        match err.downcast::<AdapterError>() {
            Ok(known) => known,
            Err(other) => AdapterError::UpstreamFault(format!("{:#}", other)),
        }
    }

    /// Map a caught panic payload into an upstream fault.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let detail = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_owned()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "adapter panicked".to_owned()
        };
        AdapterError::UpstreamFault(format!("adapter panicked: {}", detail))
    }
}

impl From<validator::ValidationErrors> for AdapterError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut violations = Vec::new();
        for (field, field_errors) in errors.field_errors() {
            for error in field_errors.iter() {
                let message = error
                    .message
                    .as_ref()
                    .map(|message| message.to_string())
                    .unwrap_or_else(|| error.code.to_string());
                violations.push(FieldViolation::new(field.to_string(), message));
            }
        }
        violations.sort_by(|a, b| a.field.cmp(&b.field));
        AdapterError::ValidationFailed(violations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn classify_passes_adapter_errors_through() {
        let err = anyhow::Error::new(AdapterError::validation("tags", "empty"));
        assert_eq!(
            AdapterError::classify(err),
            AdapterError::validation("tags", "empty")
        );
    }

    #[test]
    fn classify_wraps_foreign_errors() {
        let err = anyhow!("socket closed").context("reading tags");
        match AdapterError::classify(err) {
            AdapterError::UpstreamFault(message) => {
                assert!(message.contains("reading tags"));
                assert!(message.contains("socket closed"));
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn panic_payloads_become_upstream_faults() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(
            AdapterError::from_panic(payload),
            AdapterError::UpstreamFault("adapter panicked: boom".into())
        );
        let payload: Box<dyn Any + Send> = Box::new(17u8);
        assert_eq!(AdapterError::from_panic(payload).label(), "upstream_fault");
    }

    #[test]
    fn validation_message_lists_fields() {
        let err = AdapterError::ValidationFailed(vec![
            FieldViolation::new("tags", "at least one tag is required"),
            FieldViolation::new("arguments", "\"abc\" is not of type \"integer\""),
        ]);
        let rendered = err.to_string();
        assert!(rendered.contains("tags: at least one tag is required"));
        assert!(rendered.contains("arguments:"));
        assert_eq!(err.violations().len(), 2);
    }
}
