//! ---
//! ads_section: "02-adapter-core"
//! ads_subsection: "module"
//! ads_type: "source"
//! ads_scope: "code"
//! ads_description: "Per-call caller identity passed explicitly through every operation."
//! ads_version: "v0.0.0-prealpha"
//! ads_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Authenticated caller identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Stable identifier of the caller (user name, client id, ...).
    pub id: String,
    /// Roles granted to the caller.
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Principal {
    /// Create a principal without roles.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            roles: Vec::new(),
        }
    }

    /// Attach a role.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }
}

/// Caller identity, culture and ownership information for one call.
#[derive(Debug, Clone)]
pub struct CallContext {
    principal: Option<Principal>,
    culture: Option<String>,
    connection_id: Option<String>,
    correlation_id: Uuid,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::anonymous()
    }
}

impl CallContext {
    /// Context for an unauthenticated caller with a fresh correlation id.
    pub fn anonymous() -> Self {
        Self {
            principal: None,
            culture: None,
            connection_id: None,
            correlation_id: Uuid::new_v4(),
        }
    }

    /// Context for an authenticated caller.
    pub fn for_principal(principal: Principal) -> Self {
        Self::anonymous().with_principal(principal)
    }

    /// Attach a principal.
    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    /// Attach a culture name such as `en-GB`.
    pub fn with_culture(mut self, culture: impl Into<String>) -> Self {
        self.culture = Some(culture.into());
        self
    }

    /// Attach the connection that owns subscriptions created with this context.
    pub fn with_connection(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    /// Override the correlation id.
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Authenticated caller, if any.
    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    /// Culture requested by the caller.
    pub fn culture(&self) -> Option<&str> {
        self.culture.as_deref()
    }

    /// Owning connection identifier.
    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    /// Correlation id used in spans and logs.
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Roles of the caller. Empty for anonymous callers.
    pub fn roles(&self) -> &[String] {
        self.principal
            .as_ref()
            .map(|principal| principal.roles.as_slice())
            .unwrap_or(&[])
    }

    /// Case-insensitive role check.
    pub fn has_role(&self, role: &str) -> bool {
        self.roles()
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let ctx = CallContext::for_principal(Principal::new("operator").with_role("Viewer"))
            .with_culture("nb-NO")
            .with_connection("conn-a");
        assert_eq!(ctx.principal().map(|p| p.id.as_str()), Some("operator"));
        assert_eq!(ctx.culture(), Some("nb-NO"));
        assert_eq!(ctx.connection_id(), Some("conn-a"));
        assert!(ctx.has_role("viewer"));
        assert!(!ctx.has_role("admin"));
    }

    #[test]
    fn anonymous_contexts_have_distinct_correlation_ids() {
        let a = CallContext::anonymous();
        let b = CallContext::anonymous();
        assert_ne!(a.correlation_id(), b.correlation_id());
        assert!(a.roles().is_empty());
    }
}
