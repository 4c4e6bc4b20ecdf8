//! Service domain model and lifecycle state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle state of a provisioned service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// A provisioning run is (or was) creating the service
    Creating,
    /// Provisioning succeeded; the service is live
    Active,
    /// The service has been paused by an operator
    Inactive,
    /// Provisioning failed
    Failed,
    /// The service has been soft-deleted (terminal)
    Deleted,
}

impl ServiceState {
    /// Check whether a transition is allowed by the lifecycle state machine.
    ///
    /// `creating -> {active, failed}`; `active <-> inactive`;
    /// `{active, inactive, failed} -> deleted`. `deleted` is terminal.
    pub fn can_transition(self, to: ServiceState) -> bool {
        use ServiceState::*;
        matches!(
            (self, to),
            (Creating, Active)
                | (Creating, Failed)
                | (Active, Inactive)
                | (Inactive, Active)
                | (Active, Deleted)
                | (Inactive, Deleted)
                | (Failed, Deleted)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ServiceState::Deleted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceState::Creating => "creating",
            ServiceState::Active => "active",
            ServiceState::Inactive => "inactive",
            ServiceState::Failed => "failed",
            ServiceState::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ServiceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(ServiceState::Creating),
            "active" => Ok(ServiceState::Active),
            "inactive" => Ok(ServiceState::Inactive),
            "failed" => Ok(ServiceState::Failed),
            "deleted" => Ok(ServiceState::Deleted),
            other => Err(format!("unknown service state: {}", other)),
        }
    }
}

/// A provisioned unit tracked by the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    /// Unique, immutable identifier (`<namespace>-<timestamp>`)
    pub id: String,

    /// Human-chosen name, unique within its namespace
    pub name: String,

    /// Namespace the service lives in (DNS-normalized from the name)
    pub namespace: String,

    /// Template this service was provisioned from
    pub template: String,

    /// Configuration as submitted (with schema defaults applied)
    pub config: BTreeMap<String, Value>,

    /// Current lifecycle state
    pub state: ServiceState,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Set when the service is soft-deleted
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Service {
    /// Create a new service record in the `creating` state.
    pub fn new(
        name: &str,
        namespace: &str,
        template: &str,
        config: BTreeMap<String, Value>,
    ) -> Self {
        let now = Utc::now();
        Service {
            id: format!("{}-{}", namespace, now.format("%Y%m%d%H%M%S%3f")),
            name: name.to_string(),
            namespace: namespace.to_string(),
            template: template.to_string(),
            config,
            state: ServiceState::Creating,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

/// Normalize a service name into a DNS-compliant namespace name.
pub fn normalize_namespace(name: &str) -> String {
    name.to_lowercase().replace(['_', ' '], "-")
}
