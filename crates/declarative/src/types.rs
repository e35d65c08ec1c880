//! Core types for declarative resource reconciliation

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Property map of a resource, ordered for stable diffs and serialization
pub type Properties = BTreeMap<String, Value>;

/// Kind of remote resource managed by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// Centralized log sink for the container environment
    LogWorkspace,
    /// Dedicated virtual network
    VirtualNetwork,
    /// Subnet inside a virtual network
    Subnet,
    /// Managed container runtime environment
    ContainerEnvironment,
    /// File share registration inside a container environment
    EnvironmentStorage,
    /// Storage account backing persistent volumes
    StorageAccount,
    /// File service of a storage account
    FileService,
    /// File share inside a file service
    FileShare,
    /// Hosted container workload
    ContainerApp,
}

impl ResourceType {
    pub const ALL: [ResourceType; 9] = [
        ResourceType::LogWorkspace,
        ResourceType::VirtualNetwork,
        ResourceType::Subnet,
        ResourceType::ContainerEnvironment,
        ResourceType::EnvironmentStorage,
        ResourceType::StorageAccount,
        ResourceType::FileService,
        ResourceType::FileShare,
        ResourceType::ContainerApp,
    ];

    /// Name used in manifests, ids and provider paths.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LogWorkspace => "log_workspace",
            Self::VirtualNetwork => "virtual_network",
            Self::Subnet => "subnet",
            Self::ContainerEnvironment => "container_environment",
            Self::EnvironmentStorage => "environment_storage",
            Self::StorageAccount => "storage_account",
            Self::FileService => "file_service",
            Self::FileShare => "file_share",
            Self::ContainerApp => "container_app",
        }
    }

    /// Parse a type from its manifest name.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// Parent type this resource must be nested under, if any.
    pub fn required_parent(&self) -> Option<ResourceType> {
        match self {
            Self::Subnet => Some(Self::VirtualNetwork),
            Self::EnvironmentStorage => Some(Self::ContainerEnvironment),
            Self::FileService => Some(Self::StorageAccount),
            Self::FileShare => Some(Self::FileService),
            _ => None,
        }
    }

    /// Properties the remote API cannot change in place.
    ///
    /// A change to any of these is planned as delete + create.
    pub fn immutable_properties(&self) -> &'static [&'static str] {
        match self {
            Self::LogWorkspace => &["location"],
            Self::VirtualNetwork => &["location", "addressSpace"],
            Self::Subnet => &["addressPrefix"],
            Self::ContainerEnvironment => &["location", "infrastructureSubnet"],
            Self::EnvironmentStorage => &[],
            Self::StorageAccount => &["location", "kind", "sku"],
            Self::FileService => &[],
            Self::FileShare => &["enabledProtocols"],
            Self::ContainerApp => &["location", "environment"],
        }
    }

    /// Whether deleting this resource destroys stored data.
    pub fn holds_persistent_data(&self) -> bool {
        matches!(
            self,
            Self::LogWorkspace | Self::StorageAccount | Self::FileService | Self::FileShare
        )
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One declared unit of desired infrastructure state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// `type.name`, unique within a manifest
    pub id: String,
    pub resource_type: ResourceType,
    pub name: String,
    /// Property templates, references and secret placeholders unexpanded
    pub properties: Properties,
    /// Explicit dependencies (resource ids)
    pub depends_on: BTreeSet<String>,
    pub parent: Option<String>,
}

impl Resource {
    /// Build the canonical id for a type and name.
    pub fn make_id(resource_type: ResourceType, name: &str) -> String {
        format!("{}.{}", resource_type.as_str(), name)
    }

    /// Whether this resource mounts persistent volumes.
    pub fn mounts_volumes(&self) -> bool {
        self.properties
            .get("volumes")
            .and_then(Value::as_array)
            .is_some_and(|v| !v.is_empty())
    }

    /// Whether replacing this resource loses data.
    pub fn is_stateful(&self) -> bool {
        self.resource_type.holds_persistent_data() || self.mounts_volumes()
    }
}

/// Kind of change the planner decided for a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Create,
    Update,
    Delete,
    NoOp,
}

impl ActionKind {
    /// Whether the action calls the provider
    pub fn is_change(&self) -> bool {
        !matches!(self, Self::NoOp)
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Delete => "-",
            Self::NoOp => "=",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoOp => "no-op",
        };
        f.write_str(s)
    }
}

/// Which pass of the run an action belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Deletions of undeclared and replaced resources, dependents first
    Teardown,
    /// Creates, updates and replaces in dependency order
    Converge,
    /// Deletions that wait until declared resources stopped depending on them
    Cleanup,
}

/// A single step the executor will perform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedAction {
    pub resource: String,
    pub resource_type: ResourceType,
    pub kind: ActionKind,
    pub reason: String,
    pub phase: Phase,
    /// Level inside the phase; actions of one level may run concurrently
    pub level: usize,
    /// Resources whose actions in the same phase must succeed first
    pub depends_on: Vec<String>,
    /// Deletes persistent data or replaces a resource; needs confirmation
    pub destructive: bool,
    /// Half of a delete + create pair
    pub replace: bool,
    /// Property names that changed (updates and replaces)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed: Vec<String>,
}

/// Terminal state of an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Succeeded,
    Failed,
    Skipped,
}

/// Result of executing one planned action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub resource_id: String,
    pub kind: ActionKind,
    pub outcome: ActionOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Provider calls made, including retries
    pub attempts: u32,
}

impl ApplyResult {
    pub fn succeeded(action: &PlannedAction, attempts: u32) -> Self {
        Self {
            resource_id: action.resource.clone(),
            kind: action.kind,
            outcome: ActionOutcome::Succeeded,
            error: None,
            attempts,
        }
    }

    pub fn failed(action: &PlannedAction, error: impl Into<String>, attempts: u32) -> Self {
        Self {
            resource_id: action.resource.clone(),
            kind: action.kind,
            outcome: ActionOutcome::Failed,
            error: Some(error.into()),
            attempts,
        }
    }

    pub fn skipped(action: &PlannedAction, reason: impl Into<String>) -> Self {
        Self {
            resource_id: action.resource.clone(),
            kind: action.kind,
            outcome: ActionOutcome::Skipped,
            error: Some(reason.into()),
            attempts: 0,
        }
    }

    /// Check if the result represents success
    pub fn is_success(&self) -> bool {
        self.outcome == ActionOutcome::Succeeded
    }
}
