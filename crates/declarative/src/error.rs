//! Error types for the reconciliation engine.
//!
//! Errors are split by the stage that raises them. Manifest and cycle errors
//! are fatal for the whole run and are always raised before any remote call.
//! Secret, provider and state errors are scoped to a single resource and are
//! folded into that resource's [`ApplyResult`](crate::ApplyResult).

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading and validating a manifest
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The document could not be read from disk
    #[error("failed to read manifest {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid TOML/JSON or does not match the schema
    #[error("failed to parse manifest: {0}")]
    Parse(String),

    /// A resource declares a type the engine does not know
    #[error("unknown resource type '{type_name}' for resource '{name}'")]
    UnknownType { type_name: String, name: String },

    /// Two resources share the same `type.name` id
    #[error("duplicate resource id '{0}'")]
    DuplicateId(String),

    /// A `depends_on`, `parent` or property reference names a missing resource
    #[error("resource '{resource}' references unknown resource '{target}'")]
    DanglingReference { resource: String, target: String },

    /// A property value is malformed for the resource type
    #[error("resource '{resource}': invalid property '{property}': {message}")]
    InvalidProperty {
        resource: String,
        property: String,
        message: String,
    },

    /// The resource type requires a parent of a specific type
    #[error("resource '{resource}' must have a parent of type '{expected}'")]
    InvalidParent { resource: String, expected: String },

    /// A property references a secret that is not declared
    #[error("resource '{resource}' references undeclared secret '{secret}'")]
    UndeclaredSecret { resource: String, secret: String },

    /// A declared secret has no usable source
    #[error("secret '{name}' has no valid source: {message}")]
    SecretSource { name: String, message: String },

    /// A `--target` pattern matches no declared resource
    #[error("target '{0}' matches no resource in the manifest")]
    UnknownTarget(String),
}

/// The resource graph contains a cycle
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("dependency cycle between: {}", .members.join(", "))]
pub struct DependencyCycleError {
    /// Ids of every resource left unresolved by the topological sort
    pub members: Vec<String>,
}

/// A secret could not be materialized
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("failed to resolve secret '{name}' for '{scope}': {message}")]
pub struct SecretResolutionError {
    pub name: String,
    pub scope: String,
    pub message: String,
}

/// Errors returned by a provider call
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Network failure, throttling or a server-side hiccup; worth retrying
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Invalid configuration, quota or conflict; retrying will not help
    #[error("permanent provider error: {0}")]
    Permanent(String),
}

impl ProviderError {
    /// Whether the executor should retry the call
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Errors raised by a [`StateStore`](crate::StateStore)
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("state I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file {} is corrupt: {message}", .path.display())]
    Corrupt { path: PathBuf, message: String },

    #[error("failed to serialize state: {0}")]
    Serialize(String),

    /// Another process holds the state lock
    #[error("state is locked by {} (remove it if no other run is active)", .0.display())]
    Locked(PathBuf),

    #[error("state store unavailable: {0}")]
    Unavailable(String),
}

/// Top-level engine error for operations that abort a whole run
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Cycle(#[from] DependencyCycleError),

    #[error(transparent)]
    State(#[from] StateStoreError),

    #[error("failed to build worker pool: {0}")]
    WorkerPool(String),
}

impl Error {
    /// Whether the error was raised while validating input (manifest or graph)
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Manifest(_) | Self::Cycle(_))
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_retryable() {
        assert!(ProviderError::Transient("timeout".into()).is_retryable());
        assert!(!ProviderError::Permanent("quota".into()).is_retryable());
    }

    #[test]
    fn test_cycle_error_names_members() {
        let err = DependencyCycleError {
            members: vec!["container_app.x".into(), "container_app.y".into()],
        };
        assert_eq!(
            err.to_string(),
            "dependency cycle between: container_app.x, container_app.y"
        );
    }

    #[test]
    fn test_validation_classification() {
        let err: Error = ManifestError::DuplicateId("subnet.a".into()).into();
        assert!(err.is_validation());

        let err: Error = StateStoreError::Unavailable("down".into()).into();
        assert!(!err.is_validation());
    }
}
