//! Secret materialization
//!
//! Secrets are declared in the manifest with a source and referenced from
//! properties by name. They are resolved at apply time, held only in memory
//! for the action that needs them, and never written to state or logs.

use crate::error::SecretResolutionError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where a declared secret comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum SecretSpec {
    /// Named environment variable
    Env { var: String },
    /// Key in the configured vault backend
    Vault { key: String },
    /// Literal placeholder, for development manifests
    Literal { value: String },
}

impl SecretSpec {
    /// Short description without the value
    pub fn describe(&self) -> String {
        match self {
            Self::Env { var } => format!("env:{var}"),
            Self::Vault { key } => format!("vault:{key}"),
            Self::Literal { .. } => "literal".to_string(),
        }
    }
}

/// A secret value that refuses to print itself
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the plaintext. Callers must not log or persist it.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(***)")
    }
}

impl fmt::Display for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// A secret resolved for one resource during one apply
#[derive(Debug, Clone)]
pub struct Secret {
    pub name: String,
    pub value: SecretValue,
    /// Resource id the secret was resolved for
    pub scope: String,
}

/// External secret source
pub trait SecretBackend: Send + Sync {
    /// Fetch the value stored under `key`
    fn fetch(&self, key: &str) -> Result<String, String>;
}

/// Vault backed by a TOML or JSON file of string values.
///
/// Nested tables are addressed with `/`, so `[pdns] db-password = "..."`
/// is read with key `pdns/db-password`. The file is read on every fetch.
pub struct FileVault {
    path: PathBuf,
}

impl FileVault {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Value, String> {
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| format!("cannot read vault {}: {e}", self.path.display()))?;
        let is_json = self.path.extension().is_some_and(|ext| ext == "json");
        if is_json {
            serde_json::from_str(&content).map_err(|e| format!("invalid vault JSON: {e}"))
        } else {
            toml::from_str(&content).map_err(|e| format!("invalid vault TOML: {e}"))
        }
    }
}

impl SecretBackend for FileVault {
    fn fetch(&self, key: &str) -> Result<String, String> {
        let document = self.load()?;
        let value = key
            .split('/')
            .try_fold(&document, |current, segment| current.get(segment))
            .ok_or_else(|| format!("key '{key}' not found in vault"))?;
        match value {
            Value::String(s) => Ok(s.clone()),
            _ => Err(format!("vault key '{key}' is not a string")),
        }
    }
}

type EnvLookup = dyn Fn(&str) -> Option<String> + Send + Sync;

/// Resolves declared secrets on demand
#[derive(Clone)]
pub struct SecretMaterializer {
    specs: BTreeMap<String, SecretSpec>,
    vault: Option<Arc<dyn SecretBackend>>,
    env: Arc<EnvLookup>,
}

impl SecretMaterializer {
    /// Materializer reading environment variables from the process
    pub fn new(specs: BTreeMap<String, SecretSpec>) -> Self {
        Self {
            specs,
            vault: None,
            env: Arc::new(|var| std::env::var(var).ok()),
        }
    }

    /// Attach a vault backend for `vault` sources
    pub fn with_vault(mut self, vault: Arc<dyn SecretBackend>) -> Self {
        self.vault = Some(vault);
        self
    }

    /// Replace the environment lookup (used by tests)
    pub fn with_env_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Arc::new(lookup);
        self
    }

    /// Resolve `name` for the resource `scope`.
    pub fn resolve(&self, name: &str, scope: &str) -> Result<Secret, SecretResolutionError> {
        let fail = |message: String| SecretResolutionError {
            name: name.to_string(),
            scope: scope.to_string(),
            message,
        };

        let spec = self
            .specs
            .get(name)
            .ok_or_else(|| fail("secret is not declared".to_string()))?;

        let value = match spec {
            SecretSpec::Env { var } => {
                (self.env)(var).ok_or_else(|| fail(format!("environment variable {var} is not set")))?
            }
            SecretSpec::Vault { key } => {
                let vault = self
                    .vault
                    .as_ref()
                    .ok_or_else(|| fail("no vault is configured".to_string()))?;
                vault.fetch(key).map_err(fail)?
            }
            SecretSpec::Literal { value } => {
                log::debug!("secret '{name}' for {scope} uses a literal placeholder");
                value.clone()
            }
        };

        if value.is_empty() {
            return Err(fail(format!("{} resolved to an empty value", spec.describe())));
        }

        log::trace!("resolved secret '{name}' for {scope} from {}", spec.describe());
        Ok(Secret {
            name: name.to_string(),
            value: SecretValue::new(value),
            scope: scope.to_string(),
        })
    }
}

impl fmt::Debug for SecretMaterializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretMaterializer")
            .field("secrets", &self.specs.keys().collect::<Vec<_>>())
            .field("vault", &self.vault.is_some())
            .finish()
    }
}

/// Secrets resolved while preparing one action
#[derive(Debug, Default)]
pub struct ResolvedSecrets {
    secrets: Vec<Secret>,
}

impl ResolvedSecrets {
    pub fn push(&mut self, secret: Secret) {
        self.secrets.push(secret);
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Secret> {
        self.secrets.iter()
    }

    /// Replace every occurrence of a resolved value inside `value`.
    ///
    /// Applied to provider outputs before they are persisted.
    pub fn scrub(&self, value: &mut Value) -> bool {
        let mut changed = false;
        match value {
            Value::String(s) => {
                for secret in &self.secrets {
                    let plain = secret.value.expose();
                    if s.contains(plain) {
                        *s = s.replace(plain, "<redacted>");
                        changed = true;
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    changed |= self.scrub(item);
                }
            }
            Value::Object(map) => {
                for v in map.values_mut() {
                    changed |= self.scrub(v);
                }
            }
            _ => {}
        }
        changed
    }
}
