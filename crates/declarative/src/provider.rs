//! Provider client capability
//!
//! A provider performs one create, update or delete against the remote
//! platform. Calls must be idempotent at the provider level so the executor
//! can retry them after transient failures.

use crate::error::ProviderError;
use crate::types::{Properties, ResourceType};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A resource with every reference and secret substituted.
///
/// Properties may carry secret plaintext, so `Debug` lists keys only.
#[derive(Clone)]
pub struct ResolvedResource {
    pub id: String,
    pub resource_type: ResourceType,
    pub name: String,
    pub properties: Properties,
    /// Provider-assigned id of the parent, when the resource is nested
    pub parent_provider_id: Option<String>,
}

impl fmt::Debug for ResolvedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedResource")
            .field("id", &self.id)
            .field("resource_type", &self.resource_type)
            .field("properties", &self.properties.keys().collect::<Vec<_>>())
            .field("parent_provider_id", &self.parent_provider_id)
            .finish_non_exhaustive()
    }
}

/// What the provider reports after a create or update
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderOutput {
    pub provider_id: String,
    /// Remote attributes (fqdn, generated names...), referenceable by dependents
    pub outputs: Properties,
}

/// Remote platform operations for one or more resource types
pub trait Provider: Send + Sync {
    fn create(&self, resource: &ResolvedResource) -> Result<ProviderOutput, ProviderError>;

    fn update(
        &self,
        resource: &ResolvedResource,
        provider_id: &str,
    ) -> Result<ProviderOutput, ProviderError>;

    /// Delete a resource; deleting something already gone succeeds
    fn delete(&self, resource_type: ResourceType, provider_id: &str) -> Result<(), ProviderError>;
}

/// Dispatches calls to a provider by resource type
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<ResourceType, Arc<dyn Provider>>,
    fallback: Option<Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route one resource type to `provider`
    pub fn register(&mut self, resource_type: ResourceType, provider: Arc<dyn Provider>) {
        self.providers.insert(resource_type, provider);
    }

    /// Provider used for types without a dedicated registration
    pub fn with_fallback(mut self, provider: Arc<dyn Provider>) -> Self {
        self.fallback = Some(provider);
        self
    }

    fn get(&self, resource_type: ResourceType) -> Result<&dyn Provider, ProviderError> {
        self.providers
            .get(&resource_type)
            .or(self.fallback.as_ref())
            .map(|provider| &**provider)
            .ok_or_else(|| {
                ProviderError::Permanent(format!("no provider registered for {resource_type}"))
            })
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.providers.keys().map(ResourceType::as_str).collect();
        types.sort_unstable();
        f.debug_struct("ProviderRegistry")
            .field("types", &types)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl Provider for ProviderRegistry {
    fn create(&self, resource: &ResolvedResource) -> Result<ProviderOutput, ProviderError> {
        self.get(resource.resource_type)?.create(resource)
    }

    fn update(
        &self,
        resource: &ResolvedResource,
        provider_id: &str,
    ) -> Result<ProviderOutput, ProviderError> {
        self.get(resource.resource_type)?.update(resource, provider_id)
    }

    fn delete(&self, resource_type: ResourceType, provider_id: &str) -> Result<(), ProviderError> {
        self.get(resource_type)?.delete(resource_type, provider_id)
    }
}

pub mod memory {
    //! In-memory provider with scripted failures, for tests and rehearsals.

    use super::{Provider, ProviderOutput, ResolvedResource};
    use crate::error::ProviderError;
    use crate::types::{Properties, ResourceType};
    use serde_json::Value;
    use std::collections::{BTreeMap, HashMap, VecDeque};
    use std::sync::{Mutex, MutexGuard, PoisonError};
    use std::thread;
    use std::time::{Duration, Instant};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Operation {
        Create,
        Update,
        Delete,
    }

    /// One recorded provider call
    #[derive(Debug, Clone)]
    pub struct Call {
        pub operation: Operation,
        pub resource_id: String,
        pub started: Instant,
        pub finished: Instant,
        pub succeeded: bool,
    }

    /// Provider that keeps live resources in a map.
    ///
    /// Provider ids are `/{type}/{name}`. Failures are scripted per resource id:
    /// a queue of errors consumed one per call, or an error returned forever.
    #[derive(Debug, Default)]
    pub struct MemoryProvider {
        live: Mutex<BTreeMap<String, Properties>>,
        queued: Mutex<HashMap<String, VecDeque<ProviderError>>>,
        always: Mutex<HashMap<String, ProviderError>>,
        calls: Mutex<Vec<Call>>,
        latency: Duration,
        echo: bool,
    }

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resource id encoded in a provider id
    fn resource_id(provider_id: &str) -> String {
        provider_id
            .trim_start_matches('/')
            .replacen('/', ".", 1)
    }

    impl MemoryProvider {
        pub fn new() -> Self {
            Self::default()
        }

        /// Sleep this long inside every call
        pub fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }

        /// Return the submitted properties as the `config` output
        pub fn with_echo(mut self) -> Self {
            self.echo = true;
            self
        }

        /// Fail the next calls for `resource_id` with these errors, in order
        pub fn fail_next(&self, resource_id: &str, errors: impl IntoIterator<Item = ProviderError>) {
            lock(&self.queued)
                .entry(resource_id.to_string())
                .or_default()
                .extend(errors);
        }

        /// Fail every call for `resource_id`
        pub fn fail_always(&self, resource_id: &str, error: ProviderError) {
            lock(&self.always).insert(resource_id.to_string(), error);
        }

        pub fn calls(&self) -> Vec<Call> {
            lock(&self.calls).clone()
        }

        /// Calls that reached the provider, successful or not
        pub fn call_count(&self) -> usize {
            lock(&self.calls).len()
        }

        pub fn live_ids(&self) -> Vec<String> {
            lock(&self.live).keys().cloned().collect()
        }

        pub fn live_properties(&self, provider_id: &str) -> Option<Properties> {
            lock(&self.live).get(provider_id).cloned()
        }

        fn scripted_failure(&self, resource_id: &str) -> Option<ProviderError> {
            if let Some(error) = lock(&self.always).get(resource_id) {
                return Some(error.clone());
            }
            lock(&self.queued)
                .get_mut(resource_id)
                .and_then(VecDeque::pop_front)
        }

        fn record<T>(
            &self,
            operation: Operation,
            resource_id: &str,
            body: impl FnOnce() -> Result<T, ProviderError>,
        ) -> Result<T, ProviderError> {
            let started = Instant::now();
            if !self.latency.is_zero() {
                thread::sleep(self.latency);
            }
            let result = match self.scripted_failure(resource_id) {
                Some(error) => Err(error),
                None => body(),
            };
            lock(&self.calls).push(Call {
                operation,
                resource_id: resource_id.to_string(),
                started,
                finished: Instant::now(),
                succeeded: result.is_ok(),
            });
            result
        }

        fn store(&self, resource: &ResolvedResource) -> ProviderOutput {
            let provider_id = format!("/{}/{}", resource.resource_type, resource.name);
            lock(&self.live).insert(provider_id.clone(), resource.properties.clone());

            let mut outputs = Properties::new();
            outputs.insert(
                "fqdn".to_string(),
                Value::String(format!("{}.internal", resource.name)),
            );
            if self.echo {
                let config = resource.properties.clone().into_iter().collect();
                outputs.insert("config".to_string(), Value::Object(config));
            }
            ProviderOutput {
                provider_id,
                outputs,
            }
        }
    }

    impl Provider for MemoryProvider {
        fn create(&self, resource: &ResolvedResource) -> Result<ProviderOutput, ProviderError> {
            self.record(Operation::Create, &resource.id, || Ok(self.store(resource)))
        }

        fn update(
            &self,
            resource: &ResolvedResource,
            provider_id: &str,
        ) -> Result<ProviderOutput, ProviderError> {
            self.record(Operation::Update, &resource.id, || {
                if !lock(&self.live).contains_key(provider_id) {
                    return Err(ProviderError::Permanent(format!("{provider_id} not found")));
                }
                Ok(self.store(resource))
            })
        }

        fn delete(&self, _resource_type: ResourceType, provider_id: &str) -> Result<(), ProviderError> {
            self.record(Operation::Delete, &resource_id(provider_id), || {
                lock(&self.live).remove(provider_id);
                Ok(())
            })
        }
    }
}
