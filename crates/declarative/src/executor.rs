//! Execution engine - applies a plan level by level with bounded parallelism
//!
//! Phases run in order (teardown, converge, cleanup) and levels inside a phase
//! are strict barriers. Actions of one level run on a rayon pool sized by
//! [`ExecuteOptions::concurrency`].
//!
//! An action starts only when every action it depends on succeeded; otherwise
//! it is skipped without a remote call. The create half of a replace also needs
//! its teardown delete to have succeeded, and a cleanup delete looks up the
//! converge outcome of the declared resources it waits for. References are
//! resolved when the action starts, from the attributes published by actions
//! that already ran.

use crate::context::{CancelToken, ExecuteOptions, NoProgress, ProgressCallback};
use crate::error::{Error, ProviderError, Result};
use crate::graph::ResourceGraph;
use crate::planner::Plan;
use crate::provider::{Provider, ResolvedResource};
use crate::reference::{self, Reference};
use crate::report::ApplyReport;
use crate::retry::{RetryCallback, with_retry};
use crate::secrets::{ResolvedSecrets, SecretMaterializer};
use crate::state::{LiveStateRecord, StateStore};
use crate::types::{
    ActionKind, ActionOutcome, ApplyResult, Phase, PlannedAction, Properties, Resource,
    ResourceType,
};
use chrono::Utc;
use rayon::prelude::*;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared bookkeeping for one run
#[derive(Default)]
struct RunState {
    outcomes: Mutex<HashMap<(Phase, String), ActionOutcome>>,
    /// Referenceable attributes per resource id
    attributes: Mutex<HashMap<String, Value>>,
    /// Set once cancellation prevented an action from starting
    stopped: AtomicBool,
}

impl RunState {
    /// Why `action` cannot start, if a dependency did not succeed
    fn blocked_by(&self, action: &PlannedAction) -> Option<String> {
        let outcomes = lock(&self.outcomes);
        if action.replace
            && action.kind == ActionKind::Create
            && matches!(
                outcomes.get(&(Phase::Teardown, action.resource.clone())),
                Some(ActionOutcome::Failed | ActionOutcome::Skipped)
            )
        {
            return Some("delete half of the replacement did not succeed".to_string());
        }

        action.depends_on.iter().find_map(|dep| {
            let outcome = outcomes
                .get(&(action.phase, dep.clone()))
                .or_else(|| match action.phase {
                    Phase::Cleanup => outcomes.get(&(Phase::Converge, dep.clone())),
                    Phase::Teardown | Phase::Converge => None,
                });
            match outcome {
                Some(ActionOutcome::Failed) => Some(format!("dependency {dep} failed")),
                Some(ActionOutcome::Skipped) => Some(format!("dependency {dep} was skipped")),
                _ => None,
            }
        })
    }

    fn record(&self, action: &PlannedAction, outcome: ActionOutcome) {
        lock(&self.outcomes).insert((action.phase, action.resource.clone()), outcome);
    }

    /// Make a resource's attributes available to later references
    fn publish(&self, resource: &Resource, templates: Properties, provider_id: &str, outputs: &Properties) {
        let mut attributes: Map<String, Value> = templates.into_iter().collect();
        for (key, value) in outputs {
            attributes.insert(key.clone(), value.clone());
        }
        attributes
            .entry("name")
            .or_insert_with(|| Value::String(resource.name.clone()));
        attributes.insert("id".to_string(), Value::String(provider_id.to_string()));
        lock(&self.attributes).insert(resource.id.clone(), Value::Object(attributes));
    }
}

/// Forwards retry notifications to the progress callback
struct RetryNotifier<'a> {
    progress: &'a dyn ProgressCallback,
    resource: &'a str,
}

impl RetryCallback for RetryNotifier<'_> {
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &ProviderError, delay: Duration) {
        log::warn!(
            "{}: attempt {attempt}/{max_attempts} failed: {error}; retrying in {delay:?}",
            self.resource
        );
        self.progress
            .on_retry(self.resource, attempt, max_attempts, error, delay);
    }
}

/// Executes plans against a provider and records outcomes in a state store
pub struct Executor<'a> {
    graph: &'a ResourceGraph,
    state: &'a dyn StateStore,
    provider: &'a dyn Provider,
    secrets: &'a SecretMaterializer,
    options: ExecuteOptions,
    progress: &'a dyn ProgressCallback,
    cancel: CancelToken,
}

impl<'a> Executor<'a> {
    pub fn new(
        graph: &'a ResourceGraph,
        state: &'a dyn StateStore,
        provider: &'a dyn Provider,
        secrets: &'a SecretMaterializer,
    ) -> Self {
        Self {
            graph,
            state,
            provider,
            secrets,
            options: ExecuteOptions::default(),
            progress: &NoProgress,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_options(mut self, options: ExecuteOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_progress(mut self, progress: &'a dyn ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Execute `plan`.
    ///
    /// Resource-level failures are reported in the returned [`ApplyReport`];
    /// an `Err` means the run could not start at all.
    pub fn execute(&self, plan: &Plan) -> Result<ApplyReport> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.concurrency.max(1))
            .build()
            .map_err(|e| Error::WorkerPool(e.to_string()))?;

        let run = RunState::default();
        let mut results: Vec<Option<ApplyResult>> = vec![None; plan.actions.len()];

        for ((phase, level), indexes) in schedule(plan) {
            let count = indexes.len();
            log::debug!("{phase:?} level {level}: {count} action(s)");
            self.progress.on_level_start(phase, level, count);

            let level_results: Mutex<Vec<(usize, ApplyResult)>> =
                Mutex::new(Vec::with_capacity(count));
            pool.install(|| {
                indexes.par_iter().for_each(|&index| {
                    let result = self.run_one(&plan.actions[index], &run);
                    lock(&level_results).push((index, result));
                });
            });

            for (index, result) in level_results
                .into_inner()
                .unwrap_or_else(PoisonError::into_inner)
            {
                results[index] = Some(result);
            }
        }

        let results: Vec<ApplyResult> = results.into_iter().flatten().collect();
        let report = ApplyReport::new(results, run.stopped.load(Ordering::SeqCst));
        log::info!("Run finished: {}", report.status);
        Ok(report)
    }

    fn run_one(&self, action: &PlannedAction, run: &RunState) -> ApplyResult {
        let result = if self.cancel.is_cancelled() {
            run.stopped.store(true, Ordering::SeqCst);
            ApplyResult::skipped(action, "cancelled before start")
        } else if let Some(reason) = run.blocked_by(action) {
            log::info!("Skipping {} {}: {reason}", action.kind, action.resource);
            ApplyResult::skipped(action, reason)
        } else {
            self.progress.on_action_start(action);
            self.run_action(action, run)
        };

        if let Some(error) = result.error.as_deref()
            && result.outcome == ActionOutcome::Failed
        {
            log::warn!("{} {} failed: {error}", action.kind, action.resource);
        }

        run.record(action, result.outcome);
        self.progress.on_action_complete(action, &result);
        result
    }

    fn run_action(&self, action: &PlannedAction, run: &RunState) -> ApplyResult {
        if action.destructive && !self.options.allow_destructive {
            return ApplyResult::failed(
                action,
                "destructive action requires confirmation (data loss)",
                0,
            );
        }

        log::info!("{} {}", action.kind, action.resource);
        match action.kind {
            ActionKind::NoOp => self.observe(action, run),
            ActionKind::Create | ActionKind::Update => self.converge(action, run),
            ActionKind::Delete => self.delete(action, run),
        }
    }

    /// NoOp: publish attributes from state without a remote call
    fn observe(&self, action: &PlannedAction, run: &RunState) -> ApplyResult {
        let Some(resource) = self.graph.get(&action.resource) else {
            return ApplyResult::failed(action, "resource is not declared in the manifest", 0);
        };
        let record = match self.state.get(&action.resource) {
            Ok(Some(record)) => record,
            Ok(None) => return ApplyResult::failed(action, "no state record for unchanged resource", 0),
            Err(e) => return ApplyResult::failed(action, e.to_string(), 0),
        };
        match self.resolve_references(resource, run) {
            Ok(templates) => {
                run.publish(resource, templates, &record.provider_assigned_id, &record.outputs);
                ApplyResult::succeeded(action, 0)
            }
            Err(e) => ApplyResult::failed(action, e, 0),
        }
    }

    /// Create or Update
    fn converge(&self, action: &PlannedAction, run: &RunState) -> ApplyResult {
        let id = action.resource.as_str();
        let Some(resource) = self.graph.get(id) else {
            return ApplyResult::failed(action, "resource is not declared in the manifest", 0);
        };

        let templates = match self.resolve_references(resource, run) {
            Ok(templates) => templates,
            Err(e) => return ApplyResult::failed(action, e, 0),
        };
        let (properties, secrets) = match self.materialize_secrets(id, &templates) {
            Ok(resolved) => resolved,
            Err(e) => return ApplyResult::failed(action, e, 0),
        };

        let existing = match self.state.get(id) {
            Ok(existing) => existing,
            Err(e) => return ApplyResult::failed(action, e.to_string(), 0),
        };
        let parent_provider_id = resource.parent.as_ref().and_then(|parent| {
            lock(&run.attributes)
                .get(parent)
                .and_then(|attrs| attrs.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string)
        });

        let resolved = ResolvedResource {
            id: id.to_string(),
            resource_type: resource.resource_type,
            name: resource.name.clone(),
            properties,
            parent_provider_id,
        };
        let notifier = RetryNotifier {
            progress: self.progress,
            resource: id,
        };

        let attempted = match (action.kind, existing.as_ref()) {
            (ActionKind::Update, Some(record)) => with_retry(&self.options.retry, Some(&notifier), || {
                self.provider.update(&resolved, &record.provider_assigned_id)
            }),
            (ActionKind::Update, None) => {
                return ApplyResult::failed(action, "no state record to update", 0);
            }
            _ => with_retry(&self.options.retry, Some(&notifier), || {
                self.provider.create(&resolved)
            }),
        };
        drop(resolved);

        let output = match attempted.result {
            Ok(output) => output,
            Err(e) => return ApplyResult::failed(action, e.to_string(), attempted.attempts),
        };

        let mut outputs = output.outputs;
        for (key, value) in &mut outputs {
            if secrets.scrub(value) {
                log::warn!("Redacted a secret value from output '{key}' of {id}");
            }
        }

        let record = LiveStateRecord {
            resource_id: id.to_string(),
            resource_type: resource.resource_type.as_str().to_string(),
            provider_assigned_id: output.provider_id.clone(),
            last_applied_properties: resource.properties.clone(),
            parent: resource.parent.clone(),
            depends_on: self.graph.dependencies(id).cloned().collect(),
            outputs: outputs.clone(),
            last_applied_at: Utc::now(),
        };
        if let Err(e) = self.state.put(record) {
            return ApplyResult::failed(
                action,
                format!("applied remotely but failed to record state: {e}"),
                attempted.attempts,
            );
        }

        run.publish(resource, templates, &output.provider_id, &outputs);
        ApplyResult::succeeded(action, attempted.attempts)
    }

    fn delete(&self, action: &PlannedAction, run: &RunState) -> ApplyResult {
        let id = action.resource.as_str();
        let record = match self.state.get(id) {
            Ok(Some(record)) => record,
            Ok(None) => {
                log::debug!("{id} has no state record; nothing to delete");
                return ApplyResult::succeeded(action, 0);
            }
            Err(e) => return ApplyResult::failed(action, e.to_string(), 0),
        };
        let resource_type =
            ResourceType::parse(&record.resource_type).unwrap_or(action.resource_type);

        let notifier = RetryNotifier {
            progress: self.progress,
            resource: id,
        };
        let attempted = with_retry(&self.options.retry, Some(&notifier), || {
            self.provider
                .delete(resource_type, &record.provider_assigned_id)
        });
        if let Err(e) = attempted.result {
            return ApplyResult::failed(action, e.to_string(), attempted.attempts);
        }

        if let Err(e) = self.state.remove(id) {
            return ApplyResult::failed(
                action,
                format!("deleted remotely but failed to update state: {e}"),
                attempted.attempts,
            );
        }
        lock(&run.attributes).remove(id);
        ApplyResult::succeeded(action, attempted.attempts)
    }

    /// Substitute resource references, leaving secret placeholders intact
    fn resolve_references(&self, resource: &Resource, run: &RunState) -> std::result::Result<Properties, String> {
        let attributes = lock(&run.attributes);
        let mut lookup = |reference: &Reference| -> std::result::Result<Option<Value>, String> {
            match reference {
                Reference::Secret(_) => Ok(None),
                Reference::Resource { id, attribute } => {
                    let attrs = attributes
                        .get(id)
                        .ok_or_else(|| format!("{id} has no known attributes in this run"))?;
                    reference::lookup_path(attrs, attribute)
                        .cloned()
                        .map(Some)
                        .ok_or_else(|| format!("{id} has no attribute '{attribute}'"))
                }
            }
        };

        resource
            .properties
            .iter()
            .map(|(key, value)| {
                reference::substitute(value, &mut lookup)
                    .map(|resolved| (key.clone(), resolved))
                    .map_err(|e| format!("cannot resolve property '{key}': {e}"))
            })
            .collect()
    }

    /// Substitute secrets; the returned properties hold plaintext
    fn materialize_secrets(
        &self,
        scope: &str,
        templates: &Properties,
    ) -> std::result::Result<(Properties, ResolvedSecrets), String> {
        let mut resolved = ResolvedSecrets::default();
        let mut cache: HashMap<String, Value> = HashMap::new();

        let properties = {
            let mut lookup = |reference: &Reference| -> std::result::Result<Option<Value>, String> {
                let Reference::Secret(name) = reference else {
                    return Ok(None);
                };
                if let Some(value) = cache.get(name) {
                    return Ok(Some(value.clone()));
                }
                let secret = self
                    .secrets
                    .resolve(name, scope)
                    .map_err(|e| e.to_string())?;
                let value = Value::String(secret.value.expose().to_string());
                cache.insert(name.clone(), value.clone());
                resolved.push(secret);
                Ok(Some(value))
            };

            templates
                .iter()
                .map(|(key, value)| {
                    reference::substitute(value, &mut lookup).map(|v| (key.clone(), v))
                })
                .collect::<std::result::Result<Properties, String>>()?
        };

        Ok((properties, resolved))
    }
}

/// Action indexes by (phase, level), in plan order
fn schedule(plan: &Plan) -> BTreeMap<(Phase, usize), Vec<usize>> {
    let mut levels: BTreeMap<(Phase, usize), Vec<usize>> = BTreeMap::new();
    for (index, action) in plan.actions.iter().enumerate() {
        levels
            .entry((action.phase, action.level))
            .or_default()
            .push(index);
    }
    levels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StateStoreError;
    use crate::manifest::{self, Format};
    use crate::planner::{self, plan_destroy};
    use crate::provider::memory::{MemoryProvider, Operation};
    use crate::report::RunStatus;
    use crate::retry::RetryConfig;
    use crate::state::{FileStateStore, MemoryStateStore, StateSnapshot};
    use serde_json::json;
    use std::collections::BTreeSet;

    const PLATFORM: &str = r#"
[secrets.db-password]
source = "env"
var = "PDNS_DB_PASSWORD"

[[resources]]
type = "container_app"
name = "cache"
[resources.properties]
image = "redis:7"

[[resources]]
type = "container_app"
name = "db"
[resources.properties]
image = "postgres:16"
secrets = [{ name = "db-password", valueRef = "db-password" }]
env = [{ name = "POSTGRES_PASSWORD", secretRef = "db-password" }]

[[resources]]
type = "container_app"
name = "dns-server"
depends_on = ["container_app.db"]
[resources.properties]
image = "powerdns/pdns-auth-48"
secrets = [{ name = "db-password", valueRef = "db-password" }]
env = [
    { name = "PDNS_gpgsql_host", value = "${container_app.db.name}" },
    { name = "PDNS_gpgsql_password", secretRef = "db-password" },
]

[[resources]]
type = "container_app"
name = "proxy"
depends_on = ["container_app.cache"]
[resources.properties]
image = "caddy:2"
env = [{ name = "UPSTREAM", value = "${container_app.dns-server.fqdn}" }]

[[resources]]
type = "container_app"
name = "manager"
depends_on = ["container_app.cache", "container_app.dns-server"]
[resources.properties]
image = "powerdns-admin:latest"
env = [{ name = "PDNS_API_URL", value = "http://${container_app.dns-server.name}:8081" }]
"#;

    fn platform() -> ResourceGraph {
        manifest::load_str(PLATFORM, Format::Toml).unwrap()
    }

    fn secrets(graph: &ResourceGraph) -> SecretMaterializer {
        SecretMaterializer::new(graph.secrets().clone())
            .with_env_lookup(|var| (var == "PDNS_DB_PASSWORD").then(|| "hunter2".to_string()))
    }

    fn options() -> ExecuteOptions {
        ExecuteOptions {
            concurrency: 4,
            retry: RetryConfig {
                max_attempts: 5,
                base_delay: Duration::from_millis(1),
                backoff_factor: 2.0,
                max_delay: Duration::from_millis(5),
            },
            allow_destructive: false,
        }
    }

    fn apply(
        graph: &ResourceGraph,
        state: &dyn StateStore,
        provider: &dyn Provider,
        options: ExecuteOptions,
    ) -> ApplyReport {
        let snapshot = state.snapshot().unwrap();
        let plan = planner::plan(graph, &snapshot).unwrap();
        let materializer = secrets(graph);
        Executor::new(graph, state, provider, &materializer)
            .with_options(options)
            .execute(&plan)
            .unwrap()
    }

    fn outcome(report: &ApplyReport, id: &str) -> ActionOutcome {
        report.outcome_of(id).unwrap()
    }

    fn chain() -> ResourceGraph {
        let app = |name: &str, deps: &[&str]| Resource {
            id: Resource::make_id(ResourceType::ContainerApp, name),
            resource_type: ResourceType::ContainerApp,
            name: name.to_string(),
            properties: Properties::from([("image".to_string(), json!("busybox"))]),
            depends_on: deps.iter().map(|d| format!("container_app.{d}")).collect(),
            parent: None,
        };
        ResourceGraph::new(
            vec![app("a", &[]), app("b", &["a"]), app("c", &["b"])],
            BTreeMap::new(),
        )
        .unwrap()
    }

    /// Store that refuses writes for one resource id
    struct FailingStore {
        inner: MemoryStateStore,
        fail_for: String,
    }

    impl StateStore for FailingStore {
        fn snapshot(&self) -> std::result::Result<StateSnapshot, StateStoreError> {
            self.inner.snapshot()
        }
        fn get(&self, id: &str) -> std::result::Result<Option<LiveStateRecord>, StateStoreError> {
            self.inner.get(id)
        }
        fn put(&self, record: LiveStateRecord) -> std::result::Result<(), StateStoreError> {
            if record.resource_id == self.fail_for {
                return Err(StateStoreError::Unavailable("disk full".into()));
            }
            self.inner.put(record)
        }
        fn remove(&self, id: &str) -> std::result::Result<(), StateStoreError> {
            self.inner.remove(id)
        }
    }

    struct CancelOnFirstComplete(CancelToken);

    impl ProgressCallback for CancelOnFirstComplete {
        fn on_level_start(&self, _: Phase, _: usize, _: usize) {}
        fn on_action_start(&self, _: &PlannedAction) {}
        fn on_action_complete(&self, _: &PlannedAction, _: &ApplyResult) {
            self.0.cancel();
        }
        fn on_retry(&self, _: &str, _: u32, _: u32, _: &ProviderError, _: Duration) {}
    }

    #[test]
    fn test_apply_is_idempotent() {
        let graph = platform();
        let state = MemoryStateStore::new();
        let provider = MemoryProvider::new();

        let report = apply(&graph, &state, &provider, options());
        assert_eq!(report.status, RunStatus::Complete);
        assert_eq!(report.summary().created, 5);
        assert_eq!(provider.call_count(), 5);

        let replan = planner::plan(&graph, &state.snapshot().unwrap()).unwrap();
        assert!(!replan.has_changes());

        let second = apply(&graph, &state, &provider, options());
        assert_eq!(second.status, RunStatus::Complete);
        assert_eq!(second.summary().unchanged, 5);
        assert_eq!(provider.call_count(), 5);
    }

    #[test]
    fn test_dependents_start_after_dependencies_finish() {
        let graph = platform();
        let state = MemoryStateStore::new();
        let provider = MemoryProvider::new().with_latency(Duration::from_millis(15));
        apply(&graph, &state, &provider, options());

        let calls = provider.calls();
        let call = |id: &str| calls.iter().find(|c| c.resource_id == id).unwrap();
        for resource in graph.resources() {
            for dep in graph.dependencies(&resource.id) {
                assert!(
                    call(&resource.id).started >= call(dep).finished,
                    "{} started before {dep} finished",
                    resource.id
                );
            }
        }
    }

    #[test]
    fn test_same_level_runs_concurrently() {
        let graph = platform();
        let state = MemoryStateStore::new();
        let provider = MemoryProvider::new().with_latency(Duration::from_millis(50));
        apply(&graph, &state, &provider, options());

        let calls = provider.calls();
        let call = |id: &str| calls.iter().find(|c| c.resource_id == id).unwrap();
        let cache = call("container_app.cache");
        let db = call("container_app.db");
        assert!(cache.started < db.finished && db.started < cache.finished);
    }

    #[test]
    fn test_cycle_rejected_before_any_remote_call() {
        let doc = r#"
[[resources]]
type = "container_app"
name = "x"
depends_on = ["container_app.y"]
properties = { image = "busybox" }

[[resources]]
type = "container_app"
name = "y"
depends_on = ["container_app.x"]
properties = { image = "busybox" }
"#;
        let provider = MemoryProvider::new();
        let err = manifest::load_str(doc, Format::Toml).unwrap_err();
        assert!(matches!(err, Error::Cycle(ref cycle) if cycle.members.len() == 2));
        assert!(err.is_validation());
        assert_eq!(provider.call_count(), 0);
    }

    #[test]
    fn test_partial_failure_is_contained() {
        let graph = chain();
        let state = MemoryStateStore::new();
        let provider = MemoryProvider::new();
        provider.fail_always(
            "container_app.b",
            ProviderError::Permanent("invalid image".into()),
        );

        let report = apply(&graph, &state, &provider, options());
        assert_eq!(outcome(&report, "container_app.a"), ActionOutcome::Succeeded);
        assert_eq!(outcome(&report, "container_app.b"), ActionOutcome::Failed);
        assert_eq!(outcome(&report, "container_app.c"), ActionOutcome::Skipped);
        assert_eq!(report.status, RunStatus::PartialFailure);

        // Permanent errors are not retried, skipped actions make no call
        assert_eq!(provider.call_count(), 2);
        let snapshot = state.snapshot().unwrap();
        assert!(snapshot.contains("container_app.a"));
        assert!(!snapshot.contains("container_app.b"));
    }

    #[test]
    fn test_platform_scenario_with_failing_db() {
        let graph = platform();
        let state = MemoryStateStore::new();
        let provider = MemoryProvider::new();
        provider.fail_always(
            "container_app.db",
            ProviderError::Permanent("quota exceeded".into()),
        );

        let report = apply(&graph, &state, &provider, options());
        assert_eq!(outcome(&report, "container_app.cache"), ActionOutcome::Succeeded);
        assert_eq!(outcome(&report, "container_app.db"), ActionOutcome::Failed);
        for skipped in [
            "container_app.dns-server",
            "container_app.proxy",
            "container_app.manager",
        ] {
            assert_eq!(outcome(&report, skipped), ActionOutcome::Skipped);
        }
        assert_eq!(report.status, RunStatus::PartialFailure);
    }

    #[test]
    fn test_destroy_tears_down_in_reverse_order() {
        let graph = chain();
        let state = MemoryStateStore::new();
        let provider = MemoryProvider::new();
        apply(&graph, &state, &provider, options());

        let plan = plan_destroy(&state.snapshot().unwrap(), Some(&graph)).unwrap();
        let materializer = secrets(&graph);
        let report = Executor::new(&graph, &state, &provider, &materializer)
            .with_options(options())
            .execute(&plan)
            .unwrap();
        assert_eq!(report.status, RunStatus::Complete);

        let deletes: Vec<String> = provider
            .calls()
            .into_iter()
            .filter(|c| c.operation == Operation::Delete)
            .map(|c| c.resource_id)
            .collect();
        assert_eq!(
            deletes,
            vec!["container_app.c", "container_app.b", "container_app.a"]
        );
        assert!(state.snapshot().unwrap().is_empty());
        assert!(provider.live_ids().is_empty());
    }

    #[test]
    fn test_secrets_never_reach_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let graph = platform();
        let provider = MemoryProvider::new().with_echo();

        {
            let state = FileStateStore::open(&path).unwrap();
            let report = apply(&graph, &state, &provider, options());
            assert!(report.is_complete());
            state.close().unwrap();
        }

        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert!(!on_disk.contains("hunter2"));
        assert!(on_disk.contains("<redacted>"));
        assert!(on_disk.contains("${container_app.db.name}"));

        // The provider did receive the plaintext
        let db = provider.live_properties("/container_app/db").unwrap();
        assert_eq!(db["secrets"][0]["value"], json!("hunter2"));
    }

    #[test]
    fn test_shared_secret_identical_for_each_consumer() {
        let graph = platform();
        let state = MemoryStateStore::new();
        let provider = MemoryProvider::new();
        apply(&graph, &state, &provider, options());

        let db = provider.live_properties("/container_app/db").unwrap();
        let dns = provider.live_properties("/container_app/dns-server").unwrap();
        assert_eq!(db["secrets"][0]["value"], dns["secrets"][0]["value"]);
    }

    #[test]
    fn test_references_resolved_from_earlier_actions() {
        let graph = platform();
        let state = MemoryStateStore::new();
        let provider = MemoryProvider::new();
        apply(&graph, &state, &provider, options());

        let dns = provider.live_properties("/container_app/dns-server").unwrap();
        assert_eq!(dns["env"][0]["value"], json!("db"));
        let proxy = provider.live_properties("/container_app/proxy").unwrap();
        assert_eq!(proxy["env"][0]["value"], json!("dns-server.internal"));
        let manager = provider.live_properties("/container_app/manager").unwrap();
        assert_eq!(manager["env"][0]["value"], json!("http://dns-server:8081"));
    }

    #[test]
    fn test_missing_secret_fails_only_its_resource() {
        let graph = platform();
        let state = MemoryStateStore::new();
        let provider = MemoryProvider::new();
        let snapshot = state.snapshot().unwrap();
        let plan = planner::plan(&graph, &snapshot).unwrap();
        let materializer = SecretMaterializer::new(graph.secrets().clone()).with_env_lookup(|_| None);

        let report = Executor::new(&graph, &state, &provider, &materializer)
            .with_options(options())
            .execute(&plan)
            .unwrap();
        assert_eq!(outcome(&report, "container_app.cache"), ActionOutcome::Succeeded);
        assert_eq!(outcome(&report, "container_app.db"), ActionOutcome::Failed);
        assert_eq!(outcome(&report, "container_app.dns-server"), ActionOutcome::Skipped);
        let db = report
            .results
            .iter()
            .find(|r| r.resource_id == "container_app.db")
            .unwrap();
        assert!(db.error.as_deref().unwrap().contains("PDNS_DB_PASSWORD"));
    }

    #[test]
    fn test_transient_errors_retried() {
        let graph = chain();
        let state = MemoryStateStore::new();
        let provider = MemoryProvider::new();
        provider.fail_next(
            "container_app.a",
            [
                ProviderError::Transient("503".into()),
                ProviderError::Transient("timeout".into()),
            ],
        );

        let report = apply(&graph, &state, &provider, options());
        assert!(report.is_complete());
        let a = report
            .results
            .iter()
            .find(|r| r.resource_id == "container_app.a")
            .unwrap();
        assert_eq!(a.attempts, 3);
    }

    #[test]
    fn test_retries_exhausted_fail_the_action() {
        let graph = chain();
        let state = MemoryStateStore::new();
        let provider = MemoryProvider::new();
        provider.fail_always("container_app.a", ProviderError::Transient("429".into()));

        let report = apply(&graph, &state, &provider, options());
        let a = report
            .results
            .iter()
            .find(|r| r.resource_id == "container_app.a")
            .unwrap();
        assert_eq!(a.outcome, ActionOutcome::Failed);
        assert_eq!(a.attempts, 5);
        assert_eq!(report.status, RunStatus::PartialFailure);
    }

    #[test]
    fn test_state_write_failure_fails_the_action() {
        let graph = chain();
        let state = FailingStore {
            inner: MemoryStateStore::new(),
            fail_for: "container_app.b".to_string(),
        };
        let provider = MemoryProvider::new();

        let report = apply(&graph, &state, &provider, options());
        assert_eq!(outcome(&report, "container_app.b"), ActionOutcome::Failed);
        assert_eq!(outcome(&report, "container_app.c"), ActionOutcome::Skipped);
        assert_eq!(report.status, RunStatus::PartialFailure);
    }

    #[test]
    fn test_cancel_before_start_skips_everything() {
        let graph = platform();
        let state = MemoryStateStore::new();
        let provider = MemoryProvider::new();
        let plan = planner::plan(&graph, &StateSnapshot::default()).unwrap();
        let token = CancelToken::new();
        token.cancel();

        let materializer = secrets(&graph);
        let report = Executor::new(&graph, &state, &provider, &materializer)
            .with_cancel(token)
            .execute(&plan)
            .unwrap();
        assert_eq!(report.status, RunStatus::Cancelled);
        assert!(report.results.iter().all(|r| r.outcome == ActionOutcome::Skipped));
        assert_eq!(provider.call_count(), 0);
    }

    #[test]
    fn test_cancel_mid_run_lets_in_flight_finish() {
        let graph = chain();
        let state = MemoryStateStore::new();
        let provider = MemoryProvider::new();
        let plan = planner::plan(&graph, &StateSnapshot::default()).unwrap();
        let token = CancelToken::new();
        let progress = CancelOnFirstComplete(token.clone());

        let materializer = secrets(&graph);
        let report = Executor::new(&graph, &state, &provider, &materializer)
            .with_options(options())
            .with_progress(&progress)
            .with_cancel(token)
            .execute(&plan)
            .unwrap();
        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(outcome(&report, "container_app.a"), ActionOutcome::Succeeded);
        assert_eq!(outcome(&report, "container_app.b"), ActionOutcome::Skipped);
        assert_eq!(provider.call_count(), 1);
    }

    #[test]
    fn test_replace_requires_permission() {
        let storage = |location: &str| {
            let doc = format!(
                "[[resources]]\ntype = \"storage_account\"\nname = \"data\"\n\
                 [resources.properties]\nlocation = \"{location}\"\nsku = \"Standard_LRS\"\n"
            );
            manifest::load_str(&doc, Format::Toml).unwrap()
        };
        let state = MemoryStateStore::new();
        let provider = MemoryProvider::new();
        apply(&storage("northeurope"), &state, &provider, options());
        assert_eq!(provider.call_count(), 1);

        let moved = storage("westeurope");
        let report = apply(&moved, &state, &provider, options());
        assert_eq!(report.status, RunStatus::PartialFailure);
        assert!(report.results[0].error.as_deref().unwrap().contains("requires confirmation"));
        assert_eq!(report.results[1].outcome, ActionOutcome::Skipped);
        assert_eq!(provider.call_count(), 1);

        let report = apply(
            &moved,
            &state,
            &provider,
            ExecuteOptions {
                allow_destructive: true,
                ..options()
            },
        );
        assert!(report.is_complete());
        let operations: Vec<Operation> = provider.calls().iter().map(|c| c.operation).collect();
        assert_eq!(
            operations,
            vec![Operation::Create, Operation::Delete, Operation::Create]
        );
        let record = state.get("storage_account.data").unwrap().unwrap();
        assert_eq!(record.last_applied_properties["location"], json!("westeurope"));
    }

    fn storage(location: &str) -> ResourceGraph {
        let doc = format!(
            r#"
[[resources]]
type = "storage_account"
name = "data"
[resources.properties]
location = "{location}"
sku = "Standard_LRS"
kind = "StorageV2"

[[resources]]
type = "file_service"
name = "default"
parent = "storage_account.data"

[[resources]]
type = "file_share"
name = "pg"
parent = "file_service.default"
[resources.properties]
quota = 10
"#
        );
        manifest::load_str(&doc, Format::Toml).unwrap()
    }

    fn operations_since(provider: &MemoryProvider, start: usize) -> Vec<(Operation, String)> {
        provider.calls()[start..]
            .iter()
            .map(|c| (c.operation, c.resource_id.clone()))
            .collect()
    }

    #[test]
    fn test_replace_rebuilds_nested_resources() {
        let state = MemoryStateStore::new();
        let provider = MemoryProvider::new();
        apply(&storage("northeurope"), &state, &provider, options());
        assert_eq!(provider.call_count(), 3);

        let moved = storage("westeurope");
        let report = apply(
            &moved,
            &state,
            &provider,
            ExecuteOptions {
                allow_destructive: true,
                ..options()
            },
        );
        assert!(report.is_complete());
        assert_eq!(
            operations_since(&provider, 3),
            vec![
                (Operation::Delete, "file_share.pg".to_string()),
                (Operation::Delete, "file_service.default".to_string()),
                (Operation::Delete, "storage_account.data".to_string()),
                (Operation::Create, "storage_account.data".to_string()),
                (Operation::Create, "file_service.default".to_string()),
                (Operation::Create, "file_share.pg".to_string()),
            ]
        );

        let snapshot = state.snapshot().unwrap();
        assert_eq!(snapshot.resources.len(), 3);
        assert!(!planner::plan(&moved, &snapshot).unwrap().has_changes());
    }

    #[test]
    fn test_failed_child_delete_keeps_parent() {
        let state = MemoryStateStore::new();
        let provider = MemoryProvider::new();
        apply(&storage("northeurope"), &state, &provider, options());
        provider.fail_always(
            "file_share.pg",
            ProviderError::Permanent("share is locked".into()),
        );

        let report = apply(
            &storage("westeurope"),
            &state,
            &provider,
            ExecuteOptions {
                allow_destructive: true,
                ..options()
            },
        );
        assert_eq!(report.status, RunStatus::PartialFailure);
        assert_eq!(
            operations_since(&provider, 3),
            vec![(Operation::Delete, "file_share.pg".to_string())]
        );
        assert_eq!(outcome(&report, "storage_account.data"), ActionOutcome::Skipped);
        assert_eq!(state.snapshot().unwrap().resources.len(), 3);
    }

    const UPSTREAM: &str = r#"
[[resources]]
type = "container_app"
name = "y"
[resources.properties]
image = "redis"

[[resources]]
type = "container_app"
name = "x"
depends_on = ["container_app.y"]
[resources.properties]
image = "caddy:1"
env = [{ name = "UPSTREAM", value = "${container_app.y.name}" }]
"#;

    const WITHOUT_UPSTREAM: &str = r#"
[[resources]]
type = "container_app"
name = "x"
[resources.properties]
image = "caddy:2"
"#;

    #[test]
    fn test_undeclared_dependency_deleted_after_dependent_updates() {
        let state = MemoryStateStore::new();
        let provider = MemoryProvider::new();
        apply(
            &manifest::load_str(UPSTREAM, Format::Toml).unwrap(),
            &state,
            &provider,
            options(),
        );
        assert_eq!(provider.call_count(), 2);

        let report = apply(
            &manifest::load_str(WITHOUT_UPSTREAM, Format::Toml).unwrap(),
            &state,
            &provider,
            options(),
        );
        assert!(report.is_complete());
        assert_eq!(
            operations_since(&provider, 2),
            vec![
                (Operation::Update, "container_app.x".to_string()),
                (Operation::Delete, "container_app.y".to_string()),
            ]
        );
        assert!(!state.snapshot().unwrap().contains("container_app.y"));
    }

    #[test]
    fn test_undeclared_dependency_kept_when_dependent_fails() {
        let state = MemoryStateStore::new();
        let provider = MemoryProvider::new();
        apply(
            &manifest::load_str(UPSTREAM, Format::Toml).unwrap(),
            &state,
            &provider,
            options(),
        );
        provider.fail_always(
            "container_app.x",
            ProviderError::Permanent("invalid image".into()),
        );

        let report = apply(
            &manifest::load_str(WITHOUT_UPSTREAM, Format::Toml).unwrap(),
            &state,
            &provider,
            options(),
        );
        assert_eq!(report.status, RunStatus::PartialFailure);
        assert_eq!(outcome(&report, "container_app.y"), ActionOutcome::Skipped);
        assert_eq!(
            operations_since(&provider, 2),
            vec![(Operation::Update, "container_app.x".to_string())]
        );
        assert!(state.snapshot().unwrap().contains("container_app.y"));
    }

    #[test]
    fn test_recorded_dependencies_include_implicit_edges() {
        let graph = platform();
        let state = MemoryStateStore::new();
        let provider = MemoryProvider::new();
        apply(&graph, &state, &provider, options());

        let proxy = state.get("container_app.proxy").unwrap().unwrap();
        let expected: BTreeSet<String> = ["container_app.cache", "container_app.dns-server"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(proxy.depends_on, expected);
    }
}
