//! Planner - diffs desired resources against stored state
//!
//! A plan has up to three phases:
//!
//! - Teardown deletes what must go before anything is rebuilt: resources no
//!   longer declared, and the old copy of every replaced resource. Dependents
//!   are deleted before their dependencies.
//! - Converge walks the declared resources in dependency order and decides
//!   Create, Update or NoOp for each. A replaced resource is created again here.
//! - Cleanup deletes undeclared resources that a live declared resource still
//!   depended on, once that resource has converged away from them.
//!
//! Replacing a resource replaces everything that depends on it, since its
//! provider id changes and the remote API removes nested resources with it.

use crate::error::{DependencyCycleError, ManifestError};
use crate::graph::{self, DependencyMap, ResourceGraph};
use crate::state::{LiveStateRecord, StateSnapshot};
use crate::types::{ActionKind, Phase, PlannedAction, Properties, Resource, ResourceType};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Something odd about one resource that did not stop planning
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub resource: String,
    pub message: String,
}

/// Ordered list of actions for one run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Plan {
    pub actions: Vec<PlannedAction>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
}

/// Action counts for display
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
    /// Delete + create pairs, counted once
    pub replace: usize,
    pub noop: usize,
    pub destructive: usize,
}

impl PlanSummary {
    pub fn changes(&self) -> usize {
        self.create + self.update + self.delete + self.replace
    }
}

impl Plan {
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for action in &self.actions {
            match (action.kind, action.replace) {
                (ActionKind::Create, true) => summary.replace += 1,
                (ActionKind::Delete, true) => {}
                (ActionKind::Create, false) => summary.create += 1,
                (ActionKind::Update, _) => summary.update += 1,
                (ActionKind::Delete, false) => summary.delete += 1,
                (ActionKind::NoOp, _) => summary.noop += 1,
            }
            if action.destructive && !(action.replace && action.kind == ActionKind::Create) {
                summary.destructive += 1;
            }
        }
        summary
    }

    /// Whether executing the plan would call the provider
    pub fn has_changes(&self) -> bool {
        self.actions.iter().any(|a| a.kind.is_change())
    }

    pub fn has_destructive(&self) -> bool {
        self.actions.iter().any(|a| a.destructive)
    }

    /// Actions that change something, in execution order
    pub fn changes(&self) -> impl Iterator<Item = &PlannedAction> {
        self.actions.iter().filter(|a| a.kind.is_change())
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Options that narrow a plan
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// Restrict converge actions to these ids and their dependencies; skips teardown
    pub targets: Option<BTreeSet<String>>,
}

/// Resolve `--target` patterns (`type` or `type.name`) to resource ids
pub fn resolve_targets(
    graph: &ResourceGraph,
    patterns: &[String],
) -> Result<BTreeSet<String>, ManifestError> {
    let mut selected = BTreeSet::new();
    for pattern in patterns {
        let matched: Vec<&Resource> = graph
            .resources()
            .filter(|r| r.id == *pattern || r.resource_type.as_str() == pattern)
            .collect();
        if matched.is_empty() {
            return Err(ManifestError::UnknownTarget(pattern.clone()));
        }
        selected.extend(matched.into_iter().map(|r| r.id.clone()));
    }
    Ok(selected)
}

/// Plan a full reconcile of `graph` against `snapshot`
pub fn plan(graph: &ResourceGraph, snapshot: &StateSnapshot) -> Result<Plan, DependencyCycleError> {
    plan_with(graph, snapshot, &PlanOptions::default())
}

/// A declared resource, its usable state record and what to do with it
struct Decided<'a> {
    resource: &'a Resource,
    record: Option<&'a LiveStateRecord>,
    decision: Decision,
}

pub fn plan_with(
    graph: &ResourceGraph,
    snapshot: &StateSnapshot,
    options: &PlanOptions,
) -> Result<Plan, DependencyCycleError> {
    let levels = graph.levels()?;
    let mut plan = Plan::default();

    let mut decided: BTreeMap<&str, Decided<'_>> = BTreeMap::new();
    for id in levels.iter().flatten() {
        let Some(resource) = graph.get(id) else {
            continue;
        };
        let record = snapshot.get(id).filter(|record| {
            match ResourceType::parse(&record.resource_type) {
                Some(t) if t == resource.resource_type => true,
                _ => {
                    plan.diagnostics.push(Diagnostic {
                        resource: id.clone(),
                        message: format!(
                            "state records type '{}' but the manifest declares '{}'; ignoring the record",
                            record.resource_type, resource.resource_type
                        ),
                    });
                    false
                }
            }
        });
        decided.insert(
            id.as_str(),
            Decided {
                resource,
                record,
                decision: diff_resource(resource, record),
            },
        );
    }

    // A targeted replace still takes its dependents with it, so the selection
    // grows until it covers every dependent of a replaced resource
    let mut selected: Option<BTreeSet<String>> = options
        .targets
        .as_ref()
        .map(|targets| graph.with_dependencies(targets));
    let cascaded = loop {
        let seeds: BTreeSet<String> = decided
            .iter()
            .filter(|(id, d)| {
                matches!(d.decision, Decision::Replace { .. })
                    && selected.as_ref().is_none_or(|s| s.contains(**id))
            })
            .map(|(id, _)| (*id).to_string())
            .collect();
        let cascaded = dependents_of_replaced(&seeds, graph, snapshot);
        let Some(current) = &selected else {
            break cascaded;
        };
        let widened = graph.with_dependencies(
            current
                .iter()
                .chain(cascaded.keys().filter(|id| graph.contains(id))),
        );
        if widened.len() == current.len() {
            break cascaded;
        }
        selected = Some(widened);
    };
    let in_selection = |id: &str| selected.as_ref().is_none_or(|s| s.contains(id));

    for (id, origin) in &cascaded {
        if let Some(d) = decided.get_mut(id.as_str())
            && d.record.is_some()
            && !matches!(d.decision, Decision::Replace { .. })
        {
            let changed = match std::mem::replace(&mut d.decision, Decision::NoOp) {
                Decision::Update(changed) => changed,
                _ => Vec::new(),
            };
            d.decision = Decision::Replace {
                changed,
                cause: format!("depends on {origin}, which is replaced"),
            };
        }
    }

    let replaced: BTreeSet<&str> = decided
        .iter()
        .filter(|(id, d)| matches!(d.decision, Decision::Replace { .. }) && in_selection(**id))
        .map(|(id, _)| *id)
        .collect();

    let orphans: BTreeMap<&str, &LiveStateRecord> = snapshot
        .resources
        .values()
        .filter(|record| !graph.contains(&record.resource_id))
        .map(|record| (record.resource_id.as_str(), record))
        .collect();

    // Orphans a live declared resource still points at wait until it converged
    let mut late: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
    if selected.is_none() {
        for (id, d) in &decided {
            if replaced.contains(id) {
                continue;
            }
            let Some(record) = d.record else {
                continue;
            };
            for dep in record.depends_on.iter().chain(record.parent.iter()) {
                if orphans.contains_key(dep.as_str()) && !cascaded.contains_key(dep) {
                    late.entry(dep.as_str()).or_default().insert((*id).to_string());
                }
            }
        }
        let mut stack: Vec<&str> = late.keys().copied().collect();
        while let Some(id) = stack.pop() {
            let Some(&record) = orphans.get(id) else {
                continue;
            };
            for dep in record.depends_on.iter().chain(record.parent.iter()) {
                if orphans.contains_key(dep.as_str())
                    && !cascaded.contains_key(dep)
                    && !late.contains_key(dep.as_str())
                {
                    late.insert(dep.as_str(), BTreeSet::new());
                    stack.push(dep.as_str());
                }
            }
        }
    }

    let mut removals: Vec<Removal<'_>> = orphans
        .iter()
        .filter(|(id, _)| {
            if selected.is_some() {
                cascaded.contains_key(**id)
            } else {
                !late.contains_key(**id)
            }
        })
        .map(|(_, record)| Removal::orphan(*record))
        .collect();
    for id in &replaced {
        let d = &decided[id];
        if let (Some(record), Decision::Replace { changed, cause }) = (d.record, &d.decision) {
            removals.push(Removal {
                record,
                replace: Some((replace_reason(d.resource, cause), changed.clone())),
                after: BTreeSet::new(),
            });
        }
    }
    // A dependent goes before the replaced resource it was pulled in by,
    // unless state records the edge the other way round
    let mut cascade_edges = DependencyMap::new();
    for (id, origin) in &cascaded {
        let reversed = snapshot.get(origin).is_some_and(|record| {
            record.depends_on.contains(id) || record.parent.as_ref() == Some(id)
        });
        if !reversed {
            cascade_edges
                .entry(id.clone())
                .or_default()
                .insert(origin.clone());
        }
    }
    schedule_deletes(removals, &cascade_edges, Phase::Teardown, &mut plan)?;

    for (level, ids) in levels.iter().enumerate() {
        for id in ids {
            if !in_selection(id.as_str()) {
                continue;
            }
            let Some(d) = decided.get(id.as_str()) else {
                continue;
            };
            let depends_on: Vec<String> = graph
                .dependencies(id)
                .filter(|dep| in_selection(dep.as_str()))
                .cloned()
                .collect();
            let base = PlannedAction {
                resource: id.clone(),
                resource_type: d.resource.resource_type,
                kind: ActionKind::NoOp,
                reason: String::new(),
                phase: Phase::Converge,
                level,
                depends_on,
                destructive: false,
                replace: false,
                changed: Vec::new(),
            };

            plan.actions.push(match &d.decision {
                Decision::Create(reason) => PlannedAction {
                    kind: ActionKind::Create,
                    reason: reason.clone(),
                    ..base
                },
                Decision::Update(changed) => PlannedAction {
                    kind: ActionKind::Update,
                    reason: format!("changed: {}", changed.join(", ")),
                    changed: changed.clone(),
                    ..base
                },
                Decision::Replace { changed, cause } => PlannedAction {
                    kind: ActionKind::Create,
                    reason: replace_reason(d.resource, cause),
                    destructive: true,
                    replace: true,
                    changed: changed.clone(),
                    ..base
                },
                Decision::NoOp => PlannedAction {
                    reason: "up to date".to_string(),
                    ..base
                },
            });
        }
    }

    let cleanup: Vec<Removal<'_>> = late
        .into_iter()
        .filter_map(|(id, after)| {
            orphans.get(id).map(|record| Removal {
                after,
                ..Removal::orphan(*record)
            })
        })
        .collect();
    schedule_deletes(cleanup, &DependencyMap::new(), Phase::Cleanup, &mut plan)?;

    log::debug!(
        "Planned {} actions ({} replaced, {} diagnostics)",
        plan.actions.len(),
        replaced.len(),
        plan.diagnostics.len()
    );
    Ok(plan)
}

/// Plan deletion of everything recorded in state.
///
/// Ordering uses the recorded dependencies, plus the manifest's edges when a
/// manifest is available.
pub fn plan_destroy(
    snapshot: &StateSnapshot,
    graph: Option<&ResourceGraph>,
) -> Result<Plan, DependencyCycleError> {
    let removals = snapshot.resources.values().map(Removal::orphan).collect();
    let manifest_edges = graph.map(|g| g.edges().clone()).unwrap_or_default();
    let mut plan = Plan::default();
    schedule_deletes(removals, &manifest_edges, Phase::Teardown, &mut plan)?;
    Ok(plan)
}

/// Every resource, declared or only recorded, that transitively depends on
/// one of `seeds`, mapped to the dependency that pulled it in
fn dependents_of_replaced(
    seeds: &BTreeSet<String>,
    graph: &ResourceGraph,
    snapshot: &StateSnapshot,
) -> BTreeMap<String, String> {
    let mut dependents: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for (id, deps) in graph.edges() {
        for dep in deps {
            dependents.entry(dep.as_str()).or_default().insert(id.as_str());
        }
    }
    for record in snapshot.resources.values() {
        for dep in record.depends_on.iter().chain(record.parent.iter()) {
            dependents
                .entry(dep.as_str())
                .or_default()
                .insert(record.resource_id.as_str());
        }
    }

    let mut origin: BTreeMap<String, String> = BTreeMap::new();
    let mut queue: VecDeque<&str> = seeds.iter().map(String::as_str).collect();
    while let Some(id) = queue.pop_front() {
        for dependent in dependents.get(id).into_iter().flatten().copied() {
            if seeds.contains(dependent) || origin.contains_key(dependent) {
                continue;
            }
            origin.insert(dependent.to_string(), id.to_string());
            queue.push_back(dependent);
        }
    }
    origin
}

fn replace_reason(resource: &Resource, cause: &str) -> String {
    let mut reason = format!("replace: {cause}");
    if resource.is_stateful() {
        reason.push_str("; data loss: existing data is not carried over");
    }
    reason
}

enum Decision {
    Create(String),
    Update(Vec<String>),
    Replace { changed: Vec<String>, cause: String },
    NoOp,
}

fn diff_resource(resource: &Resource, record: Option<&LiveStateRecord>) -> Decision {
    let Some(record) = record else {
        return Decision::Create("not in state".to_string());
    };

    let changed = changed_properties(&resource.properties, &record.last_applied_properties);
    let immutable: Vec<&String> = changed
        .iter()
        .filter(|p| resource.resource_type.immutable_properties().contains(&p.as_str()))
        .collect();

    if resource.parent != record.parent {
        return Decision::Replace {
            cause: format!(
                "parent changed from {} to {}",
                record.parent.as_deref().unwrap_or("none"),
                resource.parent.as_deref().unwrap_or("none")
            ),
            changed,
        };
    }
    if !immutable.is_empty() {
        let names: Vec<&str> = immutable.iter().map(|s| s.as_str()).collect();
        return Decision::Replace {
            cause: format!("immutable {} changed", names.join(", ")),
            changed,
        };
    }
    if !changed.is_empty() {
        return Decision::Update(changed);
    }
    Decision::NoOp
}

/// Top-level property names whose values differ
fn changed_properties(desired: &Properties, applied: &Properties) -> Vec<String> {
    desired
        .keys()
        .chain(applied.keys())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .filter(|key| desired.get(*key) != applied.get(*key))
        .cloned()
        .collect()
}

/// Whether deleting the recorded resource destroys data
fn record_is_stateful(resource_type: ResourceType, record: &LiveStateRecord) -> bool {
    resource_type.holds_persistent_data()
        || record
            .last_applied_properties
            .get("volumes")
            .and_then(serde_json::Value::as_array)
            .is_some_and(|v| !v.is_empty())
}

/// A recorded resource to delete
struct Removal<'a> {
    record: &'a LiveStateRecord,
    /// Reason and changed properties when this is the delete half of a replace
    replace: Option<(String, Vec<String>)>,
    /// Converge actions that must succeed first
    after: BTreeSet<String>,
}

impl<'a> Removal<'a> {
    fn orphan(record: &'a LiveStateRecord) -> Self {
        Self {
            record,
            replace: None,
            after: BTreeSet::new(),
        }
    }
}

/// Delete actions for `removals` in `phase`, dependents before dependencies.
///
/// Ordering uses the recorded edges plus `extra` (id → ids it depends on).
fn schedule_deletes(
    removals: Vec<Removal<'_>>,
    extra: &DependencyMap,
    phase: Phase,
    plan: &mut Plan,
) -> Result<(), DependencyCycleError> {
    let mut typed: BTreeMap<&str, (ResourceType, Removal<'_>)> = BTreeMap::new();
    for removal in removals {
        let record = removal.record;
        match ResourceType::parse(&record.resource_type) {
            Some(t) => {
                typed.insert(record.resource_id.as_str(), (t, removal));
            }
            None => plan.diagnostics.push(Diagnostic {
                resource: record.resource_id.clone(),
                message: format!(
                    "unknown resource type '{}' in state; not deleted",
                    record.resource_type
                ),
            }),
        }
    }

    let mut deps = DependencyMap::new();
    for (id, (_, removal)) in &typed {
        let mut edges: BTreeSet<String> = removal.record.depends_on.clone();
        edges.extend(removal.record.parent.iter().cloned());
        if let Some(more) = extra.get(*id) {
            edges.extend(more.iter().cloned());
        }
        edges.retain(|dep| typed.contains_key(dep.as_str()));
        deps.insert((*id).to_string(), edges);
    }

    let mut dependents: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
    for (id, edges) in &deps {
        for dep in edges {
            dependents.entry(dep.as_str()).or_default().insert(id.clone());
        }
    }

    let mut forward = graph::levels(&deps)?;
    forward.reverse();

    for (level, ids) in forward.into_iter().enumerate() {
        for id in ids {
            let Some((resource_type, removal)) = typed.get(id.as_str()) else {
                continue;
            };
            let mut depends_on: BTreeSet<String> =
                dependents.get(id.as_str()).cloned().unwrap_or_default();
            depends_on.extend(removal.after.iter().cloned());

            let (reason, destructive, replace, changed) = match &removal.replace {
                Some((reason, changed)) => (reason.clone(), true, true, changed.clone()),
                None => {
                    let destructive = record_is_stateful(*resource_type, removal.record);
                    let mut reason = if removal.after.is_empty() {
                        "no longer declared".to_string()
                    } else {
                        format!(
                            "no longer declared; after {} converge",
                            removal.after.iter().cloned().collect::<Vec<_>>().join(", ")
                        )
                    };
                    if destructive {
                        reason.push_str("; data loss: stored data is deleted");
                    }
                    (reason, destructive, false, Vec::new())
                }
            };

            plan.actions.push(PlannedAction {
                depends_on: depends_on.into_iter().collect(),
                resource: id,
                resource_type: *resource_type,
                kind: ActionKind::Delete,
                reason,
                phase,
                level,
                destructive,
                replace,
                changed,
            });
        }
    }
    Ok(())
}
