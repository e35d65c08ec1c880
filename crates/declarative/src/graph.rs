//! Resource graph and dependency resolution
//!
//! Edges come from three places, all treated the same way:
//! explicit `depends_on`, property references, and parent/child nesting
//! (a child depends on its parent).
//!
//! Ordering uses Kahn's algorithm. Each round removes every node whose
//! dependencies are all resolved, which yields "levels" of mutually
//! independent resources. Nodes left over when no zero in-degree node remains
//! form (or sit behind) a cycle.

use crate::error::{DependencyCycleError, ManifestError};
use crate::reference::{self, Reference};
use crate::secrets::SecretSpec;
use crate::types::Resource;
use std::collections::{BTreeMap, BTreeSet};

/// Adjacency map: node id → ids it depends on
pub type DependencyMap = BTreeMap<String, BTreeSet<String>>;

/// Validated set of resources and the edges between them
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    resources: BTreeMap<String, Resource>,
    /// All edges (explicit ∪ implicit ∪ parent)
    edges: DependencyMap,
    /// Implicit edges only, from property references
    references: DependencyMap,
    secrets: BTreeMap<String, SecretSpec>,
}

impl ResourceGraph {
    /// Build a graph, resolving every edge against the given resources.
    ///
    /// Fails on dangling references and undeclared secrets. Does not check for
    /// cycles; call [`ResourceGraph::levels`] for that.
    pub fn new(
        resources: Vec<Resource>,
        secrets: BTreeMap<String, SecretSpec>,
    ) -> Result<Self, ManifestError> {
        let mut by_id = BTreeMap::new();
        for resource in resources {
            if by_id.contains_key(&resource.id) {
                return Err(ManifestError::DuplicateId(resource.id));
            }
            by_id.insert(resource.id.clone(), resource);
        }

        let mut edges = DependencyMap::new();
        let mut references = DependencyMap::new();

        for (id, resource) in &by_id {
            let mut deps: BTreeSet<String> = BTreeSet::new();

            for dep in &resource.depends_on {
                deps.insert(dep.clone());
            }
            if let Some(parent) = &resource.parent {
                deps.insert(parent.clone());
            }

            let mut found = Vec::new();
            for value in resource.properties.values() {
                reference::collect(value, &mut found).map_err(|message| {
                    ManifestError::InvalidProperty {
                        resource: id.clone(),
                        property: "properties".to_string(),
                        message,
                    }
                })?;
            }

            let mut implicit = BTreeSet::new();
            for r in found {
                match r {
                    Reference::Resource { id: target, .. } => {
                        implicit.insert(target);
                    }
                    Reference::Secret(name) => {
                        if !secrets.contains_key(&name) {
                            return Err(ManifestError::UndeclaredSecret {
                                resource: id.clone(),
                                secret: name,
                            });
                        }
                    }
                }
            }
            deps.extend(implicit.iter().cloned());

            for target in &deps {
                if !by_id.contains_key(target) {
                    return Err(ManifestError::DanglingReference {
                        resource: id.clone(),
                        target: target.clone(),
                    });
                }
            }

            edges.insert(id.clone(), deps);
            references.insert(id.clone(), implicit);
        }

        Ok(Self {
            resources: by_id,
            edges,
            references,
            secrets,
        })
    }

    pub fn get(&self, id: &str) -> Option<&Resource> {
        self.resources.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.resources.contains_key(id)
    }

    /// Resources in id order
    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn secrets(&self) -> &BTreeMap<String, SecretSpec> {
        &self.secrets
    }

    /// Every edge of the graph
    pub fn edges(&self) -> &DependencyMap {
        &self.edges
    }

    /// Direct dependencies of a resource
    pub fn dependencies(&self, id: &str) -> impl Iterator<Item = &String> {
        self.edges.get(id).into_iter().flatten()
    }

    /// Resources whose property values reference `id`
    pub fn referencing(&self, id: &str) -> impl Iterator<Item = &String> {
        self.references
            .iter()
            .filter(move |(_, targets)| targets.contains(id))
            .map(|(source, _)| source)
    }

    /// Topological levels of the graph.
    pub fn levels(&self) -> Result<Vec<Vec<String>>, DependencyCycleError> {
        levels(&self.edges)
    }

    /// The given ids plus everything they transitively depend on
    pub fn with_dependencies<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a String>,
    ) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<String> = ids.into_iter().cloned().collect();
        while let Some(id) = stack.pop() {
            if seen.insert(id.clone()) {
                stack.extend(self.dependencies(&id).cloned());
            }
        }
        seen
    }
}

/// Compute Kahn levels for a dependency map.
///
/// Every key is a node; dependencies on ids that are not keys are ignored,
/// which lets callers order a subset of a larger graph. Levels are sorted by
/// id so plans are reproducible.
pub fn levels(deps: &DependencyMap) -> Result<Vec<Vec<String>>, DependencyCycleError> {
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for (node, node_deps) in deps {
        let count = node_deps
            .iter()
            .filter(|d| deps.contains_key(*d))
            .inspect(|d| dependents.entry(d.as_str()).or_default().push(node.as_str()))
            .count();
        in_degree.insert(node.as_str(), count);
    }

    let mut current: Vec<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut result: Vec<Vec<String>> = Vec::new();
    let mut resolved = 0usize;

    while !current.is_empty() {
        resolved += current.len();
        let mut next = BTreeSet::new();
        for node in &current {
            for dependent in dependents.get(node).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        next.insert(*dependent);
                    }
                }
            }
        }
        result.push(current.iter().map(|s| (*s).to_string()).collect());
        current = next.into_iter().collect();
    }

    if resolved < deps.len() {
        let remaining: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(n, _)| *n)
            .collect();
        return Err(DependencyCycleError {
            members: cycle_members(deps, remaining),
        });
    }

    Ok(result)
}

/// Narrow the unresolved set down to nodes that sit on a cycle.
///
/// Nodes that merely depend on a cycle have no dependents among the
/// remaining nodes once peeled from the end, so they are dropped repeatedly.
fn cycle_members(deps: &DependencyMap, mut remaining: BTreeSet<&str>) -> Vec<String> {
    loop {
        let leaves: Vec<&str> = remaining
            .iter()
            .copied()
            .filter(|node| {
                !remaining.iter().any(|other| {
                    deps.get(*other)
                        .is_some_and(|other_deps| other_deps.contains(*node))
                })
            })
            .collect();
        if leaves.is_empty() {
            break;
        }
        for leaf in leaves {
            remaining.remove(leaf);
        }
    }
    remaining.into_iter().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Properties, ResourceType};
    use serde_json::json;

    fn app(name: &str, deps: &[&str]) -> Resource {
        Resource {
            id: Resource::make_id(ResourceType::ContainerApp, name),
            resource_type: ResourceType::ContainerApp,
            name: name.to_string(),
            properties: Properties::from([("image".to_string(), json!("busybox"))]),
            depends_on: deps.iter().map(|d| format!("container_app.{d}")).collect(),
            parent: None,
        }
    }

    fn dep_map(pairs: &[(&str, &[&str])]) -> DependencyMap {
        pairs
            .iter()
            .map(|(n, ds)| {
                (
                    n.to_string(),
                    ds.iter().map(|d| d.to_string()).collect::<BTreeSet<_>>(),
                )
            })
            .collect()
    }

    #[test]
    fn test_levels_for_platform_topology() {
        let graph = ResourceGraph::new(
            vec![
                app("cache", &[]),
                app("db", &[]),
                app("dns-server", &["db"]),
                app("proxy", &["cache", "dns-server"]),
                app("manager", &["cache", "dns-server"]),
            ],
            BTreeMap::new(),
        )
        .unwrap();

        let levels = graph.levels().unwrap();
        assert_eq!(
            levels,
            vec![
                vec!["container_app.cache", "container_app.db"],
                vec!["container_app.dns-server"],
                vec!["container_app.manager", "container_app.proxy"],
            ]
        );
    }

    #[test]
    fn test_cycle_detected_with_members() {
        let graph =
            ResourceGraph::new(vec![app("x", &["y"]), app("y", &["x"])], BTreeMap::new()).unwrap();
        let err = graph.levels().unwrap_err();
        assert_eq!(err.members, vec!["container_app.x", "container_app.y"]);
    }

    #[test]
    fn test_cycle_members_exclude_downstream_nodes() {
        let deps = dep_map(&[("a", &["b"]), ("b", &["a"]), ("c", &["a"]), ("d", &[])]);
        let err = levels(&deps).unwrap_err();
        assert_eq!(err.members, vec!["a", "b"]);
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let deps = dep_map(&[("a", &["a"]), ("b", &[])]);
        assert_eq!(levels(&deps).unwrap_err().members, vec!["a"]);
    }

    #[test]
    fn test_levels_ignore_foreign_nodes() {
        let deps = dep_map(&[("a", &["outside"]), ("b", &["a"])]);
        assert_eq!(levels(&deps).unwrap(), vec![vec!["a"], vec!["b"]]);
    }

    #[test]
    fn test_dangling_depends_on() {
        let err = ResourceGraph::new(vec![app("proxy", &["ghost"])], BTreeMap::new()).unwrap_err();
        assert!(matches!(
            err,
            ManifestError::DanglingReference { ref target, .. } if target == "container_app.ghost"
        ));
    }

    #[test]
    fn test_implicit_reference_edges() {
        let mut manager = app("manager", &[]);
        manager.properties.insert(
            "env".into(),
            json!([{ "name": "PDNS_URL", "value": "http://${container_app.dns-server.name}:8081" }]),
        );
        let graph =
            ResourceGraph::new(vec![app("dns-server", &[]), manager], BTreeMap::new()).unwrap();

        let deps: Vec<_> = graph.dependencies("container_app.manager").collect();
        assert_eq!(deps, vec!["container_app.dns-server"]);
        let referencing: Vec<_> = graph.referencing("container_app.dns-server").collect();
        assert_eq!(referencing, vec!["container_app.manager"]);
    }

    #[test]
    fn test_undeclared_secret_rejected() {
        let mut db = app("db", &[]);
        db.properties
            .insert("password".into(), json!("${secret.db-password}"));
        let err = ResourceGraph::new(vec![db], BTreeMap::new()).unwrap_err();
        assert!(matches!(err, ManifestError::UndeclaredSecret { .. }));
    }

    #[test]
    fn test_with_dependencies_is_transitive() {
        let graph = ResourceGraph::new(
            vec![app("a", &[]), app("b", &["a"]), app("c", &["b"]), app("d", &[])],
            BTreeMap::new(),
        )
        .unwrap();
        let target = "container_app.c".to_string();
        let closure = graph.with_dependencies([&target]);
        assert_eq!(
            closure.into_iter().collect::<Vec<_>>(),
            vec!["container_app.a", "container_app.b", "container_app.c"]
        );
    }
}
