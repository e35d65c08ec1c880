//! Manifest loading and validation
//!
//! A manifest is a TOML (or JSON) document with a `secrets` table and a
//! `resources` array. Loading is pure: parse, validate, build the graph and
//! make sure it is acyclic. Nothing here touches the provider or the state.

use crate::error::{Error, ManifestError};
use crate::graph::ResourceGraph;
use crate::reference::STORAGE_REF_KEY;
use crate::secrets::SecretSpec;
use crate::types::{Properties, Resource, ResourceType};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Document format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Toml,
    Json,
}

impl Format {
    /// Pick the format from a file extension, defaulting to TOML
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::Json,
            _ => Self::Toml,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestDocument {
    #[serde(default)]
    secrets: BTreeMap<String, RawSecret>,
    #[serde(default)]
    resources: Vec<RawResource>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSecret {
    source: Option<String>,
    var: Option<String>,
    key: Option<String>,
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawResource {
    #[serde(rename = "type")]
    resource_type: String,
    name: String,
    #[serde(default)]
    properties: Properties,
    #[serde(default, alias = "dependsOn")]
    depends_on: Vec<String>,
    #[serde(default)]
    parent: Option<String>,
}

/// Load a manifest file and resolve its graph.
pub fn load_path(path: &Path) -> Result<ResourceGraph, Error> {
    let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    log::debug!("Loading manifest from {}", path.display());
    load_str(&content, Format::from_path(path))
}

/// Parse a manifest document and resolve its graph.
///
/// Fails with [`Error::Manifest`] for invalid input and [`Error::Cycle`] when
/// the dependencies cannot be ordered.
pub fn load_str(content: &str, format: Format) -> Result<ResourceGraph, Error> {
    let graph = parse(content, format)?;
    let levels = graph.levels()?;
    log::debug!(
        "Manifest has {} resources in {} levels",
        graph.len(),
        levels.len()
    );
    Ok(graph)
}

/// Parse and validate without checking for cycles
pub fn parse(content: &str, format: Format) -> Result<ResourceGraph, ManifestError> {
    let document: ManifestDocument = match format {
        Format::Toml => toml::from_str(content).map_err(|e| ManifestError::Parse(e.to_string()))?,
        Format::Json => {
            serde_json::from_str(content).map_err(|e| ManifestError::Parse(e.to_string()))?
        }
    };

    let secrets = document
        .secrets
        .into_iter()
        .map(|(name, raw)| secret_spec(&name, raw).map(|spec| (name, spec)))
        .collect::<Result<BTreeMap<_, _>, _>>()?;

    let resources = document
        .resources
        .into_iter()
        .map(into_resource)
        .collect::<Result<Vec<_>, _>>()?;

    let ids: BTreeSet<&str> = resources.iter().map(|r| r.id.as_str()).collect();
    for resource in &resources {
        validate_parent(resource, &ids)?;
        validate_properties(resource)?;
    }

    ResourceGraph::new(resources, secrets)
}

fn secret_spec(name: &str, raw: RawSecret) -> Result<SecretSpec, ManifestError> {
    let missing = |field: &str| ManifestError::SecretSource {
        name: name.to_string(),
        message: format!("missing '{field}'"),
    };

    match raw.source.as_deref() {
        Some("env") => Ok(SecretSpec::Env {
            var: raw.var.ok_or_else(|| missing("var"))?,
        }),
        Some("vault") => Ok(SecretSpec::Vault {
            key: raw.key.ok_or_else(|| missing("key"))?,
        }),
        Some("literal") => Ok(SecretSpec::Literal {
            value: raw.value.ok_or_else(|| missing("value"))?,
        }),
        Some(other) => Err(ManifestError::SecretSource {
            name: name.to_string(),
            message: format!("unknown source '{other}' (expected env, vault or literal)"),
        }),
        None => Err(missing("source")),
    }
}

fn into_resource(raw: RawResource) -> Result<Resource, ManifestError> {
    let resource_type =
        ResourceType::parse(&raw.resource_type).ok_or_else(|| ManifestError::UnknownType {
            type_name: raw.resource_type.clone(),
            name: raw.name.clone(),
        })?;

    let id = Resource::make_id(resource_type, &raw.name);
    if !is_valid_name(&raw.name) {
        return Err(ManifestError::InvalidProperty {
            resource: id,
            property: "name".to_string(),
            message: "names must be non-empty and use only letters, digits, '-' and '_'"
                .to_string(),
        });
    }

    Ok(Resource {
        id,
        resource_type,
        name: raw.name,
        properties: raw.properties,
        depends_on: raw.depends_on.into_iter().collect(),
        parent: raw.parent,
    })
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn validate_parent(resource: &Resource, ids: &BTreeSet<&str>) -> Result<(), ManifestError> {
    let expected = resource.resource_type.required_parent();
    match (&resource.parent, expected) {
        (Some(parent), _) if !ids.contains(parent.as_str()) => {
            Err(ManifestError::DanglingReference {
                resource: resource.id.clone(),
                target: parent.clone(),
            })
        }
        (Some(parent), Some(expected)) if !parent.starts_with(&format!("{expected}.")) => {
            Err(ManifestError::InvalidParent {
                resource: resource.id.clone(),
                expected: expected.to_string(),
            })
        }
        (None, Some(expected)) => Err(ManifestError::InvalidParent {
            resource: resource.id.clone(),
            expected: expected.to_string(),
        }),
        _ => Ok(()),
    }
}

fn invalid(resource: &Resource, property: &str, message: impl Into<String>) -> ManifestError {
    ManifestError::InvalidProperty {
        resource: resource.id.clone(),
        property: property.to_string(),
        message: message.into(),
    }
}

/// Type-specific property checks
fn validate_properties(resource: &Resource) -> Result<(), ManifestError> {
    let props = &resource.properties;
    match resource.resource_type {
        ResourceType::ContainerApp => validate_container_app(resource),
        ResourceType::FileShare => match props.get("quota") {
            None => Ok(()),
            Some(v) if v.as_u64().is_some_and(|q| q > 0) => Ok(()),
            Some(_) => Err(invalid(resource, "quota", "must be a positive integer")),
        },
        ResourceType::Subnet => match props.get("addressPrefix") {
            Some(Value::String(_)) => Ok(()),
            _ => Err(invalid(resource, "addressPrefix", "must be a string")),
        },
        ResourceType::VirtualNetwork => match props.get("addressSpace") {
            Some(Value::Array(items))
                if !items.is_empty() && items.iter().all(Value::is_string) =>
            {
                Ok(())
            }
            _ => Err(invalid(
                resource,
                "addressSpace",
                "must be a non-empty array of strings",
            )),
        },
        _ => Ok(()),
    }
}

fn validate_container_app(resource: &Resource) -> Result<(), ManifestError> {
    let props = &resource.properties;

    match props.get("image") {
        Some(Value::String(s)) if !s.is_empty() => {}
        _ => return Err(invalid(resource, "image", "must be a non-empty string")),
    }

    if let Some(ingress) = props.get("ingress") {
        let Value::Object(ingress) = ingress else {
            return Err(invalid(resource, "ingress", "must be a table"));
        };
        if let Some(port) = ingress.get("targetPort")
            && !port.as_u64().is_some_and(|p| (1..=65535).contains(&p))
        {
            return Err(invalid(
                resource,
                "ingress.targetPort",
                "must be an integer between 1 and 65535",
            ));
        }
        if let Some(transport) = ingress.get("transport")
            && !matches!(transport.as_str(), Some("auto" | "http" | "http2" | "tcp"))
        {
            return Err(invalid(
                resource,
                "ingress.transport",
                "must be one of auto, http, http2, tcp",
            ));
        }
        if let Some(external) = ingress.get("externalEnabled")
            && !external.is_boolean()
        {
            return Err(invalid(
                resource,
                "ingress.externalEnabled",
                "must be a boolean",
            ));
        }
    }

    let secret_names = named_entries(resource, "secrets")?;
    for entry in entries(props.get("secrets")) {
        if !entry.get("valueRef").is_some_and(Value::is_string) {
            return Err(invalid(resource, "secrets", "every entry needs a 'valueRef'"));
        }
    }

    named_entries(resource, "env")?;
    for entry in entries(props.get("env")) {
        let has_value = entry.get("value").is_some();
        match (has_value, entry.get("secretRef")) {
            (true, None) => {}
            (false, Some(Value::String(secret_ref))) => {
                if !secret_names.contains(secret_ref.as_str()) {
                    return Err(invalid(
                        resource,
                        "env",
                        format!("secretRef '{secret_ref}' is not declared in secrets"),
                    ));
                }
            }
            _ => {
                return Err(invalid(
                    resource,
                    "env",
                    "every entry needs exactly one of 'value' or 'secretRef'",
                ));
            }
        }
    }

    let volume_names = named_entries(resource, "volumes")?;
    for volume in entries(props.get("volumes")) {
        match volume.get(STORAGE_REF_KEY) {
            None => {}
            Some(Value::String(target))
                if target.starts_with(&format!("{}.", ResourceType::EnvironmentStorage)) => {}
            Some(_) => {
                return Err(invalid(
                    resource,
                    "volumes",
                    "storageRef must name an environment_storage resource",
                ));
            }
        }
        if let Some(mode) = volume.get("accessMode")
            && !matches!(mode.as_str(), Some("ReadOnly" | "ReadWrite"))
        {
            return Err(invalid(
                resource,
                "volumes",
                "accessMode must be ReadOnly or ReadWrite",
            ));
        }
    }

    for mount in entries(props.get("volumeMounts")) {
        let name = mount.get("name").and_then(Value::as_str);
        if !name.is_some_and(|n| volume_names.contains(n)) {
            return Err(invalid(
                resource,
                "volumeMounts",
                format!("mount '{}' does not name a declared volume", name.unwrap_or("?")),
            ));
        }
        if !mount.get("path").is_some_and(Value::is_string) {
            return Err(invalid(resource, "volumeMounts", "every mount needs a 'path'"));
        }
    }

    Ok(())
}

/// Object entries of an array property; non-objects are skipped here and
/// rejected by [`named_entries`]
fn entries(value: Option<&Value>) -> impl Iterator<Item = &serde_json::Map<String, Value>> {
    value
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
}

/// Names of an array-of-tables property, each of which must carry a `name`
fn named_entries<'a>(
    resource: &'a Resource,
    property: &str,
) -> Result<BTreeSet<&'a str>, ManifestError> {
    let Some(value) = resource.properties.get(property) else {
        return Ok(BTreeSet::new());
    };
    let Value::Array(items) = value else {
        return Err(invalid(resource, property, "must be an array"));
    };

    let mut names = BTreeSet::new();
    for item in items {
        let name = item.get("name").and_then(Value::as_str).ok_or_else(|| {
            invalid(resource, property, "every entry needs a string 'name'")
        })?;
        if !names.insert(name) {
            return Err(invalid(
                resource,
                property,
                format!("duplicate entry name '{name}'"),
            ));
        }
    }
    Ok(names)
}
