//! Property-level references between resources
//!
//! Two forms are recognized inside property values:
//!
//! - `${<type>.<name>.<attribute>}` inside any string refers to an attribute of
//!   another resource; `${secret.<name>}` refers to a declared secret.
//! - Object keys: `valueRef = "<secret>"` names a declared secret and
//!   `storageRef = "<type>.<name>"` names another resource.
//!
//! References are discovered at load time to build graph edges and are
//! substituted lazily by the executor once their targets exist.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]*)\}").expect("reference pattern is valid"));

/// Key naming a declared secret inside an object
pub const VALUE_REF_KEY: &str = "valueRef";

/// Key naming another resource inside an object
pub const STORAGE_REF_KEY: &str = "storageRef";

/// A reference found in a property value
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reference {
    /// `${type.name.attribute}`, with `attribute` possibly a dotted path
    Resource { id: String, attribute: String },
    /// `${secret.name}` or `valueRef`
    Secret(String),
}

impl Reference {
    /// Parse the inside of a `${...}` token.
    pub fn parse(token: &str) -> Result<Self, String> {
        let token = token.trim();
        if let Some(name) = token.strip_prefix("secret.") {
            if name.is_empty() {
                return Err("secret reference without a name".to_string());
            }
            return Ok(Self::Secret(name.to_string()));
        }

        let mut parts = token.splitn(3, '.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(t), Some(n), Some(attr)) if !t.is_empty() && !n.is_empty() && !attr.is_empty() => {
                Ok(Self::Resource {
                    id: format!("{t}.{n}"),
                    attribute: attr.to_string(),
                })
            }
            _ => Err(format!(
                "malformed reference '${{{token}}}', expected '${{type.name.attribute}}'"
            )),
        }
    }

    /// Resource id this reference points at, if it is a resource reference
    pub fn target_id(&self) -> Option<&str> {
        match self {
            Self::Resource { id, .. } => Some(id),
            Self::Secret(_) => None,
        }
    }
}

/// Collect every reference in a value.
///
/// Malformed tokens are reported as errors carrying the offending text.
pub fn collect(value: &Value, out: &mut Vec<Reference>) -> Result<(), String> {
    match value {
        Value::String(s) => {
            for cap in TOKEN_RE.captures_iter(s) {
                out.push(Reference::parse(&cap[1])?);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect(item, out)?;
            }
        }
        Value::Object(map) => {
            for (key, v) in map {
                match (key.as_str(), v) {
                    (VALUE_REF_KEY, Value::String(name)) => {
                        out.push(Reference::Secret(name.clone()));
                    }
                    (STORAGE_REF_KEY, Value::String(id)) => out.push(Reference::Resource {
                        id: id.clone(),
                        attribute: "name".to_string(),
                    }),
                    _ => collect(v, out)?,
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/// Substitute references in a value.
///
/// `lookup` returns `Ok(Some(v))` to substitute, `Ok(None)` to leave the
/// reference untouched (so a later pass can handle it), or an error.
///
/// A string consisting of exactly one token is replaced by the looked-up value
/// itself, keeping its JSON type. Tokens embedded in longer strings are
/// interpolated as text. A `valueRef` entry is replaced by a `value` entry.
pub fn substitute<F>(value: &Value, lookup: &mut F) -> Result<Value, String>
where
    F: FnMut(&Reference) -> Result<Option<Value>, String>,
{
    match value {
        Value::String(s) => substitute_str(s, lookup),
        Value::Array(items) => items
            .iter()
            .map(|item| substitute(item, lookup))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, v) in map {
                match (key.as_str(), v) {
                    (VALUE_REF_KEY, Value::String(name)) => {
                        match lookup(&Reference::Secret(name.clone()))? {
                            Some(resolved) => {
                                out.insert("value".to_string(), resolved);
                            }
                            None => {
                                out.insert(key.clone(), v.clone());
                            }
                        }
                    }
                    (STORAGE_REF_KEY, Value::String(id)) => {
                        let reference = Reference::Resource {
                            id: id.clone(),
                            attribute: "name".to_string(),
                        };
                        let resolved = lookup(&reference)?.unwrap_or_else(|| v.clone());
                        out.insert(key.clone(), resolved);
                    }
                    _ => {
                        out.insert(key.clone(), substitute(v, lookup)?);
                    }
                }
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn substitute_str<F>(s: &str, lookup: &mut F) -> Result<Value, String>
where
    F: FnMut(&Reference) -> Result<Option<Value>, String>,
{
    // Whole-string token keeps the referenced value's type
    if let Some(cap) = TOKEN_RE.captures(s)
        && cap.get(0).is_some_and(|m| m.start() == 0 && m.end() == s.len())
    {
        let reference = Reference::parse(&cap[1])?;
        return Ok(lookup(&reference)?.unwrap_or_else(|| Value::String(s.to_string())));
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for cap in TOKEN_RE.captures_iter(s) {
        let Some(m) = cap.get(0) else { continue };
        out.push_str(&s[last..m.start()]);
        let reference = Reference::parse(&cap[1])?;
        match lookup(&reference)? {
            Some(v) => out.push_str(&value_to_text(&v)),
            None => out.push_str(m.as_str()),
        }
        last = m.end();
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}

/// Render a value for string interpolation
fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Look up a dotted attribute path inside a value
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}
