use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use super::{OwnerKey, OWNER_LABEL};
use crate::{Error, Result};

/// Identifying fields of a target entity a template may reference.
#[derive(Clone, Debug, Default)]
pub struct RenderContext {
    pub name: String,
    pub uid: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// Extra fields of the matched identity; empty outside user-scoped rendering
    pub extra: BTreeMap<String, String>,
}

impl RenderContext {
    fn resolve(&self, path: &str) -> Option<&str> {
        match path {
            "name" => Some(&self.name),
            "uid" => Some(&self.uid),
            _ => {
                let (root, key) = path.split_once('.')?;
                let map = match root {
                    "labels" => &self.labels,
                    "annotations" => &self.annotations,
                    "extra" => &self.extra,
                    _ => return None,
                };
                map.get(key).map(String::as_str)
            }
        }
    }
}

/// Render a template manifest against one entity.
///
/// Substitution is purely textual over string values: every `{{ <path> }}`
/// token is replaced by the referenced entity field. Same (template, entity)
/// always yields the same output; the owner label is injected last.
pub fn render(manifest: &Value, entity: &RenderContext, owner: &OwnerKey) -> Result<Value> {
    let mut rendered = substitute(manifest, entity)?;

    let labels = rendered
        .pointer_mut("/metadata")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| render_error(entity, "manifest has no metadata object"))?
        .entry("labels")
        .or_insert_with(|| Value::Object(Map::new()));
    labels
        .as_object_mut()
        .ok_or_else(|| render_error(entity, "metadata.labels is not an object"))?
        .insert(OWNER_LABEL.to_string(), Value::String(owner.value()));

    Ok(rendered)
}

fn substitute(value: &Value, entity: &RenderContext) -> Result<Value> {
    match value {
        Value::String(s) => Ok(Value::String(substitute_str(s, entity)?)),
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|v| substitute(v, entity))
                .collect::<Result<_>>()?,
        )),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(substitute_str(k, entity)?, substitute(v, entity)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn substitute_str(input: &str, entity: &RenderContext) -> Result<String> {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let re = PLACEHOLDER
        .get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_][A-Za-z0-9_./-]*)\s*\}\}").unwrap());

    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for caps in re.captures_iter(input) {
        let whole = caps.get(0).unwrap();
        let path = &caps[1];
        let resolved = entity
            .resolve(path)
            .ok_or_else(|| render_error(entity, &format!("unresolved reference {path:?}")))?;
        out.push_str(&input[last..whole.start()]);
        out.push_str(resolved);
        last = whole.end();
    }
    out.push_str(&input[last..]);
    Ok(out)
}

fn render_error(entity: &RenderContext, reason: &str) -> Error {
    Error::RenderFailed {
        entity: entity.name.clone(),
        reason: reason.to_string(),
    }
}
