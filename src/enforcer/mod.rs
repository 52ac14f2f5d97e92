use std::collections::BTreeSet;

use kube::core::GroupVersionKind;
use serde_json::Value;

use crate::{Error, Result};

pub mod adapters;
pub mod apply;
pub mod diff;
pub mod drift;
pub mod render;
pub mod selector;

/// Label stamped on every resource the engine creates. Its value is the sole
/// mechanism used to find "resources I own" during drift correction and
/// finalizer cleanup.
pub static OWNER_LABEL: &str = "kubenforce.dev/owner";

/// Paths excluded from diffing/merging on every template, user-provided or not.
pub static DEFAULT_EXCLUDED_PATHS: [&str; 3] = [".metadata", ".status", ".spec.replicas"];

/// Identity of the configuration object that owns a set of locked resources.
///
/// Configuration kinds are cluster-scoped, so `<kind>.<name>` is globally
/// unique; both components are DNS names, keeping the value label-safe.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OwnerKey {
    pub kind: String,
    pub name: String,
}

impl OwnerKey {
    pub fn new(kind: &str, name: &str) -> Self {
        OwnerKey {
            kind: kind.to_lowercase(),
            name: name.to_string(),
        }
    }

    /// The owner label value.
    pub fn value(&self) -> String {
        format!("{}.{}", self.kind, self.name)
    }

    /// Label selector string matching resources owned by this key.
    pub fn label_selector(&self) -> String {
        format!("{}={}", OWNER_LABEL, self.value())
    }

    pub fn parse(value: &str) -> Option<OwnerKey> {
        let (kind, name) = value.split_once('.')?;
        if kind.is_empty() || name.is_empty() {
            return None;
        }
        Some(OwnerKey {
            kind: kind.to_string(),
            name: name.to_string(),
        })
    }
}

/// A rendered resource the engine enforces on the cluster.
#[derive(Clone, Debug)]
pub struct LockedResource {
    /// The full desired manifest, owner label already injected
    pub manifest: Value,
    pub gvk: GroupVersionKind,
    pub namespace: Option<String>,
    pub name: String,
    /// Field paths never diffed or overwritten, `DEFAULT_EXCLUDED_PATHS` included
    pub excluded_paths: Vec<String>,
}

impl LockedResource {
    /// Build from a rendered manifest; fails if apiVersion/kind/metadata.name are absent.
    pub fn from_manifest(manifest: Value, excluded_paths: Vec<String>) -> Result<LockedResource> {
        let api_version = manifest
            .pointer("/apiVersion")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidManifest("missing apiVersion".into()))?;
        let kind = manifest
            .pointer("/kind")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidManifest("missing kind".into()))?;
        let name = manifest
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidManifest("missing metadata.name".into()))?
            .to_string();
        let namespace = manifest
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .map(str::to_string);
        let (group, version) = match api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", api_version),
        };
        let gvk = GroupVersionKind::gvk(group, version, kind);
        Ok(LockedResource {
            manifest,
            gvk,
            namespace,
            name,
            excluded_paths,
        })
    }

    /// Matching key for the differ: kind is qualified by group to avoid
    /// colliding same-named kinds from different groups.
    pub fn key(&self) -> (String, Option<String>, String) {
        (
            qualified_kind(&self.gvk.group, &self.gvk.kind),
            self.namespace.clone(),
            self.name.clone(),
        )
    }
}

pub fn qualified_kind(group: &str, kind: &str) -> String {
    if group.is_empty() {
        kind.to_string()
    } else {
        format!("{kind}.{group}")
    }
}

/// Merge the default exclusion paths into a template's own, preserving the
/// user's entries. Returns `None` when the template already carries them all.
pub fn merge_default_exclusions(excluded_paths: &[String]) -> Option<Vec<String>> {
    let current: BTreeSet<&str> = excluded_paths.iter().map(String::as_str).collect();
    if DEFAULT_EXCLUDED_PATHS.iter().all(|p| current.contains(p)) {
        return None;
    }
    let merged: BTreeSet<&str> = current
        .into_iter()
        .chain(DEFAULT_EXCLUDED_PATHS.iter().copied())
        .collect();
    Some(merged.into_iter().map(str::to_string).collect())
}
