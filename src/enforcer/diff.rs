use std::collections::HashMap;

use kube::api::{ApiResource, DynamicObject};
use kube::ResourceExt;
use serde_json::Value;

use super::adapters::{AdapterRegistry, KindAdapter};
use super::{qualified_kind, LockedResource};
use crate::Error;

/// A live resource carrying our owner label, as found by the label scan.
#[derive(Clone, Debug)]
pub struct OwnedObject {
    pub api_resource: ApiResource,
    pub object: DynamicObject,
}

impl OwnedObject {
    fn key(&self) -> (String, Option<String>, String) {
        (
            qualified_kind(&self.api_resource.group, &self.api_resource.kind),
            self.object.namespace(),
            self.object.name_any(),
        )
    }
}

/// An update the differ decided on: the merged manifest keeps the live
/// object's metadata (and version token) so the write is optimistic-concurrent.
#[derive(Clone, Debug)]
pub struct PlannedUpdate {
    pub api_resource: ApiResource,
    pub namespace: Option<String>,
    pub name: String,
    pub merged: Value,
}

/// Reconciliation plan between the desired set and the owned set.
/// Creates and updates are applied before deletes.
#[derive(Debug, Default)]
pub struct Plan {
    pub creates: Vec<LockedResource>,
    pub updates: Vec<PlannedUpdate>,
    pub deletes: Vec<OwnedObject>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// Compute the plan. Per-resource comparison failures are collected rather
/// than aborting the rest of the plan.
pub fn plan(
    desired: Vec<LockedResource>,
    owned: Vec<OwnedObject>,
    registry: &AdapterRegistry,
) -> (Plan, Vec<Error>) {
    let mut plan = Plan::default();
    let mut errors = Vec::new();

    let mut desired_by_key: HashMap<_, LockedResource> = HashMap::new();
    for lr in desired {
        let key = lr.key();
        if let Some(previous) = desired_by_key.insert(key, lr) {
            // colliding templates would fight over one object; keep the last
            // rendering and report the collision instead of dropping it quietly
            let (kind, namespace, name) = previous.key();
            errors.push(Error::InvalidManifest(format!(
                "multiple templates render {kind} {}",
                match namespace {
                    Some(ns) => format!("{ns}/{name}"),
                    None => name,
                },
            )));
        }
    }

    for owned_obj in owned {
        let Some(lr) = desired_by_key.remove(&owned_obj.key()) else {
            // left-outer-join semantics: no desired entry means deletion candidate
            plan.deletes.push(owned_obj);
            continue;
        };
        let adapter = match registry.adapter_for(&lr.gvk.group, &lr.gvk.kind, &lr.manifest) {
            Ok(adapter) => adapter,
            Err(e) => {
                errors.push(e);
                continue;
            }
        };
        if adapter.read_only {
            continue;
        }
        let actual = match serde_json::to_value(&owned_obj.object) {
            Ok(actual) => actual,
            Err(e) => {
                errors.push(e.into());
                continue;
            }
        };
        if fields_equal(&lr.manifest, &actual, &adapter, &lr.excluded_paths) {
            continue;
        }
        plan.updates.push(PlannedUpdate {
            api_resource: owned_obj.api_resource,
            namespace: lr.namespace.clone(),
            name: lr.name.clone(),
            merged: merge(&lr.manifest, &actual, &adapter, &lr.excluded_paths),
        });
    }

    // whatever is left was not owned yet
    plan.creates.extend(desired_by_key.into_values());

    (plan, errors)
}

/// Compare desired and live state over the adapter's fields, ignoring
/// excluded paths. Equal means no API write is issued.
pub fn fields_equal(
    desired: &Value,
    actual: &Value,
    adapter: &KindAdapter,
    excluded_paths: &[String],
) -> bool {
    adapter.fields.iter().all(|field| {
        let field_path = split_path(field);
        if excluded_exactly(excluded_paths, &field_path) {
            return true;
        }
        let desired_field = pruned(desired, &field_path, excluded_paths);
        let actual_field = pruned(actual, &field_path, excluded_paths);
        desired_field == actual_field
    })
}

/// Overlay the desired comparable fields onto the live object, restoring
/// excluded sub-paths from live state so they are never overwritten.
pub fn merge(
    desired: &Value,
    actual: &Value,
    adapter: &KindAdapter,
    excluded_paths: &[String],
) -> Value {
    let mut merged = actual.clone();
    for field in adapter.fields {
        let field_path = split_path(field);
        if excluded_exactly(excluded_paths, &field_path) {
            continue;
        }
        match lookup(desired, &field_path) {
            Some(value) => set(&mut merged, &field_path, value.clone()),
            None => remove(&mut merged, &field_path),
        }
        for excluded in excluded_paths {
            let excluded = split_path(excluded);
            if !is_strict_descendant(&field_path, &excluded) {
                continue;
            }
            match lookup(actual, &excluded) {
                Some(original) => set(&mut merged, &excluded, original.clone()),
                None => remove(&mut merged, &excluded),
            }
        }
    }
    merged
}

fn split_path(path: &str) -> Vec<&str> {
    path.trim_start_matches('.')
        .split('.')
        .filter(|s| !s.is_empty())
        .collect()
}

fn excluded_exactly(excluded_paths: &[String], field_path: &[&str]) -> bool {
    excluded_paths
        .iter()
        .any(|p| split_path(p) == field_path)
}

fn is_strict_descendant(ancestor: &[&str], candidate: &[&str]) -> bool {
    candidate.len() > ancestor.len() && candidate[..ancestor.len()] == *ancestor
}

fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = value;
    for segment in path {
        current = current.as_object()?.get(*segment)?;
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

// Copy of the field at `field_path` with excluded strict-descendant paths
// removed, ready for comparison.
fn pruned(value: &Value, field_path: &[&str], excluded_paths: &[String]) -> Option<Value> {
    let mut field = lookup(value, field_path)?.clone();
    for excluded in excluded_paths {
        let excluded = split_path(excluded);
        if is_strict_descendant(field_path, &excluded) {
            remove_in(&mut field, &excluded[field_path.len()..]);
        }
    }
    Some(field)
}

fn remove_in(value: &mut Value, path: &[&str]) {
    match path {
        [] => {}
        [last] => {
            if let Some(map) = value.as_object_mut() {
                map.remove(*last);
            }
        }
        [head, rest @ ..] => {
            if let Some(inner) = value.as_object_mut().and_then(|m| m.get_mut(*head)) {
                remove_in(inner, rest);
            }
        }
    }
}

fn remove(value: &mut Value, path: &[&str]) {
    remove_in(value, path)
}

fn set(value: &mut Value, path: &[&str], new: Value) {
    let mut current = value;
    for segment in &path[..path.len() - 1] {
        let map = match current {
            Value::Object(map) => map,
            other => {
                *other = Value::Object(serde_json::Map::new());
                other.as_object_mut().unwrap()
            }
        };
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    match current {
        Value::Object(map) => {
            map.insert(path[path.len() - 1].to_string(), new);
        }
        other => {
            let mut map = serde_json::Map::new();
            map.insert(path[path.len() - 1].to_string(), new);
            *other = Value::Object(map);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforcer::OWNER_LABEL;
    use assert_json_diff::assert_json_eq;
    use kube::core::GroupVersionKind;
    use serde_json::json;

    fn default_exclusions() -> Vec<String> {
        crate::enforcer::DEFAULT_EXCLUDED_PATHS
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn locked(manifest: Value) -> LockedResource {
        LockedResource::from_manifest(manifest, default_exclusions()).unwrap()
    }

    fn owned(manifest: Value) -> OwnedObject {
        let gvk = {
            let api_version = manifest["apiVersion"].as_str().unwrap();
            let (group, version) = match api_version.split_once('/') {
                Some((g, v)) => (g, v),
                None => ("", api_version),
            };
            GroupVersionKind::gvk(group, version, manifest["kind"].as_str().unwrap())
        };
        OwnedObject {
            api_resource: ApiResource::from_gvk(&gvk),
            object: serde_json::from_value(manifest).unwrap(),
        }
    }

    fn configmap(name: &str, team: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": name,
                "namespace": "ns-x",
                "labels": {OWNER_LABEL: "namespaceconfig.cfg1"}
            },
            "data": {"team": team}
        })
    }

    #[test]
    fn converged_sets_produce_an_empty_plan() {
        let registry = AdapterRegistry::default();
        let desired = vec![locked(configmap("a", "payments"))];
        let mut live = configmap("a", "payments");
        live["metadata"]["resourceVersion"] = json!("41");
        let (plan, errors) = plan(desired, vec![owned(live)], &registry);
        assert!(errors.is_empty());
        assert!(plan.is_empty());
    }

    #[test]
    fn templates_rendering_the_same_resource_are_reported() {
        let registry = AdapterRegistry::default();
        let desired = vec![
            locked(configmap("a", "payments")),
            locked(configmap("a", "billing")),
        ];
        let (plan, errors) = plan(desired, vec![], &registry);
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], Error::InvalidManifest(_)));
        // one rendering still goes through
        assert_eq!(plan.creates.len(), 1);
    }

    #[test]
    fn missing_resource_is_created_and_converged_one_untouched() {
        let registry = AdapterRegistry::default();
        let desired = vec![
            locked(configmap("a", "payments")),
            locked(configmap("b", "payments")),
        ];
        // external actor deleted "a"; only "b" is live
        let (plan, errors) = plan(desired, vec![owned(configmap("b", "payments"))], &registry);
        assert!(errors.is_empty());
        assert_eq!(plan.creates.len(), 1);
        assert_eq!(plan.creates[0].name, "a");
        assert!(plan.updates.is_empty());
        assert!(plan.deletes.is_empty());
    }

    #[test]
    fn drifted_resource_is_updated_with_live_metadata_kept() {
        let registry = AdapterRegistry::default();
        let desired = vec![locked(configmap("a", "payments"))];
        let mut live = configmap("a", "tampered");
        live["metadata"]["resourceVersion"] = json!("7");
        let (plan, errors) = plan(desired, vec![owned(live)], &registry);
        assert!(errors.is_empty());
        assert_eq!(plan.updates.len(), 1);
        let merged = &plan.updates[0].merged;
        assert_eq!(merged.pointer("/data/team"), Some(&json!("payments")));
        // metadata is excluded by default: the live version token survives
        assert_eq!(merged.pointer("/metadata/resourceVersion"), Some(&json!("7")));
    }

    #[test]
    fn unowned_resource_is_a_deletion_candidate() {
        let registry = AdapterRegistry::default();
        let (plan, errors) = plan(vec![], vec![owned(configmap("stale", "x"))], &registry);
        assert!(errors.is_empty());
        assert_eq!(plan.deletes.len(), 1);
        assert_eq!(plan.deletes[0].object.name_any(), "stale");
    }

    #[test]
    fn excluded_replicas_drift_is_tolerated() {
        let registry = AdapterRegistry::default();
        let deployment = |replicas: i64| {
            json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": {"name": "d", "namespace": "ns-x"},
                "spec": {"replicas": replicas, "paused": false}
            })
        };
        let desired = vec![locked(deployment(1))];
        // an autoscaler moved replicas; everything else matches
        let (plan, errors) = plan(desired, vec![owned(deployment(5))], &registry);
        assert!(errors.is_empty());
        assert!(plan.is_empty());
    }

    #[test]
    fn merge_restores_excluded_paths_from_live_state() {
        let adapter = AdapterRegistry::default()
            .adapter_for("apps", "Deployment", &json!({"spec": {}}))
            .unwrap();
        let exclusions = default_exclusions();
        let desired = json!({"spec": {"replicas": 1, "paused": true}});
        let actual = json!({
            "metadata": {"resourceVersion": "3"},
            "spec": {"replicas": 5, "paused": false},
            "status": {"readyReplicas": 5}
        });
        let merged = merge(&desired, &actual, &adapter, &exclusions);
        assert_json_eq!(
            merged,
            json!({
                "metadata": {"resourceVersion": "3"},
                "spec": {"replicas": 5, "paused": true},
                "status": {"readyReplicas": 5}
            })
        );
    }

    #[test]
    fn role_ref_drift_alone_is_not_corrected() {
        let registry = AdapterRegistry::default();
        let binding = |role: &str| {
            json!({
                "apiVersion": "rbac.authorization.k8s.io/v1",
                "kind": "RoleBinding",
                "metadata": {"name": "rb", "namespace": "ns-x"},
                "roleRef": {"kind": "Role", "name": role},
                "subjects": [{"kind": "User", "name": "alex"}]
            })
        };
        let (plan, errors) = plan(vec![locked(binding("viewer"))], vec![owned(binding("editor"))], &registry);
        assert!(errors.is_empty());
        assert!(plan.is_empty(), "roleRef is immutable and must not be diffed");
    }

    #[test]
    fn role_binding_subjects_do_converge() {
        let registry = AdapterRegistry::default();
        let binding = |subject: &str| {
            json!({
                "apiVersion": "rbac.authorization.k8s.io/v1",
                "kind": "RoleBinding",
                "metadata": {"name": "rb", "namespace": "ns-x"},
                "roleRef": {"kind": "Role", "name": "viewer"},
                "subjects": [{"kind": "User", "name": subject}]
            })
        };
        let (plan, _) = plan(vec![locked(binding("alex"))], vec![owned(binding("mallory"))], &registry);
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(
            plan.updates[0].merged.pointer("/subjects/0/name"),
            Some(&json!("alex"))
        );
        assert_eq!(
            plan.updates[0].merged.pointer("/roleRef/name"),
            Some(&json!("viewer"))
        );
    }

    #[test]
    fn service_accounts_are_never_patched() {
        let registry = AdapterRegistry::default();
        let sa = |secrets: Value| {
            json!({
                "apiVersion": "v1",
                "kind": "ServiceAccount",
                "metadata": {"name": "robot", "namespace": "ns-x"},
                "secrets": secrets
            })
        };
        let (plan, errors) = plan(
            vec![locked(sa(json!([])))],
            vec![owned(sa(json!([{"name": "robot-token"}])))],
            &registry,
        );
        assert!(errors.is_empty());
        assert!(plan.is_empty());
    }

    #[test]
    fn template_annotations_are_compared_despite_metadata_exclusion() {
        let registry = AdapterRegistry::default();
        let template = |tag: &str| {
            json!({
                "apiVersion": "template.openshift.io/v1",
                "kind": "Template",
                "metadata": {
                    "name": "tpl",
                    "namespace": "ns-x",
                    "annotations": {"tags": tag}
                },
                "objects": [],
                "parameters": []
            })
        };
        let (plan, _) = plan(vec![locked(template("new"))], vec![owned(template("old"))], &registry);
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(
            plan.updates[0].merged.pointer("/metadata/annotations/tags"),
            Some(&json!("new"))
        );
    }

    #[test]
    fn user_exclusions_prune_inside_spec() {
        let registry = AdapterRegistry::default();
        let service = |cluster_ip: &str| {
            json!({
                "apiVersion": "v1",
                "kind": "Service",
                "metadata": {"name": "svc", "namespace": "ns-x"},
                "spec": {"clusterIP": cluster_ip, "ports": [{"port": 80}]}
            })
        };
        let mut exclusions = default_exclusions();
        exclusions.push(".spec.clusterIP".to_string());
        let desired =
            LockedResource::from_manifest(service("None"), exclusions).unwrap();
        let (plan, _) = plan(vec![desired], vec![owned(service("10.0.0.7"))], &registry);
        assert!(plan.is_empty(), "clusterIP divergence is excluded");
    }
}
