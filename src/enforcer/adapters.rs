use std::collections::HashMap;

use serde_json::Value;

use super::qualified_kind;
use crate::{Error, Result};

/// Which fields of a resource kind are meaningful for comparison and merge.
///
/// Most kinds converge on a single `spec` field; the registry carries the
/// kinds that do not follow that convention.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KindAdapter {
    /// Dotted field paths compared between desired and live state
    pub fields: &'static [&'static str],
    /// Never patched once created; the server mutates these after creation
    /// and overwriting would race it
    pub read_only: bool,
}

const SPEC_ADAPTER: KindAdapter = KindAdapter {
    fields: &["spec"],
    read_only: false,
};

/// Registry mapping (API group, kind) to its adapter. Kinds absent from the
/// registry fall back to the generic `spec` adapter when the manifest has a
/// spec field; kinds with neither are unsupported.
#[derive(Clone, Debug)]
pub struct AdapterRegistry {
    adapters: HashMap<(&'static str, &'static str), KindAdapter>,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        let mut registry = AdapterRegistry {
            adapters: HashMap::new(),
        };
        registry.register("", "Secret", &["data", "type"], false);
        registry.register("", "ConfigMap", &["data"], false);
        // tokens and image pull secrets are attached server-side post-creation
        registry.register("", "ServiceAccount", &[], true);
        registry.register(
            "rbac.authorization.k8s.io",
            "Role",
            &["rules", "aggregationRule"],
            false,
        );
        registry.register(
            "rbac.authorization.k8s.io",
            "ClusterRole",
            &["rules", "aggregationRule"],
            false,
        );
        // roleRef is immutable post-creation, only subjects converge
        registry.register("rbac.authorization.k8s.io", "RoleBinding", &["subjects"], false);
        registry.register(
            "rbac.authorization.k8s.io",
            "ClusterRoleBinding",
            &["subjects"],
            false,
        );
        registry.register(
            "template.openshift.io",
            "Template",
            &["objects", "parameters", "metadata.annotations"],
            false,
        );
        registry
    }
}

impl AdapterRegistry {
    /// Add an adapter for a kind that does not use a generic spec field.
    pub fn register(
        &mut self,
        group: &'static str,
        kind: &'static str,
        fields: &'static [&'static str],
        read_only: bool,
    ) {
        self.adapters
            .insert((group, kind), KindAdapter { fields, read_only });
    }

    /// Resolve the adapter for a desired manifest.
    pub fn adapter_for(&self, group: &str, kind: &str, manifest: &Value) -> Result<KindAdapter> {
        if let Some(adapter) = self.adapters.get(&(group, kind)) {
            return Ok(*adapter);
        }
        if manifest.get("spec").is_some() {
            return Ok(SPEC_ADAPTER);
        }
        Err(Error::UnsupportedKind(qualified_kind(group, kind)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn secrets_compare_data_and_type() {
        let registry = AdapterRegistry::default();
        let adapter = registry
            .adapter_for("", "Secret", &json!({"data": {}}))
            .unwrap();
        assert_eq!(adapter.fields, &["data", "type"]);
        assert!(!adapter.read_only);
    }

    #[test]
    fn role_bindings_never_touch_role_ref() {
        let registry = AdapterRegistry::default();
        let adapter = registry
            .adapter_for("rbac.authorization.k8s.io", "RoleBinding", &json!({}))
            .unwrap();
        assert!(!adapter.fields.contains(&"roleRef"));
        assert_eq!(adapter.fields, &["subjects"]);
    }

    #[test]
    fn service_accounts_are_read_only() {
        let registry = AdapterRegistry::default();
        let adapter = registry
            .adapter_for("", "ServiceAccount", &json!({}))
            .unwrap();
        assert!(adapter.read_only);
    }

    #[test]
    fn spec_bearing_kinds_fall_back_to_the_generic_adapter() {
        let registry = AdapterRegistry::default();
        let adapter = registry
            .adapter_for("apps", "Deployment", &json!({"spec": {"replicas": 1}}))
            .unwrap();
        assert_eq!(adapter.fields, &["spec"]);
    }

    #[test]
    fn specless_unknown_kinds_are_unsupported() {
        let registry = AdapterRegistry::default();
        let err = registry
            .adapter_for("", "Endpoints", &json!({"subsets": []}))
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedKind(_)));
        assert!(err.to_string().contains("Endpoints"));
    }

    #[test]
    fn registered_adapters_win_over_the_spec_fallback() {
        let mut registry = AdapterRegistry::default();
        registry.register("example.dev", "Widget", &["payload"], false);
        let adapter = registry
            .adapter_for("example.dev", "Widget", &json!({"spec": {}, "payload": {}}))
            .unwrap();
        assert_eq!(adapter.fields, &["payload"]);
    }
}
