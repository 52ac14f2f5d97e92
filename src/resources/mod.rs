use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use kube::Resource;
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::enforcer::OwnerKey;

pub mod groupconfigs;
pub mod namespaceconfigs;
pub mod userconfigs;
pub mod users;

pub use groupconfigs::{GroupConfig, GROUP_CONFIG_FINALIZER};
pub use namespaceconfigs::{NamespaceConfig, NAMESPACE_CONFIG_FINALIZER};
pub use userconfigs::{UserConfig, USER_CONFIG_FINALIZER};
pub use users::{Group, Identity, User};

/// A parameterized manifest enforced for every selected entity.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTemplate {
    /// A complete resource body. String fields may reference the selected
    /// entity with `{{ name }}`, `{{ uid }}`, `{{ labels.<key> }}`,
    /// `{{ annotations.<key> }}` and, for user-scoped configurations,
    /// `{{ extra.<key> }}` from the matched identity.
    #[schemars(schema_with = "manifest_schema")]
    pub manifest: serde_json::Value,

    /// Field paths on the live resource that are never compared or
    /// overwritten. `.metadata`, `.status` and `.spec.replicas` are always
    /// appended during initialization.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_paths: Vec<String>,
}

fn manifest_schema(_g: &mut schemars::gen::SchemaGenerator) -> Schema {
    serde_json::from_value(serde_json::json!({
            "type": "object",
            "x-kubernetes-preserve-unknown-fields": true,
    }))
    .unwrap()
}

/// Shared status of all configuration kinds.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigStatus {
    /// When the state below was last written
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update: Option<Time>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<EnforcementState>,

    /// Error detail when the state is Failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum EnforcementState {
    Success,
    Failure,
}

/// Entity selectors common to all configuration kinds.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EntityMatch {
    /// Selects entities by their labels. Absent matches everything.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,

    /// Selects entities by their annotations, with label selector syntax.
    /// Absent matches everything. ANDed with the label selector.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotation_selector: Option<LabelSelector>,
}

/// The parts of a configuration object the shared reconcile loop needs.
pub trait ConfigObject: Resource<DynamicType = ()> {
    const FINALIZER: &'static str;

    fn templates(&self) -> &[ResourceTemplate];
    fn templates_mut(&mut self) -> &mut Vec<ResourceTemplate>;
    fn status(&self) -> Option<&ConfigStatus>;

    /// The value carried in the owner label of every enforced resource.
    fn owner_key(&self) -> OwnerKey {
        OwnerKey::new(
            &Self::kind(&()),
            self.meta().name.as_deref().unwrap_or_default(),
        )
    }
}
