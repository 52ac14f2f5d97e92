use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{ConfigObject, ConfigStatus, EntityMatch, ResourceTemplate};

pub static NAMESPACE_CONFIG_FINALIZER: &str = "namespaceconfigs.kubenforce.dev";

/// NamespaceConfig enforces a set of resource templates in every namespace
/// matched by its selectors.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "NamespaceConfig",
    group = "kubenforce.dev",
    version = "v1alpha1",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "ConfigStatus", shortname = "nsconfig")]
#[serde(rename_all = "camelCase")]
pub struct NamespaceConfigSpec {
    #[serde(flatten)]
    pub selector: EntityMatch,

    /// Templates rendered against every matched namespace
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub templates: Vec<ResourceTemplate>,
}

impl ConfigObject for NamespaceConfig {
    const FINALIZER: &'static str = NAMESPACE_CONFIG_FINALIZER;

    fn templates(&self) -> &[ResourceTemplate] {
        &self.spec.templates
    }

    fn templates_mut(&mut self) -> &mut Vec<ResourceTemplate> {
        &mut self.spec.templates
    }

    fn status(&self) -> Option<&ConfigStatus> {
        self.status.as_ref()
    }
}
