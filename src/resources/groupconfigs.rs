use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{ConfigObject, ConfigStatus, EntityMatch, ResourceTemplate};

pub static GROUP_CONFIG_FINALIZER: &str = "groupconfigs.kubenforce.dev";

/// GroupConfig enforces a set of resource templates for every user group
/// matched by its selectors.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "GroupConfig",
    group = "kubenforce.dev",
    version = "v1alpha1",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "ConfigStatus", shortname = "gconfig")]
#[serde(rename_all = "camelCase")]
pub struct GroupConfigSpec {
    #[serde(flatten)]
    pub selector: EntityMatch,

    /// Templates rendered against every matched group
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub templates: Vec<ResourceTemplate>,
}

impl ConfigObject for GroupConfig {
    const FINALIZER: &'static str = GROUP_CONFIG_FINALIZER;

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
