use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{ConfigObject, ConfigStatus, EntityMatch, ResourceTemplate};

pub static USER_CONFIG_FINALIZER: &str = "userconfigs.kubenforce.dev";

/// UserConfig enforces a set of resource templates for every user matched by
/// its selectors.
///
/// Label and annotation selectors are evaluated against the user object.
/// `identityExtraFieldSelector` and `providerName` are evaluated against the
/// identities that reference the user. When `providerName` is set a user
/// matches only through identities of that provider.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "UserConfig",
    group = "kubenforce.dev",
    version = "v1alpha1",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "ConfigStatus", shortname = "uconfig")]
#[serde(rename_all = "camelCase")]
pub struct UserConfigSpec {
    #[serde(flatten)]
    pub selector: EntityMatch,

    /// Selects identities by their extra fields, with label selector syntax
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_extra_field_selector: Option<LabelSelector>,

    /// Restricts matching to identities of this provider
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_name: Option<String>,

    /// Templates rendered against every matched user
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub templates: Vec<ResourceTemplate>,
}

impl ConfigObject for UserConfig {
    const FINALIZER: &'static str = USER_CONFIG_FINALIZER;

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
