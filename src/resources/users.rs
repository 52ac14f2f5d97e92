//! Clients for the `user.openshift.io/v1` API, which ships with the cluster
//! rather than with this operator. Only the fields the controllers read are
//! modelled.

use std::borrow::Cow;
use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ClusterResourceScope;
use kube::Resource;
use serde::{Deserialize, Serialize};

pub static USER_API_GROUP: &str = "user.openshift.io";

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub provider_name: String,
    #[serde(default)]
    pub provider_user_name: String,
    /// Reference to the user this identity authenticates, matched by UID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<ObjectReference>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<String>,
}

macro_rules! user_api_resource {
    ($ty:ident, $kind:literal, $plural:literal) => {
        impl Resource for $ty {
            type DynamicType = ();
            type Scope = ClusterResourceScope;

            fn kind(_: &()) -> Cow<'_, str> {
                $kind.into()
            }

            fn group(_: &()) -> Cow<'_, str> {
                USER_API_GROUP.into()
            }

            fn version(_: &()) -> Cow<'_, str> {
                "v1".into()
            }

            fn plural(_: &()) -> Cow<'_, str> {
                $plural.into()
            }

            fn meta(&self) -> &ObjectMeta {
                &self.metadata
            }

            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.metadata
            }
        }
    };
}

user_api_resource!(User, "User", "users");
user_api_resource!(Identity, "Identity", "identities");
user_api_resource!(Group, "Group", "groups");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_deserializes_openshift_wire_form() {
        let identity: Identity = serde_json::from_value(serde_json::json!({
            "apiVersion": "user.openshift.io/v1",
            "kind": "Identity",
            "metadata": {"name": "ldap:alice"},
            "providerName": "ldap",
            "providerUserName": "alice",
            "user": {"name": "alice", "uid": "u-1"},
            "extra": {"sandbox": "true"}
        }))
        .unwrap();
        assert_eq!(identity.provider_name, "ldap");
        assert_eq!(identity.user.unwrap().uid.as_deref(), Some("u-1"));
        assert_eq!(identity.extra["sandbox"], "true");
    }

    #[test]
    fn user_api_coordinates() {
        assert_eq!(User::kind(&()), "User");
        assert_eq!(Group::plural(&()), "groups");
        assert_eq!(Identity::group(&()), "user.openshift.io");
    }
}
