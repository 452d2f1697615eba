//! # Provider custom resource
//!
//! This module provide the provider descriptor, a registration record that
//! names the kinds a provider implements. It is only read by the operator.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------------
// Provider structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Provider {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "displayName", skip_serializing_if = "Option::is_none", default)]
    pub display_name: Option<String>,
}

// -----------------------------------------------------------------------------
// Spec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
#[kube(group = "dbaas.redhat.com")]
#[kube(version = "v1alpha1")]
#[kube(kind = "DBaaSProvider")]
#[kube(singular = "dbaasprovider")]
#[kube(plural = "dbaasproviders")]
#[kube(derive = "PartialEq")]
pub struct Spec {
    #[serde(rename = "provider")]
    pub provider: Provider,
    #[serde(rename = "inventoryKind")]
    pub inventory_kind: String,
    #[serde(rename = "instanceKind")]
    pub instance_kind: String,
    #[serde(rename = "connectionKind")]
    pub connection_kind: String,
}
