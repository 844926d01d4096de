//! The `resources.gardener.cloud/v1alpha1` managed resource.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reference to a secret in the same namespace.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct LocalSecretReference {
    /// Secret name.
    pub name: String,
}

/// A bundle of objects, stored in secrets, that a separate controller applies
/// to the tenant cluster.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "resources.gardener.cloud",
    version = "v1alpha1",
    kind = "ManagedResource",
    namespaced,
    derive = "PartialEq",
    status = "ManagedResourceStatus",
    shortname = "mr"
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedResourceSpec {
    /// Class of the responsible controller. Empty for the shoot side one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    /// Secrets holding the object manifests.
    #[serde(default)]
    pub secret_refs: Vec<LocalSecretReference>,
    /// Labels added to every applied object.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inject_labels: BTreeMap<String, String>,
    /// Whether the objects survive deletion of the managed resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_objects: Option<bool>,
}

/// Status of a managed resource.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagedResourceStatus {
    /// Generation last observed by the responsible controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Conditions, e.g. `ResourcesApplied`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Value>,
}
