//! The `extensions.gardener.cloud/v1alpha1` resources.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Taint;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorCode;

/// API group of all extension resources.
pub const GROUP: &str = "extensions.gardener.cloud";
/// API version of all extension resources.
pub const VERSION: &str = "v1alpha1";

/// Reference to a secret, optionally in another namespace.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct SecretReference {
    /// Name of the secret.
    pub name: String,
    /// Namespace of the secret. Defaults to the namespace of the referrer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Kind of the last operation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum LastOperationType {
    /// The object was created.
    Create,
    /// The object was reconciled.
    Reconcile,
    /// The object is being deleted.
    Delete,
}

/// Progress state of the last operation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum LastOperationState {
    /// The operation is in progress.
    Processing,
    /// The operation finished successfully.
    Succeeded,
    /// The operation failed and will be retried.
    Error,
    /// The operation failed permanently.
    Failed,
    /// The operation waits for an external event.
    Pending,
}

/// The last operation executed on an extension resource.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LastOperation {
    /// Human readable description.
    pub description: String,
    /// RFC 3339 timestamp of the last update.
    pub last_update_time: String,
    /// Progress between 1 and 100.
    pub progress: i32,
    /// State of the operation.
    pub state: LastOperationState,
    /// Type of the operation.
    #[serde(rename = "type")]
    pub type_: LastOperationType,
}

/// The last error that occurred while operating on an extension resource.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    /// The outermost error message.
    pub description: String,
    /// Canonical error codes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub codes: Vec<ErrorCode>,
    /// RFC 3339 timestamp of the last update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
}

/// Status fields shared by all extension resources.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DefaultStatus {
    /// Provider specific status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_status: Option<Value>,
    /// Last error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
    /// Last operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<LastOperation>,
    /// Generation of the spec that was last reconciled successfully.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Purpose of a control plane.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    /// The regular control plane components.
    Normal,
    /// Components exposing the control plane, e.g. load balancers.
    Exposure,
}

impl Default for Purpose {
    fn default() -> Self {
        Purpose::Normal
    }
}

/// Declared desired control plane of one tenant cluster.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "extensions.gardener.cloud",
    version = "v1alpha1",
    kind = "ControlPlane",
    namespaced,
    derive = "PartialEq",
    status = "DefaultStatus",
    shortname = "cp"
)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneSpec {
    /// Provider type, e.g. `azure`.
    #[serde(rename = "type")]
    pub type_: String,
    /// Region of the cluster.
    pub region: String,
    /// Reference to the cloud provider credentials.
    pub secret_ref: SecretReference,
    /// Purpose of the control plane.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<Purpose>,
    /// Provider specific configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config: Option<Value>,
    /// Provider status of the infrastructure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_provider_status: Option<Value>,
}

impl ControlPlane {
    /// Returns the purpose, defaulting to `normal`.
    pub fn purpose(&self) -> Purpose {
        self.spec.purpose.unwrap_or_default()
    }
}

/// Infrastructure of one tenant cluster.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "extensions.gardener.cloud",
    version = "v1alpha1",
    kind = "Infrastructure",
    namespaced,
    derive = "PartialEq",
    status = "DefaultStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureSpec {
    /// Provider type.
    #[serde(rename = "type")]
    pub type_: String,
    /// Region of the cluster.
    pub region: String,
    /// Reference to the cloud provider credentials.
    pub secret_ref: SecretReference,
    /// Provider specific configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config: Option<Value>,
    /// Public SSH key for the nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_public_key: Option<String>,
}

/// Machine image of a worker pool.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
pub struct MachineImage {
    /// Logical image name, e.g. `ubuntu`.
    pub name: String,
    /// Image version.
    pub version: String,
}

/// Root volume of the machines of a pool.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Volume {
    /// Size as a Kubernetes quantity, e.g. `20Gi`.
    pub size: String,
    /// Provider specific volume type.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
}

/// A pool of worker machines.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPool {
    /// Pool name.
    pub name: String,
    /// Machine type.
    pub machine_type: String,
    /// Machine image.
    pub machine_image: MachineImage,
    /// Minimum number of machines.
    pub minimum: i32,
    /// Maximum number of machines.
    pub maximum: i32,
    /// Surge during rolling updates.
    #[schemars(with = "Value")]
    pub max_surge: IntOrString,
    /// Unavailable machines tolerated during rolling updates.
    #[schemars(with = "Value")]
    pub max_unavailable: IntOrString,
    /// Annotations for the nodes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Labels for the nodes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Taints for the nodes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(with = "Vec<Value>")]
    pub taints: Vec<Taint>,
    /// Provider specific configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config: Option<Value>,
    /// Cloud-init like user data.
    #[schemars(with = "String")]
    pub user_data: ByteString,
    /// Root volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<Volume>,
    /// Availability zones.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub zones: Vec<String>,
}

/// Worker machines of one tenant cluster.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "extensions.gardener.cloud",
    version = "v1alpha1",
    kind = "Worker",
    namespaced,
    derive = "PartialEq",
    status = "WorkerStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSpec {
    /// Provider type.
    #[serde(rename = "type")]
    pub type_: String,
    /// Region of the cluster.
    pub region: String,
    /// Reference to the cloud provider credentials.
    pub secret_ref: SecretReference,
    /// Provider status of the infrastructure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_provider_status: Option<Value>,
    /// Public SSH key for the nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_public_key: Option<String>,
    /// Worker pools.
    #[serde(default)]
    pub pools: Vec<WorkerPool>,
}

/// Status of a machine deployment generated for a worker pool.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct MachineDeploymentStatus {
    /// Name of the machine deployment.
    pub name: String,
    /// Minimum size.
    pub minimum: i32,
    /// Maximum size.
    pub maximum: i32,
}

/// Status of a worker.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    /// Common status fields.
    #[serde(flatten)]
    pub default: DefaultStatus,
    /// Machine deployments generated in the last reconcile.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub machine_deployments: Vec<MachineDeploymentStatus>,
}

/// Purpose of an operating system config.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OperatingSystemConfigPurpose {
    /// Initial provisioning of a machine.
    Provision,
    /// Continuous reconciliation on a running machine.
    Reconcile,
}

/// A systemd drop-in of a unit.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct DropIn {
    /// Drop-in file name.
    pub name: String,
    /// Drop-in content.
    pub content: String,
}

/// A systemd unit.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Unit {
    /// Unit name, e.g. `kubelet.service`.
    pub name: String,
    /// Command to run on the unit, e.g. `start`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Whether the unit is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,
    /// Unit file content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Drop-ins.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub drop_ins: Vec<DropIn>,
}

/// Inline file content with its encoding.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct FileContentInline {
    /// Encoding of `data`: empty for plain text or `b64`.
    #[serde(default)]
    pub encoding: String,
    /// Possibly encoded data.
    pub data: String,
}

/// File content taken from a secret.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileContentSecretRef {
    /// Secret name.
    pub name: String,
    /// Key within the secret.
    pub data_key: String,
}

/// Content of a file.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileContent {
    /// Inline content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<FileContentInline>,
    /// Content stored in a secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<FileContentSecretRef>,
}

/// A file written to the machine.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct File {
    /// Absolute path.
    pub path: String,
    /// Octal permissions, e.g. `0644`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<i32>,
    /// Content.
    pub content: FileContent,
}

/// Units and files describing a machine's operating system configuration.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "extensions.gardener.cloud",
    version = "v1alpha1",
    kind = "OperatingSystemConfig",
    namespaced,
    derive = "PartialEq",
    status = "DefaultStatus",
    shortname = "osc"
)]
#[serde(rename_all = "camelCase")]
pub struct OperatingSystemConfigSpec {
    /// Operating system type, e.g. `coreos`.
    #[serde(rename = "type")]
    pub type_: String,
    /// Purpose of the config.
    pub purpose: OperatingSystemConfigPurpose,
    /// Units.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub units: Vec<Unit>,
    /// Files.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<File>,
    /// Provider specific configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config: Option<Value>,
}

impl OperatingSystemConfigSpec {
    /// Returns the unit called `name`.
    pub fn unit_mut(&mut self, name: &str) -> Option<&mut Unit> {
        self.units.iter_mut().find(|u| u.name == name)
    }

    /// Returns the file at `path`.
    pub fn file_mut(&mut self, path: &str) -> Option<&mut File> {
        self.files.iter_mut().find(|f| f.path == path)
    }
}
