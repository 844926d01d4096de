//! The `Cluster` resource and typed, read-only views of the shoot, seed and
//! cloud profile it embeds.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::apis::extensions::MachineImage;
use crate::error::Error;

/// Raw cloud profile, seed and shoot of one tenant cluster. The object is
/// cluster scoped and named after the shoot's seed namespace.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "extensions.gardener.cloud",
    version = "v1alpha1",
    kind = "Cluster",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// The cloud profile.
    pub cloud_profile: Value,
    /// The seed.
    pub seed: Value,
    /// The shoot.
    pub shoot: Value,
}

/// Kubernetes settings of a shoot.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ShootKubernetes {
    /// Full kubernetes version, e.g. `1.14.3`.
    pub version: String,
}

/// Networking of a shoot.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ShootNetworking {
    /// Network plugin.
    #[serde(default, rename = "type")]
    pub type_: String,
    /// Pod CIDR.
    #[serde(default)]
    pub pods: Option<String>,
    /// Node CIDR.
    #[serde(default)]
    pub nodes: Option<String>,
    /// Service CIDR.
    #[serde(default)]
    pub services: Option<String>,
}

/// Hibernation settings of a shoot.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Hibernation {
    /// Whether the shoot is hibernated.
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// Machine of a shoot worker pool.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ShootMachine {
    /// Machine type.
    #[serde(rename = "type")]
    pub type_: String,
    /// Machine image.
    #[serde(default)]
    pub image: Option<MachineImage>,
}

/// A worker pool as declared in the shoot.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ShootWorker {
    /// Pool name.
    pub name: String,
    /// Machine settings.
    pub machine: ShootMachine,
    /// Minimum size.
    #[serde(default)]
    pub minimum: i32,
    /// Maximum size.
    #[serde(default)]
    pub maximum: i32,
    /// Zones.
    #[serde(default)]
    pub zones: Vec<String>,
}

/// Provider section of a shoot.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ShootProvider {
    /// Provider type.
    #[serde(rename = "type")]
    pub type_: String,
    /// Worker pools.
    #[serde(default)]
    pub workers: Vec<ShootWorker>,
}

/// DNS settings of a shoot.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ShootDns {
    /// The shoot's domain.
    #[serde(default)]
    pub domain: Option<String>,
}

/// Backup settings of a shoot's etcd.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ShootBackup {
    /// Cron schedule of full snapshots.
    #[serde(default)]
    pub schedule: Option<String>,
}

/// Specification of a shoot.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShootSpec {
    /// Kubernetes settings.
    pub kubernetes: ShootKubernetes,
    /// Networking.
    #[serde(default)]
    pub networking: ShootNetworking,
    /// Provider settings.
    #[serde(default)]
    pub provider: ShootProvider,
    /// Region.
    #[serde(default)]
    pub region: String,
    /// Hibernation settings.
    #[serde(default)]
    pub hibernation: Option<Hibernation>,
    /// DNS settings.
    #[serde(default)]
    pub dns: Option<ShootDns>,
    /// Etcd backup settings.
    #[serde(default)]
    pub backup: Option<ShootBackup>,
}

/// Status of a shoot.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShootStatus {
    /// The shoot's namespace in the seed.
    #[serde(default)]
    pub technical_id: Option<String>,
}

/// A tenant cluster.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Shoot {
    /// Metadata.
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Specification.
    pub spec: ShootSpec,
    /// Status.
    #[serde(default)]
    pub status: Option<ShootStatus>,
}

/// Provider section of a seed.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct SeedProvider {
    /// Provider type.
    #[serde(rename = "type")]
    pub type_: String,
    /// Region.
    #[serde(default)]
    pub region: String,
}

/// Backup settings of a seed.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct SeedBackup {
    /// Backup provider type.
    pub provider: String,
    /// Backup region.
    #[serde(default)]
    pub region: Option<String>,
}

/// Specification of a seed.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct SeedSpec {
    /// Provider settings.
    pub provider: SeedProvider,
    /// Backup settings.
    #[serde(default)]
    pub backup: Option<SeedBackup>,
}

/// The hosting cluster.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Seed {
    /// Metadata.
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Specification.
    pub spec: SeedSpec,
}

/// A version offered by the cloud profile.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ExpirableVersion {
    /// The version.
    pub version: String,
}

/// A machine image offered by the cloud profile.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct CloudProfileMachineImage {
    /// Logical name.
    pub name: String,
    /// Offered versions.
    #[serde(default)]
    pub versions: Vec<ExpirableVersion>,
}

/// Specification of a cloud profile.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloudProfileSpec {
    /// Provider type.
    #[serde(default, rename = "type")]
    pub type_: String,
    /// Machine images.
    #[serde(default)]
    pub machine_images: Vec<CloudProfileMachineImage>,
    /// Provider specific configuration, e.g. the mapping of logical machine
    /// images to provider coordinates.
    #[serde(default)]
    pub provider_config: Option<Value>,
}

/// The catalogue of what a provider offers.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct CloudProfile {
    /// Metadata.
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Specification.
    pub spec: CloudProfileSpec,
}

/// Decoded view of a [`Cluster`]. Shared read-only between all mutators and
/// actuators handling the same shoot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClusterContext {
    /// Name of the cluster, which is the shoot's seed namespace.
    pub name: String,
    /// The cloud profile.
    pub cloud_profile: CloudProfile,
    /// The seed.
    pub seed: Seed,
    /// The shoot.
    pub shoot: Shoot,
}

impl ClusterContext {
    /// Decodes the embedded objects of a cluster resource.
    pub fn from_resource(cluster: &Cluster) -> Result<Self, Error> {
        let name = cluster.metadata.name.clone().unwrap_or_default();
        let decode = |field: &str, value: &Value| -> Result<Value, Error> {
            if value.is_null() {
                return Err(Error::invalid(field, "Required", "missing in cluster resource"));
            }
            Ok(value.clone())
        };
        let cloud_profile = serde_json::from_value(decode("spec.cloudProfile", &cluster.spec.cloud_profile)?)
            .map_err(|e| Error::invalid("spec.cloudProfile", "Invalid", e.to_string()))?;
        let seed = serde_json::from_value(decode("spec.seed", &cluster.spec.seed)?)
            .map_err(|e| Error::invalid("spec.seed", "Invalid", e.to_string()))?;
        let shoot = serde_json::from_value(decode("spec.shoot", &cluster.spec.shoot)?)
            .map_err(|e| Error::invalid("spec.shoot", "Invalid", e.to_string()))?;
        Ok(ClusterContext {
            name,
            cloud_profile,
            seed,
            shoot,
        })
    }

    /// Whether the shoot is hibernated.
    pub fn is_hibernation_enabled(&self) -> bool {
        self.shoot
            .spec
            .hibernation
            .as_ref()
            .and_then(|h| h.enabled)
            .unwrap_or(false)
    }

    /// Whether the shoot is being deleted.
    pub fn is_being_deleted(&self) -> bool {
        self.shoot.metadata.deletion_timestamp.is_some()
    }

    /// The shoot's kubernetes version.
    pub fn kubernetes_version(&self) -> &str {
        &self.shoot.spec.kubernetes.version
    }

    /// The shoot's pod CIDR.
    pub fn pods_cidr(&self) -> Option<&str> {
        self.shoot.spec.networking.pods.as_deref()
    }

    /// The shoot's worker pools.
    pub fn workers(&self) -> &[ShootWorker] {
        &self.shoot.spec.provider.workers
    }
}
