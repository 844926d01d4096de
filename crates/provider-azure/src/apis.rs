//! Provider specific configuration and status blobs of Azure.

use extensions::error::Error;
use extensions::worker::MachineImageRef;
use serde::{Deserialize, Serialize};

/// Purpose of subnets, availability sets, route tables and security groups
/// used by the worker nodes.
pub const PURPOSE_NODES: &str = "nodes";

/// What the infrastructure actuator created, as recorded in
/// `Infrastructure.status.providerStatus`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureStatus {
    /// The resource group of the shoot.
    #[serde(default)]
    pub resource_group: ResourceGroup,
    /// Networks of the shoot.
    #[serde(default)]
    pub networks: NetworkStatus,
    /// Availability sets. Empty for zoned clusters.
    #[serde(default)]
    pub availability_sets: Vec<AvailabilitySet>,
    /// Route tables.
    #[serde(default)]
    pub route_tables: Vec<RouteTable>,
    /// Security groups.
    #[serde(default)]
    pub security_groups: Vec<SecurityGroup>,
    /// Whether the cluster spans availability zones.
    #[serde(default)]
    pub zoned: bool,
}

/// An Azure resource group.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ResourceGroup {
    /// Name.
    pub name: String,
}

/// Virtual network and subnets.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct NetworkStatus {
    /// The virtual network.
    #[serde(default)]
    pub vnet: VNetStatus,
    /// Subnets of the virtual network.
    #[serde(default)]
    pub subnets: Vec<Subnet>,
}

/// A virtual network.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VNetStatus {
    /// Name.
    pub name: String,
    /// Resource group of an existing virtual network.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_group: Option<String>,
}

/// A subnet.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Subnet {
    /// Name.
    pub name: String,
    /// Purpose, e.g. `nodes`.
    pub purpose: String,
}

/// An availability set.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct AvailabilitySet {
    /// Purpose, e.g. `nodes`.
    pub purpose: String,
    /// Azure resource id.
    pub id: String,
    /// Name.
    #[serde(default)]
    pub name: String,
}

/// A route table.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct RouteTable {
    /// Purpose, e.g. `nodes`.
    pub purpose: String,
    /// Name.
    pub name: String,
}

/// A security group.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct SecurityGroup {
    /// Purpose, e.g. `nodes`.
    pub purpose: String,
    /// Name.
    pub name: String,
}

fn missing(field: &str) -> Error {
    Error::invalid(
        format!("infrastructureProviderStatus.{}", field),
        "NotFound",
        format!("no {} with purpose {}", field, PURPOSE_NODES),
    )
}

impl InfrastructureStatus {
    /// The subnet of the worker nodes.
    pub fn nodes_subnet(&self) -> Result<&Subnet, Error> {
        self.networks
            .subnets
            .iter()
            .find(|s| s.purpose == PURPOSE_NODES)
            .ok_or_else(|| missing("subnets"))
    }

    /// The availability set of the worker nodes. Zoned clusters have none.
    pub fn nodes_availability_set(&self) -> Result<&AvailabilitySet, Error> {
        self.availability_sets
            .iter()
            .find(|s| s.purpose == PURPOSE_NODES)
            .ok_or_else(|| missing("availabilitySets"))
    }

    /// The route table of the worker nodes.
    pub fn nodes_route_table(&self) -> Result<&RouteTable, Error> {
        self.route_tables
            .iter()
            .find(|r| r.purpose == PURPOSE_NODES)
            .ok_or_else(|| missing("routeTables"))
    }

    /// The security group of the worker nodes.
    pub fn nodes_security_group(&self) -> Result<&SecurityGroup, Error> {
        self.security_groups
            .iter()
            .find(|s| s.purpose == PURPOSE_NODES)
            .ok_or_else(|| missing("securityGroups"))
    }
}

/// `ControlPlane.spec.providerConfig`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneConfig {
    /// Settings of the cloud controller manager.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_controller_manager: Option<CloudControllerManagerConfig>,
}

/// Settings of the cloud controller manager.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloudControllerManagerConfig {
    /// Feature gates passed to the cloud controller manager.
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub feature_gates: std::collections::BTreeMap<String, bool>,
}

/// `CloudProfile.spec.providerConfig`: how logical machine images map to
/// Azure marketplace images.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloudProfileConfig {
    /// Machine images of the profile.
    #[serde(default)]
    pub machine_images: Vec<MachineImages>,
}

/// All versions of one logical machine image.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct MachineImages {
    /// Logical name, e.g. `ubuntu`.
    pub name: String,
    /// Available versions.
    #[serde(default)]
    pub versions: Vec<MachineImageVersion>,
}

/// One version of a machine image.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct MachineImageVersion {
    /// Version.
    pub version: String,
    /// Marketplace URN, `publisher:offer:sku:version`.
    pub urn: String,
}

/// A machine image resolved to its URN, as recorded in the worker status.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct MachineImage {
    /// Logical name.
    pub name: String,
    /// Version.
    pub version: String,
    /// Marketplace URN.
    pub urn: String,
}

impl MachineImageRef for MachineImage {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }
}

impl CloudProfileConfig {
    /// Flattens the configured images.
    pub fn images(&self) -> Vec<MachineImage> {
        self.machine_images
            .iter()
            .flat_map(|image| {
                image.versions.iter().map(move |v| MachineImage {
                    name: image.name.clone(),
                    version: v.version.clone(),
                    urn: v.urn.clone(),
                })
            })
            .collect()
    }
}

/// `Worker.status.providerStatus`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    /// Images used by the pools.
    #[serde(default)]
    pub machine_images: Vec<MachineImage>,
}
