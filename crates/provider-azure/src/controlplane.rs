//! Chart values of the Azure control plane.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use extensions::apis::cluster::ClusterContext;
use extensions::apis::decode_provider_config;
use extensions::apis::extensions::ControlPlane;
use extensions::chart::Chart;
use extensions::checksum::{
    ensure_config_map_checksum_annotation, secret_checksum_annotations, Checksums,
};
use extensions::client::SeedClient;
use extensions::controlplane::{ControlPlaneCharts, ValuesProvider};
use extensions::error::Error;
use extensions::secrets::CertificateSecretConfig;
use k8s_openapi::api::core::v1::Secret;
use serde_json::{json, Value};
use tracing::debug;

use crate::apis::{ControlPlaneConfig, InfrastructureStatus};

/// Name of the config map holding the cloud provider config.
pub const CLOUD_PROVIDER_CONFIG_NAME: &str = "cloud-provider-config";
/// Name of the config map holding the kubelet's cloud provider config.
pub const CLOUD_PROVIDER_KUBELET_CONFIG_NAME: &str = "cloud-provider-config-kubelet";
/// Key of the cloud provider config in its config maps.
pub const CLOUD_PROVIDER_CONFIG_KEY: &str = "cloudprovider.conf";
/// Name of the cloud controller manager deployment and its secrets.
pub const CLOUD_CONTROLLER_MANAGER_NAME: &str = "cloud-controller-manager";
/// Name of the cloud controller manager's server certificate secret.
pub const CLOUD_CONTROLLER_MANAGER_SERVER_NAME: &str = "cloud-controller-manager-server";
/// Name of the CA signing the control plane certificates.
pub const CA_NAME: &str = "ca-provider-azure-controlplane";

/// Keys of the cloud provider credentials secret.
pub const CLIENT_ID: &str = "clientID";
/// Client secret key.
pub const CLIENT_SECRET: &str = "clientSecret";
/// Subscription key.
pub const SUBSCRIPTION_ID: &str = "subscriptionID";
/// Tenant key.
pub const TENANT_ID: &str = "tenantID";

/// The charts of the normal control plane below `dir`.
pub fn charts(dir: &Path) -> ControlPlaneCharts {
    ControlPlaneCharts {
        config: Some(
            Chart::new("cloud-provider-config", dir.join("cloud-provider-config"))
                .with_object("v1", "ConfigMap", CLOUD_PROVIDER_CONFIG_NAME)
                .with_object("v1", "ConfigMap", CLOUD_PROVIDER_KUBELET_CONFIG_NAME),
        ),
        cloud_provider_config_name: Some(CLOUD_PROVIDER_CONFIG_NAME.to_owned()),
        control_plane: Chart::new("seed-controlplane", dir.join("seed-controlplane"))
            .with_image(CLOUD_CONTROLLER_MANAGER_NAME)
            .with_object("v1", "Service", CLOUD_CONTROLLER_MANAGER_NAME)
            .with_object("apps/v1", "Deployment", CLOUD_CONTROLLER_MANAGER_NAME)
            .with_object(
                "v1",
                "ConfigMap",
                "cloud-controller-manager-monitoring-config",
            ),
        shoot: Some(Chart::new(
            "shoot-system-components",
            dir.join("shoot-system-components"),
        )),
        storage_classes: Some(Chart::new(
            "shoot-storageclasses",
            dir.join("shoot-storageclasses"),
        )),
    }
}

/// The certificates of the control plane.
pub fn secrets() -> Vec<CertificateSecretConfig> {
    vec![
        CertificateSecretConfig::client(
            CLOUD_CONTROLLER_MANAGER_NAME,
            "system:cloud-controller-manager",
            &[],
        ),
        CertificateSecretConfig::server(
            CLOUD_CONTROLLER_MANAGER_SERVER_NAME,
            CLOUD_CONTROLLER_MANAGER_NAME,
            &[
                "cloud-controller-manager",
                "cloud-controller-manager.kube-system",
            ],
        ),
    ]
}

/// Credentials of a service principal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    /// Client id.
    pub client_id: String,
    /// Client secret.
    pub client_secret: String,
    /// Subscription id.
    pub subscription_id: String,
    /// Tenant id.
    pub tenant_id: String,
}

impl Credentials {
    /// Reads the credentials from a cloud provider secret.
    pub fn from_secret(secret: &Secret) -> Result<Self, Error> {
        let data = secret.data.clone().unwrap_or_default();
        let get = |key: &str| -> Result<String, Error> {
            data.get(key)
                .map(|v| String::from_utf8_lossy(&v.0).into_owned())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    Error::invalid(
                        format!("secret.data.{}", key),
                        "Required",
                        "missing in cloud provider secret",
                    )
                })
        };
        Ok(Credentials {
            client_id: get(CLIENT_ID)?,
            client_secret: get(CLIENT_SECRET)?,
            subscription_id: get(SUBSCRIPTION_ID)?,
            tenant_id: get(TENANT_ID)?,
        })
    }

    /// The credentials keyed as machine class secrets expect them.
    pub fn machine_class_secret(&self) -> BTreeMap<String, String> {
        let mut secret = BTreeMap::new();
        secret.insert("azureClientId".to_owned(), self.client_id.clone());
        secret.insert("azureClientSecret".to_owned(), self.client_secret.clone());
        secret.insert("azureSubscriptionId".to_owned(), self.subscription_id.clone());
        secret.insert("azureTenantId".to_owned(), self.tenant_id.clone());
        secret
    }
}

/// Reads the credentials referenced by `secret_ref` in `namespace`.
pub async fn read_credentials(
    client: &dyn SeedClient,
    namespace: &str,
    name: &str,
) -> anyhow::Result<Credentials> {
    let secret = client
        .get_secret(namespace, name)
        .await?
        .ok_or_else(|| Error::NotFound {
            kind: "Secret".to_owned(),
            name: format!("{}/{}", namespace, name),
        })?;
    Ok(Credentials::from_secret(&secret)?)
}

/// Computes the chart values of the Azure control plane.
pub struct AzureValuesProvider {
    client: Arc<dyn SeedClient>,
}

impl AzureValuesProvider {
    /// Creates a values provider reading credentials through `client`.
    pub fn new(client: Arc<dyn SeedClient>) -> Self {
        AzureValuesProvider { client }
    }
}

fn namespace(cp: &ControlPlane) -> Result<&str, Error> {
    cp.metadata
        .namespace
        .as_deref()
        .ok_or_else(|| Error::invalid("metadata.namespace", "Required", "controlplane has no namespace"))
}

fn infrastructure_status(cp: &ControlPlane) -> Result<InfrastructureStatus, Error> {
    match &cp.spec.infrastructure_provider_status {
        Some(status) => decode_provider_config("spec.infrastructureProviderStatus", status),
        None => Err(Error::InfrastructureStatusMissing(
            cp.metadata.name.clone().unwrap_or_default(),
        )),
    }
}

#[async_trait::async_trait]
impl ValuesProvider for AzureValuesProvider {
    async fn config_chart_values(
        &self,
        cp: &ControlPlane,
        cluster: &ClusterContext,
    ) -> anyhow::Result<Value> {
        let namespace = namespace(cp)?;
        let infra = infrastructure_status(cp)?;
        let secret_namespace = cp.spec.secret_ref.namespace.as_deref().unwrap_or(namespace);
        let credentials = read_credentials(self.client.as_ref(), secret_namespace, &cp.spec.secret_ref.name)
            .await
            .with_context(|| format!("could not get service account from secret '{}/{}'", secret_namespace, cp.spec.secret_ref.name))?;

        let mut values = json!({
            "tenantId": credentials.tenant_id,
            "subscriptionId": credentials.subscription_id,
            "aadClientId": credentials.client_id,
            "aadClientSecret": credentials.client_secret,
            "resourceGroup": infra.resource_group.name,
            "vnetName": infra.networks.vnet.name,
            "subnetName": infra.nodes_subnet()?.name,
            "routeTableName": infra.nodes_route_table()?.name,
            "securityGroupName": infra.nodes_security_group()?.name,
            "region": cp.spec.region,
            "kubernetesVersion": cluster.kubernetes_version(),
        });
        if let Some(group) = &infra.networks.vnet.resource_group {
            values["vnetResourceGroup"] = json!(group);
        }
        if !infra.zoned {
            values["availabilitySetName"] = json!(infra.nodes_availability_set()?.name);
        }
        debug!(%namespace, zoned = infra.zoned, "Computed cloud provider config values");
        Ok(values)
    }

    async fn control_plane_chart_values(
        &self,
        cp: &ControlPlane,
        cluster: &ClusterContext,
        checksums: &Checksums,
        scaled_down: bool,
    ) -> anyhow::Result<Value> {
        let namespace = namespace(cp)?;
        let config: ControlPlaneConfig = match &cp.spec.provider_config {
            Some(config) => decode_provider_config("spec.providerConfig", config)?,
            None => ControlPlaneConfig::default(),
        };

        let mut annotations = secret_checksum_annotations(
            checksums,
            &[
                CLOUD_CONTROLLER_MANAGER_NAME,
                CLOUD_CONTROLLER_MANAGER_SERVER_NAME,
                &cp.spec.secret_ref.name,
            ],
        );
        if let Some(checksum) = checksums.get(CLOUD_PROVIDER_CONFIG_NAME) {
            ensure_config_map_checksum_annotation(&mut annotations, CLOUD_PROVIDER_CONFIG_NAME, checksum);
        }

        let feature_gates = config
            .cloud_controller_manager
            .map(|c| c.feature_gates)
            .unwrap_or_default();

        Ok(json!({
            "cloud-controller-manager": {
                "replicas": if scaled_down { 0 } else { 1 },
                "clusterName": namespace,
                "kubernetesVersion": cluster.kubernetes_version(),
                "podNetwork": cluster.pods_cidr().unwrap_or_default(),
                "podAnnotations": annotations,
                "featureGates": feature_gates,
            }
        }))
    }

    async fn storage_class_chart_values(
        &self,
        _cp: &ControlPlane,
        cluster: &ClusterContext,
    ) -> anyhow::Result<Value> {
        Ok(json!({ "kubernetesVersion": cluster.kubernetes_version() }))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::ByteString;

    fn secret(pairs: &[(&str, &str)]) -> Secret {
        Secret {
            data: Some(
                pairs
                    .iter()
                    .map(|(k, v)| ((*k).to_owned(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn credentials_need_all_keys() {
        let full = secret(&[
            (CLIENT_ID, "C"),
            (CLIENT_SECRET, "S"),
            (SUBSCRIPTION_ID, "Sub"),
            (TENANT_ID, "T"),
        ]);
        let credentials = Credentials::from_secret(&full).unwrap();
        assert_eq!(credentials.subscription_id, "Sub");
        assert_eq!(credentials.machine_class_secret()["azureTenantId"], "T");

        let partial = secret(&[(CLIENT_ID, "C"), (CLIENT_SECRET, "S")]);
        assert!(matches!(
            Credentials::from_secret(&partial),
            Err(Error::Invalid { .. })
        ));
    }

    #[test]
    fn charts_declare_what_they_create() {
        let charts = charts(Path::new("/charts"));
        let config = charts.config.unwrap();
        assert_eq!(config.objects.len(), 2);
        assert_eq!(charts.control_plane.images, vec!["cloud-controller-manager"]);
        assert!(charts.shoot.is_some());
        assert!(charts.storage_classes.is_some());
    }
}
