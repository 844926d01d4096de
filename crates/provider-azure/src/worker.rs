//! Azure machine classes for worker pools.

use std::sync::Arc;

use anyhow::Context;
use extensions::apis::cluster::ClusterContext;
use extensions::apis::decode_provider_config;
use extensions::apis::extensions::{Worker, WorkerPool};
use extensions::client::SeedClient;
use extensions::error::Error;
use extensions::quantity::parse_bytes;
use extensions::worker::{
    append_machine_image, class_name, decode_provider_status, deployment_name,
    distribute_over_zones, distribute_positive_int_or_percent, encode_provider_status,
    find_machine_image, finish_machine_class, machine_class_hash, zoned_deployment_name,
    MachineClass, MachineConfig, MachineDeployment, WorkerDelegate,
};
use serde_json::{json, Value};
use tracing::debug;

use crate::apis::{CloudProfileConfig, InfrastructureStatus, MachineImage, WorkerStatus};
use crate::controlplane::{read_credentials, Credentials};
use crate::MACHINE_CLASS_KIND;

/// Generates Azure machine classes.
pub struct AzureWorkerDelegate {
    client: Arc<dyn SeedClient>,
}

impl AzureWorkerDelegate {
    /// Creates a delegate reading credentials through `client`.
    pub fn new(client: Arc<dyn SeedClient>) -> Self {
        AzureWorkerDelegate { client }
    }
}

/// Everything that is the same for all pools of a worker.
struct PoolContext<'a> {
    namespace: &'a str,
    worker: &'a Worker,
    infra: InfrastructureStatus,
    credentials: Credentials,
    kubernetes_version: &'a str,
}

impl PoolContext<'_> {
    fn base_class(&self, pool: &WorkerPool, image: &MachineImage) -> Result<MachineClass, Error> {
        let subnet = self.infra.nodes_subnet()?;
        let mut tags = serde_json::Map::new();
        tags.insert("Name".to_owned(), json!(self.namespace));
        tags.insert(format!("kubernetes.io-cluster-{}", self.namespace), json!("1"));
        tags.insert("kubernetes.io-role-node".to_owned(), json!("1"));

        let mut class = MachineClass::new();
        class.insert("region".to_owned(), json!(self.worker.spec.region));
        class.insert("resourceGroup".to_owned(), json!(self.infra.resource_group.name));
        class.insert("vnetName".to_owned(), json!(self.infra.networks.vnet.name));
        if let Some(group) = &self.infra.networks.vnet.resource_group {
            class.insert("vnetResourceGroup".to_owned(), json!(group));
        }
        class.insert("subnetName".to_owned(), json!(subnet.name));
        class.insert("tags".to_owned(), Value::Object(tags));
        class.insert("machineType".to_owned(), json!(pool.machine_type));
        class.insert("image".to_owned(), json!({ "urn": image.urn }));
        // Disk size in bytes.
        if let Some(volume) = &pool.volume {
            class.insert("volumeSize".to_owned(), json!(parse_bytes(&volume.size)?));
        }
        if let Some(key) = &self.worker.spec.ssh_public_key {
            class.insert("sshPublicKey".to_owned(), json!(key));
        }
        Ok(class)
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        mut class: MachineClass,
        deployment: String,
        pool: &WorkerPool,
        minimum: i32,
        maximum: i32,
        zone_index: usize,
        zones: usize,
        config: &mut MachineConfig,
    ) -> Result<(), Error> {
        let hash = machine_class_hash(&class, self.kubernetes_version)?;
        let class_name = class_name(&deployment, &hash);
        finish_machine_class(
            &mut class,
            &class_name,
            &self.credentials.machine_class_secret(),
            pool,
        );
        config.classes.push(class);
        config.deployments.push(MachineDeployment {
            name: deployment,
            secret_name: class_name.clone(),
            class_name,
            minimum,
            maximum,
            max_surge: distribute_positive_int_or_percent(zone_index, &pool.max_surge, zones),
            max_unavailable: distribute_positive_int_or_percent(
                zone_index,
                &pool.max_unavailable,
                zones,
            ),
            labels: pool.labels.clone(),
            annotations: pool.annotations.clone(),
            taints: pool.taints.clone(),
        });
        Ok(())
    }
}

#[async_trait::async_trait]
impl WorkerDelegate for AzureWorkerDelegate {
    fn machine_class_kind(&self) -> &str {
        MACHINE_CLASS_KIND
    }

    async fn generate_machine_config(
        &self,
        worker: &Worker,
        cluster: &ClusterContext,
    ) -> anyhow::Result<MachineConfig> {
        let namespace = worker
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::invalid("metadata.namespace", "Required", "worker has no namespace"))?;
        let infra: InfrastructureStatus = match &worker.spec.infrastructure_provider_status {
            Some(status) => decode_provider_config("spec.infrastructureProviderStatus", status)?,
            None => {
                return Err(Error::InfrastructureStatusMissing(
                    worker.metadata.name.clone().unwrap_or_default(),
                )
                .into())
            }
        };
        let profile: CloudProfileConfig = match &cluster.cloud_profile.spec.provider_config {
            Some(config) => decode_provider_config("cloudProfile.spec.providerConfig", config)?,
            None => CloudProfileConfig::default(),
        };
        let previous: WorkerStatus = decode_provider_status(worker)?;
        let secret_ref = &worker.spec.secret_ref;
        let secret_namespace = secret_ref.namespace.as_deref().unwrap_or(namespace);
        let credentials = read_credentials(self.client.as_ref(), secret_namespace, &secret_ref.name)
            .await
            .with_context(|| format!("could not get service account from secret '{}/{}'", secret_namespace, secret_ref.name))?;

        let ctx = PoolContext {
            namespace,
            worker,
            infra,
            credentials,
            kubernetes_version: cluster.kubernetes_version(),
        };
        let profile_images = profile.images();
        let mut config = MachineConfig::default();
        let mut used_images = Vec::new();

        for pool in &worker.spec.pools {
            let image = find_machine_image(
                &profile_images,
                &previous.machine_images,
                &pool.machine_image.name,
                &pool.machine_image.version,
            )?;
            append_machine_image(&mut used_images, image.clone());
            let class = ctx.base_class(pool, &image)?;

            if ctx.infra.zoned {
                if pool.zones.is_empty() {
                    return Err(Error::invalid(
                        format!("spec.pools[{}].zones", pool.name),
                        "Required",
                        format!("pool {:?} has no zones but the infrastructure is zoned", pool.name),
                    )
                    .into());
                }
                let zones = pool.zones.len();
                for (index, zone) in pool.zones.iter().enumerate() {
                    let mut zoned = class.clone();
                    zoned.insert("zone".to_owned(), json!(zone));
                    ctx.finish(
                        zoned,
                        zoned_deployment_name(namespace, &pool.name, index),
                        pool,
                        distribute_over_zones(index, pool.minimum, zones),
                        distribute_over_zones(index, pool.maximum, zones),
                        index,
                        zones,
                        &mut config,
                    )?;
                }
            } else {
                let mut class = class;
                class.insert(
                    "availabilitySetID".to_owned(),
                    json!(ctx.infra.nodes_availability_set()?.id),
                );
                ctx.finish(
                    class,
                    deployment_name(namespace, &pool.name),
                    pool,
                    pool.minimum,
                    pool.maximum,
                    0,
                    1,
                    &mut config,
                )?;
            }
            debug!(pool = %pool.name, image = %image.urn, "Generated machine classes");
        }

        config.provider_status = Some(encode_provider_status(&WorkerStatus {
            machine_images: used_images,
        })?);
        Ok(config)
    }
}
