//! Mutations of control planes that are exposed through seed load balancers.

use std::sync::Arc;

use anyhow::Context;
use extensions::apis::cluster::ClusterContext;
use extensions::checksum::{compute_secret_checksum, ensure_secret_checksum_annotation};
use extensions::client::SeedClient;
use extensions::error::Error;
use extensions::imagevector::ImageVector;
use extensions::merge::{ensure_named, ensure_string_with_prefix};
use extensions::webhook::{deployment_container, Ensurer, EnsurerContext, ETCD_EVENTS, KUBE_APISERVER};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, SecretKeySelector, Service, VolumeMount,
};
use lazy_static::lazy_static;
use tracing::{debug, info};

use crate::{ETCD_BACKUP_RESTORE_IMAGE_NAME, STORAGE_PROVIDER};

/// Full snapshot schedule of etcd backups.
pub const DEFAULT_BACKUP_SCHEDULE: &str = "0 */24 * * *";
/// Name of the secret holding the backup bucket credentials.
pub const BACKUP_SECRET_NAME: &str = "etcd-backup";
/// Name of the backup sidecar.
pub const BACKUP_RESTORE_CONTAINER: &str = "backup-restore";

const ADVERTISE_ADDRESS_FLAG: &str = "--advertise-address=";
const ETCD_DATA_DIR: &str = "/var/etcd/data";

lazy_static! {
    static ref BACKUP_ENV: Vec<(&'static str, &'static str)> = vec![
        ("STORAGE_CONTAINER", "bucketName"),
        ("ALICLOUD_ENDPOINT", "storageEndpoint"),
        ("ALICLOUD_ACCESS_KEY_ID", "accessKeyID"),
        ("ALICLOUD_ACCESS_KEY_SECRET", "accessKeySecret"),
    ];
}

/// Points the API server at its load balancer and adds backup sidecars to
/// etcd.
pub struct ExposureEnsurer {
    client: Arc<dyn SeedClient>,
    images: Arc<ImageVector>,
}

impl ExposureEnsurer {
    /// Creates an ensurer reading services and secrets through `client`.
    pub fn new(client: Arc<dyn SeedClient>, images: Arc<ImageVector>) -> Self {
        ExposureEnsurer { client, images }
    }

    async fn load_balancer_address(&self, namespace: &str) -> anyhow::Result<Option<String>> {
        let service = self
            .client
            .get_service(namespace, KUBE_APISERVER)
            .await
            .with_context(|| format!("could not get service '{}/{}'", namespace, KUBE_APISERVER))?;
        Ok(service.as_ref().and_then(ingress_address))
    }
}

fn ingress_address(service: &Service) -> Option<String> {
    let ingress = service
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .first()?;
    ingress.ip.clone().or_else(|| ingress.hostname.clone())
}

/// The full snapshot schedule of a cluster's etcd. Configured schedules are
/// not honoured; every cluster is backed up on the default schedule.
pub fn backup_schedule(cluster: &ClusterContext) -> &'static str {
    if let Some(configured) = cluster
        .shoot
        .spec
        .backup
        .as_ref()
        .and_then(|backup| backup.schedule.as_deref())
    {
        debug!(%configured, "Using the default backup schedule");
    }
    DEFAULT_BACKUP_SCHEDULE
}

fn backup_restore_container(
    name: &str,
    image: String,
    schedule: &str,
    storage_provider: &str,
) -> Container {
    let command = vec![
        "etcdbrctl".to_owned(),
        "server".to_owned(),
        format!("--schedule={}", schedule),
        format!("--data-dir={}/new.etcd", ETCD_DATA_DIR),
        format!("--storage-provider={}", storage_provider),
        format!("--store-prefix={}", name),
        "--cert=/root/etcd-ssl/client/tls.crt".to_owned(),
        "--key=/root/etcd-ssl/client/tls.key".to_owned(),
        "--cacert=/root/etcd-ssl/ca/ca.crt".to_owned(),
        "--insecure-transport=false".to_owned(),
        "--insecure-skip-tls-verify=false".to_owned(),
        format!("--endpoints=https://{}-local:2379", name),
        "--etcd-connection-timeout=300".to_owned(),
        "--delta-snapshot-period-seconds=300".to_owned(),
        "--delta-snapshot-memory-limit=104857600".to_owned(),
        "--garbage-collection-period-seconds=43200".to_owned(),
        format!("--snapstore-temp-directory={}/temp", ETCD_DATA_DIR),
    ];
    let env = if storage_provider.is_empty() {
        None
    } else {
        Some(
            BACKUP_ENV
                .iter()
                .map(|(variable, key)| EnvVar {
                    name: (*variable).to_owned(),
                    value_from: Some(EnvVarSource {
                        secret_key_ref: Some(SecretKeySelector {
                            name: Some(BACKUP_SECRET_NAME.to_owned()),
                            key: (*key).to_owned(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                })
                .collect(),
        )
    };
    Container {
        name: BACKUP_RESTORE_CONTAINER.to_owned(),
        image: Some(image),
        image_pull_policy: Some("IfNotPresent".to_owned()),
        command: Some(command),
        env,
        ports: Some(vec![ContainerPort {
            name: Some("server".to_owned()),
            container_port: 8080,
            protocol: Some("TCP".to_owned()),
            ..Default::default()
        }]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: name.to_owned(),
                mount_path: ETCD_DATA_DIR.to_owned(),
                ..Default::default()
            },
            VolumeMount {
                name: "ca-etcd".to_owned(),
                mount_path: "/root/etcd-ssl/ca".to_owned(),
                ..Default::default()
            },
            VolumeMount {
                name: "etcd-client-tls".to_owned(),
                mount_path: "/root/etcd-ssl/client".to_owned(),
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

#[async_trait::async_trait]
impl Ensurer for ExposureEnsurer {
    async fn ensure_kube_apiserver_deployment(
        &self,
        ctx: &EnsurerContext,
        deployment: &mut Deployment,
    ) -> anyhow::Result<()> {
        let namespace = ctx.namespace();
        let address = match self.load_balancer_address(namespace).await? {
            Some(address) => address,
            None => {
                debug!(%namespace, "API server load balancer has no address yet");
                return Ok(());
            }
        };
        if let Some(container) = deployment_container(deployment, KUBE_APISERVER) {
            let command = container.command.get_or_insert_with(Vec::new);
            ensure_string_with_prefix(command, ADVERTISE_ADDRESS_FLAG, &address);
            info!(%namespace, %address, "Ensured API server advertise address");
        }
        Ok(())
    }

    async fn ensure_etcd_stateful_set(
        &self,
        ctx: &EnsurerContext,
        stateful_set: &mut StatefulSet,
        cluster: &ClusterContext,
    ) -> anyhow::Result<()> {
        let namespace = ctx.namespace();
        let name = stateful_set
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::invalid("metadata.name", "Required", "stateful set has no name"))?;
        let image = self
            .images
            .find_image(
                ETCD_BACKUP_RESTORE_IMAGE_NAME,
                None,
                Some(cluster.kubernetes_version()),
            )?
            .reference();

        let backed_up = name != ETCD_EVENTS && cluster.seed.spec.backup.is_some();
        let storage_provider = if backed_up { STORAGE_PROVIDER } else { "" };
        let container =
            backup_restore_container(&name, image, backup_schedule(cluster), storage_provider);

        let checksum = if backed_up {
            let secret = self
                .client
                .get_secret(namespace, BACKUP_SECRET_NAME)
                .await
                .with_context(|| format!("could not get secret '{}/{}'", namespace, BACKUP_SECRET_NAME))?
                .ok_or_else(|| Error::NotFound {
                    kind: "Secret".to_owned(),
                    name: format!("{}/{}", namespace, BACKUP_SECRET_NAME),
                })?;
            Some(compute_secret_checksum(&secret.data.unwrap_or_default()))
        } else {
            None
        };

        if let Some(spec) = stateful_set.spec.as_mut() {
            if let Some(pod) = spec.template.spec.as_mut() {
                ensure_named(&mut pod.containers, container);
            }
            if let Some(checksum) = checksum {
                let metadata = spec.template.metadata.get_or_insert_with(Default::default);
                ensure_secret_checksum_annotation(
                    metadata.annotations.get_or_insert_with(Default::default),
                    BACKUP_SECRET_NAME,
                    &checksum,
                );
            }
        }
        debug!(%namespace, %name, backed_up, "Ensured etcd backup sidecar");
        Ok(())
    }
}
