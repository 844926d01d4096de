//! Admission time mutations of the Azure control plane.

use std::sync::Arc;

use anyhow::Context;
use extensions::checksum::{compute_config_map_checksum, ensure_config_map_checksum_annotation};
use extensions::client::SeedClient;
use extensions::merge::{
    ensure_no_string_with_prefix_contains, ensure_string_with_prefix,
    ensure_string_with_prefix_contains, ensure_volume, ensure_volume_mount,
};
use extensions::unit::UnitOption;
use extensions::webhook::{
    deployment_container, ensure_exec_start, Ensurer, EnsurerContext, KubeletConfiguration,
    KUBE_APISERVER, KUBE_CONTROLLER_MANAGER,
};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMapVolumeSource, Container, Volume, VolumeMount};
use lazy_static::lazy_static;
use tracing::{debug, warn};

use crate::controlplane::{
    CLOUD_PROVIDER_CONFIG_KEY, CLOUD_PROVIDER_CONFIG_NAME, CLOUD_PROVIDER_KUBELET_CONFIG_NAME,
};
use crate::PROVIDER_NAME;

const CLOUD_PROVIDER_CONFIG_MOUNT_PATH: &str = "/etc/kubernetes/cloudprovider";
const KUBELET_CLOUD_PROVIDER_CONFIG_PATH: &str = "/var/lib/kubelet/cloudprovider.conf";

lazy_static! {
    static ref CLOUD_PROVIDER_CONFIG_VOLUME_MOUNT: VolumeMount = VolumeMount {
        name: CLOUD_PROVIDER_CONFIG_NAME.to_owned(),
        mount_path: CLOUD_PROVIDER_CONFIG_MOUNT_PATH.to_owned(),
        ..Default::default()
    };
    static ref CLOUD_PROVIDER_CONFIG_VOLUME: Volume = Volume {
        name: CLOUD_PROVIDER_CONFIG_NAME.to_owned(),
        config_map: Some(ConfigMapVolumeSource {
            name: Some(CLOUD_PROVIDER_CONFIG_NAME.to_owned()),
            default_mode: Some(0o644),
            ..Default::default()
        }),
        ..Default::default()
    };
}

/// Mutates control plane components and kubelets of Azure shoots.
pub struct AzureEnsurer {
    client: Arc<dyn SeedClient>,
}

impl AzureEnsurer {
    /// Creates an ensurer reading the cloud provider config through `client`.
    pub fn new(client: Arc<dyn SeedClient>) -> Self {
        AzureEnsurer { client }
    }

    async fn ensure_checksum_annotation(
        &self,
        namespace: &str,
        deployment: &mut Deployment,
    ) -> anyhow::Result<()> {
        let config_map = self
            .client
            .get_config_map(namespace, CLOUD_PROVIDER_CONFIG_NAME)
            .await
            .with_context(|| {
                format!(
                    "could not get config map '{}/{}'",
                    namespace, CLOUD_PROVIDER_CONFIG_NAME
                )
            })?;
        let config_map = match config_map {
            Some(config_map) => config_map,
            None => {
                debug!(%namespace, "Cloud provider config not yet deployed");
                return Ok(());
            }
        };
        let checksum = compute_config_map_checksum(&config_map.data.unwrap_or_default());
        if let Some(spec) = deployment.spec.as_mut() {
            let metadata = spec.template.metadata.get_or_insert_with(Default::default);
            ensure_config_map_checksum_annotation(
                metadata.annotations.get_or_insert_with(Default::default),
                CLOUD_PROVIDER_CONFIG_NAME,
                &checksum,
            );
        }
        Ok(())
    }
}

fn ensure_cloud_provider_flags(command: &mut Vec<String>) {
    ensure_string_with_prefix(command, "--cloud-provider=", PROVIDER_NAME);
    ensure_string_with_prefix(
        command,
        "--cloud-config=",
        &format!("{}/{}", CLOUD_PROVIDER_CONFIG_MOUNT_PATH, CLOUD_PROVIDER_CONFIG_KEY),
    );
}

fn ensure_kube_apiserver_command(container: &mut Container) {
    let command = container.command.get_or_insert_with(Vec::new);
    ensure_cloud_provider_flags(command);
    ensure_no_string_with_prefix_contains(
        command,
        "--enable-admission-plugins=",
        "PersistentVolumeLabel",
        ",",
    );
    ensure_string_with_prefix_contains(
        command,
        "--disable-admission-plugins=",
        "PersistentVolumeLabel",
        ",",
    );
}

fn ensure_kube_controller_manager_command(container: &mut Container) {
    let command = container.command.get_or_insert_with(Vec::new);
    ensure_cloud_provider_flags(command);
    ensure_string_with_prefix(command, "--external-cloud-volume-plugin=", PROVIDER_NAME);
}

fn ensure_cloud_provider_config_volume(deployment: &mut Deployment) {
    if let Some(pod) = deployment
        .spec
        .as_mut()
        .and_then(|spec| spec.template.spec.as_mut())
    {
        ensure_volume(&mut pod.volumes, CLOUD_PROVIDER_CONFIG_VOLUME.clone());
    }
}

#[async_trait::async_trait]
impl Ensurer for AzureEnsurer {
    async fn ensure_kube_apiserver_deployment(
        &self,
        ctx: &EnsurerContext,
        deployment: &mut Deployment,
    ) -> anyhow::Result<()> {
        if let Some(container) = deployment_container(deployment, KUBE_APISERVER) {
            ensure_kube_apiserver_command(container);
            ensure_volume_mount(container, CLOUD_PROVIDER_CONFIG_VOLUME_MOUNT.clone());
        }
        ensure_cloud_provider_config_volume(deployment);
        self.ensure_checksum_annotation(ctx.namespace(), deployment).await
    }

    async fn ensure_kube_controller_manager_deployment(
        &self,
        ctx: &EnsurerContext,
        deployment: &mut Deployment,
    ) -> anyhow::Result<()> {
        if let Some(container) = deployment_container(deployment, KUBE_CONTROLLER_MANAGER) {
            ensure_kube_controller_manager_command(container);
            ensure_volume_mount(container, CLOUD_PROVIDER_CONFIG_VOLUME_MOUNT.clone());
        }
        ensure_cloud_provider_config_volume(deployment);
        self.ensure_checksum_annotation(ctx.namespace(), deployment).await
    }

    async fn ensure_kubelet_service_unit_options(
        &self,
        _ctx: &EnsurerContext,
        mut options: Vec<UnitOption>,
    ) -> anyhow::Result<Vec<UnitOption>> {
        ensure_exec_start(&mut options, |command| {
            ensure_string_with_prefix(command, "--cloud-provider=", PROVIDER_NAME);
            ensure_string_with_prefix(
                command,
                "--cloud-config=",
                KUBELET_CLOUD_PROVIDER_CONFIG_PATH,
            );
        });
        Ok(options)
    }

    async fn ensure_kubelet_configuration(
        &self,
        _ctx: &EnsurerContext,
        config: &mut KubeletConfiguration,
    ) -> anyhow::Result<()> {
        config.enable_controller_attach_detach = Some(true);
        Ok(())
    }

    async fn ensure_kubelet_cloud_provider_config(
        &self,
        ctx: &EnsurerContext,
        content: &mut String,
    ) -> anyhow::Result<()> {
        let namespace = ctx.namespace();
        let config_map = self
            .client
            .get_config_map(namespace, CLOUD_PROVIDER_KUBELET_CONFIG_NAME)
            .await
            .with_context(|| {
                format!(
                    "could not get config map '{}/{}'",
                    namespace, CLOUD_PROVIDER_KUBELET_CONFIG_NAME
                )
            })?;
        match config_map
            .and_then(|cm| cm.data)
            .and_then(|mut data| data.remove(CLOUD_PROVIDER_CONFIG_KEY))
        {
            Some(config) => *content = config,
            None => warn!(%namespace, "Kubelet cloud provider config not found, leaving it empty"),
        }
        Ok(())
    }
}
