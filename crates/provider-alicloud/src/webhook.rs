//! Admission time mutations of Alibaba Cloud kubelets and controllers.

use extensions::error::Error;
use extensions::merge::{
    ensure_no_string_with_prefix_contains, ensure_string_with_prefix,
    ensure_string_with_prefix_contains,
};
use extensions::unit::UnitOption;
use extensions::version;
use extensions::webhook::{
    deployment_container, ensure_exec_start, Ensurer, EnsurerContext, KubeletConfiguration,
    KUBE_APISERVER, KUBE_CONTROLLER_MANAGER,
};
use k8s_openapi::api::apps::v1::Deployment;
use tracing::debug;

const FEATURE_GATES_FLAG: &str = "--feature-gates=";

// Alicloud's CSI plugins need snapshots on every version; node info and
// driver registry are on by default from 1.16.
const ALWAYS: &[&str] = &["VolumeSnapshotDataSource"];
const BEFORE_1_16: &[&str] = &["CSINodeInfo", "CSIDriverRegistry"];

/// Feature gates to set to `true` and to remove for `kubernetes_version`.
pub fn csi_feature_gates(
    kubernetes_version: &str,
) -> Result<(Vec<&'static str>, Vec<&'static str>), Error> {
    let mut enabled = ALWAYS.to_vec();
    if version::is_at_least(kubernetes_version, "1.16")? {
        Ok((enabled, BEFORE_1_16.to_vec()))
    } else {
        enabled.extend_from_slice(BEFORE_1_16);
        Ok((enabled, Vec::new()))
    }
}

/// Mutates kubelets and controllers of Alibaba Cloud shoots.
#[derive(Clone, Debug, Default)]
pub struct AlicloudEnsurer;

impl AlicloudEnsurer {
    /// Creates an ensurer.
    pub fn new() -> Self {
        AlicloudEnsurer
    }
}

#[async_trait::async_trait]
impl Ensurer for AlicloudEnsurer {
    async fn ensure_kube_apiserver_deployment(
        &self,
        ctx: &EnsurerContext,
        deployment: &mut Deployment,
    ) -> anyhow::Result<()> {
        let cluster = ctx.cluster().await?;
        let (enabled, removed) = csi_feature_gates(cluster.kubernetes_version())?;
        if let Some(container) = deployment_container(deployment, KUBE_APISERVER) {
            let command = container.command.get_or_insert_with(Vec::new);
            for gate in removed {
                ensure_no_string_with_prefix_contains(
                    command,
                    FEATURE_GATES_FLAG,
                    &format!("{}=true", gate),
                    ",",
                );
            }
            for gate in enabled {
                ensure_string_with_prefix_contains(
                    command,
                    FEATURE_GATES_FLAG,
                    &format!("{}=true", gate),
                    ",",
                );
            }
        }
        Ok(())
    }

    async fn ensure_kube_controller_manager_deployment(
        &self,
        _ctx: &EnsurerContext,
        deployment: &mut Deployment,
    ) -> anyhow::Result<()> {
        if let Some(container) = deployment_container(deployment, KUBE_CONTROLLER_MANAGER) {
            let command = container.command.get_or_insert_with(Vec::new);
            ensure_string_with_prefix(command, "--cloud-provider=", "external");
        }
        Ok(())
    }

    async fn ensure_kubelet_service_unit_options(
        &self,
        _ctx: &EnsurerContext,
        mut options: Vec<UnitOption>,
    ) -> anyhow::Result<Vec<UnitOption>> {
        ensure_exec_start(&mut options, |command| {
            ensure_string_with_prefix(command, "--cloud-provider=", "external");
            ensure_string_with_prefix(command, "--enable-controller-attach-detach=", "true");
        });
        Ok(options)
    }

    async fn ensure_kubelet_configuration(
        &self,
        ctx: &EnsurerContext,
        config: &mut KubeletConfiguration,
    ) -> anyhow::Result<()> {
        let cluster = ctx.cluster().await?;
        let (enabled, removed) = csi_feature_gates(cluster.kubernetes_version())?;
        for gate in removed {
            config.remove_feature_gate(gate);
        }
        for gate in enabled {
            config.set_feature_gate(gate, true);
        }
        config.enable_controller_attach_detach = Some(true);
        debug!(namespace = %ctx.namespace(), "Ensured kubelet feature gates");
        Ok(())
    }
}
