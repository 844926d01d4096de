//! Admission time mutations of the Packet control plane and kubelets.

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

/// CSI feature gates to switch on for a kubernetes version, and the ones of
/// other versions to take away again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CsiFeatureGates {
    /// Gates set to `true`.
    pub enabled: &'static [&'static str],
    /// Gates removed.
    pub removed: &'static [&'static str],
}

const BEFORE_1_14: CsiFeatureGates = CsiFeatureGates {
    enabled: &["CSINodeInfo", "CSIDriverRegistry"],
    removed: &["ExpandCSIVolumes", "ExpandInUsePersistentVolumes"],
};

const SINCE_1_14: CsiFeatureGates = CsiFeatureGates {
    enabled: &["ExpandCSIVolumes", "ExpandInUsePersistentVolumes"],
    removed: &["CSINodeInfo", "CSIDriverRegistry"],
};

/// The CSI feature gates Packet clusters at `kubernetes_version` need.
pub fn csi_feature_gates(kubernetes_version: &str) -> Result<CsiFeatureGates, Error> {
    if version::is_at_least(kubernetes_version, "1.14")? {
        Ok(SINCE_1_14)
    } else {
        Ok(BEFORE_1_14)
    }
}

fn ensure_feature_gate_flag(command: &mut Vec<String>, gates: CsiFeatureGates) {
    for gate in gates.removed {
        ensure_no_string_with_prefix_contains(
            command,
            FEATURE_GATES_FLAG,
            &format!("{}=true", gate),
            ",",
        );
    }
    for gate in gates.enabled {
        ensure_string_with_prefix_contains(
            command,
            FEATURE_GATES_FLAG,
            &format!("{}=true", gate),
            ",",
        );
    }
}

/// Mutates control plane components and kubelets of Packet shoots.
#[derive(Clone, Debug, Default)]
pub struct PacketEnsurer;

impl PacketEnsurer {
    /// Creates an ensurer.
    pub fn new() -> Self {
        PacketEnsurer
    }
}

#[async_trait::async_trait]
impl Ensurer for PacketEnsurer {
    async fn ensure_kube_apiserver_deployment(
        &self,
        ctx: &EnsurerContext,
        deployment: &mut Deployment,
    ) -> anyhow::Result<()> {
        let cluster = ctx.cluster().await?;
        let gates = csi_feature_gates(cluster.kubernetes_version())?;
        if let Some(container) = deployment_container(deployment, KUBE_APISERVER) {
            let command = container.command.get_or_insert_with(Vec::new);
            ensure_feature_gate_flag(command, gates);
            ensure_string_with_prefix(command, "--allow-privileged=", "true");
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
        let version = cluster.kubernetes_version();
        let gates = csi_feature_gates(version)?;
        for gate in gates.removed {
            config.remove_feature_gate(gate);
        }
        for gate in gates.enabled {
            config.set_feature_gate(gate, true);
        }
        debug!(namespace = %ctx.namespace(), %version, "Ensured kubelet CSI feature gates");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn feature_gates_follow_the_version() {
        assert_eq!(csi_feature_gates("1.13.0").unwrap(), BEFORE_1_14);
        assert_eq!(csi_feature_gates("v1.13.5").unwrap(), BEFORE_1_14);
        assert_eq!(csi_feature_gates("1.14.0").unwrap(), SINCE_1_14);
        assert_eq!(csi_feature_gates("1.16.2").unwrap(), SINCE_1_14);
        assert!(csi_feature_gates("latest").is_err());
    }

    #[test]
    fn upgraded_clusters_lose_the_old_gates() {
        let mut command = strings(&[
            "/hyperkube",
            "apiserver",
            "--feature-gates=PodPriority=true,CSINodeInfo=true,CSIDriverRegistry=true",
        ]);
        ensure_feature_gate_flag(&mut command, SINCE_1_14);
        assert_eq!(
            command[2],
            "--feature-gates=PodPriority=true,ExpandCSIVolumes=true,ExpandInUsePersistentVolumes=true"
        );

        let once = command.clone();
        ensure_feature_gate_flag(&mut command, SINCE_1_14);
        assert_eq!(command, once);
    }
}
