//! Admission time mutation of seed objects.
//!
//! The admission server hands every intercepted object to a [`Mutator`]. The
//! [`GenericMutator`] routes objects by kind and name to a provider's
//! [`Ensurer`], whose methods all default to doing nothing, so a provider only
//! overrides what it cares about.

mod kubelet;
mod osc;
pub mod registration;
mod server;

use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::NetworkPolicy;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, instrument};

use crate::apis::cluster::ClusterContext;
use crate::apis::extensions::{File, OperatingSystemConfig, OperatingSystemConfigPurpose, Unit};
use crate::client::ClusterReader;
use crate::merge::{find_named, unit_option_with_section_and_name};
use crate::unit::{self, UnitOption};

pub use kubelet::KubeletConfiguration;
pub use osc::{
    decode_file_content, encode_file_content, CLOUD_PROVIDER_CONFIG_PATH, KUBELET_CONFIG_PATH,
    KUBELET_SERVICE_UNIT, KUBERNETES_GENERAL_CONFIG_PATH,
};
pub use server::{review, serve, AdmissionRequest, AdmissionResponse, AdmissionReview};

/// Name of the API server service and deployment.
pub const KUBE_APISERVER: &str = "kube-apiserver";
/// Name of the controller manager deployment.
pub const KUBE_CONTROLLER_MANAGER: &str = "kube-controller-manager";
/// Name of the scheduler deployment.
pub const KUBE_SCHEDULER: &str = "kube-scheduler";
/// Name of the main etcd stateful set.
pub const ETCD_MAIN: &str = "etcd-main";
/// Name of the events etcd stateful set.
pub const ETCD_EVENTS: &str = "etcd-events";
/// Name of the API server's default network policy.
pub const KUBE_APISERVER_NETWORK_POLICY: &str = "kube-apiserver-default";

/// An object intercepted in the seed, decoded for the kinds that are mutated.
#[derive(Clone, Debug, PartialEq)]
#[allow(clippy::large_enum_variant)]
pub enum SeedObject {
    /// A service.
    Service(Service),
    /// A deployment.
    Deployment(Deployment),
    /// A stateful set.
    StatefulSet(StatefulSet),
    /// A network policy.
    NetworkPolicy(NetworkPolicy),
    /// An operating system config.
    OperatingSystemConfig(OperatingSystemConfig),
    /// Anything else, passed through untouched.
    Other(Value),
}

impl SeedObject {
    /// Decodes `object` according to `kind`.
    pub fn decode(kind: &str, object: Value) -> anyhow::Result<Self> {
        Ok(match kind {
            "Service" => SeedObject::Service(serde_json::from_value(object)?),
            "Deployment" => SeedObject::Deployment(serde_json::from_value(object)?),
            "StatefulSet" => SeedObject::StatefulSet(serde_json::from_value(object)?),
            "NetworkPolicy" => SeedObject::NetworkPolicy(serde_json::from_value(object)?),
            "OperatingSystemConfig" => {
                SeedObject::OperatingSystemConfig(serde_json::from_value(object)?)
            }
            _ => SeedObject::Other(object),
        })
    }

    /// Encodes the object.
    pub fn to_value(&self) -> serde_json::Result<Value> {
        match self {
            SeedObject::Service(o) => serde_json::to_value(o),
            SeedObject::Deployment(o) => serde_json::to_value(o),
            SeedObject::StatefulSet(o) => serde_json::to_value(o),
            SeedObject::NetworkPolicy(o) => serde_json::to_value(o),
            SeedObject::OperatingSystemConfig(o) => serde_json::to_value(o),
            SeedObject::Other(o) => Ok(o.clone()),
        }
    }

    /// The object's name.
    pub fn name(&self) -> Option<&str> {
        match self {
            SeedObject::Service(o) => o.metadata.name.as_deref(),
            SeedObject::Deployment(o) => o.metadata.name.as_deref(),
            SeedObject::StatefulSet(o) => o.metadata.name.as_deref(),
            SeedObject::NetworkPolicy(o) => o.metadata.name.as_deref(),
            SeedObject::OperatingSystemConfig(o) => o.metadata.name.as_deref(),
            SeedObject::Other(o) => o.pointer("/metadata/name").and_then(Value::as_str),
        }
    }
}

/// Mutates intercepted objects in place.
#[async_trait::async_trait]
pub trait Mutator: Send + Sync {
    /// Mutates `object`, which lives in `namespace`.
    async fn mutate(&self, namespace: &str, object: &mut SeedObject) -> anyhow::Result<()>;
}

/// What ensurers know about the object being mutated. The cluster is fetched
/// on first use.
pub struct EnsurerContext {
    namespace: String,
    clusters: Arc<dyn ClusterReader>,
    cluster: OnceCell<Arc<ClusterContext>>,
}

impl EnsurerContext {
    /// Creates a context for an object in `namespace`.
    pub fn new(namespace: &str, clusters: Arc<dyn ClusterReader>) -> Self {
        EnsurerContext {
            namespace: namespace.to_owned(),
            clusters,
            cluster: OnceCell::new(),
        }
    }

    /// The shoot's seed namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The cluster of the shoot the object belongs to.
    pub async fn cluster(&self) -> anyhow::Result<Arc<ClusterContext>> {
        let cluster = self
            .cluster
            .get_or_try_init(|| self.clusters.get_cluster(&self.namespace))
            .await?;
        Ok(cluster.clone())
    }
}

/// Provider specific mutations. Every method defaults to leaving its input
/// alone.
#[async_trait::async_trait]
#[allow(unused_variables)]
pub trait Ensurer: Send + Sync {
    /// Mutates the API server service.
    async fn ensure_kube_apiserver_service(
        &self,
        ctx: &EnsurerContext,
        service: &mut Service,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Mutates the API server deployment.
    async fn ensure_kube_apiserver_deployment(
        &self,
        ctx: &EnsurerContext,
        deployment: &mut Deployment,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Mutates the controller manager deployment.
    async fn ensure_kube_controller_manager_deployment(
        &self,
        ctx: &EnsurerContext,
        deployment: &mut Deployment,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Mutates the scheduler deployment.
    async fn ensure_kube_scheduler_deployment(
        &self,
        ctx: &EnsurerContext,
        deployment: &mut Deployment,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Mutates an etcd stateful set.
    async fn ensure_etcd_stateful_set(
        &self,
        ctx: &EnsurerContext,
        stateful_set: &mut StatefulSet,
        cluster: &ClusterContext,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Mutates the API server's default network policy.
    async fn ensure_kube_apiserver_network_policy(
        &self,
        ctx: &EnsurerContext,
        policy: &mut NetworkPolicy,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Mutates the options of the kubelet service unit.
    async fn ensure_kubelet_service_unit_options(
        &self,
        ctx: &EnsurerContext,
        options: Vec<UnitOption>,
    ) -> anyhow::Result<Vec<UnitOption>> {
        Ok(options)
    }

    /// Mutates the kubelet configuration.
    async fn ensure_kubelet_configuration(
        &self,
        ctx: &EnsurerContext,
        config: &mut KubeletConfiguration,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Mutates the general kernel settings, e.g. by appending sysctls.
    async fn ensure_kubernetes_general_configuration(
        &self,
        ctx: &EnsurerContext,
        content: &mut String,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Adds provider specific units.
    async fn ensure_additional_units(
        &self,
        ctx: &EnsurerContext,
        units: &mut Vec<Unit>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Adds provider specific files.
    async fn ensure_additional_files(
        &self,
        ctx: &EnsurerContext,
        files: &mut Vec<File>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Produces the kubelet's cloud provider config. Empty content means no
    /// config file.
    async fn ensure_kubelet_cloud_provider_config(
        &self,
        ctx: &EnsurerContext,
        content: &mut String,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Routes objects to an [`Ensurer`] by kind and name.
pub struct GenericMutator {
    ensurer: Arc<dyn Ensurer>,
    clusters: Arc<dyn ClusterReader>,
}

impl GenericMutator {
    /// Creates a mutator.
    pub fn new(ensurer: Arc<dyn Ensurer>, clusters: Arc<dyn ClusterReader>) -> Self {
        GenericMutator { ensurer, clusters }
    }
}

#[async_trait::async_trait]
impl Mutator for GenericMutator {
    #[instrument(level = "debug", skip(self, object), fields(name = ?object.name()))]
    async fn mutate(&self, namespace: &str, object: &mut SeedObject) -> anyhow::Result<()> {
        let ctx = EnsurerContext::new(namespace, self.clusters.clone());
        let ensurer = self.ensurer.as_ref();
        match object {
            SeedObject::Service(service) if is_named(&service.metadata.name, KUBE_APISERVER) => {
                ensurer.ensure_kube_apiserver_service(&ctx, service).await
            }
            SeedObject::Deployment(deployment) => match deployment.metadata.name.as_deref() {
                Some(KUBE_APISERVER) => {
                    ensurer.ensure_kube_apiserver_deployment(&ctx, deployment).await
                }
                Some(KUBE_CONTROLLER_MANAGER) => {
                    ensurer
                        .ensure_kube_controller_manager_deployment(&ctx, deployment)
                        .await
                }
                Some(KUBE_SCHEDULER) => {
                    ensurer.ensure_kube_scheduler_deployment(&ctx, deployment).await
                }
                _ => Ok(()),
            },
            SeedObject::StatefulSet(stateful_set)
                if is_named(&stateful_set.metadata.name, ETCD_MAIN)
                    || is_named(&stateful_set.metadata.name, ETCD_EVENTS) =>
            {
                let cluster = ctx.cluster().await?;
                ensurer
                    .ensure_etcd_stateful_set(&ctx, stateful_set, &cluster)
                    .await
            }
            SeedObject::NetworkPolicy(policy)
                if is_named(&policy.metadata.name, KUBE_APISERVER_NETWORK_POLICY) =>
            {
                ensurer.ensure_kube_apiserver_network_policy(&ctx, policy).await
            }
            SeedObject::OperatingSystemConfig(config)
                if config.spec.purpose == OperatingSystemConfigPurpose::Reconcile =>
            {
                osc::mutate_operating_system_config(ensurer, &ctx, config).await
            }
            _ => {
                debug!(%namespace, "Object is not mutated");
                Ok(())
            }
        }
    }
}

fn is_named(name: &Option<String>, expected: &str) -> bool {
    name.as_deref() == Some(expected)
}

/// Edits the command line of `ExecStart` in the `Service` section. The result
/// keeps the executable on the first line and every argument on its own
/// continuation line.
pub fn ensure_exec_start(options: &mut [UnitOption], edit: impl FnOnce(&mut Vec<String>)) {
    if let Some(option) = unit_option_with_section_and_name(options, "Service", "ExecStart") {
        let mut command = unit::deserialize_command_line(&option.value);
        edit(&mut command);
        option.value = unit::serialize_command_line(&command, 1, " \\\n    ");
    }
}

/// Returns the container called `name` of a deployment's pod template.
pub fn deployment_container<'a>(
    deployment: &'a mut Deployment,
    name: &str,
) -> Option<&'a mut k8s_openapi::api::core::v1::Container> {
    let spec = deployment.spec.as_mut()?.template.spec.as_mut()?;
    find_named(&mut spec.containers, name)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{cluster, FakeClusterReader};
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_owned());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Ensurer for Recorder {
        async fn ensure_kube_apiserver_service(&self, _: &EnsurerContext, _: &mut Service) -> anyhow::Result<()> {
            self.record("service");
            Ok(())
        }

        async fn ensure_kube_apiserver_deployment(&self, _: &EnsurerContext, _: &mut Deployment) -> anyhow::Result<()> {
            self.record("apiserver");
            Ok(())
        }

        async fn ensure_kube_controller_manager_deployment(&self, _: &EnsurerContext, _: &mut Deployment) -> anyhow::Result<()> {
            self.record("controller-manager");
            Ok(())
        }

        async fn ensure_kube_scheduler_deployment(&self, _: &EnsurerContext, _: &mut Deployment) -> anyhow::Result<()> {
            self.record("scheduler");
            Ok(())
        }

        async fn ensure_etcd_stateful_set(
            &self,
            _: &EnsurerContext,
            _: &mut StatefulSet,
            cluster: &ClusterContext,
        ) -> anyhow::Result<()> {
            self.record(&format!("etcd {}", cluster.kubernetes_version()));
            Ok(())
        }

        async fn ensure_kube_apiserver_network_policy(&self, _: &EnsurerContext, _: &mut NetworkPolicy) -> anyhow::Result<()> {
            self.record("network-policy");
            Ok(())
        }

        async fn ensure_additional_units(&self, _: &EnsurerContext, _: &mut Vec<Unit>) -> anyhow::Result<()> {
            self.record("units");
            Ok(())
        }
    }

    fn object(kind: &str, name: &str) -> SeedObject {
        SeedObject::decode(
            kind,
            json!({"metadata": {"name": name, "namespace": "shoot--dev--test"}}),
        )
        .unwrap()
    }

    fn osc(purpose: &str) -> SeedObject {
        SeedObject::decode(
            "OperatingSystemConfig",
            json!({
                "apiVersion": "extensions.gardener.cloud/v1alpha1",
                "kind": "OperatingSystemConfig",
                "metadata": {"name": "osc", "namespace": "shoot--dev--test"},
                "spec": {"type": "coreos", "purpose": purpose}
            }),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn objects_are_routed_by_kind_and_name() -> anyhow::Result<()> {
        let recorder = Arc::new(Recorder::default());
        let clusters = Arc::new(FakeClusterReader::new());
        clusters.add(cluster("shoot--dev--test", "1.14.0"));
        let mutator = GenericMutator::new(recorder.clone(), clusters);

        let mut objects = vec![
            object("Service", "kube-apiserver"),
            object("Service", "other"),
            object("Deployment", "kube-apiserver"),
            object("Deployment", "kube-controller-manager"),
            object("Deployment", "kube-scheduler"),
            object("Deployment", "other"),
            object("StatefulSet", "etcd-main"),
            object("StatefulSet", "etcd-events"),
            object("NetworkPolicy", "kube-apiserver-default"),
            object("ConfigMap", "kube-apiserver"),
            osc("reconcile"),
            osc("provision"),
        ];
        for object in objects.iter_mut() {
            mutator.mutate("shoot--dev--test", object).await?;
        }
        assert_eq!(
            recorder.calls(),
            vec![
                "service",
                "apiserver",
                "controller-manager",
                "scheduler",
                "etcd 1.14.0",
                "etcd 1.14.0",
                "network-policy",
                "units",
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn etcd_needs_the_cluster() {
        let mutator = GenericMutator::new(
            Arc::new(Recorder::default()),
            Arc::new(FakeClusterReader::new()),
        );
        let mut etcd = object("StatefulSet", "etcd-main");
        assert!(mutator.mutate("shoot--dev--test", &mut etcd).await.is_err());
    }

    #[tokio::test]
    async fn cluster_is_fetched_once() -> anyhow::Result<()> {
        let clusters = Arc::new(FakeClusterReader::new());
        clusters.add(cluster("shoot--dev--test", "1.13.0"));
        let ctx = EnsurerContext::new("shoot--dev--test", clusters);
        let first = ctx.cluster().await?;
        let second = ctx.cluster().await?;
        assert!(Arc::ptr_eq(&first, &second));
        Ok(())
    }

    #[test]
    fn exec_start_is_rewritten_one_flag_per_line() {
        let mut options = vec![
            UnitOption::new("Unit", "Description", "kubelet daemon"),
            UnitOption::new(
                "Service",
                "ExecStart",
                "/opt/bin/kubelet \\\n    --config=/var/lib/kubelet/config/kubelet",
            ),
        ];
        ensure_exec_start(&mut options, |command| {
            crate::merge::ensure_string_with_prefix(command, "--cloud-provider=", "azure")
        });
        assert_eq!(
            options[1].value,
            "/opt/bin/kubelet \\\n    --config=/var/lib/kubelet/config/kubelet \\\n    --cloud-provider=azure"
        );
        let once = options.clone();
        ensure_exec_start(&mut options, |command| {
            crate::merge::ensure_string_with_prefix(command, "--cloud-provider=", "azure")
        });
        assert_eq!(options, once);
    }
}
