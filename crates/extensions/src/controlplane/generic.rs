use std::sync::Arc;

use anyhow::Context;
use serde_json::Value;
use tracing::{info, instrument, warn};

use super::state::{run_to_completion, DeploySecrets, ReconcileContext};
use super::{
    Actuator, ControlPlaneCharts, ValuesProvider, KUBE_APISERVER_DEPLOYMENT_NAME,
    SHOOT_CHART_RESOURCE_NAME, STORAGE_CLASSES_CHART_RESOURCE_NAME,
};
use crate::apis::cluster::ClusterContext;
use crate::apis::extensions::{ControlPlane, LastOperationType};
use crate::chart::{Chart, ChartRenderer, RenderedChart};
use crate::checksum::Checksums;
use crate::client::SeedClient;
use crate::error::Error;
use crate::imagevector::ImageVector;
use crate::managedresources;
use crate::secrets::SecretsDeployer;
use crate::status::{self, StatusUpdater};

/// Control plane actuator driven by provider supplied charts and values.
pub struct GenericActuator {
    pub(crate) charts: ControlPlaneCharts,
    pub(crate) values: Arc<dyn ValuesProvider>,
    pub(crate) secrets: Arc<dyn SecretsDeployer>,
    pub(crate) renderer: Arc<dyn ChartRenderer>,
    pub(crate) client: Arc<dyn SeedClient>,
    images: Arc<ImageVector>,
    status: Option<Arc<dyn StatusUpdater>>,
}

impl GenericActuator {
    /// Creates an actuator.
    pub fn new(
        charts: ControlPlaneCharts,
        values: Arc<dyn ValuesProvider>,
        secrets: Arc<dyn SecretsDeployer>,
        renderer: Arc<dyn ChartRenderer>,
        client: Arc<dyn SeedClient>,
        images: Arc<ImageVector>,
    ) -> Self {
        GenericActuator {
            charts,
            values,
            secrets,
            renderer,
            client,
            images,
            status: None,
        }
    }

    /// Reports the progress of every step through `status`.
    pub fn with_status_updater(mut self, status: Arc<dyn StatusUpdater>) -> Self {
        self.status = Some(status);
        self
    }

    pub(crate) async fn report(&self, namespace: &str, name: &str, status: Value) {
        if let Some(updater) = &self.status {
            if let Err(e) = updater.patch_status(namespace, name, status).await {
                warn!(%namespace, %name, error = %e, "Could not update status");
            }
        }
    }

    pub(crate) async fn apply_chart(
        &self,
        chart: &Chart,
        namespace: &str,
        values: Value,
        cluster: &ClusterContext,
    ) -> anyhow::Result<()> {
        let seed_version = self.client.server_version().await?;
        chart
            .apply(
                self.renderer.as_ref(),
                self.client.as_ref(),
                &self.images,
                namespace,
                values,
                Some(&seed_version),
                Some(cluster.kubernetes_version()),
            )
            .await
    }

    pub(crate) async fn render_chart(
        &self,
        chart: &Chart,
        namespace: &str,
        values: Value,
        cluster: &ClusterContext,
    ) -> anyhow::Result<RenderedChart> {
        let seed_version = self.client.server_version().await?;
        chart
            .render(
                self.renderer.as_ref(),
                &self.images,
                namespace,
                values,
                Some(&seed_version),
                Some(cluster.kubernetes_version()),
            )
            .await
    }

    /// Desired replicas of the API server. A missing deployment counts as
    /// scaled down, an unset replica count as one.
    pub(crate) async fn kube_apiserver_replicas(&self, namespace: &str) -> anyhow::Result<i32> {
        let deployment = self
            .client
            .get_deployment(namespace, KUBE_APISERVER_DEPLOYMENT_NAME)
            .await?;
        Ok(match deployment {
            Some(deployment) => deployment
                .spec
                .and_then(|spec| spec.replicas)
                .unwrap_or(1),
            None => 0,
        })
    }
}

fn identity(cp: &ControlPlane) -> Result<(String, String), Error> {
    let namespace = cp
        .metadata
        .namespace
        .clone()
        .ok_or_else(|| Error::invalid("metadata.namespace", "Required", "controlplane has no namespace"))?;
    let name = cp
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::invalid("metadata.name", "Required", "controlplane has no name"))?;
    Ok((namespace, name))
}

#[async_trait::async_trait]
impl Actuator for GenericActuator {
    #[instrument(level = "info", skip(self, cp, cluster), fields(namespace = ?cp.metadata.namespace, name = ?cp.metadata.name))]
    async fn reconcile(&self, cp: &ControlPlane, cluster: &ClusterContext) -> anyhow::Result<bool> {
        let (namespace, name) = identity(cp)?;
        let operation = match cp.status.as_ref().and_then(|s| s.last_operation.as_ref()) {
            Some(_) => LastOperationType::Reconcile,
            None => LastOperationType::Create,
        };
        let mut ctx = ReconcileContext {
            actuator: self,
            cp,
            cluster,
            namespace,
            name,
            operation,
            secrets: Default::default(),
            checksums: Checksums::new(),
            scaled_down: false,
        };
        run_to_completion(DeploySecrets, &mut ctx).await
    }

    #[instrument(level = "info", skip(self, cp, _cluster), fields(namespace = ?cp.metadata.namespace, name = ?cp.metadata.name))]
    async fn delete(&self, cp: &ControlPlane, _cluster: &ClusterContext) -> anyhow::Result<()> {
        let (namespace, name) = identity(cp)?;
        let key = format!("{}/{}", namespace, name);
        let client = self.client.as_ref();

        if self.charts.storage_classes.is_some() {
            self.report(&namespace, &name, status::processing(LastOperationType::Delete, 10, "Deleting storage classes")).await;
            managedresources::delete(client, &namespace, STORAGE_CLASSES_CHART_RESOURCE_NAME)
                .await
                .with_context(|| format!("could not delete storage classes for controlplane '{}'", key))?;
        }

        if self.charts.shoot.is_some() {
            self.report(&namespace, &name, status::processing(LastOperationType::Delete, 30, "Deleting control plane shoot chart")).await;
            managedresources::delete(client, &namespace, SHOOT_CHART_RESOURCE_NAME)
                .await
                .with_context(|| format!("could not delete control plane shoot chart for controlplane '{}'", key))?;
        }

        self.report(&namespace, &name, status::processing(LastOperationType::Delete, 50, "Deleting control plane chart")).await;
        self.charts
            .control_plane
            .delete(client, &namespace)
            .await
            .with_context(|| format!("could not delete control plane chart for controlplane '{}'", key))?;

        if let Some(chart) = &self.charts.config {
            self.report(&namespace, &name, status::processing(LastOperationType::Delete, 70, "Deleting config chart")).await;
            chart
                .delete(client, &namespace)
                .await
                .with_context(|| format!("could not delete config chart for controlplane '{}'", key))?;
        }

        self.report(&namespace, &name, status::processing(LastOperationType::Delete, 90, "Deleting secrets")).await;
        self.secrets
            .delete(&namespace)
            .await
            .with_context(|| format!("could not delete secrets for controlplane '{}'", key))?;

        info!(controlplane = %key, "Deleted control plane");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::apis::cluster::Hibernation;
    use crate::apis::extensions::{ControlPlaneSpec, Purpose, SecretReference};
    use crate::checksum::secret_checksum_annotations;
    use crate::controlplane::PurposeActuator;
    use crate::testing::{
        cluster, FakeChartRenderer, FakeSecretsDeployer, FakeSeedClient, FakeStatusUpdater,
    };
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use serde_json::json;

    const NAMESPACE: &str = "shoot--dev--test";

    struct Values;

    #[async_trait::async_trait]
    impl ValuesProvider for Values {
        async fn control_plane_chart_values(
            &self,
            _cp: &ControlPlane,
            _cluster: &ClusterContext,
            checksums: &Checksums,
            scaled_down: bool,
        ) -> anyhow::Result<Value> {
            Ok(json!({
                "replicas": if scaled_down { 0 } else { 1 },
                "podAnnotations": secret_checksum_annotations(checksums, &["cloudprovider", "cloud-controller-manager"]),
            }))
        }
    }

    fn charts() -> ControlPlaneCharts {
        ControlPlaneCharts {
            config: Some(
                Chart::new("cloud-provider-config", "charts/cloud-provider-config")
                    .with_object("v1", "ConfigMap", "cloud-provider-config"),
            ),
            cloud_provider_config_name: Some("cloud-provider-config".to_owned()),
            control_plane: Chart::new("seed-controlplane", "charts/seed-controlplane")
                .with_object("apps/v1", "Deployment", "cloud-controller-manager"),
            shoot: Some(Chart::new("shoot-system-components", "charts/shoot-system-components")),
            storage_classes: Some(Chart::new("shoot-storageclasses", "charts/shoot-storageclasses")),
        }
    }

    fn secret(name: &str, data: &[(&str, &str)]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some(NAMESPACE.to_owned()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| ((*k).to_owned(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn control_plane() -> ControlPlane {
        let mut cp = ControlPlane::new(
            "control-plane",
            ControlPlaneSpec {
                type_: "azure".to_owned(),
                region: "westeurope".to_owned(),
                secret_ref: SecretReference {
                    name: "cloudprovider".to_owned(),
                    namespace: None,
                },
                purpose: None,
                provider_config: None,
                infrastructure_provider_status: None,
            },
        );
        cp.metadata.namespace = Some(NAMESPACE.to_owned());
        cp
    }

    fn kube_apiserver(replicas: i32) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(KUBE_APISERVER_DEPLOYMENT_NAME.to_owned()),
                namespace: Some(NAMESPACE.to_owned()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    struct Fixture {
        client: Arc<FakeSeedClient>,
        renderer: Arc<FakeChartRenderer>,
        secrets: Arc<FakeSecretsDeployer>,
        status: Arc<FakeStatusUpdater>,
        actuator: GenericActuator,
    }

    fn fixture() -> Fixture {
        let client = Arc::new(FakeSeedClient::new());
        client.insert(&secret("cloudprovider", &[("clientID", "C"), ("clientSecret", "S")]));
        let renderer = Arc::new(FakeChartRenderer::new());
        renderer.add_template(
            "cloud-provider-config",
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cloud-provider-config\ndata:\n  cloudprovider.conf: zoned\n",
        );
        renderer.add_template_fn("seed-controlplane", |values| {
            format!(
                "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: cloud-controller-manager\nspec:\n  replicas: {}\n  selector:\n    matchLabels:\n      app: cloud-controller-manager\n  template:\n    metadata:\n      annotations: {}\n",
                values["replicas"], values["podAnnotations"]
            )
        });
        renderer.add_template(
            "shoot-system-components",
            "apiVersion: v1\nkind: ServiceAccount\nmetadata:\n  name: cloud-controller-manager\n",
        );
        let secrets = Arc::new(FakeSecretsDeployer::new(vec![secret(
            "cloud-controller-manager",
            &[("tls.crt", "cert")],
        )]));
        let status = Arc::new(FakeStatusUpdater::new());
        let actuator = GenericActuator::new(
            charts(),
            Arc::new(Values),
            secrets.clone(),
            renderer.clone(),
            client.clone(),
            Arc::new(ImageVector::default()),
        )
        .with_status_updater(status.clone());
        Fixture {
            client,
            renderer,
            secrets,
            status,
            actuator,
        }
    }

    #[tokio::test]
    async fn reconcile_applies_all_charts() -> anyhow::Result<()> {
        let f = fixture();
        let requeue = f
            .actuator
            .reconcile(&control_plane(), &cluster(NAMESPACE, "1.14.0"))
            .await?;
        assert!(!requeue);
        assert_eq!(f.secrets.deploys(), 1);
        assert!(f.client.object(NAMESPACE, "ConfigMap", "cloud-provider-config").is_some());

        let deployment = f.client.deployment(NAMESPACE, "cloud-controller-manager").unwrap();
        let annotations = deployment.spec.unwrap().template.metadata.unwrap().annotations.unwrap();
        let expected = crate::checksum::compute_secret_checksum(
            &secret("cloudprovider", &[("clientID", "C"), ("clientSecret", "S")])
                .data
                .unwrap(),
        );
        assert_eq!(annotations["checksum/secret-cloudprovider"], expected);
        assert!(annotations.contains_key("checksum/secret-cloud-controller-manager"));

        assert!(f.client.object(NAMESPACE, "ManagedResource", SHOOT_CHART_RESOURCE_NAME).is_some());
        assert!(f
            .client
            .object(NAMESPACE, "ManagedResource", STORAGE_CLASSES_CHART_RESOURCE_NAME)
            .is_some());
        let progress: Vec<i64> = f
            .status
            .statuses()
            .iter()
            .map(|(_, s)| s["lastOperation"]["progress"].as_i64().unwrap())
            .collect();
        assert_eq!(progress, vec![10, 20, 30, 50, 70, 90]);
        assert_eq!(f.status.statuses()[0].1["lastOperation"]["type"], "Create");
        Ok(())
    }

    #[tokio::test]
    async fn reconcile_waits_for_hibernation() -> anyhow::Result<()> {
        let f = fixture();
        f.client.insert(&kube_apiserver(2));
        let mut cluster = cluster(NAMESPACE, "1.14.0");
        cluster.shoot.spec.hibernation = Some(Hibernation { enabled: Some(true) });

        let requeue = f.actuator.reconcile(&control_plane(), &cluster).await?;
        assert!(requeue);
        assert_eq!(f.renderer.renders("seed-controlplane"), 0);
        assert!(!f.client.was_applied("Deployment", "cloud-controller-manager"));
        assert_eq!(f.status.last_status().unwrap()["lastOperation"]["state"], "Pending");
        Ok(())
    }

    #[tokio::test]
    async fn reconcile_scales_down_when_hibernated() -> anyhow::Result<()> {
        let f = fixture();
        f.client.insert(&kube_apiserver(0));
        let mut cluster = cluster(NAMESPACE, "1.14.0");
        cluster.shoot.spec.hibernation = Some(Hibernation { enabled: Some(true) });

        assert!(!f.actuator.reconcile(&control_plane(), &cluster).await?);
        assert_eq!(f.renderer.last_values("seed-controlplane").unwrap()["replicas"], 0);
        Ok(())
    }

    #[tokio::test]
    async fn reconcile_waits_for_wake_up_while_deleting() -> anyhow::Result<()> {
        let f = fixture();
        f.client.insert(&kube_apiserver(0));
        let mut cluster = cluster(NAMESPACE, "1.14.0");
        cluster.shoot.spec.hibernation = Some(Hibernation { enabled: Some(true) });
        cluster.shoot.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));

        assert!(f.actuator.reconcile(&control_plane(), &cluster).await?);
        assert_eq!(f.renderer.renders("seed-controlplane"), 0);

        f.client.insert(&kube_apiserver(1));
        assert!(!f.actuator.reconcile(&control_plane(), &cluster).await?);
        assert_eq!(f.renderer.last_values("seed-controlplane").unwrap()["replicas"], 1);
        Ok(())
    }

    #[tokio::test]
    async fn reconcile_fails_without_credentials() {
        let f = fixture();
        let mut cp = control_plane();
        cp.spec.secret_ref.name = "missing".to_owned();
        let err = f
            .actuator
            .reconcile(&cp, &cluster(NAMESPACE, "1.14.0"))
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("could not get cloud provider secret"));
        assert!(crate::error::is_not_found(&err));
        assert_eq!(f.renderer.renders("seed-controlplane"), 0);
    }

    #[tokio::test]
    async fn reconcile_reports_chart_failures_with_context() {
        let f = fixture();
        f.client.fail_apply("ConfigMap", "cloud-provider-config");
        let err = f
            .actuator
            .reconcile(&control_plane(), &cluster(NAMESPACE, "1.14.0"))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("could not apply config chart for controlplane '{}/control-plane'", NAMESPACE)
        );
    }

    #[tokio::test]
    async fn delete_runs_in_reverse_order() -> anyhow::Result<()> {
        let f = fixture();
        let cluster = cluster(NAMESPACE, "1.14.0");
        f.actuator.reconcile(&control_plane(), &cluster).await?;
        f.actuator.delete(&control_plane(), &cluster).await?;

        let deleted: Vec<(String, String)> = f
            .client
            .deletions()
            .into_iter()
            .map(|c| (c.kind, c.name))
            .collect();
        let position = |kind: &str, name: &str| {
            deleted
                .iter()
                .position(|(k, n)| k == kind && n == name)
                .unwrap()
        };
        assert!(
            position("ManagedResource", STORAGE_CLASSES_CHART_RESOURCE_NAME)
                < position("ManagedResource", SHOOT_CHART_RESOURCE_NAME)
        );
        assert!(
            position("ManagedResource", SHOOT_CHART_RESOURCE_NAME)
                < position("Deployment", "cloud-controller-manager")
        );
        assert!(
            position("Deployment", "cloud-controller-manager")
                < position("ConfigMap", "cloud-provider-config")
        );
        assert_eq!(f.secrets.deletes(), 1);

        // Nothing left to delete is not an error.
        f.actuator.delete(&control_plane(), &cluster).await?;
        Ok(())
    }

    #[tokio::test]
    async fn exposure_without_actuator_is_ignored() -> anyhow::Result<()> {
        let f = fixture();
        let router = PurposeActuator::new(Arc::new(f.actuator), None);
        let mut cp = control_plane();
        cp.spec.purpose = Some(Purpose::Exposure);
        assert!(!router.reconcile(&cp, &cluster(NAMESPACE, "1.14.0")).await?);
        assert_eq!(f.secrets.deploys(), 0);
        Ok(())
    }
}
