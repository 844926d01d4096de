use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Context;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::core::DynamicObject;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use super::{
    MachineClass, MachineConfig, MachineDeployment, WorkerDelegate, MACHINE_API_VERSION,
    MACHINE_DEPLOYMENT_KIND,
};
use crate::apis::cluster::ClusterContext;
use crate::apis::extensions::{LastOperationType, MachineDeploymentStatus, Worker};
use crate::client::{to_dynamic, SeedClient};
use crate::error::{is_not_found, Error};
use crate::status::{self, StatusUpdater};

const MACHINE_CLASS_PURPOSE_LABEL: &str = "garden.sapcloud.io/purpose";
const MACHINE_CLASS_PURPOSE: &str = "machineclass";
const MIN_READY_SECONDS: i32 = 500;

/// Worker actuator that writes the machine classes and deployments generated
/// by a [`WorkerDelegate`].
pub struct GenericActuator {
    delegate: Arc<dyn WorkerDelegate>,
    client: Arc<dyn SeedClient>,
    status: Arc<dyn StatusUpdater>,
}

impl GenericActuator {
    /// Creates an actuator.
    pub fn new(
        delegate: Arc<dyn WorkerDelegate>,
        client: Arc<dyn SeedClient>,
        status: Arc<dyn StatusUpdater>,
    ) -> Self {
        GenericActuator {
            delegate,
            client,
            status,
        }
    }

    async fn report(&self, namespace: &str, name: &str, status: Value) {
        if let Err(e) = self.status.patch_status(namespace, name, status).await {
            warn!(%namespace, %name, error = %e, "Could not update status");
        }
    }

    async fn generate(&self, worker: &Worker, cluster: &ClusterContext, key: &str) -> anyhow::Result<MachineConfig> {
        self.delegate
            .generate_machine_config(worker, cluster)
            .await
            .with_context(|| format!("could not generate machine config for worker '{}'", key))
    }

    async fn deploy_machine_class(&self, namespace: &str, class: &MachineClass) -> anyhow::Result<()> {
        let name = class
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::invalid("machineClass.name", "Required", "machine class has no name"))?;

        let data: BTreeMap<String, ByteString> = class
            .get("secret")
            .and_then(Value::as_object)
            .map(|secret| {
                secret
                    .iter()
                    .map(|(k, v)| {
                        let value = match v {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (k.clone(), ByteString(value.into_bytes()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        let mut labels = BTreeMap::new();
        labels.insert(MACHINE_CLASS_PURPOSE_LABEL.to_owned(), MACHINE_CLASS_PURPOSE.to_owned());
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some(namespace.to_owned()),
                labels: Some(labels),
                ..Default::default()
            },
            data: Some(data),
            type_: Some("Opaque".to_owned()),
            ..Default::default()
        };
        self.client.apply(&to_dynamic(&secret)?).await?;

        let mut spec = class.clone();
        spec.remove("name");
        spec.remove("secret");
        spec.insert(
            "secretRef".to_owned(),
            json!({"name": name, "namespace": namespace}),
        );
        let object: DynamicObject = serde_json::from_value(json!({
            "apiVersion": MACHINE_API_VERSION,
            "kind": self.delegate.machine_class_kind(),
            "metadata": {"name": name, "namespace": namespace},
            "spec": spec,
        }))?;
        self.client.apply(&object).await
    }

    async fn deploy_machine_deployment(
        &self,
        namespace: &str,
        deployment: &MachineDeployment,
        hibernated: bool,
    ) -> anyhow::Result<()> {
        let existing = self
            .client
            .get_object(Some(namespace), MACHINE_API_VERSION, MACHINE_DEPLOYMENT_KIND, &deployment.name)
            .await?;
        let existing_replicas = existing_replicas(existing.as_ref(), &deployment.name)?;
        let replicas = desired_replicas(deployment, existing_replicas, hibernated);
        debug!(name = %deployment.name, replicas, "Deploying machine deployment");

        let object: DynamicObject = serde_json::from_value(json!({
            "apiVersion": MACHINE_API_VERSION,
            "kind": MACHINE_DEPLOYMENT_KIND,
            "metadata": {"name": deployment.name, "namespace": namespace},
            "spec": {
                "replicas": replicas,
                "minReadySeconds": MIN_READY_SECONDS,
                "strategy": {
                    "type": "RollingUpdate",
                    "rollingUpdate": {
                        "maxSurge": deployment.max_surge,
                        "maxUnavailable": deployment.max_unavailable,
                    },
                },
                "selector": {"matchLabels": {"name": deployment.name}},
                "template": {
                    "metadata": {"labels": {"name": deployment.name}},
                    "spec": {
                        "class": {
                            "kind": self.delegate.machine_class_kind(),
                            "name": deployment.class_name,
                        },
                        "nodeTemplate": {
                            "metadata": {
                                "labels": deployment.labels,
                                "annotations": deployment.annotations,
                            },
                            "spec": {"taints": deployment.taints},
                        },
                    },
                },
            },
        }))?;
        self.client.apply(&object).await
    }

    async fn delete_ignoring_not_found(
        &self,
        namespace: &str,
        api_version: &str,
        kind: &str,
        name: &str,
    ) -> anyhow::Result<()> {
        match self.client.delete(Some(namespace), api_version, kind, name).await {
            Err(e) if is_not_found(&e) => {
                warn!(%namespace, %kind, %name, "Object to delete does not exist");
                Ok(())
            }
            result => result,
        }
    }

    /// Creates or updates machine classes and deployments, removes
    /// deployments of pools that are gone and records the result in the
    /// worker's status.
    #[instrument(level = "info", skip(self, worker, cluster), fields(namespace = ?worker.metadata.namespace, name = ?worker.metadata.name))]
    pub async fn reconcile(&self, worker: &Worker, cluster: &ClusterContext) -> anyhow::Result<()> {
        let (namespace, name) = identity(worker)?;
        let key = format!("{}/{}", namespace, name);

        self.report(&namespace, &name, status::processing(LastOperationType::Reconcile, 10, "Generating machine classes")).await;
        let config = self.generate(worker, cluster, &key).await?;

        self.report(&namespace, &name, status::processing(LastOperationType::Reconcile, 30, "Deploying machine classes")).await;
        for class in &config.classes {
            self.deploy_machine_class(&namespace, class)
                .await
                .with_context(|| format!("could not deploy machine classes for worker '{}'", key))?;
        }

        self.report(&namespace, &name, status::processing(LastOperationType::Reconcile, 60, "Deploying machine deployments")).await;
        let hibernated = cluster.is_hibernation_enabled();
        for deployment in &config.deployments {
            self.deploy_machine_deployment(&namespace, deployment, hibernated)
                .await
                .with_context(|| format!("could not deploy machine deployment '{}' for worker '{}'", deployment.name, key))?;
        }

        let wanted: BTreeSet<&str> = config.deployments.iter().map(|d| d.name.as_str()).collect();
        for obsolete in previous_deployments(worker)
            .iter()
            .filter(|d| !wanted.contains(d.as_str()))
        {
            info!(name = %obsolete, "Deleting obsolete machine deployment");
            self.delete_ignoring_not_found(&namespace, MACHINE_API_VERSION, MACHINE_DEPLOYMENT_KIND, obsolete)
                .await
                .with_context(|| format!("could not delete machine deployment '{}' for worker '{}'", obsolete, key))?;
        }

        let machine_deployments: Vec<MachineDeploymentStatus> = config
            .deployments
            .iter()
            .map(|d| MachineDeploymentStatus {
                name: d.name.clone(),
                minimum: d.minimum,
                maximum: d.maximum,
            })
            .collect();
        let mut patch = status::processing(LastOperationType::Reconcile, 90, "Updating worker status");
        patch["machineDeployments"] = serde_json::to_value(&machine_deployments)?;
        if let Some(provider_status) = config.provider_status {
            patch["providerStatus"] = provider_status;
        }
        self.status
            .patch_status(&namespace, &name, patch)
            .await
            .with_context(|| format!("could not update status of worker '{}'", key))
    }

    /// Deletes machine deployments, then machine classes and their secrets.
    #[instrument(level = "info", skip(self, worker, cluster), fields(namespace = ?worker.metadata.namespace, name = ?worker.metadata.name))]
    pub async fn delete(&self, worker: &Worker, cluster: &ClusterContext) -> anyhow::Result<()> {
        let (namespace, name) = identity(worker)?;
        let key = format!("{}/{}", namespace, name);
        let config = self.generate(worker, cluster, &key).await?;

        self.report(&namespace, &name, status::processing(LastOperationType::Delete, 30, "Deleting machine deployments")).await;
        let mut deployments: BTreeSet<String> = previous_deployments(worker).into_iter().collect();
        deployments.extend(config.deployments.iter().map(|d| d.name.clone()));
        for deployment in &deployments {
            self.delete_ignoring_not_found(&namespace, MACHINE_API_VERSION, MACHINE_DEPLOYMENT_KIND, deployment)
                .await
                .with_context(|| format!("could not delete machine deployment '{}' for worker '{}'", deployment, key))?;
        }

        self.report(&namespace, &name, status::processing(LastOperationType::Delete, 60, "Deleting machine classes")).await;
        let kind = self.delegate.machine_class_kind();
        for class in config
            .classes
            .iter()
            .filter_map(|c| c.get("name").and_then(Value::as_str))
        {
            self.delete_ignoring_not_found(&namespace, MACHINE_API_VERSION, kind, class)
                .await
                .with_context(|| format!("could not delete machine class '{}' for worker '{}'", class, key))?;
            self.delete_ignoring_not_found(&namespace, "v1", "Secret", class)
                .await
                .with_context(|| format!("could not delete machine class secret '{}' for worker '{}'", class, key))?;
        }
        Ok(())
    }
}

/// Replicas of a machine deployment. Hibernated clusters run no machines;
/// otherwise the current count is kept within the pool's bounds so that an
/// autoscaler's decision survives.
fn existing_replicas(existing: Option<&DynamicObject>, name: &str) -> Result<Option<i32>, Error> {
    let replicas = match existing
        .and_then(|o| o.data.pointer("/spec/replicas"))
        .and_then(Value::as_i64)
    {
        Some(replicas) => replicas,
        None => return Ok(None),
    };
    i32::try_from(replicas).map(Some).map_err(|_| {
        Error::invalid(
            "spec.replicas",
            "Invalid",
            format!("machine deployment {} has {} replicas", name, replicas),
        )
    })
}

fn desired_replicas(deployment: &MachineDeployment, existing: Option<i32>, hibernated: bool) -> i32 {
    if hibernated {
        return 0;
    }
    match existing {
        Some(replicas) => replicas.clamp(deployment.minimum, deployment.maximum.max(deployment.minimum)),
        None => deployment.minimum,
    }
}

fn previous_deployments(worker: &Worker) -> Vec<String> {
    worker
        .status
        .as_ref()
        .map(|s| s.machine_deployments.iter().map(|d| d.name.clone()).collect())
        .unwrap_or_default()
}

fn identity(worker: &Worker) -> Result<(String, String), Error> {
    let namespace = worker
        .metadata
        .namespace
        .clone()
        .ok_or_else(|| Error::invalid("metadata.namespace", "Required", "worker has no namespace"))?;
    let name = worker
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::invalid("metadata.name", "Required", "worker has no name"))?;
    Ok((namespace, name))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::apis::extensions::WorkerStatus;
    use crate::testing::{cluster, FakeSeedClient, FakeStatusUpdater};
    use crate::worker::{class_name, deployment_name, finish_machine_class, machine_class_hash};
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

    const NAMESPACE: &str = "shoot--dev--test";

    struct Delegate;

    #[async_trait::async_trait]
    impl WorkerDelegate for Delegate {
        fn machine_class_kind(&self) -> &str {
            "TestMachineClass"
        }

        async fn generate_machine_config(
            &self,
            worker: &Worker,
            cluster: &ClusterContext,
        ) -> anyhow::Result<MachineConfig> {
            let mut config = MachineConfig::default();
            for pool in &worker.spec.pools {
                let mut class = MachineClass::new();
                class.insert("machineType".into(), json!(pool.machine_type));
                let hash = machine_class_hash(&class, cluster.kubernetes_version())?;
                let deployment = deployment_name(NAMESPACE, &pool.name);
                let class_name = class_name(&deployment, &hash);
                let mut credentials = BTreeMap::new();
                credentials.insert("token".to_owned(), "secret-token".to_owned());
                finish_machine_class(&mut class, &class_name, &credentials, pool);
                config.classes.push(class);
                config.deployments.push(MachineDeployment {
                    name: deployment,
                    secret_name: class_name.clone(),
                    class_name,
                    minimum: pool.minimum,
                    maximum: pool.maximum,
                    max_surge: pool.max_surge.clone(),
                    max_unavailable: pool.max_unavailable.clone(),
                    labels: pool.labels.clone(),
                    annotations: pool.annotations.clone(),
                    taints: pool.taints.clone(),
                });
            }
            config.provider_status = Some(json!({"machineImages": [{"name": "ubuntu"}]}));
            Ok(config)
        }
    }

    fn worker(pools: &[&str], previous: &[&str]) -> Worker {
        let pools: Vec<Value> = pools
            .iter()
            .map(|name| {
                json!({
                    "name": name,
                    "machineType": "large",
                    "machineImage": {"name": "ubuntu", "version": "18.4"},
                    "minimum": 2,
                    "maximum": 4,
                    "maxSurge": 1,
                    "maxUnavailable": 0,
                    "userData": base64::encode("#cloud-config"),
                })
            })
            .collect();
        let mut worker: Worker = serde_json::from_value(json!({
            "apiVersion": "extensions.gardener.cloud/v1alpha1",
            "kind": "Worker",
            "metadata": {"name": "worker", "namespace": NAMESPACE},
            "spec": {
                "type": "test",
                "region": "eu",
                "secretRef": {"name": "cloudprovider"},
                "pools": pools,
            }
        }))
        .unwrap();
        worker.status = Some(WorkerStatus {
            machine_deployments: previous
                .iter()
                .map(|name| MachineDeploymentStatus {
                    name: deployment_name(NAMESPACE, name),
                    minimum: 1,
                    maximum: 1,
                })
                .collect(),
            ..Default::default()
        });
        worker
    }

    fn actuator(client: &FakeSeedClient, status: &FakeStatusUpdater) -> GenericActuator {
        GenericActuator::new(
            Arc::new(Delegate),
            Arc::new(client.clone()),
            Arc::new(status.clone()),
        )
    }

    #[tokio::test]
    async fn reconcile_writes_classes_deployments_and_status() -> anyhow::Result<()> {
        let client = FakeSeedClient::new();
        let status = FakeStatusUpdater::new();
        actuator(&client, &status)
            .reconcile(&worker(&["pool-1"], &[]), &cluster(NAMESPACE, "1.2.3"))
            .await?;

        let deployment = client
            .object(NAMESPACE, MACHINE_DEPLOYMENT_KIND, "shoot--dev--test-pool-1")
            .unwrap();
        assert_eq!(deployment.data["spec"]["replicas"], 2);
        let class = deployment.data["spec"]["template"]["spec"]["class"]["name"]
            .as_str()
            .unwrap()
            .to_owned();
        assert!(class.starts_with("shoot--dev--test-pool-1-"));

        let machine_class = client.object(NAMESPACE, "TestMachineClass", &class).unwrap();
        assert_eq!(machine_class.data["spec"]["secretRef"]["name"], class.as_str());
        assert!(machine_class.data["spec"].get("secret").is_none());

        let secret = client.secret(NAMESPACE, &class).unwrap();
        let data = secret.data.unwrap();
        assert_eq!(data["userData"], ByteString(b"#cloud-config".to_vec()));
        assert_eq!(data["token"], ByteString(b"secret-token".to_vec()));

        let last = status.last_status().unwrap();
        assert_eq!(last["machineDeployments"][0]["name"], "shoot--dev--test-pool-1");
        assert_eq!(last["providerStatus"]["machineImages"][0]["name"], "ubuntu");
        Ok(())
    }

    #[tokio::test]
    async fn existing_replicas_are_kept_within_bounds() -> anyhow::Result<()> {
        let client = FakeSeedClient::new();
        let existing: DynamicObject = serde_json::from_value(json!({
            "apiVersion": MACHINE_API_VERSION,
            "kind": MACHINE_DEPLOYMENT_KIND,
            "metadata": {"name": "shoot--dev--test-pool-1", "namespace": NAMESPACE},
            "spec": {"replicas": 3}
        }))?;
        client.insert(&existing);
        actuator(&client, &FakeStatusUpdater::new())
            .reconcile(&worker(&["pool-1"], &[]), &cluster(NAMESPACE, "1.2.3"))
            .await?;
        let deployment = client
            .object(NAMESPACE, MACHINE_DEPLOYMENT_KIND, "shoot--dev--test-pool-1")
            .unwrap();
        assert_eq!(deployment.data["spec"]["replicas"], 3);
        Ok(())
    }

    #[test]
    fn oversized_replica_counts_are_invalid() {
        let existing: DynamicObject = serde_json::from_value(json!({
            "apiVersion": MACHINE_API_VERSION,
            "kind": MACHINE_DEPLOYMENT_KIND,
            "metadata": {"name": "shoot--dev--test-pool-1", "namespace": NAMESPACE},
            "spec": {"replicas": 4_294_967_298u64}
        }))
        .unwrap();
        assert!(matches!(
            existing_replicas(Some(&existing), "shoot--dev--test-pool-1"),
            Err(Error::Invalid { .. })
        ));
        assert_eq!(existing_replicas(None, "shoot--dev--test-pool-1").unwrap(), None);
    }

    #[test]
    fn replicas() {
        let deployment = MachineDeployment {
            name: "d".into(),
            class_name: "c".into(),
            secret_name: "c".into(),
            minimum: 2,
            maximum: 4,
            max_surge: IntOrString::Int(1),
            max_unavailable: IntOrString::Int(0),
            labels: Default::default(),
            annotations: Default::default(),
            taints: vec![],
        };
        assert_eq!(desired_replicas(&deployment, None, false), 2);
        assert_eq!(desired_replicas(&deployment, Some(9), false), 4);
        assert_eq!(desired_replicas(&deployment, Some(1), false), 2);
        assert_eq!(desired_replicas(&deployment, Some(3), true), 0);
    }

    #[tokio::test]
    async fn obsolete_deployments_are_removed() -> anyhow::Result<()> {
        let client = FakeSeedClient::new();
        actuator(&client, &FakeStatusUpdater::new())
            .reconcile(&worker(&["pool-1"], &["pool-1", "pool-old"]), &cluster(NAMESPACE, "1.2.3"))
            .await?;
        let deletions = client.deletions();
        assert_eq!(deletions.len(), 1);
        assert_eq!(deletions[0].name, "shoot--dev--test-pool-old");
        Ok(())
    }

    #[tokio::test]
    async fn delete_removes_deployments_before_classes() -> anyhow::Result<()> {
        let client = FakeSeedClient::new();
        let status = FakeStatusUpdater::new();
        let actuator = actuator(&client, &status);
        let worker = worker(&["pool-1"], &[]);
        actuator.reconcile(&worker, &cluster(NAMESPACE, "1.2.3")).await?;
        actuator.delete(&worker, &cluster(NAMESPACE, "1.2.3")).await?;

        let kinds: Vec<String> = client.deletions().into_iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![MACHINE_DEPLOYMENT_KIND, "TestMachineClass", "Secret"]);
        Ok(())
    }
}
