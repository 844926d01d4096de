//! Machine classes and machine deployments for worker pools.
//!
//! Providers implement [`WorkerDelegate`] to turn the pools of a `Worker` into
//! provider specific machine classes; the [`GenericActuator`] writes them to
//! the seed together with the machine deployments that reference them.

mod generic;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use k8s_openapi::api::core::v1::Taint;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::apis::cluster::ClusterContext;
use crate::apis::extensions::{Worker, WorkerPool};
use crate::checksum::{canonical_json, sha256_hex};
use crate::client::ClusterReader;
use crate::controller::Reconciler;
use crate::error::Error;
use crate::version;

pub use generic::GenericActuator;

/// API version of machine classes and machine deployments.
pub const MACHINE_API_VERSION: &str = "machine.sapcloud.io/v1alpha1";
/// Kind of machine deployments.
pub const MACHINE_DEPLOYMENT_KIND: &str = "MachineDeployment";
/// Key of the user data in a machine class secret.
pub const USER_DATA_KEY: &str = "userData";

const HASH_LENGTH: usize = 5;

/// A provider specific machine class. `name` and `secret` are set by the
/// generator; every other key is free form.
pub type MachineClass = Map<String, Value>;

/// Desired state of one machine deployment.
#[derive(Clone, Debug, PartialEq)]
pub struct MachineDeployment {
    /// Name of the deployment.
    pub name: String,
    /// Name of the machine class.
    pub class_name: String,
    /// Name of the secret of the machine class.
    pub secret_name: String,
    /// Minimum number of machines.
    pub minimum: i32,
    /// Maximum number of machines.
    pub maximum: i32,
    /// Surge during rolling updates.
    pub max_surge: IntOrString,
    /// Unavailable machines tolerated during rolling updates.
    pub max_unavailable: IntOrString,
    /// Labels of the nodes.
    pub labels: BTreeMap<String, String>,
    /// Annotations of the nodes.
    pub annotations: BTreeMap<String, String>,
    /// Taints of the nodes.
    pub taints: Vec<Taint>,
}

/// Everything a delegate generates for one worker.
#[derive(Clone, Debug, Default)]
pub struct MachineConfig {
    /// Machine classes, each with `name` and `secret` set.
    pub classes: Vec<MachineClass>,
    /// Machine deployments referencing the classes.
    pub deployments: Vec<MachineDeployment>,
    /// Provider status to record on the worker, e.g. the used machine images.
    pub provider_status: Option<Value>,
}

/// Provider specific part of the worker actuator.
#[async_trait::async_trait]
pub trait WorkerDelegate: Send + Sync {
    /// Kind of the provider's machine classes, e.g. `AzureMachineClass`.
    fn machine_class_kind(&self) -> &str;

    /// Generates machine classes and deployments for all pools.
    async fn generate_machine_config(
        &self,
        worker: &Worker,
        cluster: &ClusterContext,
    ) -> anyhow::Result<MachineConfig>;
}

/// Name of the deployment of `pool`.
pub fn deployment_name(namespace: &str, pool: &str) -> String {
    format!("{}-{}", namespace, pool)
}

/// Name of the deployment of `pool` in the zone at `zone_index`.
pub fn zoned_deployment_name(namespace: &str, pool: &str, zone_index: usize) -> String {
    format!("{}-z{}", deployment_name(namespace, pool), zone_index + 1)
}

/// Name of a machine class, which is also the name of its secret.
pub fn class_name(deployment_name: &str, hash: &str) -> String {
    format!("{}-{}", deployment_name, hash)
}

/// Hash over a machine class and the kubernetes minor version. `name` and
/// `secret` are not part of the hash, so that the hash can name both.
pub fn machine_class_hash(class: &MachineClass, kubernetes_version: &str) -> Result<String, Error> {
    let mut hashed = class.clone();
    hashed.remove("name");
    hashed.remove("secret");
    let mut input = canonical_json(&Value::Object(hashed));
    input.push_str(&version::major_minor(kubernetes_version)?);
    let mut hash = sha256_hex(input.as_bytes());
    hash.truncate(HASH_LENGTH);
    Ok(hash)
}

/// Sets `name` and the `secret` of a machine class from `class_name`,
/// `credentials` and the pool's user data.
pub fn finish_machine_class(
    class: &mut MachineClass,
    class_name: &str,
    credentials: &BTreeMap<String, String>,
    pool: &WorkerPool,
) {
    class.insert("name".to_owned(), Value::String(class_name.to_owned()));
    let mut secret: Map<String, Value> = credentials
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    secret.insert(
        USER_DATA_KEY.to_owned(),
        Value::String(String::from_utf8_lossy(&pool.user_data.0).into_owned()),
    );
    class.insert("secret".to_owned(), Value::Object(secret));
}

/// Share of `total` that the zone at `zone_index` out of `zones` gets.
/// Remainders go to the first zones.
pub fn distribute_over_zones(zone_index: usize, total: i32, zones: usize) -> i32 {
    if zones == 0 {
        return total;
    }
    let zones = zones as i32;
    let index = zone_index as i32;
    let mut share = total / zones;
    if index < total % zones {
        share += 1;
    }
    share
}

/// Like [`distribute_over_zones`] for surge settings. Percentages apply to
/// each zone as they are.
pub fn distribute_positive_int_or_percent(
    zone_index: usize,
    value: &IntOrString,
    zones: usize,
) -> IntOrString {
    match value {
        IntOrString::Int(total) => IntOrString::Int(distribute_over_zones(zone_index, *total, zones)),
        IntOrString::String(percent) => IntOrString::String(percent.clone()),
    }
}

/// A machine image a pool runs, together with what the provider needs to
/// boot it.
pub trait MachineImageRef {
    /// Logical image name.
    fn name(&self) -> &str;
    /// Image version.
    fn version(&self) -> &str;
}

/// Looks up an image first in the cloud profile's images and then in the
/// images recorded in the worker's status, so that pools keep their image
/// after it was removed from the profile.
pub fn find_machine_image<T: MachineImageRef + Clone>(
    profile: &[T],
    status: &[T],
    name: &str,
    version: &str,
) -> Result<T, Error> {
    profile
        .iter()
        .chain(status.iter())
        .find(|image| image.name() == name && image.version() == version)
        .cloned()
        .ok_or_else(|| Error::ImageNotFound {
            name: name.to_owned(),
            version: version.to_owned(),
        })
}

/// Adds `image` to `images` unless an image with the same name and version
/// is already present.
pub fn append_machine_image<T: MachineImageRef>(images: &mut Vec<T>, image: T) {
    if !images
        .iter()
        .any(|i| i.name() == image.name() && i.version() == image.version())
    {
        images.push(image);
    }
}

/// Decodes the provider status of a worker, if any.
pub fn decode_provider_status<T: for<'de> Deserialize<'de> + Default>(
    worker: &Worker,
) -> Result<T, Error> {
    match worker
        .status
        .as_ref()
        .and_then(|s| s.default.provider_status.as_ref())
    {
        Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
            Error::invalid("status.providerStatus", "Invalid", e.to_string())
        }),
        None => Ok(T::default()),
    }
}

/// Encodes a provider status.
pub fn encode_provider_status<T: Serialize>(status: &T) -> Result<Value, Error> {
    serde_json::to_value(status)
        .map_err(|e| Error::invalid("status.providerStatus", "Invalid", e.to_string()))
}

/// Adapts the [`GenericActuator`] to the controller runtime by looking up the
/// cluster of every worker.
pub struct WorkerReconciler {
    actuator: GenericActuator,
    clusters: Arc<dyn ClusterReader>,
}

impl WorkerReconciler {
    /// Creates a reconciler.
    pub fn new(actuator: GenericActuator, clusters: Arc<dyn ClusterReader>) -> Self {
        WorkerReconciler { actuator, clusters }
    }

    async fn cluster(&self, worker: &Worker) -> anyhow::Result<Arc<ClusterContext>> {
        let namespace = worker
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::invalid("metadata.namespace", "Required", "worker has no namespace"))?;
        self.clusters
            .get_cluster(namespace)
            .await
            .with_context(|| format!("could not get cluster for worker in namespace '{}'", namespace))
    }
}

#[async_trait::async_trait]
impl Reconciler<Worker> for WorkerReconciler {
    async fn reconcile(&self, worker: &Worker) -> anyhow::Result<bool> {
        let cluster = self.cluster(worker).await?;
        self.actuator.reconcile(worker, &cluster).await?;
        Ok(false)
    }

    async fn delete(&self, worker: &Worker) -> anyhow::Result<()> {
        let cluster = self.cluster(worker).await?;
        self.actuator.delete(worker, &cluster).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[derive(Clone, Debug, PartialEq)]
    struct Image(&'static str, &'static str, &'static str);

    impl MachineImageRef for Image {
        fn name(&self) -> &str {
            self.0
        }

        fn version(&self) -> &str {
            self.1
        }
    }

    fn class() -> MachineClass {
        json!({
            "region": "westeurope",
            "machineType": "large",
            "image": {"urn": "Canonical:UbuntuServer:18.04-LTS:18.04.201906170"},
            "volumeSize": 20,
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[test]
    fn names_follow_the_grammar() {
        let deployment = deployment_name("shoot--dev--test", "pool-1");
        assert_eq!(deployment, "shoot--dev--test-pool-1");
        assert_eq!(
            zoned_deployment_name("shoot--dev--test", "pool-1", 0),
            "shoot--dev--test-pool-1-z1"
        );
        let hash = machine_class_hash(&class(), "1.2.3").unwrap();
        assert_eq!(hash.len(), 5);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(class_name(&deployment, &hash), format!("shoot--dev--test-pool-1-{}", hash));
    }

    #[test]
    fn hash_ignores_name_and_secret() {
        let plain = machine_class_hash(&class(), "1.2.3").unwrap();
        let mut named = class();
        named.insert("name".into(), json!("foo"));
        named.insert("secret".into(), json!({"clientID": "C"}));
        assert_eq!(machine_class_hash(&named, "1.2.3").unwrap(), plain);
    }

    #[test]
    fn hash_changes_with_class_and_minor_version() {
        let plain = machine_class_hash(&class(), "1.2.3").unwrap();
        assert_eq!(machine_class_hash(&class(), "1.2.4").unwrap(), plain);
        assert_ne!(machine_class_hash(&class(), "1.3.0").unwrap(), plain);
        let mut bigger = class();
        bigger.insert("volumeSize".into(), json!(21));
        assert_ne!(machine_class_hash(&bigger, "1.2.3").unwrap(), plain);
    }

    #[test]
    fn zones_share_remainders_first() {
        let shares: Vec<i32> = (0..3).map(|i| distribute_over_zones(i, 10, 3)).collect();
        assert_eq!(shares, vec![4, 3, 3]);
        assert_eq!(distribute_over_zones(1, 1, 2), 0);
        assert_eq!(
            distribute_positive_int_or_percent(0, &IntOrString::String("25%".into()), 2),
            IntOrString::String("25%".into())
        );
        assert_eq!(
            distribute_positive_int_or_percent(1, &IntOrString::Int(3), 2),
            IntOrString::Int(1)
        );
    }

    #[test]
    fn images_fall_back_to_the_status() {
        let profile = vec![Image("ubuntu", "18.4.1", "urn-1")];
        let status = vec![Image("ubuntu", "18.4.0", "urn-0")];
        assert_eq!(find_machine_image(&profile, &status, "ubuntu", "18.4.1").unwrap().2, "urn-1");
        assert_eq!(find_machine_image(&profile, &status, "ubuntu", "18.4.0").unwrap().2, "urn-0");
        match find_machine_image(&profile, &status, "coreos", "1.0") {
            Err(Error::ImageNotFound { name, version }) => {
                assert_eq!(name, "coreos");
                assert_eq!(version, "1.0");
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn append_skips_duplicates() {
        let mut images = vec![Image("ubuntu", "18.4.1", "urn-1")];
        append_machine_image(&mut images, Image("ubuntu", "18.4.1", "other"));
        append_machine_image(&mut images, Image("ubuntu", "18.4.2", "urn-2"));
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].2, "urn-1");
    }
}
