//! In-memory fakes of the collaborators, for tests of this crate and of
//! provider crates.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use kube::core::DynamicObject;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::apis::cluster::{ClusterContext, SeedProvider, ShootKubernetes};
use crate::chart::{ChartRenderer, Manifest, RenderedChart};
use crate::client::{to_dynamic, ClusterReader, SeedClient};
use crate::error::Error;
use crate::secrets::SecretsDeployer;
use crate::status::StatusUpdater;

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// A recorded write to the fake seed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    /// Namespace, empty for cluster scoped objects.
    pub namespace: String,
    /// Kind.
    pub kind: String,
    /// Name.
    pub name: String,
}

type Key = (String, String, String);

/// A seed that keeps objects in memory and records every write.
#[derive(Clone, Default)]
pub struct FakeSeedClient {
    objects: Arc<RwLock<BTreeMap<Key, DynamicObject>>>,
    applied: Arc<RwLock<Vec<Call>>>,
    deleted: Arc<RwLock<Vec<Call>>>,
    failing: Arc<RwLock<Vec<(String, String)>>>,
    server_version: Arc<RwLock<String>>,
}

impl FakeSeedClient {
    /// Creates an empty seed running kubernetes 1.20.0.
    pub fn new() -> Self {
        let client = Self::default();
        *write(&client.server_version) = "1.20.0".to_owned();
        client
    }

    /// Changes the reported server version.
    pub fn set_server_version(&self, version: &str) {
        *write(&self.server_version) = version.to_owned();
    }

    /// Stores an object without recording a write.
    pub fn insert<K: Serialize>(&self, object: &K) {
        let object = to_dynamic(object).expect("object should convert to a dynamic object");
        let key = key_of(&object).expect("object should have kind and name");
        write(&self.objects).insert(key, object);
    }

    /// Makes every apply of the given object fail.
    pub fn fail_apply(&self, kind: &str, name: &str) {
        write(&self.failing).push((kind.to_owned(), name.to_owned()));
    }

    /// Returns a stored object.
    pub fn object(&self, namespace: &str, kind: &str, name: &str) -> Option<DynamicObject> {
        read(&self.objects)
            .get(&(namespace.to_owned(), kind.to_owned(), name.to_owned()))
            .cloned()
    }

    /// Returns a stored object converted to `K`.
    pub fn typed<K: DeserializeOwned>(&self, namespace: &str, kind: &str, name: &str) -> Option<K> {
        self.object(namespace, kind, name)
            .map(|o| convert(&o).expect("stored object should convert"))
    }

    /// Returns a stored secret.
    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.typed(namespace, "Secret", name)
    }

    /// Returns a stored deployment.
    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.typed(namespace, "Deployment", name)
    }

    /// Applies in call order.
    pub fn applied(&self) -> Vec<Call> {
        read(&self.applied).clone()
    }

    /// Deletes in call order, including those of missing objects.
    pub fn deletions(&self) -> Vec<Call> {
        read(&self.deleted).clone()
    }

    /// Whether the given object was applied at least once.
    pub fn was_applied(&self, kind: &str, name: &str) -> bool {
        read(&self.applied)
            .iter()
            .any(|c| c.kind == kind && c.name == name)
    }

    fn get_typed<K: DeserializeOwned>(
        &self,
        namespace: &str,
        kind: &str,
        name: &str,
    ) -> anyhow::Result<Option<K>> {
        match self.object(namespace, kind, name) {
            Some(object) => Ok(Some(convert(&object)?)),
            None => Ok(None),
        }
    }
}

fn convert<K: DeserializeOwned>(object: &DynamicObject) -> anyhow::Result<K> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

fn key_of(object: &DynamicObject) -> Option<Key> {
    let kind = object.types.as_ref()?.kind.clone();
    let name = object.metadata.name.clone()?;
    let namespace = object.metadata.namespace.clone().unwrap_or_default();
    Some((namespace, kind, name))
}

#[async_trait::async_trait]
impl SeedClient for FakeSeedClient {
    async fn get_secret(&self, namespace: &str, name: &str) -> anyhow::Result<Option<Secret>> {
        self.get_typed(namespace, "Secret", name)
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> anyhow::Result<Option<ConfigMap>> {
        self.get_typed(namespace, "ConfigMap", name)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> anyhow::Result<Option<Service>> {
        self.get_typed(namespace, "Service", name)
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> anyhow::Result<Option<Deployment>> {
        self.get_typed(namespace, "Deployment", name)
    }

    async fn get_object(
        &self,
        namespace: Option<&str>,
        _api_version: &str,
        kind: &str,
        name: &str,
    ) -> anyhow::Result<Option<DynamicObject>> {
        Ok(self.object(namespace.unwrap_or_default(), kind, name))
    }

    async fn apply(&self, object: &DynamicObject) -> anyhow::Result<()> {
        let key = key_of(object)
            .ok_or_else(|| Error::invalid("metadata.name", "Required", "object has no kind or name"))?;
        if read(&self.failing)
            .iter()
            .any(|(kind, name)| *kind == key.1 && *name == key.2)
        {
            anyhow::bail!("injected failure applying {} {}", key.1, key.2);
        }
        write(&self.applied).push(Call {
            namespace: key.0.clone(),
            kind: key.1.clone(),
            name: key.2.clone(),
        });
        write(&self.objects).insert(key, object.clone());
        Ok(())
    }

    async fn delete(
        &self,
        namespace: Option<&str>,
        _api_version: &str,
        kind: &str,
        name: &str,
    ) -> anyhow::Result<()> {
        let key = (
            namespace.unwrap_or_default().to_owned(),
            kind.to_owned(),
            name.to_owned(),
        );
        write(&self.deleted).push(Call {
            namespace: key.0.clone(),
            kind: key.1.clone(),
            name: key.2.clone(),
        });
        match write(&self.objects).remove(&key) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound {
                kind: kind.to_owned(),
                name: name.to_owned(),
            }
            .into()),
        }
    }

    async fn server_version(&self) -> anyhow::Result<String> {
        Ok(read(&self.server_version).clone())
    }
}

/// Serves clusters from memory.
#[derive(Clone, Default)]
pub struct FakeClusterReader {
    clusters: Arc<RwLock<BTreeMap<String, Arc<ClusterContext>>>>,
}

impl FakeClusterReader {
    /// Creates a reader without clusters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a cluster under its name.
    pub fn add(&self, cluster: ClusterContext) {
        write(&self.clusters).insert(cluster.name.clone(), Arc::new(cluster));
    }
}

#[async_trait::async_trait]
impl ClusterReader for FakeClusterReader {
    async fn get_cluster(&self, name: &str) -> anyhow::Result<Arc<ClusterContext>> {
        read(&self.clusters).get(name).cloned().ok_or_else(|| {
            Error::NotFound {
                kind: "Cluster".to_owned(),
                name: name.to_owned(),
            }
            .into()
        })
    }
}

/// A cluster called `name` running kubernetes `version` on an azure seed.
pub fn cluster(name: &str, version: &str) -> ClusterContext {
    let mut cluster = ClusterContext {
        name: name.to_owned(),
        ..Default::default()
    };
    cluster.shoot.spec.kubernetes = ShootKubernetes {
        version: version.to_owned(),
    };
    cluster.shoot.spec.networking.pods = Some("100.96.0.0/11".to_owned());
    cluster.seed.spec.provider = SeedProvider {
        type_: "azure".to_owned(),
        region: "westeurope".to_owned(),
    };
    cluster
}

type Template = Box<dyn Fn(&Value) -> String + Send + Sync>;

/// Renders charts from templates registered per release. Releases without a
/// template render to nothing. Values of every render are recorded.
#[derive(Clone, Default)]
pub struct FakeChartRenderer {
    templates: Arc<RwLock<BTreeMap<String, Template>>>,
    values: Arc<RwLock<BTreeMap<String, Vec<Value>>>>,
}

impl FakeChartRenderer {
    /// Creates a renderer without templates.
    pub fn new() -> Self {
        Self::default()
    }

    /// Renders `release` to fixed YAML.
    pub fn add_template(&self, release: &str, yaml: &str) {
        let yaml = yaml.to_owned();
        self.add_template_fn(release, move |_| yaml.clone());
    }

    /// Renders `release` by calling `template` with the values.
    pub fn add_template_fn(
        &self,
        release: &str,
        template: impl Fn(&Value) -> String + Send + Sync + 'static,
    ) {
        write(&self.templates).insert(release.to_owned(), Box::new(template));
    }

    /// Values of the last render of `release`.
    pub fn last_values(&self, release: &str) -> Option<Value> {
        read(&self.values)
            .get(release)
            .and_then(|v| v.last().cloned())
    }

    /// Number of renders of `release`.
    pub fn renders(&self, release: &str) -> usize {
        read(&self.values).get(release).map_or(0, Vec::len)
    }
}

#[async_trait::async_trait]
impl ChartRenderer for FakeChartRenderer {
    async fn render(
        &self,
        _path: &std::path::Path,
        release: &str,
        _namespace: &str,
        values: &Value,
    ) -> anyhow::Result<RenderedChart> {
        write(&self.values)
            .entry(release.to_owned())
            .or_default()
            .push(values.clone());
        let manifests = match read(&self.templates).get(release) {
            Some(template) => vec![Manifest {
                name: format!("{}/templates/{}.yaml", release, release),
                content: template(values),
            }],
            None => Vec::new(),
        };
        Ok(RenderedChart { manifests })
    }
}

/// Returns a fixed set of secrets and counts calls.
#[derive(Clone, Default)]
pub struct FakeSecretsDeployer {
    secrets: Arc<RwLock<BTreeMap<String, Secret>>>,
    deploys: Arc<RwLock<usize>>,
    deletes: Arc<RwLock<usize>>,
}

impl FakeSecretsDeployer {
    /// Creates a deployer returning `secrets`.
    pub fn new(secrets: Vec<Secret>) -> Self {
        let deployer = Self::default();
        for secret in secrets {
            let name = secret.metadata.name.clone().unwrap_or_default();
            write(&deployer.secrets).insert(name, secret);
        }
        deployer
    }

    /// Number of deploy calls.
    pub fn deploys(&self) -> usize {
        *read(&self.deploys)
    }

    /// Number of delete calls.
    pub fn deletes(&self) -> usize {
        *read(&self.deletes)
    }
}

#[async_trait::async_trait]
impl SecretsDeployer for FakeSecretsDeployer {
    async fn deploy(&self, _namespace: &str) -> anyhow::Result<BTreeMap<String, Secret>> {
        *write(&self.deploys) += 1;
        Ok(read(&self.secrets).clone())
    }

    async fn delete(&self, _namespace: &str) -> anyhow::Result<()> {
        *write(&self.deletes) += 1;
        Ok(())
    }
}

/// Records status and object patches.
#[derive(Clone, Default)]
pub struct FakeStatusUpdater {
    statuses: Arc<RwLock<Vec<(String, Value)>>>,
    patches: Arc<RwLock<Vec<(String, Value)>>>,
}

impl FakeStatusUpdater {
    /// Creates an updater without recorded patches.
    pub fn new() -> Self {
        Self::default()
    }

    /// Status patches as `(namespace/name, status)`, in call order.
    pub fn statuses(&self) -> Vec<(String, Value)> {
        read(&self.statuses).clone()
    }

    /// Object patches as `(namespace/name, patch)`, in call order.
    pub fn patches(&self) -> Vec<(String, Value)> {
        read(&self.patches).clone()
    }

    /// The last status patch.
    pub fn last_status(&self) -> Option<Value> {
        read(&self.statuses).last().map(|(_, s)| s.clone())
    }
}

#[async_trait::async_trait]
impl StatusUpdater for FakeStatusUpdater {
    async fn patch_status(&self, namespace: &str, name: &str, status: Value) -> anyhow::Result<()> {
        write(&self.statuses).push((format!("{}/{}", namespace, name), status));
        Ok(())
    }

    async fn patch_object(&self, namespace: &str, name: &str, patch: Value) -> anyhow::Result<()> {
        write(&self.patches).push((format!("{}/{}", namespace, name), patch));
        Ok(())
    }
}
