//! Access to the seed cluster.
//!
//! Actuators and mutators never talk to `kube::Api` directly. They go through
//! [`SeedClient`] and [`ClusterReader`], so that tests can substitute
//! in-memory fakes and every call is bounded by the configured API timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::Client;
use serde::Serialize;
use tracing::{debug, trace};

use crate::apis::cluster::{Cluster, ClusterContext};
use crate::error::Error;

/// Field manager used for server side apply.
pub const FIELD_MANAGER: &str = "gardener-extensions";

/// Reads and writes objects in the seed cluster.
#[async_trait::async_trait]
pub trait SeedClient: Send + Sync {
    /// Gets a secret, `None` if it does not exist.
    async fn get_secret(&self, namespace: &str, name: &str) -> anyhow::Result<Option<Secret>>;

    /// Gets a config map, `None` if it does not exist.
    async fn get_config_map(&self, namespace: &str, name: &str)
        -> anyhow::Result<Option<ConfigMap>>;

    /// Gets a service, `None` if it does not exist.
    async fn get_service(&self, namespace: &str, name: &str) -> anyhow::Result<Option<Service>>;

    /// Gets a deployment, `None` if it does not exist.
    async fn get_deployment(&self, namespace: &str, name: &str)
        -> anyhow::Result<Option<Deployment>>;

    /// Gets an object of any kind, `None` if it or its kind does not exist.
    async fn get_object(
        &self,
        namespace: Option<&str>,
        api_version: &str,
        kind: &str,
        name: &str,
    ) -> anyhow::Result<Option<DynamicObject>>;

    /// Creates or updates an object through server side apply. The object must
    /// carry `apiVersion`, `kind` and `metadata.name`.
    async fn apply(&self, object: &DynamicObject) -> anyhow::Result<()>;

    /// Deletes an object. Fails with [`Error::NotFound`] if the object or its
    /// kind does not exist.
    async fn delete(
        &self,
        namespace: Option<&str>,
        api_version: &str,
        kind: &str,
        name: &str,
    ) -> anyhow::Result<()>;

    /// The `major.minor.patch` version of the seed's API server.
    async fn server_version(&self) -> anyhow::Result<String>;
}

/// Reads the [`Cluster`] of a shoot.
#[async_trait::async_trait]
pub trait ClusterReader: Send + Sync {
    /// Gets and decodes the cluster called `name`, which equals the shoot's
    /// seed namespace.
    async fn get_cluster(&self, name: &str) -> anyhow::Result<Arc<ClusterContext>>;
}

/// Converts any serializable Kubernetes object into a [`DynamicObject`].
pub fn to_dynamic<K: Serialize>(object: &K) -> anyhow::Result<DynamicObject> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

/// Splits an `apiVersion` into group and version. The core group is empty.
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

fn api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = split_api_version(api_version);
    ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, kind))
}

fn optional<T>(result: Result<T, kube::Error>) -> Result<Option<T>, kube::Error> {
    match result {
        Ok(object) => Ok(Some(object)),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(None),
        Err(e) => Err(e),
    }
}

/// [`SeedClient`] and [`ClusterReader`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeSeedClient {
    client: Client,
    timeout: Duration,
}

impl KubeSeedClient {
    /// Creates a client whose individual calls time out after `timeout`.
    pub fn new(client: Client, timeout: Duration) -> Self {
        KubeSeedClient { client, timeout }
    }

    /// The underlying client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn bounded<T, F>(&self, call: F) -> anyhow::Result<T>
    where
        F: Future<Output = Result<T, kube::Error>> + Send,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Timeout(self.timeout).into()),
        }
    }
}

#[async_trait::async_trait]
impl SeedClient for KubeSeedClient {
    async fn get_secret(&self, namespace: &str, name: &str) -> anyhow::Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        self.bounded(async { optional(api.get(name).await) }).await
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> anyhow::Result<Option<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        self.bounded(async { optional(api.get(name).await) }).await
    }

    async fn get_service(&self, namespace: &str, name: &str) -> anyhow::Result<Option<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        self.bounded(async { optional(api.get(name).await) }).await
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> anyhow::Result<Option<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        self.bounded(async { optional(api.get(name).await) }).await
    }

    async fn get_object(
        &self,
        namespace: Option<&str>,
        api_version: &str,
        kind: &str,
        name: &str,
    ) -> anyhow::Result<Option<DynamicObject>> {
        let resource = api_resource(api_version, kind);
        let api: Api<DynamicObject> = match namespace {
            Some(namespace) => Api::namespaced_with(self.client.clone(), namespace, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        };
        self.bounded(async { optional(api.get(name).await) }).await
    }

    async fn apply(&self, object: &DynamicObject) -> anyhow::Result<()> {
        let types = object
            .types
            .as_ref()
            .ok_or_else(|| Error::invalid("apiVersion", "Required", "object has no type meta"))?;
        let resource = api_resource(&types.api_version, &types.kind);
        let name = object
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::invalid("metadata.name", "Required", "object has no name"))?;
        let api: Api<DynamicObject> = match object.metadata.namespace.as_deref() {
            Some(namespace) => Api::namespaced_with(self.client.clone(), namespace, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        };
        debug!(kind = %types.kind, %name, namespace = ?object.metadata.namespace, "Applying object");
        trace!(object = ?object, "Applied object content");
        let params = PatchParams::apply(FIELD_MANAGER).force();
        self.bounded(async { api.patch(&name, &params, &Patch::Apply(object)).await })
            .await?;
        Ok(())
    }

    async fn delete(
        &self,
        namespace: Option<&str>,
        api_version: &str,
        kind: &str,
        name: &str,
    ) -> anyhow::Result<()> {
        let resource = api_resource(api_version, kind);
        let api: Api<DynamicObject> = match namespace {
            Some(namespace) => Api::namespaced_with(self.client.clone(), namespace, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        };
        debug!(%kind, %name, ?namespace, "Deleting object");
        let deleted = self
            .bounded(async { optional(api.delete(name, &DeleteParams::default()).await) })
            .await?;
        match deleted {
            Some(_) => Ok(()),
            None => Err(Error::NotFound {
                kind: kind.to_owned(),
                name: name.to_owned(),
            }
            .into()),
        }
    }

    async fn server_version(&self) -> anyhow::Result<String> {
        let info = self.bounded(self.client.apiserver_version()).await?;
        Ok(info.git_version.trim_start_matches('v').to_owned())
    }
}

#[async_trait::async_trait]
impl ClusterReader for KubeSeedClient {
    async fn get_cluster(&self, name: &str) -> anyhow::Result<Arc<ClusterContext>> {
        let api: Api<Cluster> = Api::all(self.client.clone());
        let cluster = self
            .bounded(async { optional(api.get(name).await) })
            .await?
            .ok_or_else(|| Error::NotFound {
                kind: "Cluster".to_owned(),
                name: name.to_owned(),
            })?;
        Ok(Arc::new(ClusterContext::from_resource(&cluster)?))
    }
}
