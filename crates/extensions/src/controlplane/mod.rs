//! Reconciliation of `ControlPlane` resources.
//!
//! Providers implement [`ValuesProvider`] and register their charts in
//! [`ControlPlaneCharts`]; the [`GenericActuator`] does everything else. A
//! reconcile walks a fixed chain of states (secrets, config chart, checksums,
//! hibernation check, control plane chart, shoot chart, storage classes) and
//! stops early while the cluster is on its way into or out of hibernation.

mod generic;
mod state;

use std::sync::Arc;

use anyhow::Context;
use serde_json::{json, Value};
use tracing::debug;

use crate::apis::cluster::ClusterContext;
use crate::apis::extensions::{ControlPlane, Purpose};
use crate::chart::Chart;
use crate::checksum::Checksums;
use crate::client::ClusterReader;
use crate::controller::Reconciler;
use crate::error::Error;

pub use generic::GenericActuator;

/// Name of the managed resource holding the shoot side chart.
pub const SHOOT_CHART_RESOURCE_NAME: &str = "extension-controlplane-shoot";
/// Name of the managed resource holding the storage classes.
pub const STORAGE_CLASSES_CHART_RESOURCE_NAME: &str = "extension-controlplane-storageclasses";
/// Name of the API server deployment in the shoot's seed namespace.
pub const KUBE_APISERVER_DEPLOYMENT_NAME: &str = "kube-apiserver";

/// Reconciles and deletes control planes.
#[async_trait::async_trait]
pub trait Actuator: Send + Sync {
    /// Drives the control plane towards its desired state. Returns `true` if
    /// the caller should reconcile again after a while even though nothing
    /// failed.
    async fn reconcile(&self, cp: &ControlPlane, cluster: &ClusterContext) -> anyhow::Result<bool>;

    /// Removes everything the reconcile created.
    async fn delete(&self, cp: &ControlPlane, cluster: &ClusterContext) -> anyhow::Result<()>;
}

/// Computes provider specific chart values.
#[async_trait::async_trait]
pub trait ValuesProvider: Send + Sync {
    /// Values of the config chart.
    async fn config_chart_values(
        &self,
        _cp: &ControlPlane,
        _cluster: &ClusterContext,
    ) -> anyhow::Result<Value> {
        Ok(json!({}))
    }

    /// Values of the control plane chart. `checksums` holds the checksums of
    /// all deployed secrets, the credentials and the cloud provider config.
    /// `scaled_down` is set while the shoot is hibernated.
    async fn control_plane_chart_values(
        &self,
        cp: &ControlPlane,
        cluster: &ClusterContext,
        checksums: &Checksums,
        scaled_down: bool,
    ) -> anyhow::Result<Value>;

    /// Values of the shoot side chart.
    async fn control_plane_shoot_chart_values(
        &self,
        _cp: &ControlPlane,
        _cluster: &ClusterContext,
    ) -> anyhow::Result<Value> {
        Ok(json!({}))
    }

    /// Values of the storage class chart.
    async fn storage_class_chart_values(
        &self,
        _cp: &ControlPlane,
        _cluster: &ClusterContext,
    ) -> anyhow::Result<Value> {
        Ok(json!({}))
    }
}

/// The charts of one control plane purpose.
#[derive(Clone, Debug)]
pub struct ControlPlaneCharts {
    /// Renders the cloud provider config. Optional.
    pub config: Option<Chart>,
    /// Name of the config map rendered by the config chart, included in the
    /// checksums.
    pub cloud_provider_config_name: Option<String>,
    /// Seed side control plane components.
    pub control_plane: Chart,
    /// Shoot side components, deployed through a managed resource. Optional.
    pub shoot: Option<Chart>,
    /// Storage classes, deployed through a managed resource. Optional.
    pub storage_classes: Option<Chart>,
}

impl ControlPlaneCharts {
    /// Only a control plane chart, as used for the exposure purpose.
    pub fn control_plane_only(chart: Chart) -> Self {
        ControlPlaneCharts {
            config: None,
            cloud_provider_config_name: None,
            control_plane: chart,
            shoot: None,
            storage_classes: None,
        }
    }
}

/// Routes control planes to the actuator of their purpose. Control planes of
/// a purpose without actuator are left alone.
pub struct PurposeActuator {
    normal: Arc<dyn Actuator>,
    exposure: Option<Arc<dyn Actuator>>,
}

impl PurposeActuator {
    /// Creates a router.
    pub fn new(normal: Arc<dyn Actuator>, exposure: Option<Arc<dyn Actuator>>) -> Self {
        PurposeActuator { normal, exposure }
    }

    fn actuator(&self, cp: &ControlPlane) -> Option<&Arc<dyn Actuator>> {
        match cp.purpose() {
            Purpose::Normal => Some(&self.normal),
            Purpose::Exposure => self.exposure.as_ref(),
        }
    }
}

#[async_trait::async_trait]
impl Actuator for PurposeActuator {
    async fn reconcile(&self, cp: &ControlPlane, cluster: &ClusterContext) -> anyhow::Result<bool> {
        match self.actuator(cp) {
            Some(actuator) => actuator.reconcile(cp, cluster).await,
            None => {
                debug!(purpose = ?cp.purpose(), "No actuator for purpose");
                Ok(false)
            }
        }
    }

    async fn delete(&self, cp: &ControlPlane, cluster: &ClusterContext) -> anyhow::Result<()> {
        match self.actuator(cp) {
            Some(actuator) => actuator.delete(cp, cluster).await,
            None => Ok(()),
        }
    }
}

/// Adapts an [`Actuator`] to the controller runtime by looking up the cluster
/// of every control plane.
pub struct ControlPlaneReconciler {
    actuator: Arc<dyn Actuator>,
    clusters: Arc<dyn ClusterReader>,
}

impl ControlPlaneReconciler {
    /// Creates a reconciler.
    pub fn new(actuator: Arc<dyn Actuator>, clusters: Arc<dyn ClusterReader>) -> Self {
        ControlPlaneReconciler { actuator, clusters }
    }

    async fn cluster(&self, cp: &ControlPlane) -> anyhow::Result<Arc<ClusterContext>> {
        let namespace = cp
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::invalid("metadata.namespace", "Required", "controlplane has no namespace"))?;
        self.clusters
            .get_cluster(namespace)
            .await
            .with_context(|| format!("could not get cluster for controlplane in namespace '{}'", namespace))
    }
}

#[async_trait::async_trait]
impl Reconciler<ControlPlane> for ControlPlaneReconciler {
    async fn reconcile(&self, cp: &ControlPlane) -> anyhow::Result<bool> {
        let cluster = self.cluster(cp).await?;
        self.actuator.reconcile(cp, &cluster).await
    }

    async fn delete(&self, cp: &ControlPlane) -> anyhow::Result<()> {
        let cluster = self.cluster(cp).await?;
        self.actuator.delete(cp, &cluster).await
    }
}
