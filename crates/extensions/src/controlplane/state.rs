//! The states of a control plane reconcile.

use std::collections::BTreeMap;
use std::fmt::Debug;

use k8s_openapi::api::core::v1::Secret;
use serde_json::Value;
use tracing::{debug, info, trace};

use super::generic::GenericActuator;
use super::{
    KUBE_APISERVER_DEPLOYMENT_NAME, SHOOT_CHART_RESOURCE_NAME, STORAGE_CLASSES_CHART_RESOURCE_NAME,
};
use crate::apis::cluster::ClusterContext;
use crate::apis::extensions::{ControlPlane, LastOperationType};
use crate::checksum::{compute_checksums, Checksums};
use crate::managedresources;
use crate::status;

/// Everything the states of one reconcile share.
pub(crate) struct ReconcileContext<'a> {
    pub(crate) actuator: &'a GenericActuator,
    pub(crate) cp: &'a ControlPlane,
    pub(crate) cluster: &'a ClusterContext,
    pub(crate) namespace: String,
    pub(crate) name: String,
    pub(crate) operation: LastOperationType,
    pub(crate) secrets: BTreeMap<String, Secret>,
    pub(crate) checksums: Checksums,
    pub(crate) scaled_down: bool,
}

impl ReconcileContext<'_> {
    fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Result of executing a state.
pub(crate) enum Transition {
    /// Continue with another state.
    Next(Box<dyn State>),
    /// Stop and report whether to requeue.
    Complete(anyhow::Result<bool>),
}

/// Marks an edge of the state graph.
pub(crate) trait TransitionTo<S> {}

impl Transition {
    #[allow(clippy::boxed_local)]
    fn next<I: State + TransitionTo<O>, O: State>(_i: Box<I>, o: O) -> Transition {
        Transition::Next(Box::new(o))
    }
}

#[async_trait::async_trait]
pub(crate) trait State: Send + Sync + Debug + 'static {
    /// Executes the state.
    async fn next(self: Box<Self>, ctx: &mut ReconcileContext<'_>) -> Transition;

    /// Status patch written when entering the state, if any.
    fn status(&self, operation: LastOperationType) -> Option<Value>;
}

/// Executes states until one completes.
pub(crate) async fn run_to_completion(
    initial: impl State,
    ctx: &mut ReconcileContext<'_>,
) -> anyhow::Result<bool> {
    let mut state: Box<dyn State> = Box::new(initial);
    loop {
        debug!(controlplane = %ctx.key(), state = ?state, "Entering state");
        if let Some(status) = state.status(ctx.operation) {
            ctx.actuator.report(&ctx.namespace, &ctx.name, status).await;
        }
        match state.next(ctx).await {
            Transition::Next(next) => {
                trace!(controlplane = %ctx.key(), next = ?next, "Transitioning");
                state = next;
            }
            Transition::Complete(result) => return result,
        }
    }
}

fn complete_with(err: anyhow::Error) -> Transition {
    Transition::Complete(Err(err))
}

#[derive(Debug)]
pub(crate) struct DeploySecrets;

#[derive(Debug)]
pub(crate) struct ApplyConfigChart;

#[derive(Debug)]
pub(crate) struct ComputeChecksums;

#[derive(Debug)]
pub(crate) struct CheckHibernation;

#[derive(Debug)]
pub(crate) struct WaitingForHibernation;

#[derive(Debug)]
pub(crate) struct WaitingForWakeUp;

#[derive(Debug)]
pub(crate) struct ApplyControlPlaneChart;

#[derive(Debug)]
pub(crate) struct ApplyShootChart;

#[derive(Debug)]
pub(crate) struct ApplyStorageClasses;

#[derive(Debug)]
pub(crate) struct Succeeded;

impl TransitionTo<ApplyConfigChart> for DeploySecrets {}
impl TransitionTo<ComputeChecksums> for ApplyConfigChart {}
impl TransitionTo<CheckHibernation> for ComputeChecksums {}
impl TransitionTo<WaitingForHibernation> for CheckHibernation {}
impl TransitionTo<WaitingForWakeUp> for CheckHibernation {}
impl TransitionTo<ApplyControlPlaneChart> for CheckHibernation {}
impl TransitionTo<ApplyShootChart> for ApplyControlPlaneChart {}
impl TransitionTo<ApplyStorageClasses> for ApplyShootChart {}
impl TransitionTo<Succeeded> for ApplyStorageClasses {}

#[async_trait::async_trait]
impl State for DeploySecrets {
    async fn next(self: Box<Self>, ctx: &mut ReconcileContext<'_>) -> Transition {
        match ctx.actuator.secrets.deploy(&ctx.namespace).await {
            Ok(secrets) => {
                ctx.secrets = secrets;
                Transition::next(self, ApplyConfigChart)
            }
            Err(e) => complete_with(e.context(format!(
                "could not deploy secrets for controlplane '{}'",
                ctx.key()
            ))),
        }
    }

    fn status(&self, operation: LastOperationType) -> Option<Value> {
        Some(status::processing(operation, 10, "Deploying secrets"))
    }
}

#[async_trait::async_trait]
impl State for ApplyConfigChart {
    async fn next(self: Box<Self>, ctx: &mut ReconcileContext<'_>) -> Transition {
        let chart = match &ctx.actuator.charts.config {
            Some(chart) => chart,
            None => return Transition::next(self, ComputeChecksums),
        };
        let result = async {
            let values = ctx
                .actuator
                .values
                .config_chart_values(ctx.cp, ctx.cluster)
                .await?;
            ctx.actuator.apply_chart(chart, &ctx.namespace, values, ctx.cluster).await
        }
        .await;
        match result {
            Ok(()) => Transition::next(self, ComputeChecksums),
            Err(e) => complete_with(e.context(format!(
                "could not apply config chart for controlplane '{}'",
                ctx.key()
            ))),
        }
    }

    fn status(&self, operation: LastOperationType) -> Option<Value> {
        Some(status::processing(operation, 20, "Applying config chart"))
    }
}

#[async_trait::async_trait]
impl State for ComputeChecksums {
    async fn next(self: Box<Self>, ctx: &mut ReconcileContext<'_>) -> Transition {
        let client = ctx.actuator.client.as_ref();
        let secret_ref = &ctx.cp.spec.secret_ref;
        let secret_namespace = secret_ref.namespace.as_deref().unwrap_or(&ctx.namespace);
        let credentials = match client.get_secret(secret_namespace, &secret_ref.name).await {
            Ok(Some(secret)) => secret,
            Ok(None) => {
                return complete_with(
                    anyhow::Error::new(crate::error::Error::NotFound {
                        kind: "Secret".to_owned(),
                        name: format!("{}/{}", secret_namespace, secret_ref.name),
                    })
                    .context(format!(
                        "could not get cloud provider secret for controlplane '{}'",
                        ctx.key()
                    )),
                )
            }
            Err(e) => {
                return complete_with(e.context(format!(
                    "could not get cloud provider secret for controlplane '{}'",
                    ctx.key()
                )))
            }
        };

        let mut config_maps = Vec::new();
        if let Some(name) = &ctx.actuator.charts.cloud_provider_config_name {
            match client.get_config_map(&ctx.namespace, name).await {
                Ok(Some(config_map)) => config_maps.push(config_map),
                Ok(None) => debug!(%name, "Cloud provider config not found, skipping checksum"),
                Err(e) => {
                    return complete_with(e.context(format!(
                        "could not get cloud provider config '{}/{}'",
                        ctx.namespace, name
                    )))
                }
            }
        }

        ctx.checksums = compute_checksums(
            ctx.secrets.values().chain(std::iter::once(&credentials)),
            config_maps.iter(),
        );
        trace!(checksums = ?ctx.checksums, "Computed checksums");
        Transition::next(self, CheckHibernation)
    }

    fn status(&self, operation: LastOperationType) -> Option<Value> {
        Some(status::processing(operation, 30, "Computing checksums"))
    }
}

#[async_trait::async_trait]
impl State for CheckHibernation {
    async fn next(self: Box<Self>, ctx: &mut ReconcileContext<'_>) -> Transition {
        if !ctx.cluster.is_hibernation_enabled() {
            return Transition::next(self, ApplyControlPlaneChart);
        }
        let replicas = match ctx.actuator.kube_apiserver_replicas(&ctx.namespace).await {
            Ok(replicas) => replicas,
            Err(e) => {
                return complete_with(e.context(format!(
                    "could not get deployment '{}/{}'",
                    ctx.namespace, KUBE_APISERVER_DEPLOYMENT_NAME
                )))
            }
        };
        if ctx.cluster.is_being_deleted() {
            if replicas == 0 {
                return Transition::next(self, WaitingForWakeUp);
            }
            return Transition::next(self, ApplyControlPlaneChart);
        }
        if replicas > 0 {
            return Transition::next(self, WaitingForHibernation);
        }
        ctx.scaled_down = true;
        Transition::next(self, ApplyControlPlaneChart)
    }

    fn status(&self, _operation: LastOperationType) -> Option<Value> {
        None
    }
}

#[async_trait::async_trait]
impl State for WaitingForHibernation {
    async fn next(self: Box<Self>, ctx: &mut ReconcileContext<'_>) -> Transition {
        info!(controlplane = %ctx.key(), "Waiting for kube-apiserver to be scaled down");
        Transition::Complete(Ok(true))
    }

    fn status(&self, operation: LastOperationType) -> Option<Value> {
        Some(status::pending(
            operation,
            40,
            "Waiting for kube-apiserver to be scaled down",
        ))
    }
}

#[async_trait::async_trait]
impl State for WaitingForWakeUp {
    async fn next(self: Box<Self>, ctx: &mut ReconcileContext<'_>) -> Transition {
        info!(controlplane = %ctx.key(), "Waiting for kube-apiserver to be woken up");
        Transition::Complete(Ok(true))
    }

    fn status(&self, operation: LastOperationType) -> Option<Value> {
        Some(status::pending(
            operation,
            40,
            "Waiting for kube-apiserver to be woken up",
        ))
    }
}

#[async_trait::async_trait]
impl State for ApplyControlPlaneChart {
    async fn next(self: Box<Self>, ctx: &mut ReconcileContext<'_>) -> Transition {
        let result = async {
            let values = ctx
                .actuator
                .values
                .control_plane_chart_values(ctx.cp, ctx.cluster, &ctx.checksums, ctx.scaled_down)
                .await?;
            ctx.actuator
                .apply_chart(&ctx.actuator.charts.control_plane, &ctx.namespace, values, ctx.cluster)
                .await
        }
        .await;
        match result {
            Ok(()) => Transition::next(self, ApplyShootChart),
            Err(e) => complete_with(e.context(format!(
                "could not apply control plane chart for controlplane '{}'",
                ctx.key()
            ))),
        }
    }

    fn status(&self, operation: LastOperationType) -> Option<Value> {
        Some(status::processing(operation, 50, "Applying control plane chart"))
    }
}

#[async_trait::async_trait]
impl State for ApplyShootChart {
    async fn next(self: Box<Self>, ctx: &mut ReconcileContext<'_>) -> Transition {
        let chart = match &ctx.actuator.charts.shoot {
            Some(chart) => chart,
            None => return Transition::next(self, ApplyStorageClasses),
        };
        let result = async {
            let values = ctx
                .actuator
                .values
                .control_plane_shoot_chart_values(ctx.cp, ctx.cluster)
                .await?;
            let rendered = ctx.actuator.render_chart(chart, &ctx.namespace, values, ctx.cluster).await?;
            managedresources::create_for_shoot(
                ctx.actuator.client.as_ref(),
                &ctx.namespace,
                SHOOT_CHART_RESOURCE_NAME,
                rendered.secret_data(),
            )
            .await
        }
        .await;
        match result {
            Ok(()) => Transition::next(self, ApplyStorageClasses),
            Err(e) => complete_with(e.context(format!(
                "could not apply control plane shoot chart for controlplane '{}'",
                ctx.key()
            ))),
        }
    }

    fn status(&self, operation: LastOperationType) -> Option<Value> {
        Some(status::processing(operation, 70, "Applying control plane shoot chart"))
    }
}

#[async_trait::async_trait]
impl State for ApplyStorageClasses {
    async fn next(self: Box<Self>, ctx: &mut ReconcileContext<'_>) -> Transition {
        let chart = match &ctx.actuator.charts.storage_classes {
            Some(chart) => chart,
            None => return Transition::next(self, Succeeded),
        };
        let result = async {
            let values = ctx
                .actuator
                .values
                .storage_class_chart_values(ctx.cp, ctx.cluster)
                .await?;
            let rendered = ctx.actuator.render_chart(chart, &ctx.namespace, values, ctx.cluster).await?;
            managedresources::create(
                ctx.actuator.client.as_ref(),
                &ctx.namespace,
                STORAGE_CLASSES_CHART_RESOURCE_NAME,
                None,
                rendered.secret_data(),
                false,
                BTreeMap::new(),
            )
            .await
        }
        .await;
        match result {
            Ok(()) => Transition::next(self, Succeeded),
            Err(e) => complete_with(e.context(format!(
                "could not apply storage classes chart for controlplane '{}'",
                ctx.key()
            ))),
        }
    }

    fn status(&self, operation: LastOperationType) -> Option<Value> {
        Some(status::processing(operation, 90, "Applying storage classes"))
    }
}

#[async_trait::async_trait]
impl State for Succeeded {
    async fn next(self: Box<Self>, ctx: &mut ReconcileContext<'_>) -> Transition {
        info!(controlplane = %ctx.key(), "Reconciled control plane");
        Transition::Complete(Ok(false))
    }

    fn status(&self, _operation: LastOperationType) -> Option<Value> {
        None
    }
}
