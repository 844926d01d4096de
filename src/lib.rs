//! Process wiring shared by the extension binaries.
//!
//! An [`Extension`] owns the seed client and a cancellation token. Binaries
//! register the controllers and admission webhooks of their provider and then
//! [`run`](Extension::run) until the process receives ctrl-c.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use extensions::apis::extensions::{ControlPlane, Worker};
use extensions::client::KubeSeedClient;
use extensions::controller::Controller;
use extensions::controlplane::{self, ControlPlaneReconciler};
use extensions::imagevector::ImageVector;
use extensions::status::KubeStatusUpdater;
use extensions::webhook::{self, Ensurer, GenericMutator, Mutator};
use extensions::worker::{self, WorkerDelegate, WorkerReconciler};
use extensions::Config;
use kube::api::{Api, ListParams};
use kube::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Installs a fmt subscriber filtered by `RUST_LOG`.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

/// A running extension process.
pub struct Extension {
    config: Config,
    client: Client,
    seed: Arc<KubeSeedClient>,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    mutators: BTreeMap<String, Arc<dyn Mutator>>,
}

impl Extension {
    /// Connects to the seed, first through a kubeconfig and then through the
    /// in-cluster configuration.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let client = Client::try_default()
            .await
            .context("could not create kubernetes client")?;
        let seed = Arc::new(KubeSeedClient::new(client.clone(), config.api_timeout));
        info!(provider = %config.provider, "Connected to seed");
        Ok(Extension {
            config,
            client,
            seed,
            token: CancellationToken::new(),
            tasks: Vec::new(),
            mutators: BTreeMap::new(),
        })
    }

    /// The process configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The seed client, which also reads clusters.
    pub fn seed(&self) -> Arc<KubeSeedClient> {
        Arc::clone(&self.seed)
    }

    /// Reads the configured image vector and its overwrite.
    pub async fn image_vector(&self) -> anyhow::Result<Arc<ImageVector>> {
        let images = ImageVector::read(
            &self.config.image_vector_file,
            self.config.image_vector_overwrite.as_deref(),
        )
        .await?;
        Ok(Arc::new(images))
    }

    /// Status updater for control planes.
    pub fn control_plane_status(&self) -> Arc<KubeStatusUpdater> {
        Arc::new(KubeStatusUpdater::for_kind::<ControlPlane>(
            self.client.clone(),
            self.config.api_timeout,
        ))
    }

    fn finalizer(&self) -> String {
        format!("extensions.gardener.cloud/{}", self.config.provider)
    }

    /// Starts a controller for control planes of this provider.
    pub fn add_control_plane_controller(&mut self, actuator: Arc<dyn controlplane::Actuator>) {
        let reconciler = ControlPlaneReconciler::new(actuator, self.seed());
        let controller = Controller::new(
            Arc::new(reconciler),
            self.control_plane_status(),
            &self.finalizer(),
            self.config.controller.clone(),
        )
        .for_type(&self.config.provider);
        let api: Api<ControlPlane> = Api::all(self.client.clone());
        let token = self.token.clone();
        self.tasks.push(tokio::spawn(
            Arc::new(controller).run(api, ListParams::default(), token),
        ));
    }

    /// Starts a controller for workers of this provider.
    pub fn add_worker_controller(&mut self, delegate: Arc<dyn WorkerDelegate>) {
        let status = Arc::new(KubeStatusUpdater::for_kind::<Worker>(
            self.client.clone(),
            self.config.api_timeout,
        ));
        let actuator = worker::GenericActuator::new(delegate, self.seed(), status.clone());
        let reconciler = WorkerReconciler::new(actuator, self.seed());
        let controller = Controller::new(
            Arc::new(reconciler),
            status,
            &self.finalizer(),
            self.config.controller.clone(),
        )
        .for_type(&self.config.provider);
        let api: Api<Worker> = Api::all(self.client.clone());
        let token = self.token.clone();
        self.tasks.push(tokio::spawn(
            Arc::new(controller).run(api, ListParams::default(), token),
        ));
    }

    /// Serves `ensurer` on the admission path `path`, e.g.
    /// `/webhooks/controlplane`.
    pub fn add_webhook(&mut self, path: &str, ensurer: Arc<dyn Ensurer>) {
        let mutator = GenericMutator::new(ensurer, self.seed());
        self.mutators.insert(path.to_owned(), Arc::new(mutator));
    }

    /// Runs until ctrl-c, then cancels all controllers and the webhook server
    /// and waits for them to stop.
    pub async fn run(mut self) -> anyhow::Result<()> {
        if !self.mutators.is_empty() {
            let webhook = &self.config.webhook;
            let addr = SocketAddr::new(webhook.addr, webhook.port);
            self.tasks.push(tokio::spawn(webhook::serve(
                addr,
                webhook.cert_file.clone(),
                webhook.private_key_file.clone(),
                std::mem::take(&mut self.mutators),
                self.token.clone(),
            )));
        }

        tokio::signal::ctrl_c()
            .await
            .context("could not listen for ctrl-c")?;
        info!("Received ctrl-c, shutting down");
        self.token.cancel();
        for result in futures::future::join_all(self.tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Task did not stop cleanly");
            }
        }
        Ok(())
    }
}
