use std::sync::Arc;

use extensions::chart::HelmRenderer;
use extensions::controlplane::{GenericActuator, PurposeActuator};
use extensions::secrets::CertificateSecretsDeployer;
use extensions::Config;
use gardener_extensions::Extension;
use provider_azure::controlplane::{charts, secrets, AzureValuesProvider, CA_NAME};
use provider_azure::webhook::AzureEnsurer;
use provider_azure::worker::AzureWorkerDelegate;
use provider_azure::PROVIDER_NAME;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    gardener_extensions::init_logging();
    let config = Config::new_from_flags(PROVIDER_NAME, env!("CARGO_PKG_VERSION"));
    let mut extension = Extension::new(config).await?;
    let seed = extension.seed();
    let images = extension.image_vector().await?;

    let actuator = GenericActuator::new(
        charts(&extension.config().charts_dir),
        Arc::new(AzureValuesProvider::new(seed.clone())),
        Arc::new(CertificateSecretsDeployer::new(seed.clone(), CA_NAME, secrets())),
        Arc::new(HelmRenderer::default()),
        seed.clone(),
        images,
    )
    .with_status_updater(extension.control_plane_status());
    // Azure has no control plane exposure.
    extension.add_control_plane_controller(Arc::new(PurposeActuator::new(Arc::new(actuator), None)));
    extension.add_worker_controller(Arc::new(AzureWorkerDelegate::new(seed.clone())));
    extension.add_webhook("/webhooks/controlplane", Arc::new(AzureEnsurer::new(seed)));

    extension.run().await
}
