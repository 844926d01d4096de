use std::sync::Arc;

use extensions::Config;
use gardener_extensions::Extension;
use provider_alicloud::exposure::ExposureEnsurer;
use provider_alicloud::webhook::AlicloudEnsurer;
use provider_alicloud::PROVIDER_NAME;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    gardener_extensions::init_logging();
    let config = Config::new_from_flags(PROVIDER_NAME, env!("CARGO_PKG_VERSION"));
    let mut extension = Extension::new(config).await?;
    let seed = extension.seed();
    let images = extension.image_vector().await?;

    extension.add_webhook("/webhooks/controlplane", Arc::new(AlicloudEnsurer::new()));
    extension.add_webhook(
        "/webhooks/controlplaneexposure",
        Arc::new(ExposureEnsurer::new(seed, images)),
    );
    extension.run().await
}
