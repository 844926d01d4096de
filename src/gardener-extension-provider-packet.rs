use std::sync::Arc;

use extensions::Config;
use gardener_extensions::Extension;
use provider_packet::webhook::PacketEnsurer;
use provider_packet::PROVIDER_NAME;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    gardener_extensions::init_logging();
    let config = Config::new_from_flags(PROVIDER_NAME, env!("CARGO_PKG_VERSION"));
    let mut extension = Extension::new(config).await?;
    extension.add_webhook("/webhooks/controlplane", Arc::new(PacketEnsurer::new()));
    extension.run().await
}
