//! Configuration for an extension process
//!
//! The best way to configure an extension is by using [`Config::default_config`]
//! or by turning on the "cli" feature and using [`Config::new_from_flags`].

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

#[cfg(feature = "cli")]
use structopt::StructOpt;

use crate::controller::ControllerConfig;

const DEFAULT_PORT: u16 = 8443;
const DEFAULT_API_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CHARTS_DIR: &str = "charts";
const DEFAULT_IMAGE_VECTOR_FILE: &str = "charts/images.yaml";

/// Environment variable naming a file whose entries overwrite the image vector.
pub const IMAGE_VECTOR_OVERWRITE_ENV: &str = "IMAGEVECTOR_OVERWRITE";

/// The configuration needed for an extension to run properly.
///
/// This can be configured manually in your code or if you are exposing a CLI, use the
/// [`Config::new_from_flags`] (this requires the "cli" feature to
/// be enabled).
#[derive(Clone, Debug)]
pub struct Config {
    /// The provider type the extension serves, e.g. `azure`
    pub provider: String,
    /// Settings shared by all controllers of the process
    pub controller: ControllerConfig,
    /// Upper bound of a single API round-trip
    pub api_timeout: Duration,
    /// The admission webhook server configuration
    pub webhook: WebhookConfig,
    /// Directory containing the provider's charts
    pub charts_dir: PathBuf,
    /// YAML file holding the image vector
    pub image_vector_file: PathBuf,
    /// Optional file whose entries replace those of the image vector
    pub image_vector_overwrite: Option<PathBuf>,
}

/// The configuration for the admission webhook server.
#[derive(Clone, Debug)]
pub struct WebhookConfig {
    /// The ip address the webhook server is listening on
    pub addr: IpAddr,
    /// The port the webhook server is listening on
    pub port: u16,
    /// Path to the server's TLS certificate.
    pub cert_file: PathBuf,
    /// Path to the server's TLS private key.
    pub private_key_file: PathBuf,
}

impl Config {
    /// Returns a Config for `provider` with all of the defaults set.
    pub fn default_config(provider: &str) -> Self {
        Config {
            provider: provider.to_owned(),
            controller: ControllerConfig::default(),
            api_timeout: Duration::from_secs(DEFAULT_API_TIMEOUT_SECS),
            webhook: WebhookConfig {
                addr: IpAddr::from([0, 0, 0, 0]),
                port: DEFAULT_PORT,
                cert_file: default_cert_path(),
                private_key_file: default_key_path(),
            },
            charts_dir: PathBuf::from(DEFAULT_CHARTS_DIR),
            image_vector_file: PathBuf::from(DEFAULT_IMAGE_VECTOR_FILE),
            image_vector_overwrite: std::env::var_os(IMAGE_VECTOR_OVERWRITE_ENV)
                .map(PathBuf::from),
        }
    }

    /// Parses all command line flags and sets the proper defaults. The version
    /// of your application should be passed to set the proper version for the CLI
    #[cfg(any(feature = "cli", feature = "docs"))]
    #[cfg_attr(feature = "docs", doc(cfg(feature = "cli")))]
    pub fn new_from_flags(provider: &str, version: &str) -> Self {
        let app = Opts::clap().version(version);
        let opts = Opts::from_clap(&app.get_matches());
        opts.into_config(provider)
    }
}

/// CLI options that can be configured for an extension
///
/// These can be parsed from args using `Opts::from_args()`
#[derive(StructOpt, Clone, Debug)]
#[cfg(any(feature = "cli", feature = "docs"))]
#[cfg_attr(feature = "docs", doc(cfg(feature = "cli")))]
#[structopt(
    name = "gardener-extension",
    about = "A controller and admission webhook server for a cloud provider extension"
)]
pub struct Opts {
    #[structopt(
        long = "max-concurrent-reconciles",
        default_value = "5",
        env = "MAX_CONCURRENT_RECONCILES",
        help = "The maximum number of reconciles running at the same time per controller"
    )]
    max_concurrent_reconciles: usize,

    #[structopt(
        long = "ignore-operation-annotation",
        help = "Reconcile on every spec change instead of waiting for the gardener.cloud/operation annotation"
    )]
    ignore_operation_annotation: bool,

    #[structopt(
        long = "requeue-after",
        default_value = "30",
        env = "REQUEUE_AFTER_SECONDS",
        help = "Seconds to wait before reconciling an object that asked to be requeued"
    )]
    requeue_after: u64,

    #[structopt(
        long = "api-timeout",
        default_value = "30",
        env = "API_TIMEOUT_SECONDS",
        help = "Seconds a single API request may take"
    )]
    api_timeout: u64,

    #[structopt(
        short = "a",
        long = "webhook-addr",
        default_value = "0.0.0.0",
        env = "WEBHOOK_ADDRESS",
        help = "The address the admission webhook server should listen on"
    )]
    addr: IpAddr,

    #[structopt(
        short = "p",
        long = "webhook-port",
        default_value = "8443",
        env = "WEBHOOK_PORT",
        help = "The port the admission webhook server should listen on"
    )]
    port: u16,

    #[structopt(
        long = "tls-cert-file",
        env = "TLS_CERT_FILE",
        help = "The path to the webhook TLS certificate. Defaults to /etc/gardener-extension/tls/tls.crt"
    )]
    tls_cert_file: Option<PathBuf>,

    #[structopt(
        long = "tls-private-key-file",
        env = "TLS_PRIVATE_KEY_FILE",
        help = "The path to the webhook TLS key. Defaults to /etc/gardener-extension/tls/tls.key"
    )]
    tls_private_key_file: Option<PathBuf>,

    #[structopt(
        long = "charts-dir",
        default_value = DEFAULT_CHARTS_DIR,
        env = "CHARTS_DIR",
        help = "The directory containing the provider's charts"
    )]
    charts_dir: PathBuf,

    #[structopt(
        long = "image-vector",
        default_value = DEFAULT_IMAGE_VECTOR_FILE,
        env = "IMAGEVECTOR",
        help = "The path to the image vector file"
    )]
    image_vector_file: PathBuf,

    #[structopt(
        long = "image-vector-overwrite",
        env = IMAGE_VECTOR_OVERWRITE_ENV,
        help = "The path to a file whose images replace those of the image vector"
    )]
    image_vector_overwrite: Option<PathBuf>,
}

#[cfg(any(feature = "cli", feature = "docs"))]
impl Opts {
    fn into_config(self, provider: &str) -> Config {
        let defaults = ControllerConfig::default();
        Config {
            provider: provider.to_owned(),
            controller: ControllerConfig {
                max_concurrent_reconciles: self.max_concurrent_reconciles.max(1),
                ignore_operation_annotation: self.ignore_operation_annotation,
                requeue_after: Duration::from_secs(self.requeue_after),
                ..defaults
            },
            api_timeout: Duration::from_secs(self.api_timeout),
            webhook: WebhookConfig {
                addr: self.addr,
                port: self.port,
                cert_file: self.tls_cert_file.unwrap_or_else(default_cert_path),
                private_key_file: self.tls_private_key_file.unwrap_or_else(default_key_path),
            },
            charts_dir: self.charts_dir,
            image_vector_file: self.image_vector_file,
            image_vector_overwrite: self.image_vector_overwrite,
        }
    }
}

fn default_cert_path() -> PathBuf {
    PathBuf::from("/etc/gardener-extension/tls/tls.crt")
}

fn default_key_path() -> PathBuf {
    PathBuf::from("/etc/gardener-extension/tls/tls.key")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_follow_the_controller_contract() {
        let config = Config::default_config("azure");
        assert_eq!(config.provider, "azure");
        assert_eq!(config.controller.max_concurrent_reconciles, 5);
        assert!(!config.controller.ignore_operation_annotation);
        assert_eq!(config.controller.requeue_after, Duration::from_secs(30));
        assert_eq!(config.controller.backoff_base, Duration::from_secs(5));
        assert_eq!(config.controller.backoff_cap, Duration::from_secs(16 * 60));
        assert_eq!(config.api_timeout, Duration::from_secs(30));
        assert_eq!(config.webhook.port, 8443);
        assert_eq!(config.webhook.addr, IpAddr::from([0, 0, 0, 0]));
    }

    #[cfg(feature = "cli")]
    #[test]
    fn flags_override_defaults() {
        let opts = Opts::from_iter(&[
            "gardener-extension",
            "--max-concurrent-reconciles",
            "0",
            "--webhook-port",
            "9443",
            "--ignore-operation-annotation",
        ]);
        let config = opts.into_config("packet");
        assert_eq!(config.controller.max_concurrent_reconciles, 1);
        assert!(config.controller.ignore_operation_annotation);
        assert_eq!(config.webhook.port, 9443);
        assert_eq!(
            config.webhook.cert_file,
            PathBuf::from("/etc/gardener-extension/tls/tls.crt")
        );
    }
}
