//! Registration of admission webhooks with the seed's API server.

use std::collections::BTreeMap;

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
    WebhookClientConfig,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::ByteString;

/// Label carrying the provider type on shoot namespaces.
pub const SHOOT_PROVIDER_LABEL: &str = "shoot.gardener.cloud/provider";
/// Label carrying the provider type on the seed's namespaces.
pub const SEED_PROVIDER_LABEL: &str = "seed.gardener.cloud/provider";
/// Label carrying the backup provider type on shoot namespaces.
pub const BACKUP_PROVIDER_LABEL: &str = "backup.gardener.cloud/provider";

/// Which namespaces a webhook intercepts objects in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    /// Namespaces of shoots running on the provider.
    Shoot,
    /// Namespaces of a seed running on the provider.
    Seed,
    /// Namespaces of shoots backed up on the provider.
    Backup,
}

impl Target {
    fn label(self) -> &'static str {
        match self {
            Target::Shoot => SHOOT_PROVIDER_LABEL,
            Target::Seed => SEED_PROVIDER_LABEL,
            Target::Backup => BACKUP_PROVIDER_LABEL,
        }
    }
}

/// Selects the namespaces labelled for `provider`.
pub fn namespace_selector(target: Target, provider: &str) -> LabelSelector {
    let mut labels = BTreeMap::new();
    labels.insert(target.label().to_owned(), provider.to_owned());
    LabelSelector {
        match_labels: Some(labels),
        ..Default::default()
    }
}

/// A rule intercepting creations and updates of `resources`.
pub fn rule(group: &str, version: &str, resources: &[&str]) -> RuleWithOperations {
    RuleWithOperations {
        api_groups: Some(vec![group.to_owned()]),
        api_versions: Some(vec![version.to_owned()]),
        operations: Some(vec!["CREATE".to_owned(), "UPDATE".to_owned()]),
        resources: Some(resources.iter().map(|r| (*r).to_owned()).collect()),
        scope: None,
    }
}

/// One webhook served by the extension.
#[derive(Clone, Debug)]
pub struct Webhook {
    /// Short name, e.g. `controlplane`.
    pub name: String,
    /// Path the webhook is served on.
    pub path: String,
    /// Namespaces the webhook applies to.
    pub target: Target,
    /// Intercepted resources.
    pub rules: Vec<RuleWithOperations>,
}

/// How the API server reaches the webhook server.
#[derive(Clone, Debug)]
pub enum ClientConfig {
    /// A service in the seed.
    Service {
        /// Service name.
        name: String,
        /// Service namespace.
        namespace: String,
    },
    /// A URL, without the webhook path.
    Url(String),
}

/// Builds the configuration registering `webhooks` for `provider`.
pub fn mutating_webhook_configuration(
    extension: &str,
    provider: &str,
    webhooks: &[Webhook],
    client: &ClientConfig,
    ca_bundle: &[u8],
) -> MutatingWebhookConfiguration {
    let webhooks = webhooks
        .iter()
        .map(|webhook| {
            let client_config = match client {
                ClientConfig::Service { name, namespace } => WebhookClientConfig {
                    ca_bundle: Some(ByteString(ca_bundle.to_vec())),
                    service: Some(ServiceReference {
                        name: name.clone(),
                        namespace: namespace.clone(),
                        path: Some(webhook.path.clone()),
                        port: None,
                    }),
                    url: None,
                },
                ClientConfig::Url(url) => WebhookClientConfig {
                    ca_bundle: Some(ByteString(ca_bundle.to_vec())),
                    service: None,
                    url: Some(format!("{}{}", url.trim_end_matches('/'), webhook.path)),
                },
            };
            MutatingWebhook {
                name: format!("{}.{}.extensions.gardener.cloud", webhook.name, provider),
                admission_review_versions: vec!["v1beta1".to_owned(), "v1".to_owned()],
                client_config,
                failure_policy: Some("Fail".to_owned()),
                namespace_selector: Some(namespace_selector(webhook.target, provider)),
                rules: Some(webhook.rules.clone()),
                side_effects: "None".to_owned(),
                timeout_seconds: Some(10),
                ..Default::default()
            }
        })
        .collect();

    MutatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(extension.to_owned()),
            ..Default::default()
        },
        webhooks: Some(webhooks),
    }
}
