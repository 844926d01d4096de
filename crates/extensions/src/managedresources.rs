//! Managed resources: object bundles stored in a secret that a separate
//! controller applies to the tenant cluster.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::Resource;
use tracing::{debug, info, warn};

use crate::apis::resources::{LocalSecretReference, ManagedResource, ManagedResourceSpec};
use crate::client::{to_dynamic, SeedClient};
use crate::error::is_not_found;

/// Label that keeps tenant side garbage collection away from the objects.
pub const NO_CLEANUP_LABEL: &str = "shoot.gardener.cloud/no-cleanup";

/// Creates or updates a secret holding `data` and a managed resource called
/// `name` that references it.
pub async fn create(
    client: &dyn SeedClient,
    namespace: &str,
    name: &str,
    class: Option<&str>,
    data: BTreeMap<String, ByteString>,
    keep_objects: bool,
    inject_labels: BTreeMap<String, String>,
) -> anyhow::Result<()> {
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(namespace.to_owned()),
            ..Default::default()
        },
        data: Some(data),
        type_: Some("Opaque".to_owned()),
        ..Default::default()
    };
    client.apply(&to_dynamic(&secret)?).await?;

    let mut resource = ManagedResource::new(
        name,
        ManagedResourceSpec {
            class: class.map(str::to_owned),
            secret_refs: vec![LocalSecretReference {
                name: name.to_owned(),
            }],
            inject_labels,
            keep_objects: Some(keep_objects),
        },
    );
    resource.meta_mut().namespace = Some(namespace.to_owned());
    client.apply(&to_dynamic(&resource)?).await?;
    info!(%name, %namespace, "Applied managed resource");
    Ok(())
}

/// Creates a managed resource for the tenant cluster whose objects survive
/// tenant side garbage collection.
pub async fn create_for_shoot(
    client: &dyn SeedClient,
    namespace: &str,
    name: &str,
    data: BTreeMap<String, ByteString>,
) -> anyhow::Result<()> {
    let mut labels = BTreeMap::new();
    labels.insert(NO_CLEANUP_LABEL.to_owned(), "true".to_owned());
    create(client, namespace, name, None, data, false, labels).await
}

/// Deletes the managed resource and its secret. Missing objects are ignored.
pub async fn delete(client: &dyn SeedClient, namespace: &str, name: &str) -> anyhow::Result<()> {
    let api_version = ManagedResource::api_version(&());
    let targets = [
        (api_version.as_ref(), "ManagedResource"),
        ("v1", "Secret"),
    ];
    for (api_version, kind) in targets {
        match client.delete(Some(namespace), api_version, kind, name).await {
            Ok(()) => debug!(%kind, %name, %namespace, "Deleted"),
            Err(e) if is_not_found(&e) => warn!(%kind, %name, %namespace, "Already gone"),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
