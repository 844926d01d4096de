use std::sync::Arc;

use extensions::apis::extensions::Worker;
use extensions::testing::{cluster, FakeSeedClient};
use extensions::worker::WorkerDelegate;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use provider_azure::worker::AzureWorkerDelegate;
use serde_json::{json, Value};

const NAMESPACE: &str = "shoot--foobar--azure";

fn client() -> Arc<FakeSeedClient> {
    let client = Arc::new(FakeSeedClient::new());
    client.insert(&Secret {
        metadata: ObjectMeta {
            name: Some("cloudprovider".to_owned()),
            namespace: Some(NAMESPACE.to_owned()),
            ..Default::default()
        },
        data: Some(
            [
                ("clientID", "client-id"),
                ("clientSecret", "client-secret"),
                ("subscriptionID", "subscription-id"),
                ("tenantID", "tenant-id"),
            ]
            .iter()
            .map(|(k, v)| ((*k).to_owned(), ByteString(v.as_bytes().to_vec())))
            .collect(),
        ),
        ..Default::default()
    });
    client
}

fn worker(zoned: bool, machine_type: &str) -> Worker {
    let mut infra = json!({
        "resourceGroup": {"name": "rg-1234"},
        "networks": {
            "vnet": {"name": "vnet-1234"},
            "subnets": [{"name": "subnet-1234", "purpose": "nodes"}]
        },
        "zoned": zoned
    });
    if !zoned {
        infra["availabilitySets"] = json!([{"purpose": "nodes", "id": "as-1234", "name": "as-name"}]);
    }
    serde_json::from_value(json!({
        "apiVersion": "extensions.gardener.cloud/v1alpha1",
        "kind": "Worker",
        "metadata": {"name": "worker", "namespace": NAMESPACE},
        "spec": {
            "type": "azure",
            "region": "westeurope",
            "secretRef": {"name": "cloudprovider"},
            "infrastructureProviderStatus": infra,
            "sshPublicKey": "ssh-rsa AAAA",
            "pools": [{
                "name": "pool-1",
                "machineType": machine_type,
                "machineImage": {"name": "ubuntu", "version": "18.04"},
                "minimum": 5,
                "maximum": 10,
                "maxSurge": 3,
                "maxUnavailable": 2,
                "userData": base64::encode("some-user-data"),
                "volume": {"size": "20Gi"},
                "zones": ["1", "2"]
            }]
        }
    }))
    .unwrap()
}

fn cluster_with_images() -> extensions::apis::cluster::ClusterContext {
    let mut cluster = cluster(NAMESPACE, "1.2.3");
    cluster.cloud_profile.spec.provider_config = Some(json!({
        "machineImages": [{
            "name": "ubuntu",
            "versions": [{"version": "18.04", "urn": "Canonical:UbuntuServer:18.04-LTS:latest"}]
        }]
    }));
    cluster
}

#[tokio::test]
async fn machine_classes_are_generated_for_pools() {
    let delegate = AzureWorkerDelegate::new(client());
    let config = delegate
        .generate_machine_config(&worker(false, "large"), &cluster_with_images())
        .await
        .unwrap();

    assert_eq!(config.classes.len(), 1);
    assert_eq!(config.deployments.len(), 1);
    let class = &config.classes[0];
    let deployment = &config.deployments[0];

    let class_name = class["name"].as_str().unwrap();
    let prefix = format!("{}-pool-1-", NAMESPACE);
    assert!(class_name.starts_with(&prefix));
    let hash = &class_name[prefix.len()..];
    assert_eq!(hash.len(), 5);
    assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));

    assert_eq!(deployment.name, format!("{}-pool-1", NAMESPACE));
    assert_eq!(deployment.class_name, class_name);
    assert_eq!(deployment.secret_name, class_name);
    assert_eq!(deployment.minimum, 5);
    assert_eq!(deployment.maximum, 10);
    assert_eq!(deployment.max_surge, IntOrString::Int(3));
    assert_eq!(deployment.max_unavailable, IntOrString::Int(2));

    assert_eq!(class["availabilitySetID"], "as-1234");
    assert_eq!(class["subnetName"], "subnet-1234");
    assert_eq!(class["machineType"], "large");
    assert_eq!(class["volumeSize"], 21_474_836_480u64);
    assert_eq!(class["image"]["urn"], "Canonical:UbuntuServer:18.04-LTS:latest");
    assert_eq!(class["secret"]["userData"], "some-user-data");
    assert_eq!(class["secret"]["azureClientId"], "client-id");

    let status = config.provider_status.unwrap();
    assert_eq!(status["machineImages"][0]["urn"], "Canonical:UbuntuServer:18.04-LTS:latest");
}

#[tokio::test]
async fn class_names_are_reproducible() {
    let delegate = AzureWorkerDelegate::new(client());
    let name = |config: extensions::worker::MachineConfig| -> Value { config.classes[0]["name"].clone() };

    let first = delegate
        .generate_machine_config(&worker(false, "large"), &cluster_with_images())
        .await
        .unwrap();
    let second = delegate
        .generate_machine_config(&worker(false, "large"), &cluster_with_images())
        .await
        .unwrap();
    assert_eq!(name(first.clone()), name(second));

    let other = delegate
        .generate_machine_config(&worker(false, "xlarge"), &cluster_with_images())
        .await
        .unwrap();
    assert_ne!(name(first), name(other));
}

#[tokio::test]
async fn zoned_clusters_get_one_deployment_per_zone() {
    let delegate = AzureWorkerDelegate::new(client());
    let config = delegate
        .generate_machine_config(&worker(true, "large"), &cluster_with_images())
        .await
        .unwrap();

    let names: Vec<&str> = config.deployments.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "shoot--foobar--azure-pool-1-z1",
            "shoot--foobar--azure-pool-1-z2"
        ]
    );
    assert_eq!(config.deployments[0].minimum, 3);
    assert_eq!(config.deployments[1].minimum, 2);
    assert_eq!(config.deployments[0].maximum, 5);
    assert_eq!(config.deployments[0].max_surge, IntOrString::Int(2));
    assert_eq!(config.classes[1]["zone"], "2");
    assert!(config.classes[0].get("availabilitySetID").is_none());
}

#[tokio::test]
async fn images_pinned_in_the_status_survive_profile_changes() {
    let delegate = AzureWorkerDelegate::new(client());
    let mut pinned = worker(false, "large");
    pinned.status = Some(serde_json::from_value(json!({
        "providerStatus": {
            "machineImages": [{"name": "ubuntu", "version": "18.04", "urn": "Canonical:UbuntuServer:18.04-LTS:pinned"}]
        }
    }))
    .unwrap());

    let config = delegate
        .generate_machine_config(&pinned, &cluster(NAMESPACE, "1.2.3"))
        .await
        .unwrap();
    assert_eq!(config.classes[0]["image"]["urn"], "Canonical:UbuntuServer:18.04-LTS:pinned");

    let err = delegate
        .generate_machine_config(&worker(false, "large"), &cluster(NAMESPACE, "1.2.3"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("ubuntu/18.04"));
}

#[tokio::test]
async fn zoned_pools_without_zones_are_rejected() {
    let delegate = AzureWorkerDelegate::new(client());
    let mut worker = worker(true, "large");
    worker.spec.pools[0].zones.clear();

    let err = delegate
        .generate_machine_config(&worker, &cluster_with_images())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("has no zones"));
    assert!(matches!(
        err.downcast_ref::<extensions::error::Error>(),
        Some(extensions::error::Error::Invalid { .. })
    ));
}
