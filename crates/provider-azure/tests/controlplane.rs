use std::sync::Arc;

use extensions::apis::cluster::Hibernation;
use extensions::apis::extensions::{ControlPlane, ControlPlaneSpec, SecretReference};
use extensions::checksum::compute_secret_checksum;
use extensions::controlplane::{Actuator, GenericActuator};
use extensions::imagevector::ImageVector;
use extensions::testing::{cluster, FakeChartRenderer, FakeSecretsDeployer, FakeSeedClient};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use provider_azure::controlplane::{charts, AzureValuesProvider};
use serde_json::json;

const NAMESPACE: &str = "shoot--dev--test";

const IMAGES: &str = r#"
images:
- name: cloud-controller-manager
  repository: k8s.gcr.io/hyperkube
  tag: v1.13.5
"#;

fn credentials() -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some("cloudprovider".to_owned()),
            namespace: Some(NAMESPACE.to_owned()),
            ..Default::default()
        },
        data: Some(
            [
                ("clientID", "C"),
                ("clientSecret", "S"),
                ("subscriptionID", "Sub"),
                ("tenantID", "T"),
            ]
            .iter()
            .map(|(k, v)| ((*k).to_owned(), ByteString(v.as_bytes().to_vec())))
            .collect(),
        ),
        ..Default::default()
    }
}

fn control_plane() -> ControlPlane {
    let mut cp = ControlPlane::new(
        "control-plane",
        ControlPlaneSpec {
            type_: "azure".to_owned(),
            region: "westeurope".to_owned(),
            secret_ref: SecretReference {
                name: "cloudprovider".to_owned(),
                namespace: None,
            },
            purpose: None,
            provider_config: None,
            infrastructure_provider_status: Some(json!({
                "apiVersion": "azure.provider.extensions.gardener.cloud/v1alpha1",
                "kind": "InfrastructureStatus",
                "resourceGroup": {"name": "rg-abcd1234"},
                "networks": {
                    "vnet": {"name": "vnet-abcd1234"},
                    "subnets": [{"name": "subnet-abcd1234-nodes", "purpose": "nodes"}]
                },
                "routeTables": [{"purpose": "nodes", "name": "route-table-name"}],
                "securityGroups": [{"purpose": "nodes", "name": "security-group-name-workers"}],
                "zoned": true
            })),
        },
    );
    cp.metadata.namespace = Some(NAMESPACE.to_owned());
    cp
}

fn kube_apiserver(replicas: i32) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some("kube-apiserver".to_owned()),
            namespace: Some(NAMESPACE.to_owned()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn renderer() -> Arc<FakeChartRenderer> {
    let renderer = Arc::new(FakeChartRenderer::new());
    renderer.add_template_fn("cloud-provider-config", |values| {
        format!(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cloud-provider-config\ndata:\n  cloudprovider.conf: |\n    tenantId: {}\n    subnetName: {}\n",
            values["tenantId"].as_str().unwrap_or_default(),
            values["subnetName"].as_str().unwrap_or_default(),
        )
    });
    renderer.add_template_fn("seed-controlplane", |values| {
        let ccm = &values["cloud-controller-manager"];
        format!(
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: cloud-controller-manager\nspec:\n  replicas: {}\n  selector:\n    matchLabels:\n      app: cloud-controller-manager\n  template:\n    metadata:\n      annotations: {}\n",
            ccm["replicas"], ccm["podAnnotations"]
        )
    });
    renderer.add_template(
        "shoot-system-components",
        "apiVersion: v1\nkind: ServiceAccount\nmetadata:\n  name: cloud-node-manager\n  namespace: kube-system\n",
    );
    renderer
}

struct Fixture {
    client: Arc<FakeSeedClient>,
    renderer: Arc<FakeChartRenderer>,
    actuator: GenericActuator,
}

fn fixture() -> Fixture {
    let client = Arc::new(FakeSeedClient::new());
    client.insert(&credentials());
    let renderer = renderer();
    let actuator = GenericActuator::new(
        charts(std::path::Path::new("charts")),
        Arc::new(AzureValuesProvider::new(client.clone())),
        Arc::new(FakeSecretsDeployer::new(Vec::new())),
        renderer.clone(),
        client.clone(),
        Arc::new(ImageVector::from_yaml(IMAGES).unwrap()),
    );
    Fixture {
        client,
        renderer,
        actuator,
    }
}

#[tokio::test]
async fn fresh_reconcile_deploys_the_control_plane() {
    let f = fixture();
    let requeue = f
        .actuator
        .reconcile(&control_plane(), &cluster(NAMESPACE, "1.13.4"))
        .await
        .unwrap();
    assert!(!requeue);

    let config_map: ConfigMap = f
        .client
        .typed(NAMESPACE, "ConfigMap", "cloud-provider-config")
        .expect("cloud provider config should exist");
    let config = &config_map.data.unwrap()["cloudprovider.conf"];
    assert!(config.contains("tenantId: T"));
    assert!(config.contains("subnetName: subnet-abcd1234-nodes"));

    let expected = compute_secret_checksum(&credentials().data.unwrap());
    let deployment = f
        .client
        .deployment(NAMESPACE, "cloud-controller-manager")
        .expect("cloud controller manager should exist");
    let annotations = deployment
        .spec
        .unwrap()
        .template
        .metadata
        .unwrap()
        .annotations
        .unwrap();
    assert_eq!(annotations["checksum/secret-cloudprovider"], expected);
    assert!(annotations.contains_key("checksum/configmap-cloud-provider-config"));

    assert!(f
        .client
        .object(NAMESPACE, "ManagedResource", "extension-controlplane-shoot")
        .is_some());

    let values = f.renderer.last_values("seed-controlplane").unwrap();
    assert_eq!(
        values["images"]["cloud-controller-manager"],
        "k8s.gcr.io/hyperkube:v1.13.5"
    );
    assert_eq!(values["cloud-controller-manager"]["clusterName"], NAMESPACE);
}

#[tokio::test]
async fn hibernation_pauses_before_the_control_plane_chart() {
    let f = fixture();
    f.client.insert(&kube_apiserver(2));
    let mut cluster = cluster(NAMESPACE, "1.13.4");
    cluster.shoot.spec.hibernation = Some(Hibernation {
        enabled: Some(true),
    });

    let requeue = f.actuator.reconcile(&control_plane(), &cluster).await.unwrap();
    assert!(requeue);
    assert!(!f.client.was_applied("Deployment", "cloud-controller-manager"));
    assert_eq!(f.renderer.renders("seed-controlplane"), 0);
}

#[tokio::test]
async fn hibernated_control_plane_is_scaled_down() {
    let f = fixture();
    f.client.insert(&kube_apiserver(0));
    let mut cluster = cluster(NAMESPACE, "1.13.4");
    cluster.shoot.spec.hibernation = Some(Hibernation {
        enabled: Some(true),
    });

    let requeue = f.actuator.reconcile(&control_plane(), &cluster).await.unwrap();
    assert!(!requeue);
    let deployment = f
        .client
        .deployment(NAMESPACE, "cloud-controller-manager")
        .unwrap();
    assert_eq!(deployment.spec.unwrap().replicas, Some(0));
}

#[tokio::test]
async fn missing_infrastructure_status_fails() {
    let f = fixture();
    let mut cp = control_plane();
    cp.spec.infrastructure_provider_status = None;
    let err = f
        .actuator
        .reconcile(&cp, &cluster(NAMESPACE, "1.13.4"))
        .await
        .unwrap_err();
    assert!(err
        .chain()
        .any(|cause| matches!(
            cause.downcast_ref::<extensions::Error>(),
            Some(extensions::Error::InfrastructureStatusMissing(_))
        )));
}
