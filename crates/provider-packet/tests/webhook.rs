use std::sync::Arc;

use extensions::apis::extensions::{
    File, FileContent, FileContentInline, OperatingSystemConfig, OperatingSystemConfigPurpose,
    OperatingSystemConfigSpec, Unit,
};
use extensions::testing::{cluster, FakeClusterReader};
use extensions::webhook::{
    decode_file_content, encode_file_content, GenericMutator, KubeletConfiguration, Mutator,
    SeedObject, KUBELET_CONFIG_PATH, KUBELET_SERVICE_UNIT,
};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use kube::api::ObjectMeta;
use provider_packet::webhook::PacketEnsurer;

const NAMESPACE: &str = "shoot--dev--packet";

const KUBELET_UNIT: &str = "[Unit]\nDescription=kubelet daemon\n[Service]\nExecStart=/opt/bin/hyperkube kubelet \\\n    --config=/var/lib/kubelet/config/kubelet\n";
const KUBELET_CONFIG: &str = "apiVersion: kubelet.config.k8s.io/v1beta1\nkind: KubeletConfiguration\nfeatureGates:\n  RotateKubeletServerCertificate: true\n";

fn mutator(version: &str) -> GenericMutator {
    let clusters = FakeClusterReader::new();
    clusters.add(cluster(NAMESPACE, version));
    GenericMutator::new(Arc::new(PacketEnsurer::new()), Arc::new(clusters))
}

fn osc() -> SeedObject {
    SeedObject::OperatingSystemConfig(OperatingSystemConfig::new(
        "osc-reconcile",
        OperatingSystemConfigSpec {
            type_: "coreos".to_owned(),
            purpose: OperatingSystemConfigPurpose::Reconcile,
            units: vec![Unit {
                name: KUBELET_SERVICE_UNIT.to_owned(),
                content: Some(KUBELET_UNIT.to_owned()),
                ..Default::default()
            }],
            files: vec![File {
                path: KUBELET_CONFIG_PATH.to_owned(),
                permissions: Some(0o644),
                content: FileContent {
                    inline: Some(FileContentInline {
                        encoding: "b64".to_owned(),
                        data: encode_file_content(KUBELET_CONFIG.as_bytes(), "b64").unwrap(),
                    }),
                    secret_ref: None,
                },
            }],
            provider_config: None,
        },
    ))
}

fn kubelet_configuration(object: &mut SeedObject) -> KubeletConfiguration {
    let config = match object {
        SeedObject::OperatingSystemConfig(config) => config,
        other => panic!("unexpected object {:?}", other),
    };
    let file = config.spec.file_mut(KUBELET_CONFIG_PATH).unwrap();
    let data = decode_file_content(file.content.inline.as_ref().unwrap()).unwrap();
    KubeletConfiguration::from_yaml(&data).unwrap()
}

#[tokio::test]
async fn kubelets_before_1_14_get_csi_registration_gates() {
    let mut object = osc();
    mutator("1.13.0").mutate(NAMESPACE, &mut object).await.unwrap();

    let config = kubelet_configuration(&mut object);
    assert_eq!(config.feature_gates.get("CSINodeInfo"), Some(&true));
    assert_eq!(config.feature_gates.get("CSIDriverRegistry"), Some(&true));
    assert!(!config.feature_gates.contains_key("ExpandCSIVolumes"));
    assert_eq!(config.feature_gates.get("RotateKubeletServerCertificate"), Some(&true));
}

#[tokio::test]
async fn kubelets_since_1_14_get_volume_expansion_gates() {
    let mut object = osc();
    mutator("1.14.0").mutate(NAMESPACE, &mut object).await.unwrap();

    let config = kubelet_configuration(&mut object);
    assert!(!config.feature_gates.contains_key("CSINodeInfo"));
    assert!(!config.feature_gates.contains_key("CSIDriverRegistry"));
    assert_eq!(config.feature_gates.get("ExpandCSIVolumes"), Some(&true));
    assert_eq!(config.feature_gates.get("ExpandInUsePersistentVolumes"), Some(&true));
}

#[tokio::test]
async fn kubelet_unit_uses_the_external_cloud_provider() {
    let mut object = osc();
    let mutator = mutator("1.14.0");
    mutator.mutate(NAMESPACE, &mut object).await.unwrap();
    let once = object.clone();
    mutator.mutate(NAMESPACE, &mut object).await.unwrap();
    assert_eq!(object, once);

    let config = match &mut object {
        SeedObject::OperatingSystemConfig(config) => config,
        other => panic!("unexpected object {:?}", other),
    };
    let unit = config.spec.unit_mut(KUBELET_SERVICE_UNIT).unwrap();
    let content = unit.content.as_deref().unwrap();
    assert!(content.contains("--cloud-provider=external"));
    assert!(content.contains("--enable-controller-attach-detach=true"));
    assert!(content.contains("--config=/var/lib/kubelet/config/kubelet"));
}

#[tokio::test]
async fn apiserver_flags_follow_the_cluster_version() {
    let mut object = SeedObject::Deployment(Deployment {
        metadata: ObjectMeta {
            name: Some("kube-apiserver".to_owned()),
            namespace: Some(NAMESPACE.to_owned()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            template: PodTemplateSpec {
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "kube-apiserver".to_owned(),
                        command: Some(vec![
                            "/hyperkube".to_owned(),
                            "apiserver".to_owned(),
                            "--feature-gates=PodPriority=true".to_owned(),
                        ]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }),
        ..Default::default()
    });
    mutator("1.13.4").mutate(NAMESPACE, &mut object).await.unwrap();

    let deployment = match object {
        SeedObject::Deployment(deployment) => deployment,
        other => panic!("unexpected object {:?}", other),
    };
    let command = deployment.spec.unwrap().template.spec.unwrap().containers[0]
        .command
        .clone()
        .unwrap();
    assert_eq!(
        command[2],
        "--feature-gates=PodPriority=true,CSINodeInfo=true,CSIDriverRegistry=true"
    );
    assert!(command.contains(&"--allow-privileged=true".to_owned()));
}

#[tokio::test]
async fn unknown_clusters_fail_the_mutation() {
    let mut object = osc();
    let err = mutator("1.14.0")
        .mutate("shoot--other--cluster", &mut object)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("shoot--other--cluster"));
}
