//! Mutation of operating system configs.
//!
//! Embedded content is only rewritten when an ensurer changed it, and always
//! with the encoding the file declared, so that running the pipeline on its
//! own output is a no-op.

use tracing::{debug, trace};

use super::kubelet::KubeletConfiguration;
use super::{Ensurer, EnsurerContext};
use crate::apis::extensions::{File, FileContent, FileContentInline, OperatingSystemConfig};
use crate::error::Error;
use crate::unit;

/// Name of the kubelet unit.
pub const KUBELET_SERVICE_UNIT: &str = "kubelet.service";
/// Path of the kubelet configuration.
pub const KUBELET_CONFIG_PATH: &str = "/var/lib/kubelet/config/kubelet";
/// Path of the general kernel settings.
pub const KUBERNETES_GENERAL_CONFIG_PATH: &str = "/etc/sysctl.d/99-k8s-general.conf";
/// Path of the kubelet's cloud provider config.
pub const CLOUD_PROVIDER_CONFIG_PATH: &str = "/var/lib/kubelet/cloudprovider.conf";

const ENCODING_BASE64: &str = "b64";
const CLOUD_PROVIDER_CONFIG_PERMISSIONS: i32 = 0o644;

/// Decodes inline file content according to its encoding.
pub fn decode_file_content(inline: &FileContentInline) -> Result<Vec<u8>, Error> {
    match inline.encoding.as_str() {
        "" => Ok(inline.data.clone().into_bytes()),
        ENCODING_BASE64 => base64::decode(&inline.data)
            .map_err(|e| Error::invalid("content.inline.data", "Invalid", e.to_string())),
        other => Err(Error::invalid(
            "content.inline.encoding",
            "NotSupported",
            format!("unsupported encoding {:?}", other),
        )),
    }
}

/// Encodes file content with `encoding`.
pub fn encode_file_content(data: &[u8], encoding: &str) -> Result<String, Error> {
    match encoding {
        "" => String::from_utf8(data.to_vec())
            .map_err(|e| Error::invalid("content.inline.data", "Invalid", e.to_string())),
        ENCODING_BASE64 => Ok(base64::encode(data)),
        other => Err(Error::invalid(
            "content.inline.encoding",
            "NotSupported",
            format!("unsupported encoding {:?}", other),
        )),
    }
}

fn inline_text(file: &File) -> Result<Option<String>, Error> {
    match &file.content.inline {
        Some(inline) => {
            let data = decode_file_content(inline)?;
            let text = String::from_utf8(data)
                .map_err(|e| Error::invalid(format!("files[{}]", file.path), "Invalid", e.to_string()))?;
            Ok(Some(text))
        }
        None => Ok(None),
    }
}

fn replace_inline_text(file: &mut File, text: &str) -> Result<(), Error> {
    if let Some(inline) = &mut file.content.inline {
        inline.data = encode_file_content(text.as_bytes(), &inline.encoding)?;
    }
    Ok(())
}

pub(crate) async fn mutate_operating_system_config(
    ensurer: &dyn Ensurer,
    ctx: &EnsurerContext,
    osc: &mut OperatingSystemConfig,
) -> anyhow::Result<()> {
    if let Some(unit) = osc.spec.unit_mut(KUBELET_SERVICE_UNIT) {
        if let Some(content) = unit.content.as_ref().filter(|c| !c.is_empty()) {
            let options = unit::deserialize(content)?;
            let ensured = ensurer
                .ensure_kubelet_service_unit_options(ctx, options.clone())
                .await?;
            if ensured != options {
                debug!(unit = KUBELET_SERVICE_UNIT, "Rewriting unit");
                unit.content = Some(unit::serialize(&ensured));
            }
        }
    }

    if let Some(file) = osc.spec.file_mut(KUBELET_CONFIG_PATH) {
        if let Some(inline) = &file.content.inline {
            let data = decode_file_content(inline)?;
            let config = KubeletConfiguration::from_yaml(&data)?;
            let mut ensured = config.clone();
            ensurer.ensure_kubelet_configuration(ctx, &mut ensured).await?;
            if ensured != config {
                debug!(path = KUBELET_CONFIG_PATH, "Rewriting kubelet configuration");
                replace_inline_text(file, &ensured.to_yaml()?)?;
            }
        }
    }

    if let Some(file) = osc.spec.file_mut(KUBERNETES_GENERAL_CONFIG_PATH) {
        if let Some(text) = inline_text(file)? {
            let mut ensured = text.clone();
            ensurer
                .ensure_kubernetes_general_configuration(ctx, &mut ensured)
                .await?;
            if ensured != text {
                debug!(path = KUBERNETES_GENERAL_CONFIG_PATH, "Rewriting general configuration");
                replace_inline_text(file, &ensured)?;
            }
        }
    }

    ensurer.ensure_additional_units(ctx, &mut osc.spec.units).await?;
    ensurer.ensure_additional_files(ctx, &mut osc.spec.files).await?;

    let mut cloud_provider_config = String::new();
    ensurer
        .ensure_kubelet_cloud_provider_config(ctx, &mut cloud_provider_config)
        .await?;
    if !cloud_provider_config.is_empty() {
        trace!(content = %cloud_provider_config, "Kubelet cloud provider config");
        ensure_cloud_provider_config_file(&mut osc.spec.files, &cloud_provider_config)?;
    }
    Ok(())
}

fn ensure_cloud_provider_config_file(files: &mut Vec<File>, content: &str) -> Result<(), Error> {
    let encoding = files
        .iter()
        .find(|f| f.path == CLOUD_PROVIDER_CONFIG_PATH)
        .and_then(|f| f.content.inline.as_ref())
        .map(|inline| inline.encoding.clone())
        .unwrap_or_else(|| ENCODING_BASE64.to_owned());
    let file = File {
        path: CLOUD_PROVIDER_CONFIG_PATH.to_owned(),
        permissions: Some(CLOUD_PROVIDER_CONFIG_PERMISSIONS),
        content: FileContent {
            inline: Some(FileContentInline {
                data: encode_file_content(content.as_bytes(), &encoding)?,
                encoding,
            }),
            secret_ref: None,
        },
    };
    match files.iter_mut().find(|f| f.path == CLOUD_PROVIDER_CONFIG_PATH) {
        Some(existing) => *existing = file,
        None => files.push(file),
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::apis::extensions::{OperatingSystemConfigPurpose, OperatingSystemConfigSpec, Unit};
    use crate::testing::FakeClusterReader;
    use crate::unit::UnitOption;
    use std::sync::Arc;

    const KUBELET_UNIT: &str = "[Unit]\nDescription=kubelet daemon\n[Service]\nExecStart=/opt/bin/hyperkube kubelet \\\n    --config=/var/lib/kubelet/config/kubelet\n";
    const KUBELET_CONFIG: &str = "apiVersion: kubelet.config.k8s.io/v1beta1\nkind: KubeletConfiguration\nfeatureGates:\n  RotateKubeletServerCertificate: true\n";

    struct Noop;

    impl Ensurer for Noop {}

    struct Azure;

    #[async_trait::async_trait]
    impl Ensurer for Azure {
        async fn ensure_kubelet_service_unit_options(
            &self,
            _: &EnsurerContext,
            mut options: Vec<UnitOption>,
        ) -> anyhow::Result<Vec<UnitOption>> {
            if let Some(option) = options.iter_mut().find(|o| o.name == "ExecStart") {
                let mut command = unit::deserialize_command_line(&option.value);
                crate::merge::ensure_string_with_prefix(&mut command, "--cloud-provider=", "azure");
                option.value = unit::serialize_command_line(&command, 2, " \\\n    ");
            }
            Ok(options)
        }

        async fn ensure_kubelet_configuration(
            &self,
            _: &EnsurerContext,
            config: &mut KubeletConfiguration,
        ) -> anyhow::Result<()> {
            config.enable_controller_attach_detach = Some(true);
            Ok(())
        }

        async fn ensure_kubernetes_general_configuration(
            &self,
            _: &EnsurerContext,
            content: &mut String,
        ) -> anyhow::Result<()> {
            if !content.contains("net.ipv4.neigh.default.gc_thresh1") {
                content.push_str("net.ipv4.neigh.default.gc_thresh1 = 0\n");
            }
            Ok(())
        }

        async fn ensure_kubelet_cloud_provider_config(
            &self,
            _: &EnsurerContext,
            content: &mut String,
        ) -> anyhow::Result<()> {
            content.push_str("[Global]\nzoned = true\n");
            Ok(())
        }
    }

    fn inline_file(path: &str, text: &str, encoding: &str) -> File {
        File {
            path: path.to_owned(),
            permissions: Some(0o644),
            content: FileContent {
                inline: Some(FileContentInline {
                    encoding: encoding.to_owned(),
                    data: encode_file_content(text.as_bytes(), encoding).unwrap(),
                }),
                secret_ref: None,
            },
        }
    }

    fn osc(encoding: &str) -> OperatingSystemConfig {
        OperatingSystemConfig::new(
            "osc-reconcile",
            OperatingSystemConfigSpec {
                type_: "coreos".to_owned(),
                purpose: OperatingSystemConfigPurpose::Reconcile,
                units: vec![Unit {
                    name: KUBELET_SERVICE_UNIT.to_owned(),
                    content: Some(KUBELET_UNIT.to_owned()),
                    ..Default::default()
                }],
                files: vec![
                    inline_file(KUBELET_CONFIG_PATH, KUBELET_CONFIG, encoding),
                    inline_file(KUBERNETES_GENERAL_CONFIG_PATH, "# general\n", encoding),
                ],
                provider_config: None,
            },
        )
    }

    fn ctx() -> EnsurerContext {
        EnsurerContext::new("shoot--dev--test", Arc::new(FakeClusterReader::new()))
    }

    #[tokio::test]
    async fn noop_ensurer_preserves_content() -> anyhow::Result<()> {
        for encoding in ["", "b64"] {
            let original = osc(encoding);
            let mut mutated = original.clone();
            mutate_operating_system_config(&Noop, &ctx(), &mut mutated).await?;
            assert_eq!(mutated, original);
        }
        Ok(())
    }

    #[tokio::test]
    async fn ensurers_rewrite_with_declared_encoding() -> anyhow::Result<()> {
        let mut config = osc("b64");
        mutate_operating_system_config(&Azure, &ctx(), &mut config).await?;

        let unit = config.spec.unit_mut(KUBELET_SERVICE_UNIT).unwrap();
        assert!(unit.content.as_ref().unwrap().contains("--cloud-provider=azure"));

        let file = config.spec.file_mut(KUBELET_CONFIG_PATH).unwrap();
        let inline = file.content.inline.as_ref().unwrap();
        assert_eq!(inline.encoding, "b64");
        let kubelet = KubeletConfiguration::from_yaml(&decode_file_content(inline)?)?;
        assert_eq!(kubelet.enable_controller_attach_detach, Some(true));
        assert_eq!(kubelet.feature_gates["RotateKubeletServerCertificate"], true);

        let general = config.spec.file_mut(KUBERNETES_GENERAL_CONFIG_PATH).unwrap();
        let text = String::from_utf8(decode_file_content(general.content.inline.as_ref().unwrap())?)?;
        assert_eq!(text, "# general\nnet.ipv4.neigh.default.gc_thresh1 = 0\n");

        let cloud = config.spec.file_mut(CLOUD_PROVIDER_CONFIG_PATH).unwrap();
        assert_eq!(cloud.permissions, Some(0o644));
        let inline = cloud.content.inline.as_ref().unwrap();
        assert_eq!(inline.encoding, "b64");
        assert_eq!(decode_file_content(inline)?, b"[Global]\nzoned = true\n".to_vec());
        Ok(())
    }

    #[tokio::test]
    async fn mutation_is_idempotent() -> anyhow::Result<()> {
        let mut once = osc("");
        mutate_operating_system_config(&Azure, &ctx(), &mut once).await?;
        let mut twice = once.clone();
        mutate_operating_system_config(&Azure, &ctx(), &mut twice).await?;
        assert_eq!(once, twice);
        Ok(())
    }

    #[test]
    fn unknown_encodings_are_rejected() {
        let inline = FileContentInline {
            encoding: "gzip".to_owned(),
            data: String::new(),
        };
        assert!(decode_file_content(&inline).is_err());
    }
}
