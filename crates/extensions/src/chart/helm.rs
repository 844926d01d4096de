use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

use super::{ChartRenderer, Manifest, RenderedChart};

const SOURCE_PREFIX: &str = "# Source: ";

/// Renders charts by running `helm template`.
#[derive(Clone, Debug)]
pub struct HelmRenderer {
    binary: PathBuf,
}

impl Default for HelmRenderer {
    fn default() -> Self {
        HelmRenderer {
            binary: PathBuf::from("helm"),
        }
    }
}

impl HelmRenderer {
    /// Creates a renderer using the given helm binary.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        HelmRenderer {
            binary: binary.into(),
        }
    }
}

#[async_trait::async_trait]
impl ChartRenderer for HelmRenderer {
    async fn render(
        &self,
        path: &Path,
        release: &str,
        namespace: &str,
        values: &Value,
    ) -> anyhow::Result<RenderedChart> {
        let values = serde_yaml::to_string(values)?;
        trace!(%release, %values, "Chart values");

        let mut child = Command::new(&self.binary)
            .arg("template")
            .arg(release)
            .arg(path)
            .arg("--namespace")
            .arg(namespace)
            .arg("--values")
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("could not run {}: {}", self.binary.display(), e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(values.as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            anyhow::bail!(
                "helm template {} failed: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let rendered = split_manifests(&String::from_utf8(output.stdout)?);
        debug!(%release, manifests = rendered.manifests.len(), "Rendered chart");
        Ok(rendered)
    }
}

/// Splits `helm template` output into files using the `# Source:` comments
/// helm puts in front of every document. Documents from the same file are
/// joined again.
fn split_manifests(output: &str) -> RenderedChart {
    let mut manifests: Vec<Manifest> = Vec::new();
    for document in output.split("\n---") {
        let document = document.trim_start_matches("---").trim_matches('\n');
        let mut lines = document.lines();
        let name = match lines.next() {
            Some(first) if first.starts_with(SOURCE_PREFIX) => {
                first[SOURCE_PREFIX.len()..].trim().to_owned()
            }
            _ => continue,
        };
        let content: Vec<&str> = lines.collect();
        let content = content.join("\n");
        if content.trim().is_empty() {
            continue;
        }
        match manifests.iter_mut().find(|m| m.name == name) {
            Some(manifest) => {
                manifest.content.push_str("---\n");
                manifest.content.push_str(&content);
                manifest.content.push('\n');
            }
            None => manifests.push(Manifest {
                name,
                content: format!("{}\n", content),
            }),
        }
    }
    RenderedChart { manifests }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn output_is_split_by_source() {
        let output = "---\n# Source: cp/templates/cm.yaml\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\n# Source: cp/templates/deploy.yaml\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: b\n---\n# Source: cp/templates/cm.yaml\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: c\n---\n# Source: cp/templates/empty.yaml\n";
        let rendered = split_manifests(output);
        assert_eq!(rendered.manifests.len(), 2);
        assert_eq!(rendered.manifests[0].name, "cp/templates/cm.yaml");
        assert_eq!(rendered.objects().unwrap().len(), 3);
    }
}
