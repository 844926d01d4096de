//! Chart descriptors and their application to the seed.
//!
//! A chart is applied with a set of values and deleted by the objects it
//! declares. Deleting by declaration instead of by rendering keeps teardown
//! correct when templates change between versions.

mod helm;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use k8s_openapi::ByteString;
use kube::core::DynamicObject;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::client::SeedClient;
use crate::error::{is_not_found, Error};
use crate::imagevector::ImageVector;

pub use helm::HelmRenderer;

/// An object a chart creates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectRef {
    /// API version, e.g. `apps/v1`.
    pub api_version: String,
    /// Kind, e.g. `Deployment`.
    pub kind: String,
    /// Name.
    pub name: String,
}

impl ObjectRef {
    /// Creates a reference.
    pub fn new(api_version: &str, kind: &str, name: &str) -> Self {
        ObjectRef {
            api_version: api_version.to_owned(),
            kind: kind.to_owned(),
            name: name.to_owned(),
        }
    }
}

/// One rendered template file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Manifest {
    /// Path of the template within the chart, e.g. `templates/cm.yaml`.
    pub name: String,
    /// Rendered YAML, possibly holding several documents.
    pub content: String,
}

/// The output of rendering a chart.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RenderedChart {
    /// Rendered files, in rendering order.
    pub manifests: Vec<Manifest>,
}

impl RenderedChart {
    /// Parses all non-empty YAML documents into objects.
    pub fn objects(&self) -> anyhow::Result<Vec<DynamicObject>> {
        let mut objects = Vec::new();
        for manifest in &self.manifests {
            for document in serde_yaml::Deserializer::from_str(&manifest.content) {
                let value = serde_yaml::Value::deserialize(document)
                    .map_err(|e| anyhow::anyhow!("invalid YAML in {}: {}", manifest.name, e))?;
                if value.is_null() {
                    continue;
                }
                let object: DynamicObject = serde_yaml::from_value(value)
                    .map_err(|e| anyhow::anyhow!("invalid object in {}: {}", manifest.name, e))?;
                objects.push(object);
            }
        }
        Ok(objects)
    }

    /// Secret data holding each non-empty manifest, keyed by its file name with
    /// path separators replaced. Used for managed resources.
    pub fn secret_data(&self) -> BTreeMap<String, ByteString> {
        self.manifests
            .iter()
            .filter(|m| !m.content.trim().is_empty())
            .map(|m| {
                (
                    m.name.replace('/', "_"),
                    ByteString(m.content.clone().into_bytes()),
                )
            })
            .collect()
    }
}

/// Renders charts. The template engine itself is external.
#[async_trait::async_trait]
pub trait ChartRenderer: Send + Sync {
    /// Renders the chart at `path` as release `release` into `namespace`.
    async fn render(
        &self,
        path: &Path,
        release: &str,
        namespace: &str,
        values: &Value,
    ) -> anyhow::Result<RenderedChart>;
}

/// A chart together with the objects it declares and the images it needs.
#[derive(Clone, Debug, PartialEq)]
pub struct Chart {
    /// Release name.
    pub name: String,
    /// Directory of the chart.
    pub path: PathBuf,
    /// Objects created by the chart, deleted on teardown.
    pub objects: Vec<ObjectRef>,
    /// Images injected into the `images` value.
    pub images: Vec<String>,
}

impl Chart {
    /// Creates a chart without declared objects or images.
    pub fn new(name: &str, path: impl Into<PathBuf>) -> Self {
        Chart {
            name: name.to_owned(),
            path: path.into(),
            objects: Vec::new(),
            images: Vec::new(),
        }
    }

    /// Declares an object created by the chart.
    pub fn with_object(mut self, api_version: &str, kind: &str, name: &str) -> Self {
        self.objects.push(ObjectRef::new(api_version, kind, name));
        self
    }

    /// Declares an image needed by the chart.
    pub fn with_image(mut self, image: &str) -> Self {
        self.images.push(image.to_owned());
        self
    }

    /// Renders the chart after injecting the required images into `values`.
    pub async fn render(
        &self,
        renderer: &dyn ChartRenderer,
        images: &ImageVector,
        namespace: &str,
        values: Value,
        runtime_version: Option<&str>,
        target_version: Option<&str>,
    ) -> anyhow::Result<RenderedChart> {
        let values = self.inject_images(images, values, runtime_version, target_version)?;
        debug!(chart = %self.name, %namespace, "Rendering chart");
        renderer
            .render(&self.path, &self.name, namespace, &values)
            .await
    }

    /// Renders the chart and applies all resulting objects to `namespace`.
    pub async fn apply(
        &self,
        renderer: &dyn ChartRenderer,
        client: &dyn SeedClient,
        images: &ImageVector,
        namespace: &str,
        values: Value,
        runtime_version: Option<&str>,
        target_version: Option<&str>,
    ) -> anyhow::Result<()> {
        let rendered = self
            .render(renderer, images, namespace, values, runtime_version, target_version)
            .await?;
        for mut object in rendered.objects()? {
            if object.metadata.namespace.is_none() {
                object.metadata.namespace = Some(namespace.to_owned());
            }
            client.apply(&object).await?;
        }
        info!(chart = %self.name, %namespace, "Applied chart");
        Ok(())
    }

    /// Deletes all declared objects from `namespace`. Missing objects and
    /// unknown kinds are skipped.
    pub async fn delete(&self, client: &dyn SeedClient, namespace: &str) -> anyhow::Result<()> {
        for object in &self.objects {
            match client
                .delete(Some(namespace), &object.api_version, &object.kind, &object.name)
                .await
            {
                Ok(()) => debug!(kind = %object.kind, name = %object.name, "Deleted chart object"),
                Err(e) if is_not_found(&e) => {
                    warn!(kind = %object.kind, name = %object.name, "Chart object already gone")
                }
                Err(e) => return Err(e),
            }
        }
        info!(chart = %self.name, %namespace, "Deleted chart");
        Ok(())
    }

    fn inject_images(
        &self,
        images: &ImageVector,
        values: Value,
        runtime_version: Option<&str>,
        target_version: Option<&str>,
    ) -> Result<Value, Error> {
        if self.images.is_empty() {
            return Ok(values);
        }
        let found = images.find_images(&self.images, runtime_version, target_version)?;
        let mut values = match values {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            _ => {
                return Err(Error::invalid(
                    "values",
                    "Invalid",
                    format!("values of chart {} must be an object", self.name),
                ))
            }
        };
        let entry = values
            .entry("images")
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if let Value::Object(map) = entry {
            for (name, reference) in found {
                map.insert(name, Value::String(reference));
            }
        }
        Ok(Value::Object(values))
    }
}

/// Charts keyed by name. Read-only after startup.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    charts: BTreeMap<String, Chart>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a chart under its name, replacing any previous one.
    pub fn register(&mut self, chart: Chart) -> &mut Self {
        self.charts.insert(chart.name.clone(), chart);
        self
    }

    /// Looks up a chart.
    pub fn get(&self, name: &str) -> Result<&Chart, Error> {
        self.charts.get(name).ok_or_else(|| Error::NotFound {
            kind: "Chart".to_owned(),
            name: name.to_owned(),
        })
    }

    /// The objects declared by the chart called `name`.
    pub fn declared_objects(&self, name: &str) -> Result<&[ObjectRef], Error> {
        Ok(&self.get(name)?.objects)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{FakeChartRenderer, FakeSeedClient};
    use serde_json::json;

    fn images() -> ImageVector {
        ImageVector::from_yaml(
            "images:\n- name: cloud-controller-manager\n  repository: repo/ccm\n  tag: v1\n",
        )
        .unwrap()
    }

    #[test]
    fn rendered_charts_split_documents() {
        let rendered = RenderedChart {
            manifests: vec![Manifest {
                name: "seed-controlplane/templates/ccm.yaml".into(),
                content: "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\n---\napiVersion: v1\nkind: Secret\nmetadata:\n  name: b\n".into(),
            }],
        };
        let objects = rendered.objects().unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[1].metadata.name.as_deref(), Some("b"));
        assert!(rendered
            .secret_data()
            .contains_key("seed-controlplane_templates_ccm.yaml"));
    }

    #[tokio::test]
    async fn apply_injects_images_and_defaults_namespace() -> anyhow::Result<()> {
        let renderer = FakeChartRenderer::new();
        renderer.add_template(
            "seed-controlplane",
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: cloud-controller-manager\n",
        );
        let client = FakeSeedClient::new();
        let chart = Chart::new("seed-controlplane", "charts/seed-controlplane")
            .with_object("apps/v1", "Deployment", "cloud-controller-manager")
            .with_image("cloud-controller-manager");

        chart
            .apply(&renderer, &client, &images(), "shoot--a--b", json!({"replicas": 1}), None, Some("1.14.0"))
            .await?;

        let values = renderer.last_values("seed-controlplane").unwrap();
        assert_eq!(values["images"]["cloud-controller-manager"], "repo/ccm:v1");
        assert_eq!(values["replicas"], 1);
        assert!(client
            .object("shoot--a--b", "Deployment", "cloud-controller-manager")
            .is_some());
        Ok(())
    }

    #[tokio::test]
    async fn delete_tolerates_missing_objects() -> anyhow::Result<()> {
        let client = FakeSeedClient::new();
        let chart = Chart::new("seed-controlplane", "charts/seed-controlplane")
            .with_object("apps/v1", "Deployment", "cloud-controller-manager")
            .with_object("v1", "Service", "cloud-controller-manager");
        chart.delete(&client, "shoot--a--b").await?;
        assert_eq!(client.deletions().len(), 2);
        Ok(())
    }

    #[test]
    fn registry_lookups() {
        let mut registry = Registry::new();
        registry.register(Chart::new("shoot-storageclasses", "charts/shoot-storageclasses"));
        assert!(registry.get("shoot-storageclasses").is_ok());
        assert!(registry.declared_objects("missing").is_err());
    }
}
