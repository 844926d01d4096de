//! The image vector: which container image to use for which component,
//! depending on the seed (runtime) and shoot (target) kubernetes versions.
//!
//! ```yaml
//! images:
//! - name: cloud-controller-manager
//!   repository: k8s.gcr.io/hyperkube
//!   targetVersion: "1.13.x"
//!   tag: v1.13.5
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Error;
use crate::version;

/// One entry of the image vector.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageSource {
    /// Logical image name.
    pub name: String,
    /// Repository, possibly including a registry host.
    pub repository: String,
    /// Tag or `sha256:` digest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Constraint on the seed's kubernetes version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_version: Option<String>,
    /// Constraint on the shoot's kubernetes version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_version: Option<String>,
}

/// A resolved image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Image {
    /// Logical image name.
    pub name: String,
    /// Repository.
    pub repository: String,
    /// Tag or digest.
    pub tag: Option<String>,
}

impl Image {
    /// The pullable reference, `repository:tag` or `repository@sha256:...`.
    pub fn reference(&self) -> String {
        match &self.tag {
            None => self.repository.clone(),
            Some(tag) if tag.starts_with("sha256:") => format!("{}@{}", self.repository, tag),
            Some(tag) => format!("{}:{}", self.repository, tag),
        }
    }
}

#[derive(Deserialize, Serialize)]
struct ImageVectorFile {
    #[serde(default)]
    images: Vec<ImageSource>,
}

/// The ordered list of image sources. Read-only after startup.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ImageVector(Vec<ImageSource>);

impl ImageVector {
    /// Creates an image vector from entries.
    pub fn new(images: Vec<ImageSource>) -> Self {
        ImageVector(images)
    }

    /// Parses the YAML representation.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let file: ImageVectorFile = serde_yaml::from_str(yaml)?;
        Ok(ImageVector(file.images))
    }

    /// Reads the image vector at `path` and applies the entries of
    /// `overwrite`, if given.
    pub async fn read(path: impl AsRef<Path>, overwrite: Option<&Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            anyhow::anyhow!("could not read image vector {}: {}", path.display(), e)
        })?;
        let mut vector = Self::from_yaml(&content)?;
        if let Some(overwrite) = overwrite {
            info!(file = %overwrite.display(), "Applying image vector overwrite");
            let content = tokio::fs::read_to_string(overwrite).await.map_err(|e| {
                anyhow::anyhow!("could not read image vector overwrite {}: {}", overwrite.display(), e)
            })?;
            vector = vector.with_overwrite(Self::from_yaml(&content)?);
        }
        Ok(vector)
    }

    /// Replaces entries that match an entry of `overwrite` in name and version
    /// constraints and appends all others.
    pub fn with_overwrite(mut self, overwrite: ImageVector) -> Self {
        for source in overwrite.0 {
            let existing = self.0.iter_mut().find(|s| {
                s.name == source.name
                    && s.runtime_version == source.runtime_version
                    && s.target_version == source.target_version
            });
            match existing {
                Some(entry) => *entry = source,
                None => self.0.push(source),
            }
        }
        self
    }

    /// Finds the image called `name` whose constraints match the given
    /// versions. The first matching entry wins. Entries without a constraint
    /// match any version.
    pub fn find_image(
        &self,
        name: &str,
        runtime_version: Option<&str>,
        target_version: Option<&str>,
    ) -> Result<Image, Error> {
        for source in self.0.iter().filter(|s| s.name == name) {
            if !constraint_matches(source.runtime_version.as_deref(), runtime_version)? {
                continue;
            }
            if !constraint_matches(source.target_version.as_deref(), target_version)? {
                continue;
            }
            debug!(%name, repository = %source.repository, tag = ?source.tag, "Found image");
            return Ok(Image {
                name: source.name.clone(),
                repository: source.repository.clone(),
                tag: source.tag.clone(),
            });
        }
        Err(Error::NotFound {
            kind: "Image".to_owned(),
            name: name.to_owned(),
        })
    }

    /// Finds all `names` and returns their references keyed by name.
    pub fn find_images(
        &self,
        names: &[String],
        runtime_version: Option<&str>,
        target_version: Option<&str>,
    ) -> Result<BTreeMap<String, String>, Error> {
        names
            .iter()
            .map(|name| {
                self.find_image(name, runtime_version, target_version)
                    .map(|image| (name.clone(), image.reference()))
            })
            .collect()
    }
}

fn constraint_matches(constraint: Option<&str>, version: Option<&str>) -> Result<bool, Error> {
    match (constraint, version) {
        (Some(constraint), Some(version)) => version::matches(constraint, version),
        _ => Ok(true),
    }
}
