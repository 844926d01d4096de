use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The kubelet configuration file. Only the fields providers touch are typed;
/// everything else is carried along unchanged.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeletConfiguration {
    /// API version, e.g. `kubelet.config.k8s.io/v1beta1`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    /// Kind, `KubeletConfiguration`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    /// Feature gates.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub feature_gates: BTreeMap<String, bool>,
    /// Whether the attach/detach controller manages volumes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_controller_attach_detach: Option<bool>,
    /// All other fields.
    #[serde(flatten)]
    pub rest: BTreeMap<String, serde_yaml::Value>,
}

impl KubeletConfiguration {
    /// Parses YAML.
    pub fn from_yaml(yaml: &[u8]) -> serde_yaml::Result<Self> {
        serde_yaml::from_slice(yaml)
    }

    /// Renders YAML.
    pub fn to_yaml(&self) -> serde_yaml::Result<String> {
        serde_yaml::to_string(self)
    }

    /// Sets a feature gate.
    pub fn set_feature_gate(&mut self, name: &str, enabled: bool) {
        self.feature_gates.insert(name.to_owned(), enabled);
    }

    /// Removes a feature gate.
    pub fn remove_feature_gate(&mut self, name: &str) {
        self.feature_gates.remove(name);
    }
}
