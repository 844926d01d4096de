//! SHA-256 checksums over canonical JSON payloads.
//!
//! Checksums end up in pod template annotations (`checksum/secret-<name>`,
//! `checksum/configmap-<name>`) so that a change of any input triggers a
//! rolling update of the consuming workload. They must therefore be stable
//! across process restarts and independent of map insertion order, which is
//! why payloads are serialized through [`canonical_json`] rather than relying
//! on the map implementation `serde_json` happens to be compiled with.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::ByteString;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Prefix of checksum annotations for secrets.
pub const SECRET_ANNOTATION_PREFIX: &str = "checksum/secret-";
/// Prefix of checksum annotations for config maps.
pub const CONFIG_MAP_ANNOTATION_PREFIX: &str = "checksum/configmap-";

/// Writes `value` as JSON with object keys sorted and without whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Serializing a string cannot fail.
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Hex encoded SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Computes the checksum of an arbitrary serializable payload.
pub fn compute_checksum<T: Serialize>(payload: &T) -> anyhow::Result<String> {
    let value = serde_json::to_value(payload)?;
    Ok(sha256_hex(canonical_json(&value).as_bytes()))
}

/// Computes the checksum of secret data.
pub fn compute_secret_checksum(data: &BTreeMap<String, ByteString>) -> String {
    let value = Value::Object(
        data.iter()
            .map(|(k, v)| (k.clone(), Value::String(base64::encode(&v.0))))
            .collect(),
    );
    sha256_hex(canonical_json(&value).as_bytes())
}

/// Computes the checksum of config map data.
pub fn compute_config_map_checksum(data: &BTreeMap<String, String>) -> String {
    let value = Value::Object(
        data.iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    );
    sha256_hex(canonical_json(&value).as_bytes())
}

/// Checksums keyed by object name.
pub type Checksums = BTreeMap<String, String>;

/// Computes checksums for the given secrets and config maps, keyed by name.
pub fn compute_checksums<'a>(
    secrets: impl IntoIterator<Item = &'a Secret>,
    config_maps: impl IntoIterator<Item = &'a ConfigMap>,
) -> Checksums {
    let mut checksums = Checksums::new();
    for secret in secrets {
        if let Some(name) = &secret.metadata.name {
            let data = secret.data.clone().unwrap_or_default();
            checksums.insert(name.clone(), compute_secret_checksum(&data));
        }
    }
    for config_map in config_maps {
        if let Some(name) = &config_map.metadata.name {
            let data = config_map.data.clone().unwrap_or_default();
            checksums.insert(name.clone(), compute_config_map_checksum(&data));
        }
    }
    checksums
}

/// Sets `checksum/secret-<name>` to the given checksum.
pub fn ensure_secret_checksum_annotation(
    annotations: &mut BTreeMap<String, String>,
    name: &str,
    checksum: &str,
) {
    annotations.insert(
        format!("{}{}", SECRET_ANNOTATION_PREFIX, name),
        checksum.to_owned(),
    );
}

/// Sets `checksum/configmap-<name>` to the given checksum.
pub fn ensure_config_map_checksum_annotation(
    annotations: &mut BTreeMap<String, String>,
    name: &str,
    checksum: &str,
) {
    annotations.insert(
        format!("{}{}", CONFIG_MAP_ANNOTATION_PREFIX, name),
        checksum.to_owned(),
    );
}

/// Builds the `checksum/secret-<name>` annotations for the given secret names.
/// Names without a computed checksum are skipped.
pub fn secret_checksum_annotations(checksums: &Checksums, names: &[&str]) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();
    for name in names {
        if let Some(checksum) = checksums.get(*name) {
            ensure_secret_checksum_annotation(&mut annotations, name, checksum);
        }
    }
    annotations
}
