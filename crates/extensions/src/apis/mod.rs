//! Custom resource types observed and written by extensions.
//!
//! Provider specific configuration travels as opaque JSON (`providerConfig`,
//! `infrastructureProviderStatus`, ...). Those blobs stay `serde_json::Value`
//! here and are decoded into typed structs by the provider crates, see
//! [`decode_provider_config`].

pub mod cluster;
pub mod extensions;
pub mod resources;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::Error;

/// Decodes an opaque provider blob into `T`. `field` names the location of the
/// blob for error messages.
pub fn decode_provider_config<T: DeserializeOwned>(field: &str, blob: &Value) -> Result<T, Error> {
    serde_json::from_value(blob.clone())
        .map_err(|e| Error::invalid(field, "Invalid", format!("could not decode provider config: {}", e)))
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(serde::Deserialize, Debug)]
    struct Blob {
        zoned: bool,
    }

    #[test]
    fn decode_reports_the_field() {
        let blob: Blob = decode_provider_config("spec.providerConfig", &serde_json::json!({"zoned": true})).unwrap();
        assert!(blob.zoned);

        let err = decode_provider_config::<Blob>("spec.providerConfig", &serde_json::json!({"zoned": "no"}))
            .unwrap_err();
        assert!(matches!(err, Error::Invalid { ref field, .. } if field == "spec.providerConfig"));
    }
}
