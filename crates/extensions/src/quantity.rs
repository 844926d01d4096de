//! Parsing of Kubernetes quantities that denote storage sizes, e.g. the
//! `volume.size` of a worker pool.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::error::Error;

// Decimal suffixes are powers of 1000, binary ones powers of 1024.
const SUFFIXES: &[(&str, f64, i32)] = &[
    ("", 1.0, 0),
    ("k", 1000.0, 1),
    ("K", 1000.0, 1),
    ("M", 1000.0, 2),
    ("G", 1000.0, 3),
    ("T", 1000.0, 4),
    ("P", 1000.0, 5),
    ("E", 1000.0, 6),
    ("Ki", 1024.0, 1),
    ("Mi", 1024.0, 2),
    ("Gi", 1024.0, 3),
    ("Ti", 1024.0, 4),
    ("Pi", 1024.0, 5),
    ("Ei", 1024.0, 6),
];

fn multiplier(suffix: &str) -> Option<f64> {
    SUFFIXES
        .iter()
        .find(|(name, _, _)| *name == suffix)
        .map(|(_, base, exponent)| base.powi(*exponent))
}

/// Converts a size quantity such as `20Gi` or `500M` to bytes.
pub fn parse_bytes(size: &str) -> Result<u64, Error> {
    let invalid = |detail: String| Error::invalid("volume.size", "Invalid", detail);

    let raw = size.trim();
    let split = raw
        .find(|c: char| c.is_ascii_alphabetic() && c != 'e')
        .unwrap_or_else(|| raw.len());
    let (number, suffix) = raw.split_at(split);
    let factor = multiplier(suffix)
        .ok_or_else(|| invalid(format!("unknown suffix in quantity {:?}", size)))?;
    let parsed: f64 = number
        .parse()
        .map_err(|e| invalid(format!("could not parse quantity {:?}: {}", size, e)))?;
    if parsed < 0.0 {
        return Err(invalid(format!("quantity {:?} must not be negative", size)));
    }
    Ok((parsed * factor) as u64)
}

/// Converts a size quantity to bytes.
pub fn quantity_to_bytes(q: &Quantity) -> Result<u64, Error> {
    parse_bytes(&q.0)
}
