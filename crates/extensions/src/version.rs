//! Kubernetes version helpers.

use semver::{Version, VersionReq};

use crate::error::Error;

/// Parses a Kubernetes version such as `v1.14`, `1.14.3` or `1.14.3-gke.1`.
/// Missing minor and patch components default to zero.
pub fn parse(version: &str) -> Result<Version, Error> {
    let trimmed = version.trim().trim_start_matches('v');
    let (core, rest) = match trimmed.find(|c: char| c == '-' || c == '+') {
        Some(i) => trimmed.split_at(i),
        None => (trimmed, ""),
    };
    let mut parts: Vec<&str> = core.split('.').collect();
    while parts.len() < 3 {
        parts.push("0");
    }
    Version::parse(&format!("{}{}", parts.join("."), rest))
        .map_err(|e| Error::invalid("kubernetes.version", "Invalid", format!("{:?}: {}", version, e)))
}

/// Returns `major.minor` of a version.
pub fn major_minor(version: &str) -> Result<String, Error> {
    let v = parse(version)?;
    Ok(format!("{}.{}", v.major, v.minor))
}

/// Checks `version` against a constraint such as `>= 1.14` or `1.13.x`.
/// Pre-release suffixes are ignored.
pub fn matches(constraint: &str, version: &str) -> Result<bool, Error> {
    let req = VersionReq::parse(constraint)
        .map_err(|e| Error::invalid("versionConstraint", "Invalid", format!("{:?}: {}", constraint, e)))?;
    let mut v = parse(version)?;
    v.pre = semver::Prerelease::EMPTY;
    v.build = semver::BuildMetadata::EMPTY;
    Ok(req.matches(&v))
}

/// Whether `version` is at least `minimum`.
pub fn is_at_least(version: &str, minimum: &str) -> Result<bool, Error> {
    Ok(parse(version)? >= parse(minimum)?)
}
