//! Error taxonomy shared by actuators, mutators and worker delegates.
//!
//! Collaborators return [`anyhow::Result`] and attach context as errors travel
//! upwards. The variants of [`Error`] are the failures the framework itself
//! understands; [`determine_error_codes`] walks an error chain and maps both
//! these variants and Kubernetes API statuses onto the canonical
//! [`ErrorCode`]s that end up in `.status.lastError.codes`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures understood by the framework.
#[derive(Error, Debug)]
pub enum Error {
    /// An object the operation depends on does not exist.
    #[error("{kind} {name:?} not found")]
    NotFound {
        /// Kind of the missing object.
        kind: String,
        /// Name of the missing object.
        name: String,
    },
    /// The object was modified concurrently. The caller should refetch and retry.
    #[error("conflict while writing {kind} {name:?}")]
    Conflict {
        /// Kind of the conflicting object.
        kind: String,
        /// Name of the conflicting object.
        name: String,
    },
    /// User supplied configuration failed validation.
    #[error("{field}: {reason}: {detail}")]
    Invalid {
        /// Path of the offending field, e.g. `spec.providerConfig.zoned`.
        field: String,
        /// Short machine readable reason, e.g. `Required`.
        reason: String,
        /// Human readable detail.
        detail: String,
    },
    /// The infrastructure has not yet reported a provider status.
    #[error("infrastructure provider status for {0:?} is not yet available")]
    InfrastructureStatusMissing(String),
    /// A machine image could neither be found in the cloud profile nor in the
    /// worker status.
    #[error("could not find machine image {name}/{version} in cloud profile or worker status")]
    ImageNotFound {
        /// Name of the machine image.
        name: String,
        /// Version of the machine image.
        version: String,
    },
    /// A single API call did not complete in time.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    /// The process is shutting down.
    #[error("operation was cancelled")]
    Cancelled,
}

impl Error {
    /// Creates an `Invalid` error.
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::Invalid {
            field: field.into(),
            reason: reason.into(),
            detail: detail.into(),
        }
    }
}

/// Canonical error codes reported in `.status.lastError.codes`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema)]
pub enum ErrorCode {
    /// Credentials were rejected by an API.
    #[serde(rename = "ERR_INFRA_UNAUTHORIZED")]
    Unauthorized,
    /// The infrastructure is not in a state that allows progress.
    #[serde(rename = "ERR_INFRA_DEPENDENCIES")]
    Infrastructure,
    /// The user supplied configuration cannot be satisfied.
    #[serde(rename = "ERR_CONFIGURATION_PROBLEM")]
    ConfigurationProblem,
    /// A dependency failed; the catch all.
    #[serde(rename = "ERR_DEPENDENCIES")]
    DependencyError,
    /// The failure is transient and clears up on retry.
    #[serde(rename = "ERR_RETRYABLE_INFRA_DEPENDENCIES")]
    RetryableError,
}

/// Maps an error chain to canonical codes. Unknown errors map to
/// [`ErrorCode::DependencyError`].
pub fn determine_error_codes(err: &anyhow::Error) -> Vec<ErrorCode> {
    let mut codes = Vec::new();
    for cause in err.chain() {
        let code = if let Some(e) = cause.downcast_ref::<Error>() {
            Some(match e {
                Error::NotFound { .. } => ErrorCode::DependencyError,
                Error::Conflict { .. } | Error::Timeout(_) | Error::Cancelled => {
                    ErrorCode::RetryableError
                }
                Error::Invalid { .. } | Error::ImageNotFound { .. } => ErrorCode::ConfigurationProblem,
                Error::InfrastructureStatusMissing(_) => ErrorCode::Infrastructure,
            })
        } else if let Some(kube::Error::Api(response)) = cause.downcast_ref::<kube::Error>() {
            Some(match response.code {
                401 | 403 => ErrorCode::Unauthorized,
                409 | 429 | 500 | 503 | 504 => ErrorCode::RetryableError,
                400 | 422 => ErrorCode::ConfigurationProblem,
                _ => ErrorCode::DependencyError,
            })
        } else {
            None
        };
        if let Some(code) = code {
            if !codes.contains(&code) {
                codes.push(code);
            }
        }
    }
    if codes.is_empty() {
        codes.push(ErrorCode::DependencyError);
    }
    codes
}

/// Returns `true` if the error or any of its causes signal a missing object.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(cause.downcast_ref::<Error>(), Some(Error::NotFound { .. }))
            || matches!(cause.downcast_ref::<kube::Error>(), Some(kube::Error::Api(r)) if r.code == 404)
    })
}

/// Returns `true` if the error or any of its causes signal a write conflict.
pub fn is_conflict(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<Error>(),
            Some(Error::Conflict { .. })
        ) || matches!(
            cause.downcast_ref::<kube::Error>(),
            Some(kube::Error::Api(r)) if r.code == 409
        )
    })
}

/// Returns `false` for errors that will not clear up without a change to the
/// object, so the caller should not schedule a retry.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    !determine_error_codes(err).contains(&ErrorCode::ConfigurationProblem)
}

#[cfg(test)]
mod test {
    use super::*;
    use anyhow::Context;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_owned(),
            message: "boom".to_owned(),
            reason: "Test".to_owned(),
            code,
        })
    }

    #[test]
    fn unknown_errors_are_dependency_errors() {
        let err = anyhow::anyhow!("something broke");
        assert_eq!(determine_error_codes(&err), vec![ErrorCode::DependencyError]);
    }

    #[test]
    fn codes_are_found_through_context() {
        let err = Err::<(), _>(Error::InfrastructureStatusMissing("shoot--foo--bar/bar".into()))
            .context("could not compute values")
            .unwrap_err();
        assert_eq!(determine_error_codes(&err), vec![ErrorCode::Infrastructure]);
        assert!(is_retryable(&err));
    }

    #[test]
    fn image_not_found_is_not_retryable() {
        let err: anyhow::Error = Error::ImageNotFound {
            name: "ubuntu".into(),
            version: "18.4".into(),
        }
        .into();
        assert_eq!(determine_error_codes(&err), vec![ErrorCode::ConfigurationProblem]);
        assert!(!is_retryable(&err));
    }

    #[test]
    fn api_statuses_are_classified() {
        let not_found = anyhow::Error::new(api_error(404)).context("could not get secret");
        assert!(is_not_found(&not_found));
        assert!(!is_conflict(&not_found));

        let conflict = anyhow::Error::new(api_error(409));
        assert!(is_conflict(&conflict));
        assert_eq!(determine_error_codes(&conflict), vec![ErrorCode::RetryableError]);

        let forbidden = anyhow::Error::new(api_error(403));
        assert_eq!(determine_error_codes(&forbidden), vec![ErrorCode::Unauthorized]);
    }

    #[test]
    fn error_code_wire_format() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::ConfigurationProblem).unwrap(),
            "\"ERR_CONFIGURATION_PROBLEM\""
        );
    }
}
