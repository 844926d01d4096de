//! Status reporting for extension resources.
//!
//! Every status write is a JSON merge patch below `.status`, so that fields
//! owned by other writers (e.g. `providerStatus` of a worker) survive.

use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use kube::api::{Api, Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject};
use kube::Client;
use serde_json::{json, Value};

use crate::apis::extensions::{
    ControlPlane, DefaultStatus, Infrastructure, LastError, LastOperation, LastOperationState,
    LastOperationType, OperatingSystemConfig, Worker,
};
use crate::error::{determine_error_codes, is_retryable, Error};

/// Writes status and metadata of extension resources.
#[async_trait::async_trait]
pub trait StatusUpdater: Send + Sync {
    /// Merges `status` into `.status` of the object.
    async fn patch_status(&self, namespace: &str, name: &str, status: Value) -> anyhow::Result<()>;

    /// Merges `patch` into the object, e.g. to change finalizers or
    /// annotations.
    async fn patch_object(&self, namespace: &str, name: &str, patch: Value) -> anyhow::Result<()>;
}

/// [`StatusUpdater`] for one kind, backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeStatusUpdater {
    client: Client,
    resource: ApiResource,
    timeout: Duration,
}

impl KubeStatusUpdater {
    /// Creates an updater for objects of kind `K`.
    pub fn for_kind<K: kube::Resource<DynamicType = ()>>(client: Client, timeout: Duration) -> Self {
        KubeStatusUpdater {
            client,
            resource: ApiResource::erase::<K>(&()),
            timeout,
        }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.resource)
    }
}

#[async_trait::async_trait]
impl StatusUpdater for KubeStatusUpdater {
    async fn patch_status(&self, namespace: &str, name: &str, status: Value) -> anyhow::Result<()> {
        let api = self.api(namespace);
        let patch = json!({ "status": status });
        let params = PatchParams::default();
        let merge = Patch::Merge(&patch);
        let call = api.patch_status(name, &params, &merge);
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map(|_| ()).map_err(Into::into),
            Err(_) => Err(Error::Timeout(self.timeout).into()),
        }
    }

    async fn patch_object(&self, namespace: &str, name: &str, patch: Value) -> anyhow::Result<()> {
        let api = self.api(namespace);
        let params = PatchParams::default();
        let merge = Patch::Merge(&patch);
        let call = api.patch(name, &params, &merge);
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map(|_| ()).map_err(Into::into),
            Err(_) => Err(Error::Timeout(self.timeout).into()),
        }
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn last_operation(
    type_: LastOperationType,
    state: LastOperationState,
    progress: i32,
    description: impl Into<String>,
) -> LastOperation {
    LastOperation {
        description: description.into(),
        last_update_time: now(),
        progress: progress.clamp(1, 100),
        state,
        type_,
    }
}

/// Status patch for an operation in progress. Progress is kept below 100.
pub fn processing(type_: LastOperationType, progress: i32, description: impl Into<String>) -> Value {
    json!({
        "lastOperation": last_operation(type_, LastOperationState::Processing, progress.min(99), description),
    })
}

/// Status patch for an operation waiting for an external event.
pub fn pending(type_: LastOperationType, progress: i32, description: impl Into<String>) -> Value {
    json!({
        "lastOperation": last_operation(type_, LastOperationState::Pending, progress.min(99), description),
    })
}

/// Status patch for a successfully finished operation. Clears the last error.
pub fn succeeded(
    type_: LastOperationType,
    description: impl Into<String>,
    observed_generation: Option<i64>,
) -> Value {
    let mut status = json!({
        "lastOperation": last_operation(type_, LastOperationState::Succeeded, 100, description),
        "lastError": null,
    });
    if let Some(generation) = observed_generation {
        status["observedGeneration"] = json!(generation);
    }
    status
}

/// Status patch for a failed operation. Errors that will not clear up on
/// retry are reported as `Failed`, all others as `Error`.
pub fn failed(type_: LastOperationType, progress: i32, err: &anyhow::Error) -> Value {
    let state = if is_retryable(err) {
        LastOperationState::Error
    } else {
        LastOperationState::Failed
    };
    let description = format!("{:#}", err);
    json!({
        "lastOperation": last_operation(type_, state, progress.min(99), description.clone()),
        "lastError": LastError {
            description,
            codes: determine_error_codes(err),
            last_update_time: Some(now()),
        },
    })
}

/// Extension resources carrying the common status fields.
pub trait Extension:
    kube::Resource<DynamicType = ()>
    + Clone
    + std::fmt::Debug
    + serde::de::DeserializeOwned
    + serde::Serialize
    + Send
    + Sync
    + 'static
{
    /// The common status, if any has been written yet.
    fn default_status(&self) -> Option<&DefaultStatus>;

    /// The provider or operating system type, `spec.type`.
    fn extension_type(&self) -> &str;
}

impl Extension for ControlPlane {
    fn default_status(&self) -> Option<&DefaultStatus> {
        self.status.as_ref()
    }

    fn extension_type(&self) -> &str {
        &self.spec.type_
    }
}

impl Extension for Infrastructure {
    fn default_status(&self) -> Option<&DefaultStatus> {
        self.status.as_ref()
    }

    fn extension_type(&self) -> &str {
        &self.spec.type_
    }
}

impl Extension for Worker {
    fn default_status(&self) -> Option<&DefaultStatus> {
        self.status.as_ref().map(|s| &s.default)
    }

    fn extension_type(&self) -> &str {
        &self.spec.type_
    }
}

impl Extension for OperatingSystemConfig {
    fn default_status(&self) -> Option<&DefaultStatus> {
        self.status.as_ref()
    }

    fn extension_type(&self) -> &str {
        &self.spec.type_
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn processing_keeps_progress_below_100() {
        let status = processing(LastOperationType::Reconcile, 120, "Applying charts");
        assert_eq!(status["lastOperation"]["progress"], 99);
        assert_eq!(status["lastOperation"]["state"], "Processing");
        assert_eq!(status["lastOperation"]["type"], "Reconcile");
    }

    #[test]
    fn succeeded_clears_last_error() {
        let status = succeeded(LastOperationType::Reconcile, "done", Some(3));
        assert_eq!(status["lastOperation"]["progress"], 100);
        assert!(status["lastError"].is_null());
        assert_eq!(status["observedGeneration"], 3);
    }

    #[test]
    fn failed_carries_codes() {
        let err: anyhow::Error = Error::invalid("spec.providerConfig", "Invalid", "bad").into();
        let status = failed(LastOperationType::Reconcile, 40, &err);
        assert_eq!(status["lastOperation"]["state"], "Failed");
        assert_eq!(status["lastError"]["codes"][0], "ERR_CONFIGURATION_PROBLEM");

        let err = anyhow::anyhow!("connection reset");
        let status = failed(LastOperationType::Delete, 40, &err);
        assert_eq!(status["lastOperation"]["state"], "Error");
        assert_eq!(status["lastError"]["codes"][0], "ERR_DEPENDENCIES");
    }
}
