use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};
use tracing_futures::Instrument;
use warp::http::StatusCode;
use warp::Filter;

use super::{Mutator, SeedObject};
use crate::error::Error;

const PATCH_TYPE_JSON_PATCH: &str = "JSONPatch";

/// An admission review as sent by the API server and returned by the webhook.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    /// `admission.k8s.io/v1beta1` or `admission.k8s.io/v1`.
    pub api_version: String,
    /// `AdmissionReview`.
    pub kind: String,
    /// The request, set by the API server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<AdmissionRequest>,
    /// The response, set by the webhook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<AdmissionResponse>,
}

/// Group, version and kind of the object under review.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct GroupVersionKind {
    /// API group, empty for the core group.
    #[serde(default)]
    pub group: String,
    /// API version.
    pub version: String,
    /// Kind.
    pub kind: String,
}

/// The admission attributes of one request.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    /// Identifier copied into the response.
    pub uid: String,
    /// Kind of the object.
    pub kind: GroupVersionKind,
    /// Name of the object.
    #[serde(default)]
    pub name: Option<String>,
    /// Namespace of the object.
    #[serde(default)]
    pub namespace: Option<String>,
    /// `CREATE`, `UPDATE`, `DELETE` or `CONNECT`.
    pub operation: String,
    /// The object as it would be persisted.
    #[serde(default)]
    pub object: Option<Value>,
    /// The existing object for updates and deletions.
    #[serde(default)]
    pub old_object: Option<Value>,
}

/// The verdict on one request.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    /// Identifier copied from the request.
    pub uid: String,
    /// Whether the request is admitted.
    pub allowed: bool,
    /// Details on denied requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    /// Base64 encoded JSON patch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
    /// Always `JSONPatch` when a patch is present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_type: Option<String>,
}

impl AdmissionResponse {
    fn deny(uid: String, code: u16, message: String) -> Self {
        AdmissionResponse {
            uid,
            allowed: false,
            status: Some(Status {
                code: Some(code.into()),
                message: Some(message),
                status: Some("Failure".to_owned()),
                ..Default::default()
            }),
            patch: None,
            patch_type: None,
        }
    }
}

/// Runs `mutator` on the object of `review` and answers with the patch that
/// turns the submitted object into the mutated one.
pub async fn review(mutator: &dyn Mutator, review: AdmissionReview) -> AdmissionReview {
    let request = match review.request {
        Some(request) => request,
        None => {
            return AdmissionReview {
                api_version: review.api_version,
                kind: review.kind,
                request: None,
                response: Some(AdmissionResponse::deny(
                    String::new(),
                    400,
                    "admission review carries no request".to_owned(),
                )),
            }
        }
    };

    let span = tracing::debug_span!(
        "review",
        kind = %request.kind.kind,
        name = ?request.name,
        namespace = ?request.namespace,
        operation = %request.operation,
    );
    let response = mutate(mutator, &request).instrument(span).await;
    AdmissionReview {
        api_version: review.api_version,
        kind: review.kind,
        request: None,
        response: Some(response),
    }
}

async fn mutate(mutator: &dyn Mutator, request: &AdmissionRequest) -> AdmissionResponse {
    let uid = request.uid.clone();
    let object = match &request.object {
        Some(object) if request.operation != "DELETE" => object.clone(),
        _ => {
            trace!("Nothing to mutate");
            return allow(uid, None);
        }
    };

    let mut decoded = match SeedObject::decode(&request.kind.kind, object) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!(error = %e, "Could not decode object");
            return AdmissionResponse::deny(uid, 400, format!("could not decode object: {}", e));
        }
    };
    // Diff against the typed encoding so that fields this crate does not model
    // are not removed.
    let before = match decoded.to_value() {
        Ok(value) => value,
        Err(e) => return AdmissionResponse::deny(uid, 500, e.to_string()),
    };
    let namespace = request.namespace.clone().unwrap_or_default();

    if let Err(e) = mutator.mutate(&namespace, &mut decoded).await {
        let invalid = e
            .chain()
            .any(|cause| matches!(cause.downcast_ref::<Error>(), Some(Error::Invalid { .. })));
        let code = if invalid { 400 } else { 500 };
        warn!(error = %format!("{:#}", e), code, allowed = false, "Admission request denied");
        return AdmissionResponse::deny(uid, code, format!("{:#}", e));
    }

    let after = match decoded.to_value() {
        Ok(value) => value,
        Err(e) => return AdmissionResponse::deny(uid, 500, e.to_string()),
    };
    let patch = json_patch::diff(&before, &after);
    if patch.0.is_empty() {
        info!(allowed = true, "Admission request allowed");
        return allow(uid, None);
    }
    match serde_json::to_vec(&patch) {
        Ok(bytes) => {
            info!(allowed = true, ?patch, "Admission request allowed with patch");
            allow(uid, Some(base64::encode(bytes)))
        }
        Err(e) => AdmissionResponse::deny(uid, 500, e.to_string()),
    }
}

fn allow(uid: String, patch: Option<String>) -> AdmissionResponse {
    let patch_type = patch.as_ref().map(|_| PATCH_TYPE_JSON_PATCH.to_owned());
    AdmissionResponse {
        uid,
        allowed: true,
        status: None,
        patch,
        patch_type,
    }
}

/// Serves admission reviews over TLS until `shutdown` is cancelled. Each
/// entry of `mutators` is served on its path, e.g. `/webhooks/azure`.
pub async fn serve(
    addr: SocketAddr,
    cert_file: PathBuf,
    key_file: PathBuf,
    mutators: BTreeMap<String, Arc<dyn Mutator>>,
    shutdown: CancellationToken,
) {
    let mutators = Arc::new(mutators);
    let routes = warp::post()
        .and(warp::path::full())
        .and(warp::body::json())
        .and_then(move |path: warp::path::FullPath, request: AdmissionReview| {
            let mutators = Arc::clone(&mutators);
            async move {
                let reply: Box<dyn warp::Reply> = match mutators.get(path.as_str()) {
                    Some(mutator) => {
                        let response = review(mutator.as_ref(), request).await;
                        Box::new(warp::reply::json(&response))
                    }
                    None => {
                        warn!(path = path.as_str(), "No webhook registered for path");
                        Box::new(warp::reply::with_status(
                            "no webhook registered for path",
                            StatusCode::NOT_FOUND,
                        ))
                    }
                };
                Ok::<_, Infallible>(reply)
            }
        });

    let (bound, server) = warp::serve(routes)
        .tls()
        .cert_path(cert_file)
        .key_path(key_file)
        .bind_with_graceful_shutdown(addr, async move { shutdown.cancelled().await });
    info!(address = %bound, "Webhook server listening");
    server.await;
}
