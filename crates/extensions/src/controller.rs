//! Runtime that drives a [`Reconciler`] from a watch on extension resources.
//!
//! Every object gets its own task, so reconciles of one object never overlap
//! while different objects are reconciled concurrently, bounded by a
//! semaphore. Failed reconciles are retried with exponential backoff, and a
//! reconcile asking to be requeued runs again after a fixed delay.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use kube::api::{Api, ListParams};
use kube_runtime::watcher::{self, Event};
use serde_json::{json, Value};
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::apis::extensions::{LastOperationState, LastOperationType};
use crate::backoff::{BackoffStrategy, ExponentialBackoffStrategy};
use crate::error::{is_conflict, is_not_found, is_retryable, Error};
use crate::status::{self, Extension, StatusUpdater};

/// Annotation requesting an operation on an extension resource.
pub const OPERATION_ANNOTATION: &str = "gardener.cloud/operation";
/// Value of [`OPERATION_ANNOTATION`] requesting a reconcile.
pub const OPERATION_RECONCILE: &str = "reconcile";

/// Tuning of a controller.
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    /// Upper bound of reconciles running at the same time.
    pub max_concurrent_reconciles: usize,
    /// Reconcile on every spec change instead of waiting for the operation
    /// annotation.
    pub ignore_operation_annotation: bool,
    /// Delay before a requeued reconcile runs again.
    pub requeue_after: Duration,
    /// Upper bound of a single reconcile or delete.
    pub reconcile_timeout: Duration,
    /// First retry delay after a failure.
    pub backoff_base: Duration,
    /// Largest retry delay.
    pub backoff_cap: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            max_concurrent_reconciles: 5,
            ignore_operation_annotation: false,
            requeue_after: Duration::from_secs(30),
            reconcile_timeout: Duration::from_secs(10 * 60),
            backoff_base: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(16 * 60),
        }
    }
}

/// Brings one kind of extension resource into its desired state.
#[async_trait::async_trait]
pub trait Reconciler<K>: Send + Sync {
    /// Reconciles `object`. Returns `true` to be called again after the
    /// configured requeue delay.
    async fn reconcile(&self, object: &K) -> anyhow::Result<bool>;

    /// Cleans up after `object`, which is being deleted.
    async fn delete(&self, object: &K) -> anyhow::Result<()>;
}

/// What to do after handling an object once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Wait for the next change.
    Done,
    /// Handle the object again after the given delay.
    RequeueAfter(Duration),
    /// Handle the object again after backing off.
    Retry,
    /// Wait for the next change, keeping the backoff of earlier failures.
    Failed,
}

/// Whether an object needs a reconcile: it is being deleted, its spec
/// changed since the last successful reconcile, the last operation neither
/// succeeded nor failed for good, or a reconcile was requested through the
/// operation annotation.
pub fn should_reconcile<K: Extension>(object: &K, ignore_operation_annotation: bool) -> bool {
    let meta = object.meta();
    if meta.deletion_timestamp.is_some() {
        return true;
    }
    if !ignore_operation_annotation && has_operation_annotation(object) {
        return true;
    }
    let status = object.default_status();
    if status.and_then(|s| s.observed_generation) != meta.generation {
        return true;
    }
    match status.and_then(|s| s.last_operation.as_ref()) {
        Some(operation) => !matches!(
            operation.state,
            LastOperationState::Succeeded | LastOperationState::Failed
        ),
        None => true,
    }
}

fn has_operation_annotation<K: Extension>(object: &K) -> bool {
    object
        .meta()
        .annotations
        .as_ref()
        .and_then(|a| a.get(OPERATION_ANNOTATION))
        .map_or(false, |v| v == OPERATION_RECONCILE)
}

fn has_finalizer<K: Extension>(object: &K, finalizer: &str) -> bool {
    object
        .meta()
        .finalizers
        .as_ref()
        .map_or(false, |f| f.iter().any(|x| x == finalizer))
}

fn operation_type<K: Extension>(object: &K) -> LastOperationType {
    if object.meta().deletion_timestamp.is_some() {
        LastOperationType::Delete
    } else if object
        .default_status()
        .and_then(|s| s.last_operation.as_ref())
        .is_none()
    {
        LastOperationType::Create
    } else {
        LastOperationType::Reconcile
    }
}

fn last_progress<K: Extension>(object: &K) -> i32 {
    object
        .default_status()
        .and_then(|s| s.last_operation.as_ref())
        .map_or(1, |o| o.progress)
}

type ObjectKey = (String, String);

fn object_key<K: Extension>(object: &K) -> Option<ObjectKey> {
    let meta = object.meta();
    Some((meta.namespace.clone().unwrap_or_default(), meta.name.clone()?))
}

/// Drives a [`Reconciler`] for resources of kind `K`.
pub struct Controller<K> {
    reconciler: Arc<dyn Reconciler<K>>,
    status: Arc<dyn StatusUpdater>,
    finalizer: String,
    config: ControllerConfig,
    extension_type: Option<String>,
    // Generation whose reconcile failed with a non-retryable error, per object.
    failed: Mutex<HashMap<ObjectKey, Option<i64>>>,
}

impl<K: Extension> Controller<K> {
    /// Creates a controller that protects objects with `finalizer`.
    pub fn new(
        reconciler: Arc<dyn Reconciler<K>>,
        status: Arc<dyn StatusUpdater>,
        finalizer: &str,
        config: ControllerConfig,
    ) -> Self {
        Controller {
            reconciler,
            status,
            finalizer: finalizer.to_owned(),
            config,
            extension_type: None,
            failed: Mutex::new(HashMap::new()),
        }
    }

    /// Only handles objects whose `spec.type` is `extension_type`.
    pub fn for_type(mut self, extension_type: &str) -> Self {
        self.extension_type = Some(extension_type.to_owned());
        self
    }

    async fn bounded<T>(&self, call: impl Future<Output = anyhow::Result<T>>) -> anyhow::Result<T> {
        match tokio::time::timeout(self.config.reconcile_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(self.config.reconcile_timeout).into()),
        }
    }

    fn failed_generations(&self) -> std::sync::MutexGuard<'_, HashMap<ObjectKey, Option<i64>>> {
        self.failed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn failed_for_good(&self, key: &ObjectKey, object: &K) -> bool {
        if !self.config.ignore_operation_annotation && has_operation_annotation(object) {
            return false;
        }
        self.failed_generations().get(key) == Some(&object.meta().generation)
    }

    async fn write_status(&self, namespace: &str, name: &str, status: Value) {
        if let Err(e) = self.status.patch_status(namespace, name, status).await {
            warn!(%namespace, %name, error = %e, "Could not update status");
        }
    }

    async fn set_finalizers(&self, namespace: &str, name: &str, finalizers: Vec<String>) -> anyhow::Result<()> {
        self.status
            .patch_object(namespace, name, json!({"metadata": {"finalizers": finalizers}}))
            .await
    }

    /// Handles one observed version of an object.
    #[instrument(level = "debug", skip(self, object), fields(namespace = ?object.meta().namespace, name = ?object.meta().name))]
    pub async fn handle(&self, object: &K) -> Outcome {
        let (namespace, name) = match object_key(object) {
            Some(key) => key,
            None => {
                warn!("Ignoring object without name");
                return Outcome::Done;
            }
        };
        if let Some(wanted) = &self.extension_type {
            if object.extension_type() != wanted.as_str() {
                debug!(extension_type = object.extension_type(), "Ignoring object of other type");
                return Outcome::Done;
            }
        }
        let finalizers = object.meta().finalizers.clone().unwrap_or_default();

        if object.meta().deletion_timestamp.is_some() {
            if !has_finalizer(object, &self.finalizer) {
                debug!("Object is being deleted and carries no finalizer of this controller");
                return Outcome::Done;
            }
            info!("Deleting");
            return match self.bounded(self.reconciler.delete(object)).await {
                Ok(()) => {
                    self.write_status(&namespace, &name, status::succeeded(LastOperationType::Delete, "Deleted", None))
                        .await;
                    let remaining = finalizers.into_iter().filter(|f| *f != self.finalizer).collect();
                    match self.set_finalizers(&namespace, &name, remaining).await {
                        Ok(()) => Outcome::Done,
                        Err(e) if is_not_found(&e) => Outcome::Done,
                        Err(e) => {
                            warn!(error = %e, "Could not remove finalizer");
                            Outcome::Retry
                        }
                    }
                }
                Err(e) => {
                    error!(error = %format!("{:#}", e), "Delete failed");
                    self.write_status(&namespace, &name, status::failed(LastOperationType::Delete, last_progress(object), &e))
                        .await;
                    Outcome::Retry
                }
            };
        }

        let key = (namespace.clone(), name.clone());
        if self.failed_for_good(&key, object) {
            debug!("Last reconcile of this generation failed and will not be retried");
            return Outcome::Done;
        }
        if !should_reconcile(object, self.config.ignore_operation_annotation) {
            debug!("Object is up to date");
            return Outcome::Done;
        }

        if !has_finalizer(object, &self.finalizer) {
            let mut with_finalizer = finalizers;
            with_finalizer.push(self.finalizer.clone());
            if let Err(e) = self.set_finalizers(&namespace, &name, with_finalizer).await {
                warn!(error = %e, "Could not add finalizer");
                return Outcome::Retry;
            }
        }

        let operation = operation_type(object);
        info!(?operation, "Reconciling");
        let result = self.bounded(self.reconciler.reconcile(object)).await;
        if result.is_ok() {
            self.failed_generations().remove(&key);
        }
        match result {
            Ok(true) => {
                info!(after = ?self.config.requeue_after, "Requeueing");
                Outcome::RequeueAfter(self.config.requeue_after)
            }
            Ok(false) => {
                let description = format!("Successfully reconciled {}", name);
                self.write_status(
                    &namespace,
                    &name,
                    status::succeeded(operation, description, object.meta().generation),
                )
                .await;
                if has_operation_annotation(object) {
                    let mut annotations = BTreeMap::new();
                    annotations.insert(OPERATION_ANNOTATION, Value::Null);
                    if let Err(e) = self
                        .status
                        .patch_object(&namespace, &name, json!({"metadata": {"annotations": annotations}}))
                        .await
                    {
                        warn!(error = %e, "Could not remove operation annotation");
                    }
                }
                Outcome::Done
            }
            Err(e) => {
                error!(error = %format!("{:#}", e), "Reconcile failed");
                self.write_status(&namespace, &name, status::failed(operation, last_progress(object), &e))
                    .await;
                if is_conflict(&e) {
                    Outcome::RequeueAfter(self.config.backoff_base)
                } else if is_retryable(&e) {
                    Outcome::Retry
                } else {
                    self.failed_generations().insert(key, object.meta().generation);
                    Outcome::Failed
                }
            }
        }
    }

    async fn run_object(
        self: Arc<Self>,
        mut updates: watch::Receiver<K>,
        semaphore: Arc<Semaphore>,
        token: CancellationToken,
    ) {
        let mut backoff = ExponentialBackoffStrategy::new(self.config.backoff_base, self.config.backoff_cap);
        loop {
            let object = updates.borrow().clone();
            let outcome = {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                tokio::select! {
                    _ = token.cancelled() => return,
                    outcome = self.handle(&object) => outcome,
                }
            };
            match outcome {
                Outcome::Done => {
                    backoff.reset();
                    tokio::select! {
                        _ = token.cancelled() => return,
                        changed = updates.changed() => if changed.is_err() {
                            return;
                        },
                    }
                }
                Outcome::Failed => {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        changed = updates.changed() => if changed.is_err() {
                            return;
                        },
                    }
                }
                Outcome::RequeueAfter(delay) => {
                    backoff.reset();
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(delay) => (),
                    }
                }
                Outcome::Retry => {
                    let delay = backoff.next_duration();
                    debug!(?delay, "Backing off");
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(delay) => (),
                    }
                }
            }
        }
    }

    fn dispatch(
        self: &Arc<Self>,
        handlers: &mut HashMap<ObjectKey, watch::Sender<K>>,
        object: K,
        semaphore: &Arc<Semaphore>,
        token: &CancellationToken,
    ) {
        let key = match object_key(&object) {
            Some(key) => key,
            None => return,
        };
        let object = match handlers.get(&key) {
            Some(sender) => match sender.send(object) {
                Ok(()) => return,
                Err(watch::error::SendError(object)) => object,
            },
            None => object,
        };
        debug!(namespace = %key.0, name = %key.1, "Starting task for object");
        let (sender, receiver) = watch::channel(object);
        handlers.insert(key, sender);
        tokio::spawn(Arc::clone(self).run_object(receiver, Arc::clone(semaphore), token.clone()));
    }

    /// Watches `api` and handles every object until `token` is cancelled.
    pub async fn run(self: Arc<Self>, api: Api<K>, params: ListParams, token: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_reconciles.max(1)));
        let mut handlers: HashMap<ObjectKey, watch::Sender<K>> = HashMap::new();
        let mut events = watcher::watcher(api, params).boxed();
        info!(kind = %K::kind(&()), "Starting controller");
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => {
                    info!(kind = %K::kind(&()), "Controller is shutting down");
                    return;
                }
                event = events.try_next() => event,
            };
            match event {
                Ok(Some(Event::Applied(object))) => {
                    self.dispatch(&mut handlers, object, &semaphore, &token)
                }
                Ok(Some(Event::Deleted(object))) => {
                    if let Some(key) = object_key(&object) {
                        debug!(namespace = %key.0, name = %key.1, "Object deleted");
                        handlers.remove(&key);
                        self.failed_generations().remove(&key);
                    }
                }
                Ok(Some(Event::Restarted(objects))) => {
                    info!(count = objects.len(), "Watch restarted, resyncing");
                    let current: HashSet<ObjectKey> = objects.iter().filter_map(object_key).collect();
                    handlers.retain(|key, _| current.contains(key));
                    for object in objects {
                        self.dispatch(&mut handlers, object, &semaphore, &token);
                    }
                }
                Ok(None) => {
                    warn!("Watch stream ended");
                    return;
                }
                Err(error) => warn!(?error, "Error streaming object events"),
            }
        }
    }
}
