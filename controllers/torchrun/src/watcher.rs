//! Kubernetes resource watchers.
//!
//! Both CRDs are driven by `kube_runtime::Controller` through the generic
//! `watch_resource()` helper, which adds metrics and the per-object
//! Fibonacci error backoff around the reconcile functions.
//!
//! TorchrunJobs are also re-triggered by changes to the PVCs, pods and batch
//! Jobs they own (filtered to objects labelled as managed by this controller).

use crate::error::ControllerError;
use crate::naming;
use crate::reconciler::{Reconciler, Requeue};
use crds::{TorchrunJob, TorchrunQueue};
use futures::StreamExt;
use futures::future::BoxFuture;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::{Api, Client, Resource, ResourceExt};
use kube_runtime::controller::{Action, Config as RuntimeConfig};
use kube_runtime::{Controller, watcher};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

fn backoff_key(kind: &str, namespace: &str, name: &str) -> String {
    format!("{}/{}/{}", kind, namespace, name)
}

/// Runs `controller` until its watch streams end.
///
/// `reconcile_fn` receives the namespace and name of the object; the
/// controller re-fetches the object itself so every pass works on the
/// latest stored version.
async fn watch_resource<K, F>(
    controller: Controller<K>,
    reconciler: Arc<Reconciler>,
    reconcile_fn: F,
    kind: &'static str,
) -> Result<(), ControllerError>
where
    K: Resource + Clone + Send + Sync + 'static + Debug + serde::de::DeserializeOwned,
    K::DynamicType: Default + Eq + Hash + Clone + Debug + Unpin,
    F: Fn(Arc<Reconciler>, String, String) -> BoxFuture<'static, Result<Requeue, ControllerError>>
        + Send
        + Sync
        + Clone
        + 'static,
{
    info!("Starting {} watcher", kind);

    let error_policy = move |obj: Arc<K>, error: &ControllerError, ctx: Arc<Reconciler>| {
        let key = backoff_key(kind, &obj.namespace().unwrap_or_default(), &obj.name_any());
        let (delay, attempts) = ctx.next_backoff(&key);
        warn!("Reconciliation of {} failed (attempt {}), retrying in {:?}: {}", key, attempts, delay, error);
        Action::requeue(delay)
    };

    let reconcile = move |obj: Arc<K>, ctx: Arc<Reconciler>| {
        let reconcile_fn = reconcile_fn.clone();
        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        async move {
            let key = backoff_key(kind, &namespace, &name);
            debug!("Reconciling {}", key);

            let timer = ctx.metrics.start_reconcile(kind);
            let result = reconcile_fn(ctx.clone(), namespace, name).await;
            timer.observe_duration();

            match result {
                Ok(requeue) => {
                    ctx.metrics.record_reconcile(kind, "success");
                    ctx.reset_backoff(&key);
                    Ok(requeue.into_action())
                }
                Err(e) => {
                    ctx.metrics.record_reconcile(kind, "error");
                    error!("Reconciliation failed for {}: {}", key, e);
                    Err(e)
                }
            }
        }
    };

    let runtime_config = RuntimeConfig::default()
        .debounce(reconciler.config.debounce)
        .concurrency(reconciler.config.concurrency);

    controller
        .with_config(runtime_config)
        .run(reconcile, error_policy, reconciler)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("Reconciled {} {}", kind, obj.name),
                Err(e) => debug!("Controller event for {}: {}", kind, e),
            }
        })
        .await;

    Ok(())
}

/// Watches TorchrunJobs and TorchrunQueues.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    client: Client,
    /// `None` watches all namespaces
    namespace: Option<String>,
}

impl Watcher {
    pub fn new(reconciler: Arc<Reconciler>, client: Client, namespace: Option<String>) -> Self {
        Self {
            reconciler,
            client,
            namespace,
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    /// Starts watching TorchrunJob resources and their children.
    pub async fn watch_torchrun_jobs(&self) -> Result<(), ControllerError> {
        let children = watcher::Config::default().labels(&naming::managed_selector());
        let controller = Controller::new(self.api::<TorchrunJob>(), watcher::Config::default())
            .owns(self.api::<PersistentVolumeClaim>(), children.clone())
            .owns(self.api::<Pod>(), children.clone())
            .owns(self.api::<Job>(), children);

        watch_resource(
            controller,
            self.reconciler.clone(),
            |reconciler, namespace, name| {
                Box::pin(async move { reconciler.reconcile_torchrun_job(&namespace, &name).await })
            },
            "TorchrunJob",
        )
        .await
    }

    /// Starts watching TorchrunQueue resources.
    pub async fn watch_torchrun_queues(&self) -> Result<(), ControllerError> {
        let controller = Controller::new(self.api::<TorchrunQueue>(), watcher::Config::default());

        watch_resource(
            controller,
            self.reconciler.clone(),
            |reconciler, namespace, name| {
                Box::pin(async move { reconciler.reconcile_torchrun_queue(&namespace, &name).await })
            },
            "TorchrunQueue",
        )
        .await
    }
}
