//! Reconciliation logic for torchrun CRDs.
//!
//! - `job`: TorchrunJob (workspace, compute job, status)
//! - `queue`: TorchrunQueue (scheduler queue, queue resources, finalizer)

pub mod job;
#[cfg(test)]
mod job_test;
pub mod queue;

use crate::backoff::FibonacciBackoff;
use crate::config::ControllerConfig;
use crate::metrics::Metrics;
use cluster_client::ClusterClientTrait;
use kube_runtime::controller::Action;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

/// Fallback delay when the backoff table cannot be locked.
const DEFAULT_ERROR_REQUEUE: Duration = Duration::from_secs(60);

/// What to do after a successful reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Poll again after the delay
    After(Duration),
    /// Wait for the next change event
    Never,
}

impl Requeue {
    #[must_use]
    pub fn into_action(self) -> Action {
        match self {
            Requeue::After(delay) => Action::requeue(delay),
            Requeue::Never => Action::await_change(),
        }
    }
}

/// Backoff state for a resource
#[derive(Debug, Clone)]
struct BackoffState {
    backoff: FibonacciBackoff,
    error_count: u32,
}

impl BackoffState {
    fn new() -> Self {
        Self {
            backoff: FibonacciBackoff::default(),
            error_count: 0,
        }
    }
}

/// Reconciles TorchrunJobs and TorchrunQueues.
pub struct Reconciler {
    pub(crate) client: Box<dyn ClusterClientTrait + Send + Sync>,
    pub(crate) config: ControllerConfig,
    pub(crate) metrics: Arc<Metrics>,
    /// Error backoff per resource (kind/namespace/name -> BackoffState)
    backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
}

impl Reconciler {
    pub fn new(
        client: Box<dyn ClusterClientTrait + Send + Sync>,
        config: ControllerConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            client,
            config,
            metrics,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Next error requeue delay for a resource; advances its backoff.
    ///
    /// Returns (delay, consecutive error count)
    pub fn next_backoff(&self, resource_key: &str) -> (Duration, u32) {
        match self.backoff_states.lock() {
            Ok(mut states) => {
                let state = states.entry(resource_key.to_string()).or_insert_with(BackoffState::new);
                state.error_count += 1;
                (state.backoff.next_backoff(), state.error_count)
            }
            Err(e) => {
                warn!("Failed to lock backoff_states: {}, using default backoff", e);
                (DEFAULT_ERROR_REQUEUE, 0)
            }
        }
    }

    /// Forget the error history of a resource (on successful reconciliation)
    pub fn reset_backoff(&self, resource_key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            states.remove(resource_key);
        }
    }
}
