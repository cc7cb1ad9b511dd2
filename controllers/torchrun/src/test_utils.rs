//! Test utilities for unit testing reconcilers
//!
//! This module provides helpers for creating test data and setting up test scenarios.

#[cfg(test)]
use crate::config::ControllerConfig;
#[cfg(test)]
use crate::metrics::Metrics;
#[cfg(test)]
use crate::reconciler::Reconciler;
#[cfg(test)]
use cluster_client::MockClusterClient;
#[cfg(test)]
use crds::*;
#[cfg(test)]
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
#[cfg(test)]
use std::sync::Arc;

/// Helper to create a test TorchrunJob bound to `queue`
#[cfg(test)]
pub fn create_test_job(name: &str, namespace: &str, queue: &str) -> TorchrunJob {
    TorchrunJob {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-{}", name)),
            ..Default::default()
        },
        spec: TorchrunJobSpec {
            queue: queue.to_string(),
            command: "train.py".to_string(),
            ..Default::default()
        },
        status: None,
    }
}

/// Pod template document with a single trainer container. `gpus == 0` leaves
/// out the GPU request.
#[cfg(test)]
pub fn trainer_pod_spec(gpus: u32) -> serde_json::Value {
    let mut trainer = serde_json::json!({
        "name": "trainer",
        "image": "pytorch/pytorch:2.3.0-cuda12.1-cudnn8-runtime"
    });
    if gpus > 0 {
        trainer["resources"] = serde_json::json!({
            "requests": { "nvidia.com/gpu": gpus.to_string() },
            "limits": { "nvidia.com/gpu": gpus.to_string() }
        });
    }
    serde_json::json!({ "containers": [trainer] })
}

/// Helper to create a test TorchrunQueue mirrored to `scheduler_queue`
#[cfg(test)]
pub fn create_test_queue(name: &str, namespace: &str, scheduler_queue: &str) -> TorchrunQueue {
    TorchrunQueue {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-{}", name)),
            ..Default::default()
        },
        spec: TorchrunQueueSpec {
            queue: SchedulerQueueSpec {
                name: scheduler_queue.to_string(),
                ..Default::default()
            },
            pod_template: PodTemplate {
                metadata: PodTemplateMetadata::default(),
                spec: Some(trainer_pod_spec(0)),
            },
            ..Default::default()
        },
        status: None,
    }
}

/// Controller configuration used by tests: defaults plus a fixed storage class
#[cfg(test)]
pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        default_storage_class: Some("standard".to_string()),
        ..Default::default()
    }
}

/// Helper to create a Reconciler backed by `client`
#[cfg(test)]
pub fn create_test_reconciler(client: MockClusterClient) -> Reconciler {
    let metrics = Arc::new(Metrics::new().expect("metrics registry"));
    Reconciler::new(Box::new(client), test_config(), metrics)
}
