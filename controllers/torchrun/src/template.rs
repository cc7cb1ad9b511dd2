//! Queue pod-template documents.
//!
//! The queue stores its pod spec as a free-form document. It is checked at
//! the two places the controller depends on its shape (the trainer container
//! and volume claim names) before being decoded into a typed `PodSpec`.

use crate::error::ControllerError;
use crate::naming::TRAINER_CONTAINER;
use crds::TorchrunQueue;
use k8s_openapi::api::core::v1::PodSpec;
use kube::ResourceExt;
use serde_json::Value;
use std::collections::BTreeMap;

/// Checks that the template's first container is the trainer and that no
/// other container reuses that name.
pub fn validate_trainer(spec: Option<&Value>) -> Result<(), ControllerError> {
    let containers = spec
        .and_then(|s| s.get("containers"))
        .and_then(Value::as_array)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ControllerError::InvalidPodTemplate("pod spec must have at least one container".to_string()))?;

    let name_of = |c: &Value| c.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
    let first = name_of(&containers[0]);
    if first != TRAINER_CONTAINER {
        return Err(ControllerError::InvalidPodTemplate(format!(
            "first container must be named '{}', found '{}'",
            TRAINER_CONTAINER, first
        )));
    }
    if containers.iter().skip(1).any(|c| name_of(c) == TRAINER_CONTAINER) {
        return Err(ControllerError::InvalidPodTemplate(format!(
            "only the first container may be named '{}'",
            TRAINER_CONTAINER
        )));
    }
    Ok(())
}

/// Maps the object name declared in each queue resource template to the
/// name the queue actually creates it under.
#[must_use]
pub fn translation_map(queue: &TorchrunQueue) -> BTreeMap<String, String> {
    let queue_name = queue.name_any();
    queue
        .spec
        .resources
        .iter()
        .map(|resource| {
            let declared = resource.template_name().unwrap_or(&resource.name).to_string();
            (declared, resource.object_name(&queue_name))
        })
        .collect()
}

/// Rewrites `volumes[*].persistentVolumeClaim.claimName` through `names`.
/// Returns the number of claims rewritten.
pub fn rewrite_claim_names(spec: &mut Value, names: &BTreeMap<String, String>) -> usize {
    let Some(volumes) = spec.get_mut("volumes").and_then(Value::as_array_mut) else {
        return 0;
    };
    let mut rewritten = 0;
    for volume in volumes {
        let Some(claim) = volume
            .get_mut("persistentVolumeClaim")
            .and_then(|pvc| pvc.get_mut("claimName"))
        else {
            continue;
        };
        let Some(target) = claim.as_str().and_then(|name| names.get(name)) else {
            continue;
        };
        if claim.as_str() != Some(target.as_str()) {
            *claim = Value::String(target.clone());
            rewritten += 1;
        }
    }
    rewritten
}

/// Validates, translates and decodes the queue's pod template.
pub fn resolve_pod_spec(queue: &TorchrunQueue) -> Result<PodSpec, ControllerError> {
    let template = queue.spec.pod_template.spec.as_ref();
    validate_trainer(template)?;

    let mut spec = template.cloned().unwrap_or(Value::Null);
    rewrite_claim_names(&mut spec, &translation_map(queue));

    serde_json::from_value(spec)
        .map_err(|e| ControllerError::InvalidPodTemplate(format!("pod spec cannot be decoded: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_queue, trainer_pod_spec};
    use crds::{NameMode, QueueResourceTemplate};
    use serde_json::json;

    fn datasets_queue(mode: NameMode) -> TorchrunQueue {
        let mut queue = create_test_queue("dev", "ml", "team-a");
        queue.spec.resources = vec![QueueResourceTemplate {
            name: "datasets".to_string(),
            name_mode: mode,
            immutable: false,
            template: json!({
                "apiVersion": "v1",
                "kind": "PersistentVolumeClaim",
                "metadata": { "name": "datasets" },
                "spec": { "accessModes": ["ReadOnlyMany"] }
            }),
        }];
        let mut spec = trainer_pod_spec(0);
        spec["volumes"] = json!([
            { "name": "data", "persistentVolumeClaim": { "claimName": "datasets" } },
            { "name": "other", "persistentVolumeClaim": { "claimName": "scratch" } },
            { "name": "cfg", "configMap": { "name": "datasets" } }
        ]);
        queue.spec.pod_template.spec = Some(spec);
        queue
    }

    #[test]
    fn test_rejects_missing_containers() {
        let err = validate_trainer(None).unwrap_err();
        assert!(matches!(err, ControllerError::InvalidPodTemplate(_)));
        assert!(validate_trainer(Some(&json!({ "containers": [] }))).is_err());
    }

    #[test]
    fn test_rejects_first_container_not_trainer() {
        let spec = json!({ "containers": [{ "name": "sidecar" }, { "name": "trainer" }] });
        let err = validate_trainer(Some(&spec)).unwrap_err();
        assert!(err.to_string().contains("found 'sidecar'"));
    }

    #[test]
    fn test_rejects_duplicate_trainer() {
        let spec = json!({ "containers": [{ "name": "trainer" }, { "name": "trainer" }] });
        assert!(validate_trainer(Some(&spec)).is_err());
        assert!(validate_trainer(Some(&json!({ "containers": [{ "name": "trainer" }, { "name": "log" }] }))).is_ok());
    }

    #[test]
    fn test_prefixed_claim_is_rewritten() {
        let queue = datasets_queue(NameMode::Prefix);
        let pod = resolve_pod_spec(&queue).unwrap();
        let volumes = pod.volumes.unwrap();

        let claim = |name: &str| {
            volumes
                .iter()
                .find(|v| v.name == name)
                .and_then(|v| v.persistent_volume_claim.as_ref())
                .map(|c| c.claim_name.clone())
        };
        assert_eq!(claim("data").as_deref(), Some("dev-datasets"));
        assert_eq!(claim("other").as_deref(), Some("scratch"));
        let config_map = volumes.iter().find(|v| v.name == "cfg").and_then(|v| v.config_map.as_ref());
        assert_eq!(config_map.map(|c| c.name.as_str()), Some("datasets"));
    }

    #[test]
    fn test_exact_claim_keeps_its_name() {
        let mut queue = datasets_queue(NameMode::Exact);
        let mut spec = queue.spec.pod_template.spec.take().unwrap();
        assert_eq!(rewrite_claim_names(&mut spec, &translation_map(&queue)), 0);
        assert_eq!(spec["volumes"][0]["persistentVolumeClaim"]["claimName"], "datasets");
    }

    #[test]
    fn test_undecodable_template_is_invalid() {
        let mut queue = create_test_queue("dev", "ml", "team-a");
        queue.spec.pod_template.spec = Some(json!({ "containers": [{ "name": "trainer", "ports": "not-a-list" }] }));
        let err = resolve_pod_spec(&queue).unwrap_err();
        assert!(matches!(err, ControllerError::InvalidPodTemplate(_)));
        assert!(err.is_terminal());
    }
}
