//! Schema overrides for fields whose types do not carry a `JsonSchema` impl.
//!
//! Pod templates, environment variables and volumes are validated by the
//! controller when they are consumed, so the CRD only records them as
//! free-form objects.

use schemars::{Schema, SchemaGenerator, json_schema};

pub(crate) fn free_form_object(_: &mut SchemaGenerator) -> Schema {
    json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true
    })
}

pub(crate) fn free_form_object_list(_: &mut SchemaGenerator) -> Schema {
    json_schema!({
        "type": "array",
        "items": {
            "type": "object",
            "x-kubernetes-preserve-unknown-fields": true
        }
    })
}

#[cfg(test)]
mod tests {
    use crate::{TorchrunJob, TorchrunQueue};
    use kube::CustomResourceExt;

    #[test]
    fn test_free_form_fields_keep_unknown_fields() {
        for crd in [serde_json::to_string(&TorchrunQueue::crd()), serde_json::to_string(&TorchrunJob::crd())] {
            assert!(crd.unwrap().contains(r#""x-kubernetes-preserve-unknown-fields":true"#));
        }
    }
}
