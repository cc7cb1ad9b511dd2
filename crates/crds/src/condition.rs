//! Status conditions shared by `TorchrunJob` and `TorchrunQueue`.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single observation about a resource, keyed by `type`.
///
/// A status carries at most one condition per type.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (see [`condition_types`])
    #[serde(rename = "type")]
    pub type_: String,

    /// Whether the condition holds
    pub status: ConditionStatus,

    /// When the status last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    /// Machine-readable reason in PascalCase
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Condition type names.
pub mod condition_types {
    // TorchrunJob
    pub const PROVISIONED: &str = "Provisioned";
    pub const WORKSPACE_READY: &str = "WorkspaceReady";
    pub const WORKSPACE_SYNC: &str = "WorkspaceSync";
    pub const ALL_WORKERS_READY: &str = "AllWorkersReady";
    pub const COMPLETED: &str = "Completed";
    pub const JOB_CREATED: &str = "JobCreated";
    pub const QUEUE_NOT_FOUND: &str = "QueueNotFound";
    pub const FAILED: &str = "Failed";

    // TorchrunQueue
    pub const VALID: &str = "Valid";
    pub const QUEUE_READY: &str = "QueueReady";
    pub const RESOURCES_READY: &str = "ResourcesReady";
}
