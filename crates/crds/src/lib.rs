//! Torchrun CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the torchrun controller.
//!
//! - `TorchrunQueue`: reusable infrastructure policy (pod template, rendezvous
//!   settings, kai-scheduler queue, storage defaults, shared resources)
//! - `TorchrunJob`: a single distributed training run bound to one queue

pub mod condition;
mod schema;
pub mod torchrun_job;
pub mod torchrun_queue;

pub use condition::*;
pub use torchrun_job::*;
pub use torchrun_queue::*;

/// API group shared by every torchrun resource.
pub const API_GROUP: &str = "torchrun.ai";
