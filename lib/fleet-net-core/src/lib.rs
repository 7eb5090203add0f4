//! Core machinery shared by the fleet networking agents
//!
//! This library provides:
//! - Object store seam over the Kubernetes API, with an in-memory implementation
//! - Fleet-scoped unique names and object metadata helpers
//! - Status condition helpers and the finalizer link state machine
//! - Export/import latency metrics
//! - Agent configuration and the controller runner

pub mod condition;
pub mod config;
pub mod controller;
pub mod error;
pub mod link;
pub mod metrics;
pub mod objectmeta;
pub mod store;
pub mod uniquename;

pub use config::{HubAgentConfig, MemberAgentConfig};
pub use controller::{run_controller, ReconcileOutcome, Reconciler};
pub use error::{ignore_not_found, FleetError, Result};
pub use link::LinkState;
pub use metrics::{serve_metrics, FleetMetrics};
pub use objectmeta::ObjectKey;
pub use store::{KubeStore, ListOptions, MemoryStore, ObjectStore, StoreObject};
