//! Failure Injector
//!
//! Controlled failure injection for a fleet of worker nodes:
//! - Attacks (memory allocation, memory leak, CPU spike) with apply/revert
//! - Failure definitions parsed from and rendered to YAML
//! - An execution engine with timeout-driven auto-revert
//! - Node registration and heartbeats
//! - Master-side reconciliation of expected vs. current state

pub mod attack;
pub mod config;
pub mod engine;
pub mod error;
pub mod failure;
pub mod master;
pub mod node;
pub mod rpc;
pub mod server;
pub mod telemetry;

// Re-exports for convenience
pub use attack::{Attack, AttackRegistry};
pub use engine::FailureEngine;
pub use error::{InjectorError, InjectorResult};
pub use failure::{Failure, FailureState, FailureTransformer, Metadata, Spec, Status};
pub use master::Master;
pub use node::{NodeAgent, NodeStatusService};
