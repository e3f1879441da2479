//! Node Side
//!
//! Everything that runs on a worker: the status service that keeps the node
//! registered and heartbeating, and the agent that reconciles failures.

mod agent;
mod status;

pub use agent::{host_labels, NodeAgent, SyncReport};
pub use status::{NodeState, NodeStatusService};
