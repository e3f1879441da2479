//! Master Side
//!
//! Node liveness tracking, the authoritative failure store, and the
//! reconciliation service nodes talk to.

mod registry;
mod selector;
mod service;
mod store;

pub use registry::{Liveness, LivenessPolicy, Node, NodeRegistry, SweepReport};
pub use selector::{parse_labels, LabelSelector};
pub use service::{FailureEvent, Master};
pub use store::FailureStore;
