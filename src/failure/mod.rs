//! Failure Model
//!
//! A failure is an identified, node-targeted bundle of attacks (its `Spec`)
//! together with its node-observed and master-declared state.

pub mod duration;
pub mod spec;
pub mod transformer;
pub mod wire;

pub use spec::{parse_definition, render_definition, AttackMap, Spec};
pub use transformer::FailureTransformer;
pub use wire::{WireFailure, WireFailureState};

use serde::{Deserialize, Serialize};

/// Identity of a failure instance; `id` is unique per node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Metadata {
    pub id: String,
    pub node_id: String,
}

impl Metadata {
    pub fn new(id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_id: node_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureState {
    Enabled,
    Disabled,
    #[default]
    Unknown,
}

impl std::fmt::Display for FailureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureState::Enabled => write!(f, "enabled"),
            FailureState::Disabled => write!(f, "disabled"),
            FailureState::Unknown => write!(f, "unknown"),
        }
    }
}

/// `current_state` is written by the owning node only,
/// `expected_state` and `generation` by the master only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Status {
    pub current_state: FailureState,
    pub expected_state: FailureState,
    /// Counts operator requests for `Enabled`, so a node can tell a new
    /// apply from the one it already ran to its timeout
    #[serde(default)]
    pub generation: u64,
}

impl Status {
    pub fn new(current_state: FailureState, expected_state: FailureState) -> Self {
        Self {
            current_state,
            expected_state,
            generation: 0,
        }
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    pub fn is_converged(&self) -> bool {
        self.current_state == self.expected_state
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Failure {
    pub metadata: Metadata,
    pub spec: Spec,
    pub status: Status,
}

impl Failure {
    pub fn new(metadata: Metadata, spec: Spec, status: Status) -> Self {
        Self {
            metadata,
            spec,
            status,
        }
    }

    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn node_id(&self) -> &str {
        &self.metadata.node_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_convergence() {
        assert!(Status::new(FailureState::Enabled, FailureState::Enabled).is_converged());
        assert!(!Status::new(FailureState::Unknown, FailureState::Disabled).is_converged());
        assert_eq!(Status::default().current_state, FailureState::Unknown);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(FailureState::Enabled.to_string(), "enabled");
        assert_eq!(FailureState::Disabled.to_string(), "disabled");
    }
}
