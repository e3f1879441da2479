//! Failure <-> Wire Transformer
//!
//! Pure, bidirectional conversion between [`Failure`] and [`WireFailure`].
//! Constructed once at startup and handed to the master and node agents.

use tracing::debug;

use crate::error::{InjectorError, InjectorResult};
use crate::failure::wire::{WireFailure, WireFailureState};
use crate::failure::{Failure, FailureState, Metadata, Spec, Status};

#[derive(Debug, Clone, Default)]
pub struct FailureTransformer {
    _private: (),
}

impl FailureTransformer {
    pub fn new() -> Self {
        Self { _private: () }
    }

    /// Render a failure into its wire form
    pub fn to_wire(&self, failure: &Failure) -> InjectorResult<WireFailure> {
        let definition = failure.spec.render()?;
        Ok(WireFailure {
            id: failure.metadata.id.clone(),
            node_id: failure.metadata.node_id.clone(),
            definition,
            current_state: self.state_to_wire(failure.status.current_state) as i32,
            expected_state: self.state_to_wire(failure.status.expected_state) as i32,
            generation: failure.status.generation,
        })
    }

    /// Parse a wire failure; unknown enum values and bad definitions are errors
    pub fn from_wire(&self, wire: &WireFailure) -> InjectorResult<Failure> {
        let current_state = self.state_from_wire(wire.current_state)?;
        let expected_state = self.state_from_wire(wire.expected_state)?;
        let spec = Spec::parse(&wire.definition)?;
        debug!("Decoded failure {}/{} ({} attacks)", wire.node_id, wire.id, spec.attacks.len());

        Ok(Failure::new(
            Metadata::new(wire.id.clone(), wire.node_id.clone()),
            spec,
            Status::new(current_state, expected_state).with_generation(wire.generation),
        ))
    }

    pub fn state_to_wire(&self, state: FailureState) -> WireFailureState {
        match state {
            FailureState::Enabled => WireFailureState::Enabled,
            FailureState::Disabled => WireFailureState::Disabled,
            FailureState::Unknown => WireFailureState::Unknown,
        }
    }

    pub fn state_from_wire(&self, value: i32) -> InjectorResult<FailureState> {
        match WireFailureState::try_from(value) {
            Ok(WireFailureState::Enabled) => Ok(FailureState::Enabled),
            Ok(WireFailureState::Disabled) => Ok(FailureState::Disabled),
            Ok(WireFailureState::Unknown) => Ok(FailureState::Unknown),
            Err(_) => Err(InjectorError::UnknownState(value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attack::Opts;
    use crate::failure::AttackMap;
    use serde_yaml::Value;
    use std::time::Duration;

    fn example_wire() -> WireFailure {
        WireFailure {
            id: "test1".to_string(),
            node_id: "node1".to_string(),
            definition: "attacks:\n- attack1:\n    size: 524288000\n".to_string(),
            current_state: WireFailureState::Enabled as i32,
            expected_state: WireFailureState::Disabled as i32,
            generation: 2,
        }
    }

    fn example_failure() -> Failure {
        let mut opts = Opts::new();
        opts.insert("size".to_string(), Value::from(524288000u64));
        Failure::new(
            Metadata::new("test1", "node1"),
            Spec::new(Duration::ZERO, vec![AttackMap::new("attack1", Some(opts))]),
            Status::new(FailureState::Enabled, FailureState::Disabled).with_generation(2),
        )
    }

    #[test]
    fn test_wire_to_failure() {
        let transformer = FailureTransformer::new();
        let failure = transformer.from_wire(&example_wire()).unwrap();
        assert_eq!(failure, example_failure());
    }

    #[test]
    fn test_failure_to_wire() {
        let transformer = FailureTransformer::new();
        let wire = transformer.to_wire(&example_failure()).unwrap();
        assert_eq!(wire, example_wire());
    }

    #[test]
    fn test_round_trip_with_timeout() {
        let transformer = FailureTransformer::new();
        let mut failure = example_failure();
        failure.spec.timeout = Duration::from_secs(90);
        failure.spec.attacks.push(AttackMap::new("cpu_spike", None));
        failure.status = Status::new(FailureState::Unknown, FailureState::Enabled);

        let wire = transformer.to_wire(&failure).unwrap();
        assert_eq!(transformer.from_wire(&wire).unwrap(), failure);
    }

    #[test]
    fn test_unknown_current_state() {
        let transformer = FailureTransformer::new();
        let mut wire = example_wire();
        wire.current_state = 9999;
        assert!(matches!(transformer.from_wire(&wire), Err(InjectorError::UnknownState(9999))));
    }

    #[test]
    fn test_unknown_expected_state() {
        let transformer = FailureTransformer::new();
        let mut wire = example_wire();
        wire.expected_state = 9999;
        assert!(matches!(transformer.from_wire(&wire), Err(InjectorError::UnknownState(9999))));
    }

    #[test]
    fn test_bad_definition_propagates() {
        let transformer = FailureTransformer::new();
        let mut wire = example_wire();
        wire.definition = "attacks:\n- attack1:\n  size: 1\n".to_string();
        assert!(matches!(transformer.from_wire(&wire), Err(InjectorError::AttacksFormat)));
    }

    #[test]
    fn test_multi_key_map_fails_to_wire() {
        let transformer = FailureTransformer::new();
        let mut failure = example_failure();
        failure.spec.attacks[0].insert("attack2", None);
        assert!(matches!(transformer.to_wire(&failure), Err(InjectorError::MultiKeyAttackMap)));
    }
}
