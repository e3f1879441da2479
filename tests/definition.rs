use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

use failure_injector::attack::AttackRegistry;
use failure_injector::failure::{parse_definition, render_definition, Metadata, Spec, Status};
use failure_injector::{Failure, FailureEngine, FailureState, FailureTransformer, InjectorError};

const CATALOGUE: &str = "\
spec:
  timeout: 1m30s
  attacks:
  - memory_allocation:
      size: 1048576
  - memory_leak:
      interval: 100ms
      limit: 65536
      size: 4096
  - cpu_spike:
      cores: 1
      load: 10
";

fn definition_file(text: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_load_definition_file() {
    let file = definition_file(CATALOGUE);
    let spec = Spec::from_file(file.path()).unwrap();
    assert_eq!(spec.timeout, Duration::from_secs(90));
    let kinds: Vec<&str> = spec.attacks.iter().map(|attack| attack.single().unwrap().0).collect();
    assert_eq!(kinds, vec!["memory_allocation", "memory_leak", "cpu_spike"]);

    // Rendering is canonical, so it is a fixed point
    let rendered = render_definition(&spec).unwrap();
    assert_eq!(rendered, CATALOGUE);
    assert_eq!(parse_definition(&rendered).unwrap(), spec);
}

#[test]
fn test_missing_file() {
    let err = Spec::from_file("/nonexistent/failure.yaml").unwrap_err();
    assert!(matches!(err, InjectorError::Definition(_)));
}

#[test]
fn test_indentation_mistake_in_file() {
    let file = definition_file("spec:\n  attacks:\n  - memory_allocation:\n    size: 1024\n    extra: 1\n");
    let err = Spec::from_file(file.path()).unwrap_err();
    assert_eq!(err.to_string(), "attacks format error, tip: check indentation and '-' indicator");
}

#[test]
fn test_catalogue_survives_the_wire() {
    let transformer = FailureTransformer::new();
    let failure = Failure::new(
        Metadata::new("burn", "node-1"),
        parse_definition(CATALOGUE).unwrap(),
        Status::new(FailureState::Unknown, FailureState::Enabled),
    );
    let wire = transformer.to_wire(&failure).unwrap();
    assert!(wire.definition.starts_with("timeout: 1m30s\nattacks:\n"));
    assert_eq!(transformer.from_wire(&wire).unwrap(), failure);
}

#[tokio::test]
async fn test_bad_options_fail_before_any_attack_runs() {
    let spec = parse_definition("spec:\n  attacks:\n  - memory_allocation:\n      size: 1024\n  - cpu_spike:\n      load: 400\n")
        .unwrap();
    let failure = Failure::new(Metadata::new("f", "n"), spec, Status::default());
    let err = FailureEngine::new(&failure, &AttackRegistry::with_builtin()).err().unwrap();
    assert!(matches!(err, InjectorError::InvalidOption { .. }));
}
