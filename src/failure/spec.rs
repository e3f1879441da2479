//! Failure Spec
//!
//! Ordered attack list plus timeout, parsed from (and rendered back to)
//! the human-authored definition document:
//!
//! ```yaml
//! spec:
//!   timeout: 1h
//!   attacks:
//!   - memory_allocation:
//!       size: 524288000
//!   - cpu_spike:
//! ```

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::attack::Opts;
use crate::error::{InjectorError, InjectorResult};
use crate::failure::duration::{parse_duration, serde_text};

/// One element of the attack list: attack kind -> options.
///
/// A well-formed map holds exactly one entry. Building a multi-entry map is
/// possible (so callers can assemble one programmatically), but such a map
/// cannot be rendered or executed.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct AttackMap(BTreeMap<String, Option<Opts>>);

impl AttackMap {
    pub fn new(kind: impl Into<String>, opts: Option<Opts>) -> Self {
        let mut map = BTreeMap::new();
        map.insert(kind.into(), opts);
        Self(map)
    }

    pub fn insert(&mut self, kind: impl Into<String>, opts: Option<Opts>) -> Option<Option<Opts>> {
        self.0.insert(kind.into(), opts)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The single (kind, options) entry of a well-formed map
    pub fn single(&self) -> InjectorResult<(&str, Option<&Opts>)> {
        if self.0.len() != 1 {
            return Err(InjectorError::MultiKeyAttackMap);
        }
        self.0
            .iter()
            .next()
            .map(|(kind, opts)| (kind.as_str(), opts.as_ref()))
            .ok_or(InjectorError::MultiKeyAttackMap)
    }

    fn from_value(value: Value) -> InjectorResult<Self> {
        let Value::Mapping(mapping) = value else {
            return Err(InjectorError::AttacksFormat);
        };
        if mapping.len() != 1 {
            return Err(InjectorError::AttacksFormat);
        }
        let (key, value) = mapping
            .into_iter()
            .next()
            .ok_or(InjectorError::AttacksFormat)?;
        let Value::String(kind) = key else {
            return Err(InjectorError::AttacksFormat);
        };
        let opts = match value {
            Value::Null => None,
            Value::Mapping(options) => Some(opts_from_mapping(options)?),
            _ => return Err(InjectorError::AttacksFormat),
        };
        Ok(Self::new(kind, opts))
    }
}

/// Validated failure spec
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Spec {
    /// Zero means "no automatic revert"
    #[serde(serialize_with = "serde_text::serialize", skip_serializing_if = "Duration::is_zero")]
    pub timeout: Duration,
    pub attacks: Vec<AttackMap>,
}

#[derive(Deserialize)]
struct RawSpec {
    #[serde(default)]
    timeout: Option<String>,
    #[serde(default)]
    attacks: Option<Value>,
}

#[derive(Deserialize)]
struct RawDefinition {
    spec: RawSpec,
}

#[derive(Serialize)]
struct DefinitionRef<'a> {
    spec: &'a Spec,
}

impl TryFrom<RawSpec> for Spec {
    type Error = InjectorError;

    fn try_from(raw: RawSpec) -> InjectorResult<Self> {
        let timeout = match raw.timeout {
            Some(text) => parse_duration(&text)?,
            None => Duration::ZERO,
        };
        let attacks = match raw.attacks {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Sequence(items)) => items
                .into_iter()
                .map(AttackMap::from_value)
                .collect::<InjectorResult<Vec<_>>>()?,
            Some(_) => return Err(InjectorError::AttacksFormat),
        };
        Ok(Self { timeout, attacks })
    }
}

impl Spec {
    pub fn new(timeout: Duration, attacks: Vec<AttackMap>) -> Self {
        Self { timeout, attacks }
    }

    /// Parse the root-less form (`timeout:` / `attacks:` at top level)
    pub fn parse(text: &str) -> InjectorResult<Self> {
        let raw: RawSpec = serde_yaml::from_str(text)?;
        Spec::try_from(raw)
    }

    /// Render the root-less form embedded in wire messages
    pub fn render(&self) -> InjectorResult<String> {
        self.check_single_maps()?;
        Ok(serde_yaml::to_string(self)?)
    }

    /// Load a `spec:`-rooted definition document from disk
    pub fn from_file(path: impl AsRef<Path>) -> InjectorResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            InjectorError::Definition(format!("cannot read {}: {}", path.display(), e))
        })?;
        parse_definition(&text)
    }

    fn check_single_maps(&self) -> InjectorResult<()> {
        if self.attacks.iter().any(|attack| attack.len() != 1) {
            return Err(InjectorError::MultiKeyAttackMap);
        }
        Ok(())
    }
}

/// Parse a `spec:`-rooted definition document
pub fn parse_definition(text: &str) -> InjectorResult<Spec> {
    let raw: RawDefinition = serde_yaml::from_str(text)?;
    Spec::try_from(raw.spec)
}

/// Render a spec as a `spec:`-rooted definition document
pub fn render_definition(spec: &Spec) -> InjectorResult<String> {
    spec.check_single_maps()?;
    Ok(serde_yaml::to_string(&DefinitionRef { spec })?)
}

fn opts_from_mapping(mapping: Mapping) -> InjectorResult<Opts> {
    mapping
        .into_iter()
        .map(|(key, value)| match key {
            Value::String(name) => Ok((name, canonicalize(value))),
            _ => Err(InjectorError::AttacksFormat),
        })
        .collect()
}

/// Sort nested mappings by key so rendering is stable
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Mapping(mapping) => {
            let mut entries: Vec<(Value, Value)> = mapping
                .into_iter()
                .map(|(k, v)| (k, canonicalize(v)))
                .collect();
            entries.sort_by(|a, b| sort_key(&a.0).cmp(&sort_key(&b.0)));
            Value::Mapping(entries.into_iter().collect())
        }
        Value::Sequence(items) => Value::Sequence(items.into_iter().map(canonicalize).collect()),
        Value::Tagged(mut tagged) => {
            let inner = std::mem::take(&mut tagged.value);
            tagged.value = canonicalize(inner);
            Value::Tagged(tagged)
        }
        other => other,
    }
}

fn sort_key(key: &Value) -> String {
    match key {
        Value::String(text) => text.clone(),
        other => serde_yaml::to_string(other).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFINITION: &str = "spec:\n  timeout: 1h\n  attacks:\n  - attack1:\n      size: 524288000\n";

    fn size_opts(size: u64) -> Opts {
        let mut opts = Opts::new();
        opts.insert("size".to_string(), Value::from(size));
        opts
    }

    #[test]
    fn test_parse_definition() {
        let spec = parse_definition(DEFINITION).unwrap();
        assert_eq!(spec.timeout, Duration::from_secs(3600));
        assert_eq!(spec.attacks, vec![AttackMap::new("attack1", Some(size_opts(524288000)))]);
    }

    #[test]
    fn test_render_definition_is_byte_identical() {
        let spec = parse_definition(DEFINITION).unwrap();
        assert_eq!(render_definition(&spec).unwrap(), DEFINITION);
    }

    #[test]
    fn test_attack_without_options() {
        let text = "spec:\n  attacks:\n  - cpu_spike:\n  - attack1:\n      size: 1\n";
        let spec = parse_definition(text).unwrap();
        assert_eq!(spec.timeout, Duration::ZERO);
        assert_eq!(spec.attacks.len(), 2);
        assert_eq!(spec.attacks[0].single().unwrap(), ("cpu_spike", None));
        assert_eq!(spec.attacks[1].single().unwrap().0, "attack1");
    }

    #[test]
    fn test_bad_indentation_is_format_error() {
        // `size` lands next to `attack1` instead of under it
        let text = "spec:\n  attacks:\n  - attack1:\n    size: 1\n";
        let err = parse_definition(text).unwrap_err();
        assert_eq!(err.to_string(), "attacks format error, tip: check indentation and '-' indicator");
    }

    #[test]
    fn test_missing_dash_is_format_error() {
        let text = "spec:\n  attacks:\n    attack1:\n      size: 1\n";
        assert!(matches!(parse_definition(text), Err(InjectorError::AttacksFormat)));
    }

    #[test]
    fn test_scalar_element_is_format_error() {
        let text = "attacks:\n- attack1\n";
        assert!(matches!(Spec::parse(text), Err(InjectorError::AttacksFormat)));
    }

    #[test]
    fn test_render_rejects_multi_key_map() {
        let mut map = AttackMap::new("attack1", None);
        map.insert("attack2", None);
        let spec = Spec::new(Duration::ZERO, vec![map]);
        let err = spec.render().unwrap_err();
        assert_eq!(err.to_string(), "each attack map of the attack list needs to be a single map");
        assert!(render_definition(&spec).is_err());
    }

    #[test]
    fn test_order_is_preserved() {
        let spec = Spec::new(
            Duration::from_secs(30),
            vec![
                AttackMap::new("zeta", None),
                AttackMap::new("alpha", Some(size_opts(1))),
                AttackMap::new("mid", None),
            ],
        );
        let parsed = Spec::parse(&spec.render().unwrap()).unwrap();
        assert_eq!(parsed, spec);
    }

    #[test]
    fn test_nested_options_are_sorted() {
        let text = "attacks:\n- attack1:\n    b: 2\n    a:\n      y: 1\n      x: 2\n";
        let rendered = Spec::parse(text).unwrap().render().unwrap();
        assert_eq!(rendered, "attacks:\n- attack1:\n    a:\n      x: 2\n      y: 1\n    b: 2\n");
    }

    #[test]
    fn test_invalid_timeout() {
        let text = "spec:\n  timeout: soon\n  attacks: []\n";
        assert!(matches!(parse_definition(text), Err(InjectorError::InvalidDuration(_))));
    }
}
