//! Typed Option Validation
//!
//! Each attack kind declares the options it recognises. The options bag from a
//! definition is checked against that schema at construction: unknown keys,
//! missing required keys, wrong types and out-of-range values are rejected.

use serde_yaml::Value;
use std::collections::HashMap;
use std::time::Duration;

use super::Opts;
use crate::error::{InjectorError, InjectorResult};
use crate::failure::duration::parse_duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    /// Integer greater than zero
    PositiveInteger,
    /// Integer within `min..=max`
    Range { min: u64, max: u64 },
    /// Duration text such as `500ms`
    Duration,
    String,
    Bool,
}

#[derive(Debug, Clone, Copy)]
pub struct OptionSpec {
    pub name: &'static str,
    pub kind: OptionKind,
    pub required: bool,
}

impl OptionSpec {
    pub const fn required(name: &'static str, kind: OptionKind) -> Self {
        Self { name, kind, required: true }
    }

    pub const fn optional(name: &'static str, kind: OptionKind) -> Self {
        Self { name, kind, required: false }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Integer(u64),
    Duration(Duration),
    String(String),
    Bool(bool),
}

/// Options that passed schema validation
#[derive(Debug, Clone, Default)]
pub struct AttackOptions {
    values: HashMap<&'static str, OptionValue>,
}

impl AttackOptions {
    pub fn integer(&self, name: &str) -> Option<u64> {
        match self.values.get(name) {
            Some(OptionValue::Integer(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn duration(&self, name: &str) -> Option<Duration> {
        match self.values.get(name) {
            Some(OptionValue::Duration(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn string(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(OptionValue::String(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        match self.values.get(name) {
            Some(OptionValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Recognised option set of one attack kind
#[derive(Debug, Clone, Copy)]
pub struct OptionSchema {
    kind: &'static str,
    options: &'static [OptionSpec],
}

impl OptionSchema {
    pub const fn new(kind: &'static str, options: &'static [OptionSpec]) -> Self {
        Self { kind, options }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn options(&self) -> &'static [OptionSpec] {
        self.options
    }

    pub fn validate(&self, opts: Option<&Opts>) -> InjectorResult<AttackOptions> {
        let empty = Opts::new();
        let opts = opts.unwrap_or(&empty);

        if let Some(unknown) = opts.keys().find(|key| !self.options.iter().any(|spec| spec.name == key.as_str())) {
            return Err(InjectorError::option(self.kind, unknown, "unknown option"));
        }

        let mut values = HashMap::new();
        for spec in self.options {
            match opts.get(spec.name) {
                None | Some(Value::Null) if spec.required => {
                    return Err(InjectorError::option(self.kind, spec.name, "missing required option"));
                }
                None | Some(Value::Null) => {}
                Some(raw) => {
                    let value = self.coerce(spec, raw)?;
                    values.insert(spec.name, value);
                }
            }
        }
        Ok(AttackOptions { values })
    }

    fn coerce(&self, spec: &OptionSpec, raw: &Value) -> InjectorResult<OptionValue> {
        let fail = |reason: String| InjectorError::option(self.kind, spec.name, reason);
        match spec.kind {
            OptionKind::PositiveInteger => match integer(raw) {
                Some(v) if v > 0 => Ok(OptionValue::Integer(v as u64)),
                Some(v) => Err(fail(format!("must be greater than zero, got {}", v))),
                None => Err(fail(format!("expected an integer, got {}", describe(raw)))),
            },
            OptionKind::Range { min, max } => match integer(raw) {
                Some(v) if v >= min as i128 && v <= max as i128 => Ok(OptionValue::Integer(v as u64)),
                Some(v) => Err(fail(format!("must be within {}..={}, got {}", min, max, v))),
                None => Err(fail(format!("expected an integer, got {}", describe(raw)))),
            },
            OptionKind::Duration => match raw {
                Value::String(text) => parse_duration(text)
                    .map(OptionValue::Duration)
                    .map_err(|e| fail(e.to_string())),
                other => Err(fail(format!("expected a duration string, got {}", describe(other)))),
            },
            OptionKind::String => match raw {
                Value::String(text) => Ok(OptionValue::String(text.clone())),
                other => Err(fail(format!("expected a string, got {}", describe(other)))),
            },
            OptionKind::Bool => match raw {
                Value::Bool(flag) => Ok(OptionValue::Bool(*flag)),
                other => Err(fail(format!("expected a boolean, got {}", describe(other)))),
            },
        }
    }
}

fn integer(raw: &Value) -> Option<i128> {
    match raw {
        Value::Number(n) => n
            .as_u64()
            .map(i128::from)
            .or_else(|| n.as_i64().map(i128::from)),
        _ => None,
    }
}

fn describe(raw: &Value) -> &'static str {
    match raw {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(n) if n.is_f64() => "a float",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a list",
        Value::Mapping(_) => "a map",
        Value::Tagged(_) => "a tagged value",
    }
}
