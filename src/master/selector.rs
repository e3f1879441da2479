//! Label Selector
//!
//! Comma-separated `key=value` requirements; a node matches when it carries
//! every listed label with the listed value. The empty selector matches all.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{InjectorError, InjectorResult};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<(String, String)>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> InjectorResult<Self> {
        let mut requirements = Vec::new();
        for part in text.split(',').map(str::trim).filter(|part| !part.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| InjectorError::InvalidSelector(format!("'{}' is not key=value", part)))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(InjectorError::InvalidSelector(format!("'{}' has an empty key", part)));
            }
            requirements.push((key.to_string(), value.trim().to_string()));
        }
        Ok(Self { requirements })
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    }
}

impl FromStr for LabelSelector {
    type Err = InjectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .requirements
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

/// Parse `k=v,k2=v2` into a label map (used for node labels)
pub fn parse_labels(text: &str) -> InjectorResult<BTreeMap<String, String>> {
    Ok(LabelSelector::parse(text)?.requirements.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_parse_and_match() {
        let selector = LabelSelector::parse("zone=a, tier=web").unwrap();
        assert!(selector.matches(&labels(&[("zone", "a"), ("tier", "web"), ("extra", "x")])));
        assert!(!selector.matches(&labels(&[("zone", "a")])));
        assert!(!selector.matches(&labels(&[("zone", "b"), ("tier", "web")])));
        assert_eq!(selector.to_string(), "zone=a,tier=web");
    }

    #[test]
    fn test_empty_matches_everything() {
        let selector = LabelSelector::parse("").unwrap();
        assert!(selector.is_empty());
        assert!(selector.matches(&BTreeMap::new()));
    }

    #[test]
    fn test_malformed() {
        assert!(LabelSelector::parse("zone").is_err());
        assert!(LabelSelector::parse("=a").is_err());
        assert!("zone=a,oops".parse::<LabelSelector>().is_err());
    }

    #[test]
    fn test_parse_labels() {
        let parsed = parse_labels("role=db,zone=eu").unwrap();
        assert_eq!(parsed, labels(&[("role", "db"), ("zone", "eu")]));
    }
}
