//! Process Configuration
//!
//! Master and node settings come from `INJECTOR_*` environment variables
//! (a `.env` file is honored by the binary). Durations use the same text
//! form as failure definitions, e.g. `5s` or `1m30s`.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::env;
use std::time::Duration;
use uuid::Uuid;

use crate::failure::duration::parse_duration;
use crate::master::{parse_labels, LivenessPolicy};
use crate::node::host_labels;

// ──────────────────────────────────────────────────────────────────────────────
// MASTER
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct MasterConfig {
    pub listen: String,
    pub policy: LivenessPolicy,
    pub sweep_interval: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7070".to_string(),
            policy: LivenessPolicy::default(),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

impl MasterConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let missed_heartbeats = match lookup("INJECTOR_MISSED_HEARTBEATS") {
            Some(text) => text
                .trim()
                .parse::<u32>()
                .with_context(|| format!("INJECTOR_MISSED_HEARTBEATS: '{}' is not a count", text))?,
            None => defaults.policy.missed_heartbeats,
        };
        if missed_heartbeats == 0 {
            bail!("INJECTOR_MISSED_HEARTBEATS must be at least 1");
        }

        let policy = LivenessPolicy {
            heartbeat_interval: positive(&lookup, "INJECTOR_HEARTBEAT_INTERVAL", defaults.policy.heartbeat_interval)?,
            missed_heartbeats,
            evict_after: lookup("INJECTOR_EVICT_AFTER")
                .map(|text| parse_duration(&text).context("INJECTOR_EVICT_AFTER"))
                .transpose()?,
        };

        Ok(Self {
            listen: lookup("INJECTOR_MASTER_LISTEN").unwrap_or(defaults.listen),
            policy,
            sweep_interval: positive(&lookup, "INJECTOR_SWEEP_INTERVAL", defaults.sweep_interval)?,
        })
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// NODE
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub master_url: String,
    pub node_id: String,
    pub labels: BTreeMap<String, String>,
    pub heartbeat_interval: Duration,
    pub sync_interval: Duration,
    pub request_timeout: Duration,
}

impl NodeConfig {
    /// Environment settings; host facts fill in labels not set explicitly
    pub fn from_env() -> Result<Self> {
        let mut config = Self::from_lookup(|name| env::var(name).ok())?;
        for (key, value) in host_labels() {
            config.labels.entry(key).or_insert(value);
        }
        Ok(config)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let labels = match lookup("INJECTOR_NODE_LABELS") {
            Some(text) => parse_labels(&text).context("INJECTOR_NODE_LABELS")?,
            None => BTreeMap::new(),
        };
        let node_id = lookup("INJECTOR_NODE_ID")
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Ok(Self {
            master_url: lookup("INJECTOR_MASTER_URL").unwrap_or_else(|| "http://127.0.0.1:7070".to_string()),
            node_id,
            labels,
            heartbeat_interval: positive(&lookup, "INJECTOR_HEARTBEAT_INTERVAL", Duration::from_secs(5))?,
            sync_interval: positive(&lookup, "INJECTOR_SYNC_INTERVAL", Duration::from_secs(2))?,
            request_timeout: positive(&lookup, "INJECTOR_REQUEST_TIMEOUT", Duration::from_secs(5))?,
        })
    }
}

fn positive<F>(lookup: &F, name: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(text) = lookup(name) else {
        return Ok(default);
    };
    let value = parse_duration(&text).with_context(|| name.to_string())?;
    if value.is_zero() {
        bail!("{} must be a positive duration", name);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_master_defaults() {
        let config = MasterConfig::from_lookup(vars(&[])).unwrap();
        assert_eq!(config, MasterConfig::default());
        assert_eq!(config.policy.unreachable_after(), Duration::from_secs(15));
    }

    #[test]
    fn test_master_overrides() {
        let config = MasterConfig::from_lookup(vars(&[
            ("INJECTOR_HEARTBEAT_INTERVAL", "2s"),
            ("INJECTOR_MISSED_HEARTBEATS", "5"),
            ("INJECTOR_EVICT_AFTER", "10m"),
            ("INJECTOR_MASTER_LISTEN", "127.0.0.1:9000"),
        ]))
        .unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.policy.unreachable_after(), Duration::from_secs(10));
        assert_eq!(config.policy.evict_after, Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(MasterConfig::from_lookup(vars(&[("INJECTOR_MISSED_HEARTBEATS", "0")])).is_err());
        assert!(MasterConfig::from_lookup(vars(&[("INJECTOR_MISSED_HEARTBEATS", "many")])).is_err());
        assert!(MasterConfig::from_lookup(vars(&[("INJECTOR_HEARTBEAT_INTERVAL", "0s")])).is_err());
        assert!(NodeConfig::from_lookup(vars(&[("INJECTOR_SYNC_INTERVAL", "soon")])).is_err());
        assert!(NodeConfig::from_lookup(vars(&[("INJECTOR_NODE_LABELS", "zone")])).is_err());
    }

    #[test]
    fn test_node_config() {
        let config = NodeConfig::from_lookup(vars(&[
            ("INJECTOR_NODE_ID", "worker-1"),
            ("INJECTOR_NODE_LABELS", "zone=eu,tier=db"),
        ]))
        .unwrap();
        assert_eq!(config.node_id, "worker-1");
        assert_eq!(config.labels.get("tier").map(String::as_str), Some("db"));
        assert_eq!(config.sync_interval, Duration::from_secs(2));

        let generated = NodeConfig::from_lookup(vars(&[])).unwrap();
        assert!(Uuid::parse_str(&generated.node_id).is_ok());
    }
}
