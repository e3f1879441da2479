//! Node Registry
//!
//! Known nodes keyed by id. Heartbeats and sweeps touch one entry at a time
//! under that entry's lock; adding or removing nodes takes the map-wide
//! write lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use super::selector::LabelSelector;
use crate::error::{InjectorError, InjectorResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Alive,
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    pub id: String,
    pub labels: BTreeMap<String, String>,
    pub liveness: Liveness,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

/// Missed-heartbeat policy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LivenessPolicy {
    /// Period at which nodes are expected to ping
    pub heartbeat_interval: Duration,
    /// Periods of silence before a node is marked unreachable
    pub missed_heartbeats: u32,
    /// Silence after which an unreachable node is dropped entirely
    pub evict_after: Option<Duration>,
}

impl LivenessPolicy {
    pub fn unreachable_after(&self) -> Duration {
        self.heartbeat_interval * self.missed_heartbeats.max(1)
    }
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            missed_heartbeats: 3,
            evict_after: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub unreachable: Vec<String>,
    pub evicted: Vec<String>,
}

pub struct NodeRegistry {
    policy: LivenessPolicy,
    nodes: RwLock<HashMap<String, Arc<Mutex<Node>>>>,
}

fn silence(now: DateTime<Utc>, last: DateTime<Utc>) -> Duration {
    now.signed_duration_since(last).to_std().unwrap_or(Duration::ZERO)
}

impl NodeRegistry {
    pub fn new(policy: LivenessPolicy) -> Self {
        Self {
            policy,
            nodes: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &LivenessPolicy {
        &self.policy
    }

    /// Add a node. A live node with the same id blocks registration;
    /// an unreachable one is replaced.
    pub async fn register(&self, id: &str, labels: BTreeMap<String, String>) -> InjectorResult<Node> {
        if id.is_empty() {
            return Err(InjectorError::Registration("node id must not be empty".to_string()));
        }
        let mut nodes = self.nodes.write().await;
        if let Some(existing) = nodes.get(id) {
            if existing.lock().await.liveness == Liveness::Alive {
                return Err(InjectorError::Registration(format!("node '{}' is already registered", id)));
            }
            info!("Node {} re-registering after being unreachable", id);
        }

        let now = Utc::now();
        let node = Node {
            id: id.to_string(),
            labels,
            liveness: Liveness::Alive,
            last_heartbeat: now,
            registered_at: now,
        };
        nodes.insert(id.to_string(), Arc::new(Mutex::new(node.clone())));
        info!("Node {} registered", id);
        Ok(node)
    }

    pub async fn heartbeat(&self, id: &str) -> InjectorResult<()> {
        self.heartbeat_at(id, Utc::now()).await
    }

    pub async fn heartbeat_at(&self, id: &str, now: DateTime<Utc>) -> InjectorResult<()> {
        let entry = self
            .nodes
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| InjectorError::NodeNotFound(id.to_string()))?;

        let mut node = entry.lock().await;
        if now > node.last_heartbeat {
            node.last_heartbeat = now;
        }
        if node.liveness == Liveness::Unreachable {
            info!("Node {} is reachable again", id);
            node.liveness = Liveness::Alive;
        }
        Ok(())
    }

    /// Remove a node; returns whether it was known
    pub async fn deregister(&self, id: &str) -> bool {
        let removed = self.nodes.write().await.remove(id).is_some();
        if removed {
            info!("Node {} deregistered", id);
        }
        removed
    }

    pub async fn get(&self, id: &str) -> Option<Node> {
        let entry = self.nodes.read().await.get(id).cloned()?;
        let node = entry.lock().await.clone();
        Some(node)
    }

    pub async fn is_alive(&self, id: &str) -> bool {
        matches!(self.get(id).await, Some(node) if node.liveness == Liveness::Alive)
    }

    /// Snapshot of nodes matching `selector`, sorted by id
    pub async fn list(&self, selector: &LabelSelector) -> Vec<Node> {
        let entries: Vec<Arc<Mutex<Node>>> = self.nodes.read().await.values().cloned().collect();
        let mut nodes = Vec::with_capacity(entries.len());
        for entry in entries {
            let node = entry.lock().await;
            if selector.matches(&node.labels) {
                nodes.push(node.clone());
            }
        }
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    /// Mark silent nodes unreachable and evict long-silent ones
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let (mut report, candidates) = self.mark_silent(now).await;
        report.evicted = self.evict(now, candidates).await;
        report.unreachable.sort();
        report.evicted.sort();
        report
    }

    /// First sweep phase, one entry lock at a time. Returns the entries
    /// that were silent long enough to be evicted.
    async fn mark_silent(&self, now: DateTime<Utc>) -> (SweepReport, Vec<(String, Arc<Mutex<Node>>)>) {
        let unreachable_after = self.policy.unreachable_after();
        let entries: Vec<(String, Arc<Mutex<Node>>)> = self
            .nodes
            .read()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();

        let mut report = SweepReport::default();
        let mut candidates = Vec::new();
        for (id, entry) in entries {
            let mut node = entry.lock().await;
            let quiet = silence(now, node.last_heartbeat);
            if node.liveness == Liveness::Alive && quiet > unreachable_after {
                warn!("Node {} missed heartbeats for {:?}, marking unreachable", id, quiet);
                node.liveness = Liveness::Unreachable;
                report.unreachable.push(id.clone());
            }
            if self.should_evict(&node, now) {
                drop(node);
                candidates.push((id, entry));
            }
        }
        (report, candidates)
    }

    /// Second sweep phase under the map-wide lock. A candidate that heartbeated
    /// or re-registered since it was picked is kept.
    async fn evict(&self, now: DateTime<Utc>, candidates: Vec<(String, Arc<Mutex<Node>>)>) -> Vec<String> {
        if candidates.is_empty() {
            return Vec::new();
        }
        let mut nodes = self.nodes.write().await;
        let mut evicted = Vec::new();
        for (id, candidate) in candidates {
            let still_silent = match nodes.get(&id) {
                Some(current) if Arc::ptr_eq(current, &candidate) => self.should_evict(&*current.lock().await, now),
                _ => false,
            };
            if still_silent {
                nodes.remove(&id);
                warn!("Node {} evicted after prolonged silence", id);
                evicted.push(id);
            }
        }
        evicted
    }

    fn should_evict(&self, node: &Node, now: DateTime<Utc>) -> bool {
        match self.policy.evict_after {
            Some(evict_after) => {
                node.liveness == Liveness::Unreachable && silence(now, node.last_heartbeat) > evict_after
            }
            None => false,
        }
    }
}
