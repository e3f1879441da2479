//! Failure Store
//!
//! The master's record of every failure, keyed by node and failure id.
//! Operator calls write `expected_state`; node reports write `current_state`.
//! Neither path ever touches the other field.

use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use crate::error::{InjectorError, InjectorResult};
use crate::failure::{Failure, FailureState, Spec};

#[derive(Default)]
pub struct FailureStore {
    failures: RwLock<HashMap<String, BTreeMap<String, Failure>>>,
}

fn not_found(node_id: &str, id: &str) -> InjectorError {
    InjectorError::FailureNotFound {
        node_id: node_id.to_string(),
        id: id.to_string(),
    }
}

impl FailureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, failure: Failure) -> InjectorResult<Failure> {
        let mut failures = self.failures.write().await;
        let per_node = failures.entry(failure.metadata.node_id.clone()).or_default();
        if per_node.contains_key(&failure.metadata.id) {
            return Err(InjectorError::DuplicateFailure {
                node_id: failure.metadata.node_id.clone(),
                id: failure.metadata.id.clone(),
            });
        }
        per_node.insert(failure.metadata.id.clone(), failure.clone());
        Ok(failure)
    }

    pub async fn get(&self, node_id: &str, id: &str) -> InjectorResult<Failure> {
        self.failures
            .read()
            .await
            .get(node_id)
            .and_then(|per_node| per_node.get(id))
            .cloned()
            .ok_or_else(|| not_found(node_id, id))
    }

    /// Failures targeting one node, ordered by id
    pub async fn list_for_node(&self, node_id: &str) -> Vec<Failure> {
        self.failures
            .read()
            .await
            .get(node_id)
            .map(|per_node| per_node.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Failures whose target node passes `filter`, ordered by node then id
    pub async fn list<F>(&self, filter: F) -> Vec<Failure>
    where
        F: Fn(&str) -> bool,
    {
        let failures = self.failures.read().await;
        let mut node_ids: Vec<&String> = failures.keys().filter(|node_id| filter(node_id.as_str())).collect();
        node_ids.sort();
        node_ids
            .into_iter()
            .flat_map(|node_id| failures[node_id].values().cloned())
            .collect()
    }

    /// Master-side intent
    pub async fn set_expected(&self, node_id: &str, id: &str, state: FailureState) -> InjectorResult<Failure> {
        self.update(node_id, id, None, Some(state)).await
    }

    /// Replace the spec and/or the expected state in one write. Every request
    /// for `Enabled` starts a new apply generation.
    pub async fn update(
        &self,
        node_id: &str,
        id: &str,
        spec: Option<Spec>,
        expected: Option<FailureState>,
    ) -> InjectorResult<Failure> {
        self.modify(node_id, id, move |failure| {
            if let Some(spec) = spec {
                failure.spec = spec;
            }
            if let Some(state) = expected {
                failure.status.expected_state = state;
                if state == FailureState::Enabled {
                    failure.status.generation += 1;
                }
            }
        })
        .await
    }

    /// Node-side ground truth; only the owning node may report. Returns the
    /// previous current state along with the updated failure.
    pub async fn report_current(
        &self,
        reporter: &str,
        node_id: &str,
        id: &str,
        state: FailureState,
    ) -> InjectorResult<(FailureState, Failure)> {
        if reporter != node_id {
            return Err(InjectorError::NotOwner {
                reporter: reporter.to_string(),
                node_id: node_id.to_string(),
                id: id.to_string(),
            });
        }
        let mut previous = state;
        let updated = self
            .modify(node_id, id, |failure| {
                previous = std::mem::replace(&mut failure.status.current_state, state);
            })
            .await?;
        Ok((previous, updated))
    }

    pub async fn delete(&self, node_id: &str, id: &str) -> InjectorResult<Failure> {
        let mut failures = self.failures.write().await;
        let per_node = failures.get_mut(node_id).ok_or_else(|| not_found(node_id, id))?;
        let removed = per_node.remove(id).ok_or_else(|| not_found(node_id, id))?;
        if per_node.is_empty() {
            failures.remove(node_id);
        }
        Ok(removed)
    }

    /// Failures whose current state differs from the expected one
    pub async fn drifted(&self) -> Vec<Failure> {
        self.list(|_| true)
            .await
            .into_iter()
            .filter(|failure| !failure.status.is_converged())
            .collect()
    }

    async fn modify<F>(&self, node_id: &str, id: &str, change: F) -> InjectorResult<Failure>
    where
        F: FnOnce(&mut Failure),
    {
        let mut failures = self.failures.write().await;
        let failure = failures
            .get_mut(node_id)
            .and_then(|per_node| per_node.get_mut(id))
            .ok_or_else(|| not_found(node_id, id))?;
        change(failure);
        Ok(failure.clone())
    }
}
