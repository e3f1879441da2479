//! Master Reconciliation
//!
//! Owns the node registry and the failure store. Operators declare intent
//! (expected state, spec changes) through the operator API; nodes pull that
//! intent and report what actually runs through [`MasterApi`]. Convergence is
//! level-triggered: every pull carries the full desired state.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::{LivenessPolicy, Node, NodeRegistry, SweepReport};
use super::selector::LabelSelector;
use super::store::FailureStore;
use crate::error::{InjectorError, InjectorResult};
use crate::failure::wire::{Heartbeat, NodeRegistration, WireFailure};
use crate::failure::{Failure, FailureState, FailureTransformer, Metadata, Spec, Status};
use crate::rpc::MasterApi;

const EVENT_BUFFER: usize = 1024;

/// Change notification for watchers of the failure collection
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "failure", rename_all = "snake_case")]
pub enum FailureEvent {
    Created(Failure),
    Updated(Failure),
    Deleted(Failure),
}

impl FailureEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            FailureEvent::Created(_) => "created",
            FailureEvent::Updated(_) => "updated",
            FailureEvent::Deleted(_) => "deleted",
        }
    }

    pub fn failure(&self) -> &Failure {
        match self {
            FailureEvent::Created(failure) | FailureEvent::Updated(failure) | FailureEvent::Deleted(failure) => failure,
        }
    }
}

pub struct Master {
    nodes: NodeRegistry,
    failures: FailureStore,
    transformer: Arc<FailureTransformer>,
    events: broadcast::Sender<FailureEvent>,
}

fn desired(state: FailureState) -> InjectorResult<FailureState> {
    match state {
        FailureState::Unknown => Err(InjectorError::Definition(
            "expected state must be enabled or disabled".to_string(),
        )),
        state => Ok(state),
    }
}

impl Master {
    pub fn new(policy: LivenessPolicy, transformer: Arc<FailureTransformer>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            nodes: NodeRegistry::new(policy),
            failures: FailureStore::new(),
            transformer,
            events,
        }
    }

    pub fn nodes(&self) -> &NodeRegistry {
        &self.nodes
    }

    /// Watch stream of failure changes
    pub fn subscribe(&self) -> broadcast::Receiver<FailureEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: FailureEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    // ─── Operator API ────────────────────────────────────────────────────

    /// Declare a new failure. The node has not reported on it yet, so the
    /// current state starts out `Unknown`.
    pub async fn create_failure(&self, metadata: Metadata, spec: Spec, expected: FailureState) -> InjectorResult<Failure> {
        if metadata.id.is_empty() || metadata.node_id.is_empty() {
            return Err(InjectorError::Definition("failure id and node id are required".to_string()));
        }
        let expected = desired(expected)?;
        // Whatever the store holds must be deliverable to the node
        spec.render()?;

        let failure = Failure::new(metadata, spec, Status::new(FailureState::Unknown, expected));
        let created = self.failures.create(failure).await?;
        info!("Failure {}/{} created (expected {})", created.node_id(), created.id(), expected);
        self.publish(FailureEvent::Created(created.clone()));
        Ok(created)
    }

    pub async fn get_failure(&self, node_id: &str, id: &str) -> InjectorResult<Failure> {
        self.failures.get(node_id, id).await
    }

    /// Failures whose target node matches `selector`. The empty selector also
    /// returns failures aimed at nodes that have not registered yet.
    pub async fn list_failures(&self, selector: &LabelSelector) -> Vec<Failure> {
        if selector.is_empty() {
            return self.failures.list(|_| true).await;
        }
        let matching: HashSet<String> = self.nodes.list(selector).await.into_iter().map(|node| node.id).collect();
        self.failures.list(|node_id| matching.contains(node_id)).await
    }

    pub async fn list_nodes(&self, selector: &LabelSelector) -> Vec<Node> {
        self.nodes.list(selector).await
    }

    pub async fn get_node(&self, node_id: &str) -> InjectorResult<Node> {
        self.nodes
            .get(node_id)
            .await
            .ok_or_else(|| InjectorError::NodeNotFound(node_id.to_string()))
    }

    pub async fn apply(&self, node_id: &str, id: &str) -> InjectorResult<Failure> {
        self.set_expected(node_id, id, FailureState::Enabled).await
    }

    pub async fn revert(&self, node_id: &str, id: &str) -> InjectorResult<Failure> {
        self.set_expected(node_id, id, FailureState::Disabled).await
    }

    pub async fn set_expected(&self, node_id: &str, id: &str, state: FailureState) -> InjectorResult<Failure> {
        let state = desired(state)?;
        let updated = self.failures.set_expected(node_id, id, state).await?;
        info!("Failure {}/{} expected {}", node_id, id, state);
        self.publish(FailureEvent::Updated(updated.clone()));
        Ok(updated)
    }

    /// Replace the attack list/timeout and/or the expected state. Both are
    /// validated before either is written; the node rebuilds its engine on
    /// the next pull when the spec changed.
    pub async fn update_failure(
        &self,
        node_id: &str,
        id: &str,
        spec: Option<Spec>,
        expected: Option<FailureState>,
    ) -> InjectorResult<Failure> {
        let expected = expected.map(desired).transpose()?;
        if let Some(spec) = &spec {
            spec.render()?;
        }
        if spec.is_none() && expected.is_none() {
            return self.get_failure(node_id, id).await;
        }

        let spec_changed = spec.is_some();
        let updated = self.failures.update(node_id, id, spec, expected).await?;
        info!(
            "Failure {}/{} updated (spec changed: {}, expected {})",
            node_id, id, spec_changed, updated.status.expected_state
        );
        self.publish(FailureEvent::Updated(updated.clone()));
        Ok(updated)
    }

    /// Forget a failure; the node reverts it once it no longer sees it in a pull
    pub async fn delete_failure(&self, node_id: &str, id: &str) -> InjectorResult<Failure> {
        let removed = self.failures.delete(node_id, id).await?;
        info!("Failure {}/{} deleted", node_id, id);
        self.publish(FailureEvent::Deleted(removed.clone()));
        Ok(removed)
    }

    /// Failures whose reported state differs from the declared one
    pub async fn drifted(&self) -> Vec<Failure> {
        self.failures.drifted().await
    }

    pub async fn sweep(&self) -> SweepReport {
        self.nodes.sweep().await
    }

    /// Periodic liveness sweep plus drift logging, until `shutdown` fires
    pub async fn run_sweeper(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("Sweeper running every {:?}", interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let report = self.sweep().await;
            if !report.unreachable.is_empty() || !report.evicted.is_empty() {
                debug!("Sweep: unreachable={:?} evicted={:?}", report.unreachable, report.evicted);
            }
            self.log_drift().await;
        }
        info!("Sweeper stopped");
    }

    async fn log_drift(&self) {
        let drifted = self.drifted().await;
        if drifted.is_empty() {
            return;
        }
        debug!("{} failure(s) not converged", drifted.len());
        for failure in drifted {
            // Drift on a live node is normal between pulls; a silent node cannot converge
            if !self.nodes.is_alive(failure.node_id()).await {
                warn!(
                    "Failure {}/{} stuck at {} (expected {}): node is not reachable",
                    failure.node_id(),
                    failure.id(),
                    failure.status.current_state,
                    failure.status.expected_state
                );
            }
        }
    }

    /// Nodes must (re-)register before they take part in reconciliation
    async fn ensure_known(&self, node_id: &str) -> InjectorResult<()> {
        self.get_node(node_id).await.map(|_| ())
    }
}

// ─── Node-facing RPC ─────────────────────────────────────────────────────

#[async_trait]
impl MasterApi for Master {
    async fn register(&self, registration: NodeRegistration) -> InjectorResult<()> {
        let labels: BTreeMap<String, String> = registration.labels.into_iter().collect();
        self.nodes.register(&registration.node_id, labels).await?;
        Ok(())
    }

    async fn heartbeat(&self, heartbeat: Heartbeat) -> InjectorResult<()> {
        self.nodes.heartbeat(&heartbeat.node_id).await
    }

    async fn deregister(&self, node_id: &str) -> InjectorResult<()> {
        if !self.nodes.deregister(node_id).await {
            debug!("Deregister for unknown node {}", node_id);
        }
        Ok(())
    }

    async fn pull_failures(&self, node_id: &str) -> InjectorResult<Vec<WireFailure>> {
        self.ensure_known(node_id).await?;
        self.failures
            .list_for_node(node_id)
            .await
            .iter()
            .map(|failure| self.transformer.to_wire(failure))
            .collect()
    }

    async fn report_failure(&self, node_id: &str, failure: WireFailure) -> InjectorResult<()> {
        self.ensure_known(node_id).await?;
        // Only the current state is taken from a node; the expected state is ours
        let state = self.transformer.state_from_wire(failure.current_state)?;
        let (previous, updated) = self
            .failures
            .report_current(node_id, &failure.node_id, &failure.id, state)
            .await?;

        if previous != state {
            info!("Failure {}/{} now {}", failure.node_id, failure.id, state);
            self.publish(FailureEvent::Updated(updated));
        }
        Ok(())
    }
}
