//! Node Agent
//!
//! Level-triggered reconciliation on the node: every pass pulls the full set
//! of failures the master wants here, drives one engine per failure towards
//! its expected state and reports the state actually reached.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::attack::AttackRegistry;
use crate::engine::FailureEngine;
use crate::error::{InjectorError, InjectorResult};
use crate::failure::wire::WireFailure;
use crate::failure::{Failure, FailureState, FailureTransformer};
use crate::rpc::MasterApi;

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub reconciled: usize,
    pub errors: usize,
    pub removed: usize,
}

pub struct NodeAgent {
    node_id: String,
    master: Arc<dyn MasterApi>,
    registry: Arc<AttackRegistry>,
    transformer: Arc<FailureTransformer>,
    engines: Mutex<HashMap<String, Arc<FailureEngine>>>,
    /// Apply generation behind each failure's last successful apply
    armed: Mutex<HashMap<String, u64>>,
    /// Cancels in-flight applies on shutdown
    cancel: CancellationToken,
}

impl NodeAgent {
    pub fn new(
        node_id: impl Into<String>,
        master: Arc<dyn MasterApi>,
        registry: Arc<AttackRegistry>,
        transformer: Arc<FailureTransformer>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            master,
            registry,
            transformer,
            engines: Mutex::new(HashMap::new()),
            armed: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Engine currently running failure `id`, if any
    pub async fn engine(&self, id: &str) -> Option<Arc<FailureEngine>> {
        self.engines.lock().await.get(id).cloned()
    }

    /// One reconciliation pass. Only the pull itself can fail the pass;
    /// per-failure problems are logged, counted and reported upstream.
    pub async fn sync(&self) -> InjectorResult<SyncReport> {
        let wires = self.master.pull_failures(&self.node_id).await?;
        let mut report = SyncReport::default();
        let mut listed = HashSet::new();

        for wire in wires {
            if wire.node_id != self.node_id {
                warn!("Ignoring failure {}/{} addressed to another node", wire.node_id, wire.id);
                continue;
            }
            listed.insert(wire.id.clone());

            let reached = match self.reconcile(&wire).await {
                Ok(state) => state,
                Err((state, e)) => {
                    warn!("Failure {} did not converge: {}", wire.id, e);
                    report.errors += 1;
                    state
                }
            };
            self.report(wire, reached).await;
            report.reconciled += 1;
        }

        let stale: Vec<(String, Arc<FailureEngine>)> = {
            let mut engines = self.engines.lock().await;
            let ids: Vec<String> = engines.keys().filter(|id| !listed.contains(*id)).cloned().collect();
            ids.into_iter()
                .filter_map(|id| engines.remove(&id).map(|engine| (id, engine)))
                .collect()
        };
        for (id, engine) in stale {
            info!("Failure {} no longer assigned, reverting", id);
            self.armed.lock().await.remove(&id);
            if let Err(e) = engine.revert().await {
                warn!("Reverting removed failure {} failed: {}", id, e);
                report.errors += 1;
            }
            report.removed += 1;
        }

        debug!("Sync pass for {}: {:?}", self.node_id, report);
        Ok(report)
    }

    /// Drive one failure; on error also return the state it was left in
    async fn reconcile(&self, wire: &WireFailure) -> Result<FailureState, (FailureState, InjectorError)> {
        let failure = self
            .transformer
            .from_wire(wire)
            .map_err(|e| (FailureState::Unknown, e))?;
        let engine = self
            .engine_for(&failure)
            .await
            .map_err(|e| (FailureState::Unknown, e))?;

        let outcome = match failure.status.expected_state {
            FailureState::Enabled => self.enable(&failure, &engine).await,
            FailureState::Disabled => engine.revert().await,
            FailureState::Unknown => Ok(()),
        };
        match outcome {
            Ok(()) => Ok(engine.state()),
            Err(e) => Err((engine.state(), e)),
        }
    }

    /// A failure that ran to its timeout stays down until the master starts
    /// a newer apply generation than the one that armed it.
    async fn enable(&self, failure: &Failure, engine: &FailureEngine) -> InjectorResult<()> {
        let generation = failure.status.generation;
        let armed = self.armed.lock().await.get(failure.id()).copied();
        if engine.expired().await && armed.is_some_and(|armed| armed >= generation) {
            return Ok(());
        }
        engine.fail(&self.cancel).await?;
        self.armed.lock().await.insert(failure.id().to_string(), generation);
        Ok(())
    }

    /// Reuse the engine while the failure's `Spec` is unchanged; otherwise revert the
    /// old one and build a fresh engine from the new spec.
    async fn engine_for(&self, failure: &Failure) -> InjectorResult<Arc<FailureEngine>> {
        let mut engines = self.engines.lock().await;
        if let Some(engine) = engines.get(failure.id()) {
            if engine.spec() == &failure.spec {
                return Ok(Arc::clone(engine));
            }
        }
        if let Some(previous) = engines.remove(failure.id()) {
            info!("Failure {} spec changed, rebuilding engine", failure.id());
            if let Err(e) = previous.revert().await {
                warn!("Reverting previous spec of {} failed: {}", failure.id(), e);
            }
        }

        let engine = Arc::new(FailureEngine::new(failure, &self.registry)?);
        engines.insert(failure.id().to_string(), Arc::clone(&engine));
        Ok(engine)
    }

    async fn report(&self, mut wire: WireFailure, state: FailureState) {
        wire.current_state = self.transformer.state_to_wire(state) as i32;
        if let Err(e) = self.master.report_failure(&self.node_id, wire).await {
            warn!("Reporting state to master failed: {}", e);
        }
    }

    /// Sync every `interval` until `shutdown` fires, then revert everything
    pub async fn run(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.sync().await {
                warn!("Sync with master failed: {}", e);
            }
        }
        self.revert_all().await;
    }

    /// Cancel in-flight applies and revert every failure on this node
    pub async fn revert_all(&self) {
        self.cancel.cancel();
        let engines: Vec<(String, Arc<FailureEngine>)> = self.engines.lock().await.drain().collect();
        self.armed.lock().await.clear();
        for (id, engine) in engines {
            if let Err(e) = engine.revert().await {
                warn!("Reverting {} on shutdown failed: {}", id, e);
            }
        }
        info!("All failures on {} reverted", self.node_id);
    }
}

/// Host facts advertised as node labels
pub fn host_labels() -> BTreeMap<String, String> {
    let mut system = System::new();
    system.refresh_memory();
    system.refresh_cpu_all();

    let mut labels = BTreeMap::new();
    if let Some(hostname) = System::host_name() {
        labels.insert("hostname".to_string(), hostname);
    }
    labels.insert("cpus".to_string(), system.cpus().len().to_string());
    labels.insert("memory_mb".to_string(), (system.total_memory() / (1024 * 1024)).to_string());
    labels
}
