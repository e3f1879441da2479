//! Failure Execution Engine
//!
//! Realises a failure's spec as running attacks and guarantees they are
//! eventually reverted. Apply and revert on one engine are serialised by a
//! per-failure lock; a spec timeout arms a watcher task that races the
//! timer against manual revert, and exactly one of them performs the revert.

use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::attack::{Attack, AttackRegistry};
use crate::error::{InjectorError, InjectorResult};
use crate::failure::{Failure, FailureState, Metadata, Spec};

struct EngineInner {
    /// Constructed up front, in spec order
    attacks: Vec<Box<dyn Attack>>,
    state: FailureState,
    /// Bumped on every successful apply; a timer only acts on its own generation
    generation: u64,
    timer: Option<CancellationToken>,
    /// Set when the timeout reverted the last apply; cleared by `revert`
    expired: bool,
}

pub struct FailureEngine {
    metadata: Metadata,
    spec: Spec,
    inner: Arc<Mutex<EngineInner>>,
    state_tx: Arc<watch::Sender<FailureState>>,
}

impl FailureEngine {
    /// Build every attack of the failure's `Spec`. Validation errors surface here,
    /// before anything is applied.
    pub fn new(failure: &Failure, registry: &AttackRegistry) -> InjectorResult<Self> {
        let attacks = failure
            .spec
            .attacks
            .iter()
            .map(|attack_map| {
                let (kind, opts) = attack_map.single()?;
                registry.create(kind, opts)
            })
            .collect::<InjectorResult<Vec<_>>>()?;

        let (state_tx, _) = watch::channel(FailureState::Disabled);
        Ok(Self {
            metadata: failure.metadata.clone(),
            spec: failure.spec.clone(),
            inner: Arc::new(Mutex::new(EngineInner {
                attacks,
                state: FailureState::Disabled,
                generation: 0,
                timer: None,
                expired: false,
            })),
            state_tx: Arc::new(state_tx),
        })
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn spec(&self) -> &Spec {
        &self.spec
    }

    /// Snapshot of the engine's current state
    pub fn state(&self) -> FailureState {
        *self.state_tx.borrow()
    }

    /// Observe state transitions, including timeout reverts
    pub fn subscribe(&self) -> watch::Receiver<FailureState> {
        self.state_tx.subscribe()
    }

    /// Number of attacks currently applied
    pub async fn applied_attacks(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.attacks.iter().filter(|attack| attack.is_applied()).count()
    }

    /// Whether the last apply ended by timeout rather than by `revert`
    pub async fn expired(&self) -> bool {
        self.inner.lock().await.expired
    }

    /// Apply every attack in order.
    ///
    /// A no-op when already `Enabled`. If attack `i` fails (or `cancel` fires
    /// before attack `i` starts) the attacks before it stay applied, the state
    /// becomes `Unknown` and the error names the step. Calling `fail` again
    /// resumes at the first attack that is not applied.
    pub async fn fail(&self, cancel: &CancellationToken) -> InjectorResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.state == FailureState::Enabled {
            debug!("{}/{}: already enabled", self.metadata.node_id, self.metadata.id);
            return Ok(());
        }

        let mut outcome = Ok(());
        for (index, attack) in inner.attacks.iter_mut().enumerate() {
            if attack.is_applied() {
                continue;
            }
            if cancel.is_cancelled() {
                outcome = Err(InjectorError::Cancelled { applied: index });
                break;
            }
            match attack.apply(cancel).await {
                Ok(()) => debug!("{}: applied attack #{} ({})", self.metadata.id, index, attack.kind()),
                Err(InjectorError::Cancelled { .. }) => {
                    outcome = Err(InjectorError::Cancelled { applied: index });
                    break;
                }
                Err(e) => {
                    outcome = Err(InjectorError::AttackFailed {
                        index,
                        kind: attack.kind().to_string(),
                        source: Box::new(e),
                    });
                    break;
                }
            }
        }

        if let Err(e) = outcome {
            let partial = inner.attacks.iter().any(|attack| attack.is_applied());
            if partial {
                self.set_state(&mut inner, FailureState::Unknown);
            }
            warn!("{}/{}: apply stopped: {}", self.metadata.node_id, self.metadata.id, e);
            return Err(e);
        }

        self.set_state(&mut inner, FailureState::Enabled);
        inner.generation += 1;
        inner.expired = false;
        info!(
            "{}/{}: enabled {} attack(s)",
            self.metadata.node_id,
            self.metadata.id,
            inner.attacks.len()
        );
        if !self.spec.timeout.is_zero() {
            self.arm_timeout(&mut inner);
        }
        Ok(())
    }

    /// Revert every applied attack (reverse apply order). A no-op when
    /// nothing is applied and the state is already `Disabled`.
    pub async fn revert(&self) -> InjectorResult<()> {
        let mut inner = self.inner.lock().await;
        inner.expired = false;
        revert_locked(&mut inner, &self.state_tx, &self.metadata).await
    }

    fn set_state(&self, inner: &mut EngineInner, state: FailureState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    fn arm_timeout(&self, inner: &mut EngineInner) {
        let generation = inner.generation;
        let token = CancellationToken::new();
        if let Some(previous) = inner.timer.replace(token.clone()) {
            previous.cancel();
        }

        let shared = Arc::clone(&self.inner);
        let state_tx = Arc::clone(&self.state_tx);
        let metadata = self.metadata.clone();
        let timeout = self.spec.timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let mut inner = shared.lock().await;
                    if token.is_cancelled() || inner.generation != generation {
                        return;
                    }
                    info!("{}/{}: timeout of {:?} elapsed, reverting", metadata.node_id, metadata.id, timeout);
                    inner.expired = true;
                    if let Err(e) = revert_locked(&mut inner, &state_tx, &metadata).await {
                        error!("{}/{}: timeout revert failed: {}", metadata.node_id, metadata.id, e);
                    }
                }
            }
        });
    }
}

async fn revert_locked(
    inner: &mut EngineInner,
    state_tx: &watch::Sender<FailureState>,
    metadata: &Metadata,
) -> InjectorResult<()> {
    if let Some(timer) = inner.timer.take() {
        timer.cancel();
    }
    let any_applied = inner.attacks.iter().any(|attack| attack.is_applied());
    if !any_applied && inner.state == FailureState::Disabled {
        debug!("{}/{}: already disabled", metadata.node_id, metadata.id);
        return Ok(());
    }

    let mut errors = Vec::new();
    for attack in inner.attacks.iter_mut().rev() {
        if !attack.is_applied() {
            continue;
        }
        if let Err(e) = attack.revert().await {
            errors.push(format!("{}: {}", attack.kind(), e));
        }
    }

    inner.state = FailureState::Disabled;
    state_tx.send_replace(FailureState::Disabled);
    info!("{}/{}: disabled", metadata.node_id, metadata.id);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(InjectorError::RevertFailed(errors.join("; ")))
    }
}
