//! Node Status Service
//!
//! Registration and liveness towards the master:
//!
//! ```text
//! Unregistered --register--> Registered --start_heartbeat--> HeartbeatActive
//!      ^                         ^  <------stop_heartbeat-------  |
//!      +--------deregister-------+-------------------------------+
//! ```
//!
//! A failed heartbeat never stops the loop. It is pushed onto the error
//! channel returned by `start_heartbeat`, which closes when the loop ends.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{InjectorError, InjectorResult};
use crate::failure::wire::{Heartbeat, NodeRegistration};
use crate::rpc::MasterApi;

/// Heartbeat errors buffered for a slow consumer; further ones are dropped
const ERROR_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Unregistered,
    Registered,
    HeartbeatActive,
}

struct HeartbeatLoop {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct StatusInner {
    state: NodeState,
    heartbeat: Option<HeartbeatLoop>,
}

pub struct NodeStatusService {
    node_id: String,
    labels: BTreeMap<String, String>,
    master: Arc<dyn MasterApi>,
    inner: Mutex<StatusInner>,
}

impl NodeStatusService {
    pub fn new(node_id: impl Into<String>, labels: BTreeMap<String, String>, master: Arc<dyn MasterApi>) -> Self {
        Self {
            node_id: node_id.into(),
            labels,
            master,
            inner: Mutex::new(StatusInner {
                state: NodeState::Unregistered,
                heartbeat: None,
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn registration(&self) -> NodeRegistration {
        NodeRegistration {
            node_id: self.node_id.clone(),
            labels: self.labels.clone().into_iter().collect(),
        }
    }

    /// Announce this node. Already being registered is not an error.
    pub async fn register_on_master(&self) -> InjectorResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != NodeState::Unregistered {
            debug!("Node {} already registered", self.node_id);
            return Ok(());
        }
        self.master.register(self.registration()).await?;
        inner.state = NodeState::Registered;
        info!("Node {} registered on master", self.node_id);
        Ok(())
    }

    /// Re-send the registration after the master forgot this node
    /// (restart or eviction) without touching the local state machine.
    pub async fn rejoin(&self) -> InjectorResult<()> {
        let inner = self.inner.lock().await;
        if inner.state == NodeState::Unregistered {
            return Err(InjectorError::NotRegistered);
        }
        self.master.register(self.registration()).await?;
        info!("Node {} re-joined the master", self.node_id);
        Ok(())
    }

    /// Start pinging the master every `interval`.
    ///
    /// `interval` must be positive. The returned channel yields one error per
    /// failed ping and is closed by `stop_heartbeat`.
    pub async fn start_heartbeat(&self, interval: chrono::Duration) -> InjectorResult<mpsc::Receiver<InjectorError>> {
        if interval <= chrono::Duration::zero() {
            return Err(InjectorError::InvalidInterval);
        }
        let period = interval.to_std().map_err(|_| InjectorError::InvalidInterval)?;

        let mut inner = self.inner.lock().await;
        match inner.state {
            NodeState::Unregistered => return Err(InjectorError::NotRegistered),
            NodeState::HeartbeatActive => return Err(InjectorError::HeartbeatActive),
            NodeState::Registered => {}
        }

        let (errors_tx, errors_rx) = mpsc::channel(ERROR_BUFFER);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(heartbeat_loop(
            self.node_id.clone(),
            Arc::clone(&self.master),
            period,
            cancel.clone(),
            errors_tx,
        ));

        inner.heartbeat = Some(HeartbeatLoop { cancel, task });
        inner.state = NodeState::HeartbeatActive;
        info!("Node {} heartbeat every {:?}", self.node_id, period);
        Ok(errors_rx)
    }

    /// Stop the heartbeat loop and close its error channel. No-op when inactive.
    pub async fn stop_heartbeat(&self) {
        let mut inner = self.inner.lock().await;
        let Some(heartbeat) = inner.heartbeat.take() else {
            return;
        };
        heartbeat.cancel.cancel();
        if let Err(e) = heartbeat.task.await {
            warn!("Heartbeat task for {} ended abnormally: {}", self.node_id, e);
        }
        if inner.state == NodeState::HeartbeatActive {
            inner.state = NodeState::Registered;
        }
        info!("Node {} heartbeat stopped", self.node_id);
    }

    /// Leave the cluster; valid from any state
    pub async fn deregister_on_master(&self) -> InjectorResult<()> {
        self.stop_heartbeat().await;
        let mut inner = self.inner.lock().await;
        self.master.deregister(&self.node_id).await?;
        inner.state = NodeState::Unregistered;
        info!("Node {} deregistered", self.node_id);
        Ok(())
    }

    /// True while the node counts as registered with the master
    pub async fn state(&self) -> bool {
        self.node_state().await != NodeState::Unregistered
    }

    pub async fn node_state(&self) -> NodeState {
        self.inner.lock().await.state
    }
}

impl Drop for NodeStatusService {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.inner.get_mut().heartbeat.take() {
            heartbeat.cancel.cancel();
        }
    }
}

async fn heartbeat_loop(
    node_id: String,
    master: Arc<dyn MasterApi>,
    period: std::time::Duration,
    cancel: CancellationToken,
    errors: mpsc::Sender<InjectorError>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let heartbeat = Heartbeat {
            node_id: node_id.clone(),
            sent_at_unix_ms: Utc::now().timestamp_millis(),
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = master.heartbeat(heartbeat) => result,
        };

        if let Err(e) = result {
            warn!("Heartbeat from {} failed: {}", node_id, e);
            if errors.try_send(e).is_err() {
                debug!("Heartbeat error channel full, dropping error");
            }
        }
    }
    // `errors` drops here, closing the channel
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::wire::WireFailure;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct MockMaster {
        nodes: Mutex<HashSet<String>>,
        heartbeats: AtomicUsize,
        drop_heartbeats: AtomicBool,
        reject_registration: AtomicBool,
    }

    #[async_trait]
    impl MasterApi for MockMaster {
        async fn register(&self, registration: NodeRegistration) -> InjectorResult<()> {
            if self.reject_registration.load(Ordering::SeqCst) {
                return Err(InjectorError::Registration("duplicate".to_string()));
            }
            self.nodes.lock().await.insert(registration.node_id);
            Ok(())
        }

        async fn heartbeat(&self, _heartbeat: Heartbeat) -> InjectorResult<()> {
            if self.drop_heartbeats.load(Ordering::SeqCst) {
                return Err(InjectorError::Transport("connection refused".to_string()));
            }
            self.heartbeats.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn deregister(&self, node_id: &str) -> InjectorResult<()> {
            self.nodes.lock().await.remove(node_id);
            Ok(())
        }

        async fn pull_failures(&self, _node_id: &str) -> InjectorResult<Vec<WireFailure>> {
            Ok(Vec::new())
        }

        async fn report_failure(&self, _node_id: &str, _failure: WireFailure) -> InjectorResult<()> {
            Ok(())
        }
    }

    fn service(master: &Arc<MockMaster>) -> NodeStatusService {
        NodeStatusService::new("node-a", BTreeMap::new(), master.clone())
    }

    #[tokio::test]
    async fn test_interval_must_be_positive() {
        let master = Arc::new(MockMaster::default());
        let status = service(&master);
        status.register_on_master().await.unwrap();

        for interval in [chrono::Duration::zero(), chrono::Duration::milliseconds(-5)] {
            let err = status.start_heartbeat(interval).await.unwrap_err();
            assert!(matches!(err, InjectorError::InvalidInterval));
        }
        assert_eq!(status.node_state().await, NodeState::Registered);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(master.heartbeats.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_requires_registration() {
        let master = Arc::new(MockMaster::default());
        let status = service(&master);
        let err = status.start_heartbeat(chrono::Duration::milliseconds(10)).await.unwrap_err();
        assert!(matches!(err, InjectorError::NotRegistered));
        assert!(!status.state().await);
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let master = Arc::new(MockMaster::default());
        let status = service(&master);
        status.register_on_master().await.unwrap();
        assert!(status.state().await);

        let mut errors = status.start_heartbeat(chrono::Duration::milliseconds(10)).await.unwrap();
        assert!(matches!(
            status.start_heartbeat(chrono::Duration::milliseconds(10)).await,
            Err(InjectorError::HeartbeatActive)
        ));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(master.heartbeats.load(Ordering::SeqCst) >= 2);

        status.stop_heartbeat().await;
        assert_eq!(status.node_state().await, NodeState::Registered);
        assert!(errors.recv().await.is_none(), "error channel must close on stop");
        // Stopping twice is fine
        status.stop_heartbeat().await;

        status.deregister_on_master().await.unwrap();
        assert!(!status.state().await);
        assert!(master.nodes.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_errors_do_not_stop_loop() {
        let master = Arc::new(MockMaster::default());
        let status = service(&master);
        status.register_on_master().await.unwrap();
        master.drop_heartbeats.store(true, Ordering::SeqCst);

        let mut errors = status.start_heartbeat(chrono::Duration::milliseconds(10)).await.unwrap();
        let first = tokio::time::timeout(Duration::from_secs(1), errors.recv()).await.unwrap();
        assert!(matches!(first, Some(InjectorError::Transport(_))));

        master.drop_heartbeats.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(master.heartbeats.load(Ordering::SeqCst) >= 1);
        assert_eq!(status.node_state().await, NodeState::HeartbeatActive);

        status.deregister_on_master().await.unwrap();
        assert_eq!(status.node_state().await, NodeState::Unregistered);
    }

    #[tokio::test]
    async fn test_rejected_registration() {
        let master = Arc::new(MockMaster::default());
        master.reject_registration.store(true, Ordering::SeqCst);
        let status = service(&master);
        assert!(matches!(
            status.register_on_master().await,
            Err(InjectorError::Registration(_))
        ));
        assert!(!status.state().await);
        assert!(matches!(status.rejoin().await, Err(InjectorError::NotRegistered)));
        // Leaving without ever joining is allowed
        status.deregister_on_master().await.unwrap();
    }
}
