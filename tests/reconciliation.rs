use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use failure_injector::attack::AttackRegistry;
use failure_injector::failure::parse_definition;
use failure_injector::master::{LabelSelector, Liveness, LivenessPolicy, Master};
use failure_injector::rpc::MasterApi;
use failure_injector::{FailureState, FailureTransformer, Metadata, NodeAgent, NodeStatusService};

const ALLOCATE: &str = "spec:\n  attacks:\n  - memory_allocation:\n      size: 1048576\n";
const ALLOCATE_BRIEFLY: &str = "spec:\n  timeout: 100ms\n  attacks:\n  - memory_allocation:\n      size: 1048576\n";

struct Cluster {
    master: Arc<Master>,
    status: NodeStatusService,
    agent: NodeAgent,
}

async fn cluster(node_id: &str) -> Cluster {
    let transformer = Arc::new(FailureTransformer::new());
    let master = Arc::new(Master::new(
        LivenessPolicy {
            heartbeat_interval: Duration::from_millis(20),
            missed_heartbeats: 3,
            evict_after: None,
        },
        Arc::clone(&transformer),
    ));
    let api: Arc<dyn MasterApi> = master.clone();

    let mut labels = BTreeMap::new();
    labels.insert("role".to_string(), "db".to_string());
    let status = NodeStatusService::new(node_id, labels, Arc::clone(&api));
    status.register_on_master().await.unwrap();

    let agent = NodeAgent::new(node_id, api, Arc::new(AttackRegistry::with_builtin()), transformer);
    Cluster { master, status, agent }
}

#[tokio::test]
async fn test_expected_state_converges() {
    let cluster = cluster("node-1").await;
    let master = &cluster.master;
    master
        .create_failure(
            Metadata::new("alloc", "node-1"),
            parse_definition(ALLOCATE).unwrap(),
            FailureState::Enabled,
        )
        .await
        .unwrap();
    assert_eq!(master.drifted().await.len(), 1);

    cluster.agent.sync().await.unwrap();
    let failure = master.get_failure("node-1", "alloc").await.unwrap();
    assert_eq!(failure.status.current_state, FailureState::Enabled);
    assert!(master.drifted().await.is_empty());

    master.revert("node-1", "alloc").await.unwrap();
    cluster.agent.sync().await.unwrap();
    let failure = master.get_failure("node-1", "alloc").await.unwrap();
    assert_eq!(failure.status.current_state, FailureState::Disabled);
    assert_eq!(cluster.agent.engine("alloc").await.unwrap().applied_attacks().await, 0);
}

#[tokio::test]
async fn test_timeout_revert_shows_up_as_drift() {
    let cluster = cluster("node-1").await;
    let master = &cluster.master;
    master
        .create_failure(
            Metadata::new("brief", "node-1"),
            parse_definition(ALLOCATE_BRIEFLY).unwrap(),
            FailureState::Enabled,
        )
        .await
        .unwrap();

    cluster.agent.sync().await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    cluster.agent.sync().await.unwrap();

    let failure = master.get_failure("node-1", "brief").await.unwrap();
    assert_eq!(failure.status.current_state, FailureState::Disabled);
    assert_eq!(failure.status.expected_state, FailureState::Enabled);
    assert_eq!(master.drifted().await.len(), 1);
}

#[tokio::test]
async fn test_reapply_between_pulls_rearms_timed_out_failure() {
    let cluster = cluster("node-1").await;
    let master = &cluster.master;
    master
        .create_failure(
            Metadata::new("brief", "node-1"),
            parse_definition(ALLOCATE_BRIEFLY).unwrap(),
            FailureState::Enabled,
        )
        .await
        .unwrap();
    cluster.agent.sync().await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    cluster.agent.sync().await.unwrap();
    assert_eq!(master.drifted().await.len(), 1);

    // The node never gets to see the intermediate Disabled
    master.revert("node-1", "brief").await.unwrap();
    master.apply("node-1", "brief").await.unwrap();
    cluster.agent.sync().await.unwrap();

    let failure = master.get_failure("node-1", "brief").await.unwrap();
    assert_eq!(failure.status.current_state, FailureState::Enabled);
    assert!(master.drifted().await.is_empty());
    cluster.agent.revert_all().await;
}

#[tokio::test]
async fn test_deleted_failure_is_reverted_on_node() {
    let cluster = cluster("node-1").await;
    let master = &cluster.master;
    master
        .create_failure(
            Metadata::new("alloc", "node-1"),
            parse_definition(ALLOCATE).unwrap(),
            FailureState::Enabled,
        )
        .await
        .unwrap();
    cluster.agent.sync().await.unwrap();
    let engine = cluster.agent.engine("alloc").await.unwrap();
    assert_eq!(engine.state(), FailureState::Enabled);

    master.delete_failure("node-1", "alloc").await.unwrap();
    let report = cluster.agent.sync().await.unwrap();
    assert_eq!(report.removed, 1);
    assert_eq!(engine.state(), FailureState::Disabled);
}

#[tokio::test]
async fn test_agent_run_reverts_on_shutdown() {
    let cluster = Arc::new(cluster("node-1").await);
    cluster
        .master
        .create_failure(
            Metadata::new("alloc", "node-1"),
            parse_definition(ALLOCATE).unwrap(),
            FailureState::Enabled,
        )
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let runner = {
        let cluster = Arc::clone(&cluster);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { cluster.agent.run(Duration::from_millis(10), shutdown).await })
    };

    let mut converged = false;
    for _ in 0..100 {
        let failure = cluster.master.get_failure("node-1", "alloc").await.unwrap();
        if failure.status.is_converged() {
            converged = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(converged);
    let engine = cluster.agent.engine("alloc").await.unwrap();

    shutdown.cancel();
    runner.await.unwrap();
    assert_eq!(engine.state(), FailureState::Disabled);
}

#[tokio::test]
async fn test_silent_node_becomes_unreachable() {
    let cluster = cluster("node-1").await;
    let master = &cluster.master;

    let _errors = cluster
        .status
        .start_heartbeat(chrono::Duration::milliseconds(20))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    master.sweep().await;
    assert_eq!(master.get_node("node-1").await.unwrap().liveness, Liveness::Alive);

    cluster.status.stop_heartbeat().await;
    let report = master.nodes().sweep_at(Utc::now() + chrono::Duration::seconds(1)).await;
    assert_eq!(report.unreachable, vec!["node-1".to_string()]);
    assert_eq!(master.get_node("node-1").await.unwrap().liveness, Liveness::Unreachable);

    // Unreachable nodes may register again
    cluster.status.rejoin().await.unwrap();
    assert_eq!(master.get_node("node-1").await.unwrap().liveness, Liveness::Alive);

    cluster.status.deregister_on_master().await.unwrap();
    assert!(master.list_nodes(&LabelSelector::parse("role=db").unwrap()).await.is_empty());
}
