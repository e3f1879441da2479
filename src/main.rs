//! Failure Injector
//!
//! ```text
//! injector master          run the master (HTTP API + liveness sweeper)
//! injector node            run a node agent against INJECTOR_MASTER_URL
//! injector render <file>   validate a definition file, print its canonical form
//! ```

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use failure_injector::attack::AttackRegistry;
use failure_injector::config::{MasterConfig, NodeConfig};
use failure_injector::failure::{render_definition, FailureTransformer, Spec};
use failure_injector::node::{NodeAgent, NodeStatusService};
use failure_injector::rpc::{HttpMasterClient, MasterApi};
use failure_injector::server::run_master_server;
use failure_injector::telemetry::init_telemetry;
use failure_injector::InjectorError;

const USAGE: &str = "usage: injector <master | node | render <file>>";

// ──────────────────────────────────────────────────────────────────────────────
// MAIN ENTRY POINT
// ──────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("master") => {
            let _telemetry = init_telemetry("injector-master")?;
            run_master_server(MasterConfig::from_env()?).await
        }
        Some("node") => {
            let _telemetry = init_telemetry("injector-node")?;
            run_node(NodeConfig::from_env()?).await
        }
        Some("render") => {
            let path = args.get(1).context(USAGE)?;
            let spec = Spec::from_file(path).with_context(|| format!("cannot load {}", path))?;
            print!("{}", render_definition(&spec)?);
            Ok(())
        }
        _ => bail!(USAGE),
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// NODE
// ──────────────────────────────────────────────────────────────────────────────

async fn run_node(config: NodeConfig) -> Result<()> {
    info!("Node {} joining {}", config.node_id, config.master_url);
    let master: Arc<dyn MasterApi> = Arc::new(HttpMasterClient::new(&config.master_url, config.request_timeout)?);

    let status = Arc::new(NodeStatusService::new(
        config.node_id.clone(),
        config.labels.clone(),
        Arc::clone(&master),
    ));
    status.register_on_master().await?;

    let heartbeat_interval = chrono::Duration::from_std(config.heartbeat_interval)?;
    let mut heartbeat_errors = status.start_heartbeat(heartbeat_interval).await?;

    // The master forgets evicted or restarted-away nodes; join again when told so
    let rejoin = {
        let status = Arc::clone(&status);
        tokio::spawn(async move {
            while let Some(err) = heartbeat_errors.recv().await {
                if matches!(err, InjectorError::NodeNotFound(_)) {
                    if let Err(e) = status.rejoin().await {
                        warn!("Re-joining the master failed: {}", e);
                    }
                }
            }
        })
    };

    let agent = NodeAgent::new(
        config.node_id.clone(),
        Arc::clone(&master),
        Arc::new(AttackRegistry::with_builtin()),
        Arc::new(FailureTransformer::new()),
    );

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
            }
            shutdown.cancel();
        });
    }

    agent.run(config.sync_interval, shutdown).await;

    status.stop_heartbeat().await;
    if let Err(e) = rejoin.await {
        warn!("Heartbeat watcher ended abnormally: {}", e);
    }
    status.deregister_on_master().await?;
    info!("Node {} left the cluster", config.node_id);
    Ok(())
}
