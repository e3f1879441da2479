//! Node -> Master RPC Surface
//!
//! [`MasterApi`] is what a node needs from the master: registration,
//! liveness pings, and pulling/reporting failure state. The master implements
//! it in-process; [`HttpMasterClient`] implements it over HTTP with
//! protobuf bodies.

mod client;

pub use client::HttpMasterClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::InjectorResult;
use crate::failure::wire::{Heartbeat, NodeRegistration, WireFailure};

pub const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";

/// JSON body of every non-2xx answer from the master. `kind` lets the
/// client rebuild the error variant; `detail` carries the variant's payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: String,
    pub detail: String,
}

/// RPC paths shared by client and server
pub mod paths {
    pub const REGISTER: &str = "/rpc/v1/register";
    pub const HEARTBEAT: &str = "/rpc/v1/heartbeat";
    pub const DEREGISTER: &str = "/rpc/v1/deregister";
    pub const PULL_FAILURES: &str = "/rpc/v1/failures/pull";
    pub const REPORT_FAILURE: &str = "/rpc/v1/failures/report";
}

#[async_trait]
pub trait MasterApi: Send + Sync {
    /// Announce a node; rejected when a live node already holds the id
    async fn register(&self, registration: NodeRegistration) -> InjectorResult<()>;

    /// Liveness ping; fails for nodes the master does not know
    async fn heartbeat(&self, heartbeat: Heartbeat) -> InjectorResult<()>;

    /// Remove a node from the master's registry
    async fn deregister(&self, node_id: &str) -> InjectorResult<()>;

    /// Every failure targeting `node_id`, with the master's expected state
    async fn pull_failures(&self, node_id: &str) -> InjectorResult<Vec<WireFailure>>;

    /// Report the node-observed current state of one failure
    async fn report_failure(&self, node_id: &str, failure: WireFailure) -> InjectorResult<()>;
}
