//! Master HTTP Surface
//!
//! Two faces over one [`Master`]:
//! - `/rpc/v1/*` protobuf bodies, used by node agents through `HttpMasterClient`
//! - `/api/v1/*` JSON for operators, with `labelSelector` filtering and
//!   `watch=true` streaming failure events as Server-Sent Events

use axum::{
    body::Bytes,
    extract::{Json, Path, Query, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Router,
};
use prost::Message;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::MasterConfig;
use crate::error::InjectorError;
use crate::failure::wire::{FailureReport, Heartbeat, NodeRef, NodeRegistration, WireFailureList};
use crate::failure::{parse_definition, Failure, FailureState, FailureTransformer, Metadata};
use crate::master::{FailureEvent, LabelSelector, Master, Node};
use crate::rpc::{paths, ErrorBody, MasterApi, PROTOBUF_CONTENT_TYPE};

const WATCH_BUFFER: usize = 64;

// ─── Error mapping ───────────────────────────────────────────────────────────

pub struct ServerError {
    status: StatusCode,
    body: ErrorBody,
}

impl ServerError {
    fn bad_request(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorBody {
                error: message.clone(),
                kind: "validation".to_string(),
                detail: message,
            },
        }
    }
}

impl From<InjectorError> for ServerError {
    fn from(err: InjectorError) -> Self {
        let (status, kind, detail) = match &err {
            e if e.is_validation() => (StatusCode::BAD_REQUEST, "validation", e.to_string()),
            InjectorError::Registration(reason) => (StatusCode::CONFLICT, "registration", reason.clone()),
            InjectorError::DuplicateFailure { .. } => (StatusCode::CONFLICT, "duplicate_failure", err.to_string()),
            InjectorError::NodeNotFound(node_id) => (StatusCode::NOT_FOUND, "node_not_found", node_id.clone()),
            InjectorError::FailureNotFound { .. } => (StatusCode::NOT_FOUND, "failure_not_found", err.to_string()),
            InjectorError::NotOwner { .. } => (StatusCode::FORBIDDEN, "not_owner", err.to_string()),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string()),
        };
        Self {
            status,
            body: ErrorBody {
                error: err.to_string(),
                kind: kind.to_string(),
                detail,
            },
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!("Request failed: {}", self.body.error);
        }
        (self.status, Json(self.body)).into_response()
    }
}

type ApiResult<T> = Result<T, ServerError>;

// ─── Protobuf bodies ─────────────────────────────────────────────────────────

struct Protobuf<M>(M);

impl<M: Message> IntoResponse for Protobuf<M> {
    fn into_response(self) -> Response {
        ([(header::CONTENT_TYPE, PROTOBUF_CONTENT_TYPE)], self.0.encode_to_vec()).into_response()
    }
}

fn decode<M: Message + Default>(body: Bytes) -> ApiResult<M> {
    M::decode(body).map_err(|e| ServerError::bad_request(format!("malformed message: {}", e)))
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn build_router(master: Arc<Master>) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route(paths::REGISTER, post(rpc_register))
        .route(paths::HEARTBEAT, post(rpc_heartbeat))
        .route(paths::DEREGISTER, post(rpc_deregister))
        .route(paths::PULL_FAILURES, post(rpc_pull_failures))
        .route(paths::REPORT_FAILURE, post(rpc_report_failure))
        .route("/api/v1/nodes", get(list_nodes))
        .route("/api/v1/nodes/{node}", get(get_node))
        .route("/api/v1/failures", get(list_failures).post(create_failure))
        .route("/api/v1/drift", get(list_drift))
        .route(
            "/api/v1/nodes/{node}/failures/{id}",
            get(get_failure).put(update_failure).delete(delete_failure),
        )
        .route("/api/v1/nodes/{node}/failures/{id}/apply", post(apply_failure))
        .route("/api/v1/nodes/{node}/failures/{id}/revert", post(revert_failure))
        .layer(TraceLayer::new_for_http())
        .with_state(master)
}

/// Serve `master` on `listener` until `shutdown` fires
pub async fn serve(listener: TcpListener, master: Arc<Master>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let app = build_router(master);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

/// Master process: sweeper plus HTTP server, until Ctrl-C
pub async fn run_master_server(config: MasterConfig) -> anyhow::Result<()> {
    let master = Arc::new(Master::new(config.policy, Arc::new(FailureTransformer::new())));
    let shutdown = CancellationToken::new();

    let sweeper = {
        let master = Arc::clone(&master);
        let shutdown = shutdown.clone();
        let interval = config.sweep_interval;
        tokio::spawn(async move { master.run_sweeper(interval, shutdown).await })
    };

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
            }
            shutdown.cancel();
        });
    }

    let listener = TcpListener::bind(&config.listen).await?;
    info!("Master listening at http://{}", listener.local_addr()?);
    let served = serve(listener, master, shutdown.clone()).await;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        warn!("Sweeper task ended abnormally: {}", e);
    }
    served
}

// ─── RPC handlers ────────────────────────────────────────────────────────────

async fn rpc_register(State(master): State<Arc<Master>>, body: Bytes) -> ApiResult<StatusCode> {
    let registration: NodeRegistration = decode(body)?;
    master.register(registration).await?;
    Ok(StatusCode::OK)
}

async fn rpc_heartbeat(State(master): State<Arc<Master>>, body: Bytes) -> ApiResult<StatusCode> {
    let heartbeat: Heartbeat = decode(body)?;
    master.heartbeat(heartbeat).await?;
    Ok(StatusCode::OK)
}

async fn rpc_deregister(State(master): State<Arc<Master>>, body: Bytes) -> ApiResult<StatusCode> {
    let node: NodeRef = decode(body)?;
    master.deregister(&node.node_id).await?;
    Ok(StatusCode::OK)
}

async fn rpc_pull_failures(State(master): State<Arc<Master>>, body: Bytes) -> ApiResult<Protobuf<WireFailureList>> {
    let node: NodeRef = decode(body)?;
    let failures = master.pull_failures(&node.node_id).await?;
    Ok(Protobuf(WireFailureList { failures }))
}

async fn rpc_report_failure(State(master): State<Arc<Master>>, body: Bytes) -> ApiResult<StatusCode> {
    let report: FailureReport = decode(body)?;
    let failure = report
        .failure
        .ok_or_else(|| ServerError::bad_request("report carries no failure"))?;
    master.report_failure(&report.reporter_node_id, failure).await?;
    Ok(StatusCode::OK)
}

// ─── REST handlers ───────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    #[serde(default)]
    label_selector: Option<String>,
    #[serde(default)]
    watch: bool,
}

impl ListQuery {
    fn selector(&self) -> ApiResult<LabelSelector> {
        match &self.label_selector {
            Some(text) => Ok(LabelSelector::parse(text)?),
            None => Ok(LabelSelector::everything()),
        }
    }
}

/// New failure: `definition` is a `spec:`-rooted document
#[derive(Debug, Deserialize)]
pub struct CreateFailureRequest {
    pub id: String,
    pub node_id: String,
    pub definition: String,
    #[serde(default = "default_expected")]
    pub expected_state: FailureState,
}

fn default_expected() -> FailureState {
    FailureState::Disabled
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateFailureRequest {
    #[serde(default)]
    pub definition: Option<String>,
    #[serde(default)]
    pub expected_state: Option<FailureState>,
}

async fn list_nodes(State(master): State<Arc<Master>>, Query(query): Query<ListQuery>) -> ApiResult<Json<Vec<Node>>> {
    let selector = query.selector()?;
    Ok(Json(master.list_nodes(&selector).await))
}

async fn get_node(State(master): State<Arc<Master>>, Path(node): Path<String>) -> ApiResult<Json<Node>> {
    Ok(Json(master.get_node(&node).await?))
}

async fn list_failures(State(master): State<Arc<Master>>, Query(query): Query<ListQuery>) -> ApiResult<Response> {
    let selector = query.selector()?;
    if query.watch {
        return Ok(watch_failures(master, selector).await.into_response());
    }
    Ok(Json(master.list_failures(&selector).await).into_response())
}

async fn list_drift(State(master): State<Arc<Master>>) -> Json<Vec<Failure>> {
    Json(master.drifted().await)
}

async fn create_failure(
    State(master): State<Arc<Master>>,
    Json(request): Json<CreateFailureRequest>,
) -> ApiResult<(StatusCode, Json<Failure>)> {
    let spec = parse_definition(&request.definition)?;
    let created = master
        .create_failure(Metadata::new(request.id, request.node_id), spec, request.expected_state)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_failure(
    State(master): State<Arc<Master>>,
    Path((node, id)): Path<(String, String)>,
) -> ApiResult<Json<Failure>> {
    Ok(Json(master.get_failure(&node, &id).await?))
}

async fn update_failure(
    State(master): State<Arc<Master>>,
    Path((node, id)): Path<(String, String)>,
    Json(request): Json<UpdateFailureRequest>,
) -> ApiResult<Json<Failure>> {
    let spec = request.definition.as_deref().map(parse_definition).transpose()?;
    let updated = master
        .update_failure(&node, &id, spec, request.expected_state)
        .await?;
    Ok(Json(updated))
}

async fn delete_failure(
    State(master): State<Arc<Master>>,
    Path((node, id)): Path<(String, String)>,
) -> ApiResult<Json<Failure>> {
    Ok(Json(master.delete_failure(&node, &id).await?))
}

async fn apply_failure(
    State(master): State<Arc<Master>>,
    Path((node, id)): Path<(String, String)>,
) -> ApiResult<Json<Failure>> {
    Ok(Json(master.apply(&node, &id).await?))
}

async fn revert_failure(
    State(master): State<Arc<Master>>,
    Path((node, id)): Path<(String, String)>,
) -> ApiResult<Json<Failure>> {
    Ok(Json(master.revert(&node, &id).await?))
}

// ─── Watch ───────────────────────────────────────────────────────────────────

/// Current matching failures as `created` events, then every later change
async fn watch_failures(master: Arc<Master>, selector: LabelSelector) -> impl IntoResponse {
    let (tx, rx) = mpsc::channel(WATCH_BUFFER);
    // Subscribe before the snapshot so no change falls in between
    let mut events = master.subscribe();
    let snapshot = master.list_failures(&selector).await;

    tokio::spawn(async move {
        for failure in snapshot {
            if !forward(&tx, &FailureEvent::Created(failure)).await {
                return;
            }
        }
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Watcher lagged, {} event(s) skipped", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if !selector.is_empty() {
                match master.get_node(event.failure().node_id()).await {
                    Ok(node) if selector.matches(&node.labels) => {}
                    _ => continue,
                }
            }
            if !forward(&tx, &event).await {
                break;
            }
        }
        debug!("Watcher closed");
    });

    Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default())
}

/// Push one event to the watcher; false once the client has gone away
async fn forward(tx: &mpsc::Sender<Result<Event, Infallible>>, event: &FailureEvent) -> bool {
    match Event::default().event(event.kind()).json_data(event) {
        Ok(sse) => tx.send(Ok(sse)).await.is_ok(),
        Err(e) => {
            warn!("Cannot encode watch event: {}", e);
            true
        }
    }
}
