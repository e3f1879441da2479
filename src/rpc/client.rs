use async_trait::async_trait;
use prost::Message;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

use super::{paths, ErrorBody, MasterApi, PROTOBUF_CONTENT_TYPE};
use crate::error::{InjectorError, InjectorResult};
use crate::failure::wire::{FailureReport, Heartbeat, NodeRef, NodeRegistration, WireFailure, WireFailureList};

/// `MasterApi` over HTTP, protobuf-encoded request and response bodies
#[derive(Clone)]
pub struct HttpMasterClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpMasterClient {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> InjectorResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| InjectorError::Transport(format!("cannot build http client: {}", e)))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn call<M: Message>(&self, path: &str, message: &M) -> InjectorResult<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        debug!("POST {}", url);
        let response = self
            .http
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, PROTOBUF_CONTENT_TYPE)
            .body(message.encode_to_vec())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(match serde_json::from_str::<ErrorBody>(&body) {
            Ok(error) => match error.kind.as_str() {
                "registration" => InjectorError::Registration(error.detail),
                "node_not_found" => InjectorError::NodeNotFound(error.detail),
                _ => InjectorError::Transport(format!("{} returned {}: {}", path, status, error.error)),
            },
            Err(_) if status == StatusCode::NOT_FOUND => InjectorError::Transport(format!("{} is not served", path)),
            Err(_) => InjectorError::Transport(format!("{} returned {}: {}", path, status, body)),
        })
    }
}

#[async_trait]
impl MasterApi for HttpMasterClient {
    async fn register(&self, registration: NodeRegistration) -> InjectorResult<()> {
        self.call(paths::REGISTER, &registration).await?;
        Ok(())
    }

    async fn heartbeat(&self, heartbeat: Heartbeat) -> InjectorResult<()> {
        self.call(paths::HEARTBEAT, &heartbeat).await?;
        Ok(())
    }

    async fn deregister(&self, node_id: &str) -> InjectorResult<()> {
        let message = NodeRef { node_id: node_id.to_string() };
        self.call(paths::DEREGISTER, &message).await?;
        Ok(())
    }

    async fn pull_failures(&self, node_id: &str) -> InjectorResult<Vec<WireFailure>> {
        let message = NodeRef { node_id: node_id.to_string() };
        let response = self.call(paths::PULL_FAILURES, &message).await?;
        let body = response.bytes().await?;
        Ok(WireFailureList::decode(body)?.failures)
    }

    async fn report_failure(&self, node_id: &str, failure: WireFailure) -> InjectorResult<()> {
        let message = FailureReport {
            reporter_node_id: node_id.to_string(),
            failure: Some(failure),
        };
        self.call(paths::REPORT_FAILURE, &message).await?;
        Ok(())
    }
}
