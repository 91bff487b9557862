//! Orchestrator clients
//!
//! The worker talks to the orchestrator through [`OrchestratorClient`]. The
//! HTTP client is used by the `anvil-worker` binary; the local client calls
//! an in-process [`Orchestrator`] and is what the integration tests use.

use crate::error::{Result, WorkerError};
use anvil_crd::{
    ActionStatusReport, DataMetadata, DataUpload, MetadataPayload, WorkflowAction,
    WorkflowContext, WorkflowData,
};
use anvil_workflow::{ErrorBody, ErrorCode, Orchestrator};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Calls the worker makes against the orchestrator
#[async_trait]
pub trait OrchestratorClient: Send + Sync {
    /// Contexts whose next action is addressed to `worker_id`
    async fn get_workflow_contexts(&self, worker_id: &str) -> Result<Vec<WorkflowContext>>;

    /// The live context of one workflow
    async fn get_workflow_context(&self, workflow_id: &str) -> Result<WorkflowContext>;

    /// The immutable action list
    async fn get_workflow_actions(&self, workflow_id: &str) -> Result<Vec<WorkflowAction>>;

    /// Report an action transition; returns the committed context
    async fn report_action_status(&self, report: &ActionStatusReport) -> Result<WorkflowContext>;

    /// Fetch a data version; 0 means latest
    async fn get_workflow_data(&self, workflow_id: &str, version: u32) -> Result<WorkflowData>;

    /// Append a data version
    async fn update_workflow_data(
        &self,
        workflow_id: &str,
        metadata: serde_json::Value,
        data: Vec<u8>,
    ) -> Result<DataMetadata>;
}

/// HTTP/JSON client for a remote orchestrator
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    base: Url,
}

impl HttpClient {
    /// Create a client for `server_url` (e.g. `http://10.0.0.1:42111`)
    pub fn new(server_url: &str) -> Result<Self> {
        let base = Url::parse(server_url)
            .map_err(|e| WorkerError::Config(format!("invalid server url '{}': {}", server_url, e)))?;
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self { client, base })
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| WorkerError::Config(format!("{} cannot be a base url", self.base)))?
            .pop_if_empty()
            .extend(["api", "v1"])
            .extend(segments);
        Ok(url)
    }
}

/// Decode a success body, or turn an error body back into a [`WorkerError`]
async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }

    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&body) {
        Ok(err) => Err(err.into()),
        Err(_) => Err(WorkerError::Rpc {
            code: ErrorCode::from_http_status(status.as_u16()),
            message: format!("{}: {}", status, body),
        }),
    }
}

#[async_trait]
impl OrchestratorClient for HttpClient {
    async fn get_workflow_contexts(&self, worker_id: &str) -> Result<Vec<WorkflowContext>> {
        let url = self.url(&["workers", worker_id, "contexts"])?;
        debug!(url = %url, "Polling workflow contexts");
        decode(self.client.get(url).send().await?).await
    }

    async fn get_workflow_context(&self, workflow_id: &str) -> Result<WorkflowContext> {
        let url = self.url(&["workflows", workflow_id, "context"])?;
        decode(self.client.get(url).send().await?).await
    }

    async fn get_workflow_actions(&self, workflow_id: &str) -> Result<Vec<WorkflowAction>> {
        let url = self.url(&["workflows", workflow_id, "actions"])?;
        decode(self.client.get(url).send().await?).await
    }

    async fn report_action_status(&self, report: &ActionStatusReport) -> Result<WorkflowContext> {
        let url = self.url(&["workflows", &report.workflow_id, "report"])?;
        decode(self.client.post(url).json(report).send().await?).await
    }

    async fn get_workflow_data(&self, workflow_id: &str, version: u32) -> Result<WorkflowData> {
        let url = self.url(&["workflows", workflow_id, "data"])?;
        let request = self.client.get(url).query(&[("version", version)]);
        decode(request.send().await?).await
    }

    async fn update_workflow_data(
        &self,
        workflow_id: &str,
        metadata: serde_json::Value,
        data: Vec<u8>,
    ) -> Result<DataMetadata> {
        let url = self.url(&["workflows", workflow_id, "data"])?;
        let body = DataUpload {
            metadata: MetadataPayload::Value(metadata),
            data,
        };
        decode(self.client.put(url).json(&body).send().await?).await
    }
}

/// Client for an orchestrator in the same process
#[derive(Clone)]
pub struct LocalClient {
    orchestrator: Arc<Orchestrator>,
}

impl LocalClient {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl OrchestratorClient for LocalClient {
    async fn get_workflow_contexts(&self, worker_id: &str) -> Result<Vec<WorkflowContext>> {
        Ok(self.orchestrator.get_workflow_contexts(worker_id).await?)
    }

    async fn get_workflow_context(&self, workflow_id: &str) -> Result<WorkflowContext> {
        Ok(self.orchestrator.get_workflow_context(workflow_id).await?)
    }

    async fn get_workflow_actions(&self, workflow_id: &str) -> Result<Vec<WorkflowAction>> {
        Ok(self.orchestrator.get_workflow_actions(workflow_id).await?)
    }

    async fn report_action_status(&self, report: &ActionStatusReport) -> Result<WorkflowContext> {
        Ok(self
            .orchestrator
            .report_action_status(report.clone())
            .await?)
    }

    async fn get_workflow_data(&self, workflow_id: &str, version: u32) -> Result<WorkflowData> {
        Ok(self
            .orchestrator
            .get_workflow_data(workflow_id, version)
            .await?)
    }

    async fn update_workflow_data(
        &self,
        workflow_id: &str,
        metadata: serde_json::Value,
        data: Vec<u8>,
    ) -> Result<DataMetadata> {
        Ok(self
            .orchestrator
            .update_workflow_data(workflow_id, metadata, data)
            .await?)
    }
}
