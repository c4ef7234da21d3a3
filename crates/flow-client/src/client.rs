//! `reqwest` implementation of [`WorkflowBackend`]

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::Value;

use flow_core::backend::{
    DebugRequest, ExecutionSearchPage, ExecutionSearchRequest, ExecutionStarted, StartRequest,
    WorkflowBackend,
};
use flow_core::{ExecutionRecord, ToolDefinition, WorkflowVersion};

use crate::config::HttpBackendConfig;
use crate::error::ClientError;

/// Header carrying the team id
pub const TEAM_HEADER: &str = "x-monkeys-teamid";

/// Orchestrator client over HTTP
#[derive(Debug, Clone)]
pub struct HttpBackend {
    config: HttpBackendConfig,
    http_client: reqwest::Client,
}

impl HttpBackend {
    /// Build the HTTP client with the configured headers and timeout
    pub fn new(config: HttpBackendConfig) -> Result<Self, ClientError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| ClientError::Config(format!("invalid token: {}", e)))?;
            headers.insert(AUTHORIZATION, value);
        }
        if let Some(team_id) = &config.team_id {
            let value = HeaderValue::from_str(team_id)
                .map_err(|e| ClientError::Config(format!("invalid team id: {}", e)))?;
            headers.insert(HeaderName::from_static(TEAM_HEADER), value);
        }

        let http_client = reqwest::Client::builder()
            .timeout(config.timeout())
            .default_headers(headers)
            .build()?;

        Ok(Self {
            config,
            http_client,
        })
    }

    /// Connection settings
    pub fn config(&self) -> &HttpBackendConfig {
        &self.config
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = self.config.url(path);
        log::debug!("{} {}", method, url);
        self.http_client.request(method, url)
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ClientError> {
        let body = self.execute(request).await?;
        serde_json::from_value(unwrap_envelope(body))
            .map_err(|e| ClientError::Decode(e.to_string()))
    }

    /// Send and check the status; an empty body decodes as `null`
    async fn execute(&self, request: RequestBuilder) -> Result<Value, ClientError> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            log::warn!("Orchestrator answered {}: {}", status, body);
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| ClientError::Decode(e.to_string()))
    }
}

/// Strip the `{code, data}` envelope the API wraps replies in
fn unwrap_envelope(body: Value) -> Value {
    match body {
        Value::Object(mut map) if map.contains_key("code") && map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

#[async_trait]
impl WorkflowBackend for HttpBackend {
    async fn start_execution(
        &self,
        workflow_id: &str,
        request: &StartRequest,
    ) -> flow_core::Result<ExecutionStarted> {
        let path = format!("/executions/{}/start", workflow_id);
        Ok(self
            .fetch(self.request(Method::POST, &path).json(request))
            .await?)
    }

    async fn debug_execution(
        &self,
        workflow_id: &str,
        request: &DebugRequest,
    ) -> flow_core::Result<ExecutionStarted> {
        let path = format!("/executions/{}/debug", workflow_id);
        let body: Value = self
            .fetch(self.request(Method::POST, &path).json(request))
            .await?;
        // The debug endpoint may answer with the bare instance id
        let started = match body {
            Value::String(workflow_instance_id) => ExecutionStarted {
                workflow_instance_id,
            },
            other => serde_json::from_value(other).map_err(|e| ClientError::Decode(e.to_string()))?,
        };
        Ok(started)
    }

    async fn get_execution(&self, instance_id: &str) -> flow_core::Result<ExecutionRecord> {
        let path = format!("/executions/{}", instance_id);
        Ok(self.fetch(self.request(Method::GET, &path)).await?)
    }

    async fn terminate_execution(&self, instance_id: &str) -> flow_core::Result<()> {
        let path = format!("/executions/{}/terminate", instance_id);
        self.execute(self.request(Method::POST, &path)).await?;
        Ok(())
    }

    async fn pause_execution(&self, instance_id: &str) -> flow_core::Result<()> {
        let path = format!("/executions/{}/pause", instance_id);
        self.execute(self.request(Method::POST, &path)).await?;
        Ok(())
    }

    async fn resume_execution(&self, instance_id: &str) -> flow_core::Result<()> {
        let path = format!("/executions/{}/resume", instance_id);
        self.execute(self.request(Method::POST, &path)).await?;
        Ok(())
    }

    async fn search_executions(
        &self,
        request: &ExecutionSearchRequest,
    ) -> flow_core::Result<ExecutionSearchPage> {
        Ok(self
            .fetch(self.request(Method::POST, "/executions/search").json(request))
            .await?)
    }

    async fn get_workflow(
        &self,
        workflow_id: &str,
        version: Option<u32>,
    ) -> flow_core::Result<WorkflowVersion> {
        let path = format!("/metadata/{}", workflow_id);
        let mut request = self.request(Method::GET, &path);
        if let Some(version) = version {
            request = request.query(&[("version", version)]);
        }
        Ok(self.fetch(request).await?)
    }

    async fn save_workflow(&self, workflow: &WorkflowVersion) -> flow_core::Result<()> {
        let path = format!("/metadata/{}", workflow.workflow_id);
        self.execute(self.request(Method::PUT, &path).json(workflow))
            .await?;
        Ok(())
    }

    async fn list_tools(&self) -> flow_core::Result<Vec<ToolDefinition>> {
        Ok(self.fetch(self.request(Method::GET, "/tools")).await?)
    }
}
