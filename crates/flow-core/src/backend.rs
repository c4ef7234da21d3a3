//! Orchestrator backend seam
//!
//! Everything the flow core needs from the orchestrator goes through
//! [`WorkflowBackend`]. The engine itself never performs I/O; the driver and
//! the poller call into a backend and feed the results into a session.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::descriptor::ToolDefinition;
use crate::error::Result;
use crate::execution::{ExecutionRecord, ExecutionStatus};
use crate::types::Task;
use crate::version::WorkflowVersion;

/// Body of a start request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    #[serde(default)]
    pub input_data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

impl StartRequest {
    /// Start `version` with no inputs
    pub fn new(version: u32) -> Self {
        Self {
            input_data: Map::new(),
            version: Some(version),
        }
    }

    /// Add one workflow input
    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.input_data.insert(key.into(), value);
        self
    }
}

/// Body of a debug request: run an unsaved task list
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugRequest {
    #[serde(default)]
    pub input_data: Map<String, Value>,
    pub tasks: Vec<Task>,
}

/// Reply to start and debug requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStarted {
    pub workflow_instance_id: String,
}

/// Page selector for searches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { page: 1, limit: 10 }
    }
}

/// Filter for past executions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSearchRequest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workflow_id: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub status: Vec<ExecutionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time_from: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time_to: Option<i64>,
    #[serde(default)]
    pub pagination: Pagination,
}

impl ExecutionSearchRequest {
    /// Search the executions of one workflow
    pub fn for_workflow(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: vec![workflow_id.into()],
            ..Self::default()
        }
    }

    /// Only executions in `status`
    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.status.push(status);
        self
    }

    /// Select a 1-based page of `limit` items
    pub fn with_page(mut self, page: u32, limit: u32) -> Self {
        self.pagination = Pagination { page, limit };
        self
    }
}

/// One page of search results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSearchPage {
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub limit: u32,
    #[serde(default)]
    pub total: u64,
    /// Definitions of the workflows the executions belong to
    #[serde(default)]
    pub definitions: Vec<WorkflowVersion>,
    #[serde(default, rename = "data")]
    pub executions: Vec<ExecutionRecord>,
}

impl ExecutionSearchPage {
    /// Definition an execution ran against, matched by workflow id
    pub fn definition(&self, workflow_id: &str) -> Option<&WorkflowVersion> {
        self.definitions
            .iter()
            .find(|definition| definition.workflow_id == workflow_id)
    }

    /// Pages after this one exist
    pub fn has_more(&self) -> bool {
        u64::from(self.page) * u64::from(self.limit) < self.total
    }
}

/// Async calls the flow core makes against the orchestrator
///
/// Start, debug, pause, resume and terminate are fire-and-forget from the
/// session's point of view: node states only change when polled data says so.
#[async_trait]
pub trait WorkflowBackend: Send + Sync {
    /// Start a saved version; returns the new instance id
    async fn start_execution(&self, workflow_id: &str, request: &StartRequest)
        -> Result<ExecutionStarted>;

    /// Run an unsaved task list
    async fn debug_execution(&self, workflow_id: &str, request: &DebugRequest)
        -> Result<ExecutionStarted>;

    async fn get_execution(&self, instance_id: &str) -> Result<ExecutionRecord>;

    async fn terminate_execution(&self, instance_id: &str) -> Result<()>;

    async fn pause_execution(&self, instance_id: &str) -> Result<()>;

    async fn resume_execution(&self, instance_id: &str) -> Result<()>;

    async fn search_executions(&self, request: &ExecutionSearchRequest)
        -> Result<ExecutionSearchPage>;

    /// Fetch a version; `None` fetches the latest
    async fn get_workflow(&self, workflow_id: &str, version: Option<u32>)
        -> Result<WorkflowVersion>;

    /// Persist an edited version
    async fn save_workflow(&self, workflow: &WorkflowVersion) -> Result<()>;

    /// Tool definitions available to the team
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>>;
}
