//! Active workflow version tracking
//!
//! Exactly one [`WorkflowVersion`] is active per session. The controller keeps
//! the version header (id, number, outputs, inputs, latest flag); the task list
//! itself is handed to the session's task tree so there is a single copy.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::descriptor::ToolProperty;
use crate::error::{FlowError, Result};
use crate::types::Task;

fn default_latest() -> bool {
    true
}

/// One entry of a workflow's output mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputMapping {
    pub key: String,
    /// Expression producing the value, e.g. `${summarise.output.text}`
    pub value: String,
}

/// A fetched workflow definition at one version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowVersion {
    pub workflow_id: String,
    pub version: u32,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub output: Vec<OutputMapping>,
    /// Workflow input fields
    #[serde(default)]
    pub variables: Vec<ToolProperty>,
    #[serde(default = "default_latest")]
    pub is_latest: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WorkflowVersion {
    /// Create an empty latest version
    pub fn new(workflow_id: impl Into<String>, version: u32) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            version,
            tasks: Vec::new(),
            output: Vec::new(),
            variables: Vec::new(),
            is_latest: true,
            display_name: None,
            description: None,
            icon_url: None,
            extra: Map::new(),
        }
    }

    /// Replace the task list
    pub fn with_tasks(mut self, tasks: Vec<Task>) -> Self {
        self.tasks = tasks;
        self
    }

    /// Mark the version as latest or historical
    pub fn with_latest(mut self, is_latest: bool) -> Self {
        self.is_latest = is_latest;
        self
    }
}

/// Outcome of [`VersionController::update`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionChange {
    /// First version loaded in this session
    Initial { version: u32 },
    /// Same version number, refreshed in place
    InPlace { version: u32 },
    /// Version number changed; the canvas must be swapped behind a guard
    Swapped { from: u32, to: u32 },
}

impl VersionChange {
    /// The version number changed
    pub fn is_swap(&self) -> bool {
        matches!(self, VersionChange::Swapped { .. })
    }
}

/// Tracks the active version and gates mutation on it
#[derive(Debug, Default)]
pub struct VersionController {
    /// Header of the active version; its `tasks` are always empty
    active: Option<WorkflowVersion>,
    swapping: bool,
}

impl VersionController {
    /// Controller with nothing loaded
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the active version, returning what changed and the task list
    pub fn update(&mut self, mut workflow: WorkflowVersion) -> (VersionChange, Vec<Task>) {
        let tasks = std::mem::take(&mut workflow.tasks);
        let change = match &self.active {
            None => VersionChange::Initial {
                version: workflow.version,
            },
            Some(active)
                if active.version == workflow.version
                    && active.workflow_id == workflow.workflow_id =>
            {
                VersionChange::InPlace {
                    version: workflow.version,
                }
            }
            Some(active) => VersionChange::Swapped {
                from: active.version,
                to: workflow.version,
            },
        };

        if let VersionChange::Swapped { from, to } = change {
            log::info!(
                "Swapping workflow '{}' from version {} to {}",
                workflow.workflow_id,
                from,
                to
            );
        }

        self.active = Some(workflow);
        (change, tasks)
    }

    /// Header of the active version
    pub fn active(&self) -> Option<&WorkflowVersion> {
        self.active.as_ref()
    }

    /// Number of the loaded version
    pub fn active_version(&self) -> Option<u32> {
        self.active.as_ref().map(|active| active.version)
    }

    /// Id of the loaded workflow
    pub fn workflow_id(&self) -> Option<&str> {
        self.active.as_ref().map(|active| active.workflow_id.as_str())
    }

    /// Whether the active version may be edited
    ///
    /// A session without a loaded version edits a new, unsaved workflow.
    pub fn is_latest_workflow_version(&self) -> bool {
        self.active.as_ref().map_or(true, |active| active.is_latest)
    }

    /// Fail with `ReadOnlyVersion` unless the active version is latest
    pub fn ensure_mutable(&self) -> Result<()> {
        match &self.active {
            Some(active) if !active.is_latest => Err(FlowError::ReadOnlyVersion {
                version: active.version,
            }),
            _ => Ok(()),
        }
    }

    /// Workflow inputs of the active version
    pub fn variables(&self) -> &[ToolProperty] {
        self.active
            .as_ref()
            .map(|active| active.variables.as_slice())
            .unwrap_or(&[])
    }

    /// Reassemble the active version around the given task list for saving
    pub fn to_workflow(&self, tasks: Vec<Task>) -> Option<WorkflowVersion> {
        self.active.as_ref().map(|active| WorkflowVersion {
            tasks,
            ..active.clone()
        })
    }

    pub(crate) fn begin_swap(&mut self) {
        self.swapping = true;
    }

    pub(crate) fn end_swap(&mut self) {
        self.swapping = false;
    }

    /// True only while a guarded swap is rebuilding the graph
    pub fn is_swapping(&self) -> bool {
        self.swapping
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_first_update_is_initial() {
        let mut controller = VersionController::new();
        let (change, tasks) = controller
            .update(WorkflowVersion::new("wf", 1).with_tasks(vec![Task::simple("a")]));

        assert_eq!(change, VersionChange::Initial { version: 1 });
        assert_eq!(tasks.len(), 1);
        assert!(controller.active().unwrap().tasks.is_empty());
    }

    #[test]
    fn test_same_version_updates_in_place() {
        let mut controller = VersionController::new();
        controller.update(WorkflowVersion::new("wf", 2));
        let (change, _) = controller.update(WorkflowVersion::new("wf", 2));
        assert_eq!(change, VersionChange::InPlace { version: 2 });
        assert!(!change.is_swap());
    }

    #[test]
    fn test_version_change_is_swap() {
        let mut controller = VersionController::new();
        controller.update(WorkflowVersion::new("wf", 2));
        let (change, _) = controller.update(WorkflowVersion::new("wf", 1).with_latest(false));
        assert_eq!(change, VersionChange::Swapped { from: 2, to: 1 });
    }

    #[test]
    fn test_non_latest_is_read_only() {
        let mut controller = VersionController::new();
        assert!(controller.ensure_mutable().is_ok());

        controller.update(WorkflowVersion::new("wf", 1).with_latest(false));
        assert!(!controller.is_latest_workflow_version());
        assert!(matches!(
            controller.ensure_mutable(),
            Err(FlowError::ReadOnlyVersion { version: 1 })
        ));
    }

    #[test]
    fn test_missing_is_latest_defaults_to_true() {
        let version: WorkflowVersion = serde_json::from_value(json!({
            "workflowId": "wf",
            "version": 3,
            "tasks": [],
            "teamId": "t-1"
        }))
        .unwrap();
        assert!(version.is_latest);
        assert_eq!(version.extra["teamId"], json!("t-1"));
    }

    #[test]
    fn test_to_workflow_reattaches_tasks() {
        let mut controller = VersionController::new();
        controller.update(WorkflowVersion::new("wf", 4));
        let workflow = controller.to_workflow(vec![Task::simple("x")]).unwrap();
        assert_eq!(workflow.version, 4);
        assert_eq!(workflow.tasks[0].reference_name, "x");
    }
}
