//! Execution records returned by the orchestrator
//!
//! An [`ExecutionRecord`] is a transient snapshot of one workflow instance.
//! It is replaced wholesale on every poll and never written back.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum $name {
            $($variant,)+
            /// Unrecognised status, kept verbatim
            Other(String),
        }

        impl $name {
            /// Wire name
            pub fn as_str(&self) -> &str {
                match self {
                    $($name::$variant => $text,)+
                    $name::Other(other) => other,
                }
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                match value.as_str() {
                    $($text => $name::$variant,)+
                    _ => $name::Other(value),
                }
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                match value {
                    $name::Other(other) => other,
                    known => known.as_str().to_string(),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum! {
    /// Status of a whole workflow instance
    ExecutionStatus {
        Running => "RUNNING",
        Paused => "PAUSED",
        Completed => "COMPLETED",
        Failed => "FAILED",
        Terminated => "TERMINATED",
        Canceled => "CANCELED",
        TimedOut => "TIMED_OUT",
    }
}

impl ExecutionStatus {
    /// The instance will not change any more
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Terminated
                | ExecutionStatus::Canceled
                | ExecutionStatus::TimedOut
        )
    }

    /// The instance is executing or suspended mid-run
    pub fn is_active(&self) -> bool {
        matches!(self, ExecutionStatus::Running | ExecutionStatus::Paused)
    }
}

string_enum! {
    /// Status of one task inside an instance
    TaskStatus {
        Scheduled => "SCHEDULED",
        InProgress => "IN_PROGRESS",
        Paused => "PAUSED",
        Completed => "COMPLETED",
        CompletedWithErrors => "COMPLETED_WITH_ERRORS",
        Failed => "FAILED",
        FailedWithTerminalError => "FAILED_WITH_TERMINAL_ERROR",
        Canceled => "CANCELED",
        TimedOut => "TIMED_OUT",
        Skipped => "SKIPPED",
    }
}

/// Output key under which a SUB_WORKFLOW task reports its child instance
pub const SUB_WORKFLOW_ID_KEY: &str = "subWorkflowId";

/// One task entry of an execution record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecution {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_task_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_data: Option<Map<String, Value>>,
    /// The task definition this entry executed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_task: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskExecution {
    /// Entry for `reference_name` in `status`
    pub fn new(reference_name: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            reference_task_name: Some(reference_name.into()),
            status: Some(status),
            start_time: None,
            end_time: None,
            output_data: None,
            workflow_task: None,
            extra: Map::new(),
        }
    }

    /// Set one output field
    pub fn with_output(mut self, key: impl Into<String>, value: Value) -> Self {
        self.output_data
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    /// Child instance started by a sub-workflow task
    ///
    /// Only reported once the task is scheduled, running or completed.
    pub fn sub_workflow_instance(&self) -> Option<&str> {
        let started = matches!(
            self.status,
            Some(TaskStatus::Scheduled | TaskStatus::InProgress | TaskStatus::Completed)
        );
        if !started {
            return None;
        }
        self.output_data.as_ref()?.get(SUB_WORKFLOW_ID_KEY)?.as_str()
    }

    /// Reference name of the executed task
    ///
    /// Falls back to `workflowTask.taskReferenceName` for records that omit
    /// the top-level field.
    pub fn reference_name(&self) -> Option<&str> {
        self.reference_task_name.as_deref().or_else(|| {
            self.workflow_task
                .as_ref()?
                .get("taskReferenceName")?
                .as_str()
        })
    }
}

/// Snapshot of one workflow instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    /// Instance id
    #[serde(rename = "workflowId")]
    pub instance_id: String,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(default)]
    pub tasks: Vec<TaskExecution>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ExecutionRecord {
    /// Record for `instance_id` with no tasks
    pub fn new(instance_id: impl Into<String>, status: ExecutionStatus) -> Self {
        Self {
            instance_id: instance_id.into(),
            status,
            start_time: None,
            end_time: None,
            tasks: Vec::new(),
            extra: Map::new(),
        }
    }

    /// Append a task entry
    pub fn with_task(mut self, task: TaskExecution) -> Self {
        self.tasks.push(task);
        self
    }

    /// Set start and end times in epoch milliseconds
    pub fn with_times(mut self, start_time: Option<i64>, end_time: Option<i64>) -> Self {
        self.start_time = start_time;
        self.end_time = end_time;
        self
    }

    /// The workflow reached a final status
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Latest entry per reference name
    ///
    /// Retried and looped tasks appear several times; the last entry wins.
    pub fn per_task_status(&self) -> BTreeMap<&str, &TaskExecution> {
        let mut latest = BTreeMap::new();
        for task in &self.tasks {
            if let Some(name) = task.reference_name() {
                latest.insert(name, task);
            }
        }
        latest
    }

    /// `(reference name, child instance id)` for each task that started a
    /// sub-workflow instance
    pub fn sub_workflow_instances(&self) -> Vec<(&str, &str)> {
        self.per_task_status()
            .into_iter()
            .filter_map(|(name, task)| Some((name, task.sub_workflow_instance()?)))
            .collect()
    }
}
