//! Core types for workflow task lists
//!
//! A workflow is a list of orchestrator-compatible [`Task`]s. Composite tasks
//! (fork, decision, loop, sub-workflow) own nested task lists called
//! branches. Only the fields the engine reasons about are typed; every other
//! field is kept verbatim in [`Task::extra`] so a definition round-trips
//! through any edit without losing orchestrator-specific settings.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Unique identifier for a node (equal to a task's reference name)
pub type NodeId = String;

/// Id of the implicit start pseudo-node
pub const START_NODE_ID: &str = "workflow_start";

/// Id of the implicit end pseudo-node
pub const END_NODE_ID: &str = "workflow_end";

/// Pseudo reference under which workflow inputs are addressed
pub const WORKFLOW_REFERENCE: &str = "workflow";

/// Tool-name prefix of tools that invoke another workflow
pub const SUB_WORKFLOW_PREFIX: &str = "sub_workflow_";

/// Orchestrator task type, as written in the task's `type` field
///
/// Known spellings map to dedicated variants; anything else is carried as
/// [`TaskType::Other`] with its original string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskType {
    #[default]
    Simple,
    ForkJoin,
    Fork,
    Join,
    Switch,
    Decision,
    SubWorkflow,
    DoWhile,
    Other(String),
}

impl TaskType {
    /// The structural kind used for layout, mutation and scoping
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskType::Simple => TaskKind::Simple,
            TaskType::ForkJoin | TaskType::Fork => TaskKind::Fork,
            TaskType::Join => TaskKind::Join,
            TaskType::Switch | TaskType::Decision => TaskKind::Decision,
            TaskType::SubWorkflow => TaskKind::SubWorkflow,
            TaskType::DoWhile => TaskKind::Loop,
            TaskType::Other(_) => TaskKind::Opaque,
        }
    }

    /// Wire name, e.g. `FORK_JOIN`
    pub fn as_str(&self) -> &str {
        match self {
            TaskType::Simple => "SIMPLE",
            TaskType::ForkJoin => "FORK_JOIN",
            TaskType::Fork => "FORK",
            TaskType::Join => "JOIN",
            TaskType::Switch => "SWITCH",
            TaskType::Decision => "DECISION",
            TaskType::SubWorkflow => "SUB_WORKFLOW",
            TaskType::DoWhile => "DO_WHILE",
            TaskType::Other(other) => other,
        }
    }
}

impl From<String> for TaskType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "SIMPLE" => TaskType::Simple,
            "FORK_JOIN" => TaskType::ForkJoin,
            "FORK" => TaskType::Fork,
            "JOIN" => TaskType::Join,
            "SWITCH" => TaskType::Switch,
            "DECISION" => TaskType::Decision,
            "SUB_WORKFLOW" => TaskType::SubWorkflow,
            "DO_WHILE" => TaskType::DoWhile,
            _ => TaskType::Other(value),
        }
    }
}

impl From<TaskType> for String {
    fn from(value: TaskType) -> Self {
        match value {
            TaskType::Other(other) => other,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structural kind of a task
///
/// Every place that lays out, edits or scopes tasks dispatches on this enum,
/// so adding a kind is a compile-time checked change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Plain step
    Simple,
    /// Parallel lanes merged by the JOIN that follows
    Fork,
    /// Merge point of the preceding fork
    Join,
    /// One lane per case plus a default lane
    Decision,
    /// Reference to another workflow, optionally carrying its definition
    SubWorkflow,
    /// Loop whose body is a single lane
    Loop,
    /// Unrecognised type, laid out like a simple step
    Opaque,
}

impl TaskKind {
    /// Whether this kind owns nested task lists
    pub fn is_composite(&self) -> bool {
        matches!(
            self,
            TaskKind::Fork | TaskKind::Decision | TaskKind::SubWorkflow | TaskKind::Loop
        )
    }
}

/// Identifies one nested task list inside a composite task
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "key", rename_all = "camelCase")]
pub enum BranchKey {
    /// Top-level task list
    Root,
    /// Fork lane by index
    Lane(usize),
    /// Decision case by name
    Case(String),
    /// Decision default case
    Default,
    /// Loop body
    Loop,
    /// Inline definition of a sub-workflow
    Nested,
}

impl fmt::Display for BranchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchKey::Root => f.write_str("root"),
            BranchKey::Lane(index) => write!(f, "lane-{}", index),
            BranchKey::Case(name) => write!(f, "case-{}", name),
            BranchKey::Default => f.write_str("default"),
            BranchKey::Loop => f.write_str("loop"),
            BranchKey::Nested => f.write_str("nested"),
        }
    }
}

/// Editor metadata stored on a task under `__alias`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Inline workflow definition carried by a sub-workflow task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `subWorkflowParam` of a sub-workflow task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubWorkflowParam {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_definition: Option<WorkflowDefinition>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One orchestrator task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Tool name, used to look up the task's ToolDefinition
    pub name: String,
    /// Globally unique id of this task within the workflow
    #[serde(rename = "taskReferenceName")]
    pub reference_name: String,
    #[serde(rename = "type", default)]
    pub task_type: TaskType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_parameters: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fork_tasks: Option<Vec<Vec<Task>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_on: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_cases: Option<IndexMap<String, Vec<Task>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_case: Option<Vec<Task>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_over: Option<Vec<Task>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_workflow_param: Option<SubWorkflowParam>,
    /// Fields the engine does not interpret, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Task {
    /// Key under which editor metadata lives in the task JSON
    pub const ALIAS_KEY: &'static str = "__alias";

    /// Create a task of the given type
    pub fn new(
        name: impl Into<String>,
        reference_name: impl Into<String>,
        task_type: TaskType,
    ) -> Self {
        Self {
            name: name.into(),
            reference_name: reference_name.into(),
            task_type,
            input_parameters: None,
            fork_tasks: None,
            join_on: None,
            decision_cases: None,
            default_case: None,
            loop_over: None,
            sub_workflow_param: None,
            extra: Map::new(),
        }
    }

    /// Create a SIMPLE task whose tool name equals its reference name
    pub fn simple(reference_name: impl Into<String>) -> Self {
        let reference_name = reference_name.into();
        Self::new(reference_name.clone(), reference_name, TaskType::Simple)
    }

    /// Create a FORK_JOIN task with the given lanes
    pub fn fork(reference_name: impl Into<String>, lanes: Vec<Vec<Task>>) -> Self {
        let mut task = Self::new("fork_join", reference_name, TaskType::ForkJoin);
        task.fork_tasks = Some(lanes);
        task
    }

    /// Create a JOIN task waiting on the given reference names
    pub fn join(reference_name: impl Into<String>, join_on: Vec<String>) -> Self {
        let mut task = Self::new("join", reference_name, TaskType::Join);
        task.join_on = Some(join_on);
        task
    }

    /// Create a SWITCH task with the given cases and default lane
    pub fn decision(
        reference_name: impl Into<String>,
        cases: impl IntoIterator<Item = (String, Vec<Task>)>,
        default_case: Vec<Task>,
    ) -> Self {
        let mut task = Self::new("switch", reference_name, TaskType::Switch);
        task.decision_cases = Some(cases.into_iter().collect());
        task.default_case = Some(default_case);
        task
    }

    /// Create a DO_WHILE task with the given body
    pub fn do_while(reference_name: impl Into<String>, body: Vec<Task>) -> Self {
        let mut task = Self::new("do_while", reference_name, TaskType::DoWhile);
        task.loop_over = Some(body);
        task
    }

    /// Create a SUB_WORKFLOW task, optionally carrying the nested definition
    pub fn sub_workflow(
        reference_name: impl Into<String>,
        workflow_name: impl Into<String>,
        nested: Option<Vec<Task>>,
    ) -> Self {
        let workflow_name = workflow_name.into();
        let mut task = Self::new(
            format!("{}{}", SUB_WORKFLOW_PREFIX, workflow_name),
            reference_name,
            TaskType::SubWorkflow,
        );
        task.sub_workflow_param = Some(SubWorkflowParam {
            name: Some(workflow_name),
            version: None,
            workflow_definition: nested.map(|tasks| WorkflowDefinition {
                tasks,
                extra: Map::new(),
            }),
            extra: Map::new(),
        });
        task
    }

    /// Set an input parameter
    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.input_parameters
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    /// Structural kind of the task
    pub fn kind(&self) -> TaskKind {
        self.task_type.kind()
    }

    /// Editor metadata from `__alias`, if present and well-formed
    pub fn custom_data(&self) -> Option<CustomData> {
        self.extra
            .get(Self::ALIAS_KEY)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Nested task lists in layout order
    ///
    /// Decision tasks always report a default lane, even when `defaultCase`
    /// is absent from the JSON.
    pub fn branches(&self) -> Vec<(BranchKey, &[Task])> {
        match self.kind() {
            TaskKind::Fork => self
                .fork_tasks
                .iter()
                .flatten()
                .enumerate()
                .map(|(index, lane)| (BranchKey::Lane(index), lane.as_slice()))
                .collect(),
            TaskKind::Decision => {
                let mut branches: Vec<(BranchKey, &[Task])> = self
                    .decision_cases
                    .iter()
                    .flatten()
                    .map(|(name, lane)| (BranchKey::Case(name.clone()), lane.as_slice()))
                    .collect();
                branches.push((
                    BranchKey::Default,
                    self.default_case.as_deref().unwrap_or(&[]),
                ));
                branches
            }
            TaskKind::Loop => vec![(BranchKey::Loop, self.loop_over.as_deref().unwrap_or(&[]))],
            TaskKind::SubWorkflow => self
                .sub_workflow_param
                .as_ref()
                .and_then(|param| param.workflow_definition.as_ref())
                .map(|definition| vec![(BranchKey::Nested, definition.tasks.as_slice())])
                .unwrap_or_default(),
            TaskKind::Simple | TaskKind::Join | TaskKind::Opaque => Vec::new(),
        }
    }

    /// Mutable access to one nested task list
    ///
    /// Missing optional containers (`defaultCase`, `loopOver`) are created on
    /// demand so an insert into an empty lane has somewhere to go.
    pub fn branch_mut(&mut self, key: &BranchKey) -> Option<&mut Vec<Task>> {
        match (self.kind(), key) {
            (TaskKind::Fork, BranchKey::Lane(index)) => {
                self.fork_tasks.as_mut().and_then(|lanes| lanes.get_mut(*index))
            }
            (TaskKind::Decision, BranchKey::Case(name)) => self
                .decision_cases
                .as_mut()
                .and_then(|cases| cases.get_mut(name)),
            (TaskKind::Decision, BranchKey::Default) => {
                Some(self.default_case.get_or_insert_with(Vec::new))
            }
            (TaskKind::Loop, BranchKey::Loop) => Some(self.loop_over.get_or_insert_with(Vec::new)),
            (TaskKind::SubWorkflow, BranchKey::Nested) => self
                .sub_workflow_param
                .as_mut()
                .and_then(|param| param.workflow_definition.as_mut())
                .map(|definition| &mut definition.tasks),
            _ => None,
        }
    }

    /// Workflow invoked by a SUB_WORKFLOW task
    ///
    /// `subWorkflowParam.name` wins; otherwise the tool name minus its
    /// `sub_workflow_` prefix.
    pub fn sub_workflow_name(&self) -> Option<&str> {
        if self.kind() != TaskKind::SubWorkflow {
            return None;
        }
        self.sub_workflow_param
            .as_ref()
            .and_then(|param| param.name.as_deref())
            .or_else(|| self.name.strip_prefix(SUB_WORKFLOW_PREFIX))
    }

    /// Visit this task and every nested task, depth first
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Task)) {
        visit(self);
        for (_, lane) in self.branches() {
            for child in lane {
                child.walk(visit);
            }
        }
    }

    /// Reference names of this task and everything nested under it
    pub fn reference_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.walk(&mut |task| names.push(task.reference_name.as_str()));
        names
    }

    /// Number of tasks in this subtree, including this one
    pub fn subtree_len(&self) -> usize {
        let mut count = 0;
        self.walk(&mut |_| count += 1);
        count
    }
}

/// Count every task in a list, nested ones included
pub fn count_tasks(tasks: &[Task]) -> usize {
    tasks.iter().map(Task::subtree_len).sum()
}
