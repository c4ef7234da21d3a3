//! Editing session facade
//!
//! [`FlowSession`] is the one object an editor talks to. It owns the task
//! tree, the active version header, the execution overlay, undo history, the
//! derived graph and variable table, and an [`EventBus`]. Every structural
//! edit is gated (latest version, canvas in EDIT), applied atomically through
//! the mutation engine, recorded for undo, and followed by a rebuild in the
//! same call.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use flow_core::{FlowConfig, FlowSession, ToolRegistry};
//!
//! let registry = Arc::new(ToolRegistry::with_builtins());
//! let mut session = FlowSession::new(registry, FlowConfig::default());
//! let _subscription = session.subscribe(sink);
//! session.update_version(backend.get_workflow("wf", None).await?)?;
//! session.move_task("d", "a", false)?;
//! ```

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::builder::GraphBuilder;
use crate::config::FlowConfig;
use crate::descriptor::ToolDefinition;
use crate::error::{FlowError, Result};
use crate::events::{EventBus, EventSink, FlowEvent, NodeStateChange, Subscription};
use crate::execution::ExecutionRecord;
use crate::graph::FlowGraph;
use crate::mutation::{ensure_acyclic_nesting, InsertPosition};
use crate::nested::Expansions;
use crate::overlay::{
    CanvasState, ChildScope, ExecutionOverlay, NodeExecutionState, OverlayUpdate,
};
use crate::registry::ToolRegistry;
use crate::tree::TaskTree;
use crate::types::{
    BranchKey, CustomData, NodeId, SubWorkflowParam, Task, TaskKind, START_NODE_ID,
    SUB_WORKFLOW_PREFIX,
};
use crate::undo::UndoStack;
use crate::validation::{validate_workflow, ValidationIssue};
use crate::variables::{VariableResolver, WorkflowVariables};
use crate::version::{VersionChange, VersionController, WorkflowVersion};

/// One editing session over one workflow
pub struct FlowSession {
    tree: TaskTree,
    registry: Arc<ToolRegistry>,
    config: FlowConfig,
    versions: VersionController,
    overlay: ExecutionOverlay,
    history: UndoStack,
    graph: FlowGraph,
    variables: WorkflowVariables,
    /// Sub-workflows whose nested definition is laid out inline
    restored: HashSet<NodeId>,
    /// Children of restored sub-workflows resolved from the registry
    expansions: Expansions,
    rebuild_pending: bool,
    bus: EventBus,
}

impl FlowSession {
    /// Create a session editing a new, empty workflow
    pub fn new(registry: Arc<ToolRegistry>, config: FlowConfig) -> Self {
        let graph = GraphBuilder::new(&registry, &config.layout)
            .build(&[])
            .unwrap_or_default();
        let mut history = UndoStack::new(config.history.max_snapshots);
        if let Err(e) = history.push(&[]) {
            log::warn!("Failed to record initial snapshot: {}", e);
        }

        Self {
            tree: TaskTree::default(),
            registry,
            config,
            versions: VersionController::new(),
            overlay: ExecutionOverlay::new(true),
            history,
            graph,
            variables: WorkflowVariables::default(),
            restored: HashSet::new(),
            expansions: Expansions::new(),
            rebuild_pending: false,
            bus: EventBus::new(),
        }
    }

    /// The canonical task list
    pub fn tasks(&self) -> &[Task] {
        self.tree.tasks()
    }

    /// Indexed view of the task list
    pub fn tree(&self) -> &TaskTree {
        &self.tree
    }

    /// Graph as of the last rebuild
    pub fn graph(&self) -> &FlowGraph {
        &self.graph
    }

    /// Variables visible to each node
    pub fn variables(&self) -> &WorkflowVariables {
        &self.variables
    }

    /// Tools known to the session
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Merge fetched tool definitions and rebuild
    ///
    /// Nodes whose tools were unknown before render normally afterwards.
    pub fn register_tools(&mut self, tools: Vec<ToolDefinition>) -> Result<()> {
        Arc::make_mut(&mut self.registry).register_all(tools);
        self.rebuild()
    }

    /// Expose fetched workflows as sub-workflow tools and rebuild
    pub fn register_workflows(&mut self, workflows: &[WorkflowVersion]) -> Result<()> {
        Arc::make_mut(&mut self.registry).register_workflows(workflows);
        self.rebuild()
    }

    /// Workflows named by sub-workflow tasks that have no tool yet
    ///
    /// Definitions of already registered sub-workflows are searched too, so
    /// loading the result repeatedly reaches every nested sub-workflow.
    pub fn unregistered_sub_workflows(&self) -> BTreeSet<String> {
        let mut missing = BTreeSet::new();
        let mut seen = HashSet::new();
        let mut pending = sub_workflow_tools(self.tree.tasks());
        while let Some(tool) = pending.pop() {
            if !seen.insert(tool.clone()) {
                continue;
            }
            if let Some(tasks) = self.registry.sub_workflow_tasks(&tool) {
                pending.extend(sub_workflow_tools(&tasks));
            } else if !self.registry.has_tool(&tool) {
                if let Some(workflow_id) = tool.strip_prefix(SUB_WORKFLOW_PREFIX) {
                    missing.insert(workflow_id.to_string());
                }
            }
        }
        missing
    }

    /// Layout, poll and history settings
    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    /// Loaded version and mutability
    pub fn versions(&self) -> &VersionController {
        &self.versions
    }

    /// Node states and the canvas lock
    pub fn overlay(&self) -> &ExecutionOverlay {
        &self.overlay
    }

    /// Current canvas state
    pub fn canvas_state(&self) -> CanvasState {
        self.overlay.canvas_state()
    }

    /// Execution state of one node, `Idle` if unknown
    pub fn node_state(&self, node_id: &str) -> NodeExecutionState {
        self.overlay.state(node_id)
    }

    /// A batched `update_raw` is waiting for [`flush`](Self::flush)
    pub fn is_rebuild_pending(&self) -> bool {
        self.rebuild_pending
    }

    /// An older snapshot is available
    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    /// An undone snapshot can be restored
    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    /// Whether a sub-workflow node is laid out with its children
    pub fn is_restored(&self, node_id: &str) -> bool {
        self.restored.contains(node_id) || self.expansions.contains(node_id)
    }

    /// Children of restored sub-workflows that come from registered
    /// definitions rather than the task list
    pub fn expansions(&self) -> &Expansions {
        &self.expansions
    }

    /// Attach a sink until the returned guard is dropped
    pub fn subscribe(&self, sink: Arc<dyn EventSink>) -> Subscription {
        self.bus.subscribe(sink)
    }

    /// Forward events into an unbounded channel until the guard is dropped
    pub fn subscribe_channel(&self) -> (Subscription, mpsc::UnboundedReceiver<FlowEvent>) {
        self.bus.subscribe_channel()
    }

    /// The bus events are published on
    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    // ---- versions -------------------------------------------------------

    /// Load a fetched version
    ///
    /// A version-number change hides the canvas, rebuilds and reveals it
    /// again; the first load and same-version refreshes do not.
    pub fn update_version(&mut self, mut workflow: WorkflowVersion) -> Result<VersionChange> {
        let tree = TaskTree::new(std::mem::take(&mut workflow.tasks))?;
        let workflow_id = workflow.workflow_id.clone();
        let version = workflow.version;
        let latest = workflow.is_latest;
        let previous = self.versions.active_version();

        let (change, _) = self.versions.update(workflow);
        let swap = change.is_swap();
        if swap {
            self.versions.begin_swap();
            self.bus.publish(FlowEvent::CanvasVisibility { visible: false });
            self.restored.clear();
            self.expansions.clear();
        }

        self.tree = tree;
        self.prune_restored();
        self.history.clear();
        let recorded = self.history.push(self.tree.tasks());
        if let Some(transition) = self.overlay.set_latest(latest) {
            self.bus.publish(FlowEvent::CanvasStateChanged {
                from: transition.from,
                to: transition.to,
            });
        }
        let rebuilt = self.rebuild();

        self.bus.publish(FlowEvent::VersionChanged {
            workflow_id,
            from: previous,
            to: version,
            read_only: !latest,
        });
        if swap {
            self.versions.end_swap();
            self.bus.publish(FlowEvent::CanvasVisibility { visible: true });
        }

        recorded?;
        rebuilt?;
        Ok(change)
    }

    /// The active version with the current task list, ready to save
    pub fn to_workflow(&self) -> Option<WorkflowVersion> {
        self.versions.to_workflow(self.tree.tasks().to_vec())
    }

    // ---- structural edits ----------------------------------------------

    fn ensure_mutable(&self) -> Result<()> {
        self.versions.ensure_mutable()?;
        self.overlay.lock().ensure_editable()
    }

    /// Run a gated edit, then record and rebuild
    fn edit<R>(&mut self, op: impl FnOnce(&mut TaskTree) -> Result<R>) -> Result<R> {
        let result = self.ensure_mutable().and_then(|()| op(&mut self.tree));
        match result {
            Ok(output) => {
                self.tree.sync_join_targets();
                self.commit()?;
                Ok(output)
            }
            Err(e) => {
                if e.is_user_warning() {
                    log::warn!("Edit rejected: {}", e);
                    self.bus.publish(FlowEvent::warning(e.to_string()));
                }
                Err(e)
            }
        }
    }

    /// Forget restored sub-workflows that left the tree
    fn prune_restored(&mut self) {
        let tree = &self.tree;
        self.restored.retain(|id| tree.contains(id));
        let restored = &self.restored;
        self.expansions.retain_roots(|id| restored.contains(id));
    }

    fn commit(&mut self) -> Result<()> {
        self.prune_restored();
        self.history.push(self.tree.tasks())?;
        self.bus.publish(FlowEvent::TasksChanged {
            task_count: self.tree.len(),
        });
        self.rebuild()
    }

    /// Re-derive the graph and variable table from the task list
    pub fn rebuild(&mut self) -> Result<()> {
        let graph = GraphBuilder::new(&self.registry, &self.config.layout)
            .with_restored(&self.restored)
            .with_expansions(&self.expansions)
            .build(self.tree.tasks())?;
        let variables = VariableResolver::new(&self.registry, self.versions.variables())
            .generate(self.tree.tasks());

        log::debug!(
            "Rebuilt graph: {} nodes, {} edges",
            graph.nodes.len(),
            graph.edges.len()
        );
        self.rebuild_pending = false;
        self.bus.publish(FlowEvent::GraphRebuilt {
            node_count: graph.nodes.len(),
            edge_count: graph.edges.len(),
        });
        self.graph = graph;

        if variables != self.variables {
            self.bus.publish(FlowEvent::VariablesChanged {
                variable_count: variables.variable_count(),
            });
            self.variables = variables;
        }
        Ok(())
    }

    /// Insert `tasks` next to `target`
    pub fn insert(
        &mut self,
        target: &str,
        position: InsertPosition,
        tasks: Vec<Task>,
    ) -> Result<()> {
        let outer: Vec<String> = self
            .versions
            .workflow_id()
            .map(str::to_string)
            .into_iter()
            .collect();
        self.edit(|tree| {
            ensure_acyclic_nesting(&outer, &tasks)?;
            tree.insert(target, position, tasks)
        })
    }

    /// Insert `task` before `target`
    pub fn insert_before(&mut self, target: &str, task: Task) -> Result<()> {
        self.insert(target, InsertPosition::Before, vec![task])
    }

    /// Insert `task` after `target`
    pub fn insert_after(&mut self, target: &str, task: Task) -> Result<()> {
        self.insert(target, InsertPosition::After, vec![task])
    }

    /// Create tasks from a tool and insert them next to `target`
    ///
    /// Returns the reference names of the inserted tasks.
    pub fn insert_tool(
        &mut self,
        target: &str,
        position: InsertPosition,
        tool_name: &str,
    ) -> Result<Vec<NodeId>> {
        let tasks = self.create_task(tool_name)?;
        let ids = tasks.iter().map(|t| t.reference_name.clone()).collect();
        self.insert(target, position, tasks)?;
        Ok(ids)
    }

    /// Move `id` next to `target`
    pub fn move_task(&mut self, id: &str, target: &str, insert_after: bool) -> Result<()> {
        self.edit(|tree| tree.move_task(id, target, insert_after))
    }

    /// Remove `id` and everything nested under it; returns the removed tasks
    pub fn remove(&mut self, id: &str) -> Result<Vec<Task>> {
        self.edit(|tree| tree.remove(id))
    }

    /// Patch a task's JSON
    ///
    /// With `rebuild = false` the patch is applied and recorded but the graph
    /// is left stale until [`flush`](Self::flush), so several patches can be
    /// batched into one rebuild.
    pub fn update_raw(&mut self, id: &str, patch: &Value, rebuild: bool) -> Result<()> {
        if rebuild {
            return self.edit(|tree| tree.update_raw(id, patch));
        }

        if let Err(e) = self.ensure_mutable() {
            self.bus.publish(FlowEvent::warning(e.to_string()));
            return Err(e);
        }
        self.tree.update_raw(id, patch)?;
        self.history.push(self.tree.tasks())?;
        self.rebuild_pending = true;
        self.bus.publish(FlowEvent::RebuildPending {
            node_id: id.to_string(),
        });
        Ok(())
    }

    /// Run the rebuild deferred by batched `update_raw` calls
    pub fn flush(&mut self) -> Result<()> {
        if !self.rebuild_pending {
            return Ok(());
        }
        self.bus.publish(FlowEvent::TasksChanged {
            task_count: self.tree.len(),
        });
        self.rebuild()
    }

    /// Add an empty lane to a fork or a new case to a decision
    pub fn add_branch(&mut self, id: &str) -> Result<BranchKey> {
        self.edit(|tree| tree.add_branch(id))
    }

    /// Step back in history; `false` at the oldest snapshot
    pub fn undo(&mut self) -> Result<bool> {
        self.ensure_mutable()?;
        match self.history.undo() {
            Some(tasks) => self.restore_snapshot(tasks?).map(|()| true),
            None => Ok(false),
        }
    }

    /// Step forward in history; `false` at the newest snapshot
    pub fn redo(&mut self) -> Result<bool> {
        self.ensure_mutable()?;
        match self.history.redo() {
            Some(tasks) => self.restore_snapshot(tasks?).map(|()| true),
            None => Ok(false),
        }
    }

    fn restore_snapshot(&mut self, tasks: Vec<Task>) -> Result<()> {
        self.tree.replace(tasks)?;
        self.prune_restored();
        self.bus.publish(FlowEvent::TasksChanged {
            task_count: self.tree.len(),
        });
        self.rebuild()
    }

    /// Instantiate a tool as new tasks with fresh reference names
    ///
    /// Fork tools yield the fork and its JOIN; every other tool yields one
    /// task. Default input values come from the tool's input schema.
    pub fn create_task(&self, tool_name: &str) -> Result<Vec<Task>> {
        let tool = self
            .registry
            .get(tool_name)
            .ok_or_else(|| FlowError::invalid_target(tool_name, "no such tool"))?;

        let reference = self.fresh_reference(&tool.name, &[]);
        let mut task = Task::new(tool.name.clone(), reference, tool.task_type.clone());
        let inputs = tool.default_inputs();
        if !inputs.is_empty() {
            task.input_parameters = Some(inputs);
        }
        let alias = CustomData {
            icon: tool.icon.clone(),
            title: Some(tool.display_name.clone()),
            description: None,
        };
        task.extra
            .insert(Task::ALIAS_KEY.to_string(), serde_json::to_value(alias)?);

        match task.kind() {
            TaskKind::Fork => {
                task.fork_tasks = Some(vec![Vec::new(), Vec::new()]);
                let join = Task::join(
                    self.fresh_reference("join", &[task.reference_name.as_str()]),
                    Vec::new(),
                );
                return Ok(vec![task, join]);
            }
            TaskKind::Decision => {
                task.decision_cases = Some(IndexMap::from([("case_1".to_string(), Vec::new())]));
                task.default_case = Some(Vec::new());
            }
            TaskKind::Loop => task.loop_over = Some(Vec::new()),
            TaskKind::SubWorkflow => {
                let workflow = tool_name.strip_prefix(SUB_WORKFLOW_PREFIX).map(str::to_string);
                task.sub_workflow_param = Some(SubWorkflowParam {
                    name: workflow,
                    ..SubWorkflowParam::default()
                });
            }
            TaskKind::Simple | TaskKind::Join | TaskKind::Opaque => {}
        }
        Ok(vec![task])
    }

    /// `<name>_<suffix>` not used in the tree nor in `taken`
    fn fresh_reference(&self, name: &str, taken: &[&str]) -> String {
        loop {
            let suffix = Uuid::new_v4().simple().to_string();
            let candidate = format!("{}_{}", name, &suffix[..6]);
            if !self.tree.contains(&candidate) && !taken.contains(&candidate.as_str()) {
                return candidate;
            }
        }
    }

    // ---- view toggles --------------------------------------------------

    /// Lay a sub-workflow's children out inline
    ///
    /// An inline definition is used as is. Otherwise the children come from
    /// the definition registered for the sub-workflow's tool, nested
    /// sub-workflows included; those children are shown but never saved.
    /// A sub-workflow that would contain itself fails with
    /// [`FlowError::SubWorkflowCycle`].
    pub fn restore_sub_workflow(&mut self, id: &str) -> Result<()> {
        let task = self
            .tree
            .get(id)
            .ok_or_else(|| FlowError::UnknownNode(id.to_string()))?;
        if task.kind() != TaskKind::SubWorkflow {
            return Err(FlowError::invalid_target(id, "not a sub-workflow"));
        }
        if self.is_restored(id) {
            return Ok(());
        }

        if task.branches().is_empty() {
            let outer = self.versions.workflow_id();
            if let Err(e) = self.expansions.expand(&self.registry, task, outer) {
                if e.is_user_warning() {
                    log::warn!("Restore rejected: {}", e);
                    self.bus.publish(FlowEvent::warning(e.to_string()));
                }
                return Err(e);
            }
        } else {
            self.restored.insert(id.to_string());
        }
        self.rebuild()
    }

    /// Collapse a restored sub-workflow back to a single node
    pub fn collapse_sub_workflow(&mut self, id: &str) -> Result<()> {
        let inline = self.restored.remove(id);
        let expanded = self.expansions.remove(id);
        if inline || expanded {
            self.rebuild()?;
        }
        Ok(())
    }

    // ---- validation ----------------------------------------------------

    /// Check references, tools and branch structure
    pub fn validate(&self) -> Vec<ValidationIssue> {
        let resolver = VariableResolver::new(&self.registry, self.versions.variables());
        validate_workflow(self.tree.tasks(), &self.registry, &resolver, &self.variables)
    }

    // ---- execution -----------------------------------------------------

    /// Lock the canvas for a start request
    ///
    /// Fails if the workflow is empty or has issues that block execution.
    pub fn request_start(&mut self) -> Result<()> {
        if self.tree.is_empty() {
            return Err(self.reject_start(FlowError::invalid_target(
                START_NODE_ID,
                "workflow is empty",
            )));
        }
        if let Some(issue) = self
            .validate()
            .into_iter()
            .find(ValidationIssue::blocks_execution)
        {
            return Err(self.reject_start(FlowError::invalid_target(
                issue.node_id(),
                issue.to_string(),
            )));
        }

        let update = self.overlay.request_start()?;
        self.publish_overlay(update, false);
        Ok(())
    }

    fn reject_start(&self, error: FlowError) -> FlowError {
        self.bus.publish(FlowEvent::warning(error.to_string()));
        error
    }

    /// The backend rejected the start request; unlock the canvas
    pub fn start_failed(&mut self, message: &str) -> Result<()> {
        let transition = self.overlay.start_failed()?;
        log::warn!("Execution start failed: {}", message);
        self.bus.publish(FlowEvent::CanvasStateChanged {
            from: transition.from,
            to: transition.to,
        });
        self.bus.publish(FlowEvent::warning(message));
        Ok(())
    }

    /// Merge a polled record; returns whether anything changed
    pub fn apply_execution(&mut self, record: ExecutionRecord) -> bool {
        match self.overlay.apply(record) {
            Some(update) => {
                self.publish_overlay(update, true);
                true
            }
            None => false,
        }
    }

    /// Child instances started by sub-workflow tasks in `record`
    ///
    /// `scope` is where `record`'s own tasks are shown (`None` for the run).
    /// Only children whose sub-workflow node is restored are returned, since
    /// a collapsed node has nowhere to show them.
    pub fn child_executions(
        &self,
        record: &ExecutionRecord,
        scope: Option<&ChildScope>,
    ) -> Vec<(ChildScope, String)> {
        record
            .sub_workflow_instances()
            .into_iter()
            .filter_map(|(reference, instance_id)| {
                let node_id = match scope {
                    Some(scope) => scope.node_id(reference),
                    None => reference.to_string(),
                };
                Some((self.child_scope(&node_id)?, instance_id.to_string()))
            })
            .collect()
    }

    fn child_scope(&self, node_id: &str) -> Option<ChildScope> {
        let scoped = if self.expansions.contains(node_id) {
            true
        } else if self.restored.contains(node_id) {
            false
        } else {
            return None;
        };
        Some(ChildScope {
            parent_id: node_id.to_string(),
            scoped,
        })
    }

    /// Merge a polled record of a child instance
    pub fn apply_child_execution(&mut self, scope: ChildScope, record: ExecutionRecord) -> bool {
        match self.overlay.apply_child(scope, record) {
            Some(update) => {
                self.publish_overlay(update, true);
                true
            }
            None => false,
        }
    }

    /// Stop showing an instance's states; returns whether it was shown
    pub fn remove_execution(&mut self, instance_id: &str) -> bool {
        match self.overlay.remove_execution(instance_id) {
            Some(update) => {
                log::debug!("Removed execution '{}' from the overlay", instance_id);
                self.publish_overlay(update, true);
                true
            }
            None => false,
        }
    }

    /// Polling gave up; the overlay keeps its last good state
    pub fn poll_failed(&self, instance_id: &str, attempts: u32, message: &str) {
        log::warn!(
            "Polling '{}' failed after {} attempts: {}",
            instance_id,
            attempts,
            message
        );
        self.bus.publish(FlowEvent::PollFailed {
            instance_id: instance_id.to_string(),
            attempts,
            message: message.to_string(),
        });
    }

    /// Show a past execution's states; the canvas is READONLY until closed
    pub fn inspect_execution(&mut self, record: ExecutionRecord) -> Result<()> {
        let update = self.overlay.inspect(record)?;
        self.publish_overlay(update, true);
        Ok(())
    }

    /// Leave inspection of a past execution
    pub fn close_inspection(&mut self) {
        let update = self.overlay.close_inspection();
        self.publish_overlay(update, false);
    }

    /// Elapsed run time in milliseconds, frozen once the run ended
    pub fn elapsed_ms(&self) -> Option<i64> {
        self.overlay.timer().elapsed_now()
    }

    fn publish_overlay(&self, update: OverlayUpdate, always: bool) {
        if always || !update.changed.is_empty() {
            self.bus.publish(FlowEvent::ExecutionUpdated {
                instance_id: update.instance_id.clone(),
                status: update.status.clone(),
                changed: update
                    .changed
                    .iter()
                    .map(|(node_id, state)| NodeStateChange {
                        node_id: node_id.clone(),
                        state: *state,
                    })
                    .collect(),
            });
        }
        for transition in &update.canvas {
            self.bus.publish(FlowEvent::CanvasStateChanged {
                from: transition.from,
                to: transition.to,
            });
        }
    }
}

/// Tool names of every sub-workflow task in `tasks`, nested ones included
fn sub_workflow_tools(tasks: &[Task]) -> Vec<String> {
    let mut tools = Vec::new();
    for task in tasks {
        task.walk(&mut |task| {
            if task.kind() == TaskKind::SubWorkflow {
                tools.push(task.name.clone());
            }
        });
    }
    tools
}

impl std::fmt::Debug for FlowSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowSession")
            .field("workflow_id", &self.versions.workflow_id())
            .field("version", &self.versions.active_version())
            .field("tasks", &self.tree.len())
            .field("canvas", &self.canvas_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ToolProperty;
    use crate::events::VecEventSink;
    use crate::execution::{ExecutionStatus, TaskExecution, TaskStatus};
    use crate::types::TaskType;
    use serde_json::json;

    fn registry() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        for name in ["a", "b", "c", "d"] {
            registry.register(
                ToolDefinition::new(name, name.to_uppercase(), "test")
                    .with_output(ToolProperty::optional("text", "Text", "string")),
            );
        }
        registry.register(
            ToolDefinition::new("llm", "LLM", "text")
                .with_input(
                    ToolProperty::optional("temperature", "Temp", "number")
                        .with_default(json!(0.7)),
                ),
        );
        registry.register(
            ToolDefinition::new("fork_join", "Parallel", "control")
                .with_task_type(TaskType::ForkJoin),
        );
        Arc::new(registry)
    }

    fn scenario() -> Vec<Task> {
        vec![
            Task::simple("a"),
            Task::fork("fork", vec![vec![Task::simple("b")], vec![Task::simple("c")]]),
            Task::join("join", vec!["b".into(), "c".into()]),
            Task::simple("d"),
        ]
    }

    fn session_with(version: WorkflowVersion) -> (FlowSession, Arc<VecEventSink>, Subscription) {
        let mut session = FlowSession::new(registry(), FlowConfig::default());
        session.update_version(version).unwrap();
        let sink = Arc::new(VecEventSink::new());
        let subscription = session.subscribe(sink.clone());
        (session, sink, subscription)
    }

    fn loaded() -> (FlowSession, Arc<VecEventSink>, Subscription) {
        session_with(WorkflowVersion::new("wf", 1).with_tasks(scenario()))
    }

    #[test]
    fn test_new_session_has_start_and_end() {
        let session = FlowSession::new(registry(), FlowConfig::default());
        assert_eq!(session.graph().nodes.len(), 2);
        assert_eq!(session.canvas_state(), CanvasState::Edit);
    }

    #[test]
    fn test_edit_rebuilds_and_publishes() {
        let (mut session, sink, _sub) = loaded();
        session.insert_after("a", Task::simple("a2")).unwrap();

        assert!(session.graph().find_node("a2").is_some());
        let events = sink.events();
        assert!(matches!(events[0], FlowEvent::TasksChanged { task_count: 7 }));
        assert!(events
            .iter()
            .any(|e| matches!(e, FlowEvent::GraphRebuilt { .. })));
    }

    #[test]
    fn test_read_only_version_rejects_edits() {
        let (mut session, sink, _sub) =
            session_with(WorkflowVersion::new("wf", 1).with_tasks(scenario()).with_latest(false));

        assert_eq!(session.canvas_state(), CanvasState::Readonly);
        let err = session.remove("d").unwrap_err();
        assert!(matches!(err, FlowError::ReadOnlyVersion { version: 1 }));
        assert_eq!(session.tasks().len(), 4);
        assert!(matches!(sink.events()[0], FlowEvent::Warning { .. }));
    }

    #[test]
    fn test_cycle_is_a_warning_and_a_no_op() {
        let (mut session, sink, _sub) = loaded();
        let before = session.tasks().to_vec();
        let err = session.move_task("fork", "b", true).unwrap_err();

        assert!(matches!(err, FlowError::StructuralCycle { .. }));
        assert_eq!(session.tasks(), before.as_slice());
        assert_eq!(sink.events().len(), 1);
    }

    #[test]
    fn test_batched_update_raw_waits_for_flush() {
        let (mut session, sink, _sub) = loaded();
        session
            .update_raw("a", &json!({"__alias": {"title": "First"}}), false)
            .unwrap();
        session
            .update_raw("d", &json!({"__alias": {"title": "Last"}}), false)
            .unwrap();

        assert!(session.is_rebuild_pending());
        assert_eq!(session.graph().find_node("a").unwrap().custom_data.title, None);

        session.flush().unwrap();
        assert!(!session.is_rebuild_pending());
        assert_eq!(
            session.graph().find_node("a").unwrap().custom_data.title.as_deref(),
            Some("First")
        );
        let pending = sink
            .events()
            .iter()
            .filter(|e| matches!(e, FlowEvent::RebuildPending { .. }))
            .count();
        assert_eq!(pending, 2);
    }

    #[test]
    fn test_undo_redo() {
        let (mut session, _sink, _sub) = loaded();
        session.remove("d").unwrap();
        assert_eq!(session.tasks().len(), 3);

        assert!(session.undo().unwrap());
        assert_eq!(session.tasks().len(), 4);
        assert!(session.graph().find_node("d").is_some());

        assert!(session.redo().unwrap());
        assert_eq!(session.tasks().len(), 3);
        assert!(!session.redo().unwrap());
    }

    #[test]
    fn test_version_swap_hides_and_reveals_canvas() {
        let (mut session, sink, _sub) = loaded();
        let change = session
            .update_version(WorkflowVersion::new("wf", 2).with_tasks(vec![Task::simple("z")]))
            .unwrap();
        assert_eq!(change, VersionChange::Swapped { from: 1, to: 2 });

        let events = sink.events();
        assert_eq!(events.first(), Some(&FlowEvent::CanvasVisibility { visible: false }));
        assert_eq!(events.last(), Some(&FlowEvent::CanvasVisibility { visible: true }));
        assert!(!session.can_undo());
        assert!(!session.versions().is_swapping());
    }

    #[test]
    fn test_same_version_refresh_keeps_canvas_visible() {
        let (mut session, sink, _sub) = loaded();
        session
            .update_version(WorkflowVersion::new("wf", 1).with_tasks(scenario()))
            .unwrap();
        assert!(!sink
            .events()
            .iter()
            .any(|e| matches!(e, FlowEvent::CanvasVisibility { .. })));
    }

    #[test]
    fn test_create_task_from_tools() {
        let (session, _sink, _sub) = loaded();

        let llm = session.create_task("llm").unwrap();
        assert_eq!(llm.len(), 1);
        assert!(llm[0].reference_name.starts_with("llm_"));
        assert_eq!(llm[0].input_parameters.as_ref().unwrap()["temperature"], json!(0.7));
        assert_eq!(llm[0].custom_data().unwrap().title.as_deref(), Some("LLM"));

        let fork = session.create_task("fork_join").unwrap();
        assert_eq!(fork.len(), 2);
        assert_eq!(fork[0].kind(), TaskKind::Fork);
        assert_eq!(fork[1].kind(), TaskKind::Join);

        assert!(session.create_task("nope").is_err());
    }

    #[test]
    fn test_insert_tool_keeps_join_in_sync() {
        let (mut session, _sink, _sub) = loaded();
        let ids = session
            .insert_tool("d", InsertPosition::After, "fork_join")
            .unwrap();
        let placeholder = crate::tree::placeholder_id(&ids[0], &BranchKey::Lane(0));
        session.insert_after(&placeholder, Task::simple("inner")).unwrap();

        let join = session.tree().get(&ids[1]).unwrap();
        assert_eq!(join.join_on, Some(vec!["inner".to_string()]));
    }

    #[test]
    fn test_start_blocked_by_empty_branch() {
        let (mut session, sink, _sub) = session_with(
            WorkflowVersion::new("wf", 1).with_tasks(vec![
                Task::fork("fork", vec![vec![Task::simple("b")], vec![]]),
                Task::join("join", vec!["b".into()]),
            ]),
        );
        assert!(session.request_start().is_err());
        assert_eq!(session.canvas_state(), CanvasState::Edit);
        assert!(matches!(sink.events()[0], FlowEvent::Warning { .. }));
    }

    #[test]
    fn test_run_locks_editing() {
        let (mut session, _sink, _sub) = loaded();
        session.request_start().unwrap();
        assert!(matches!(
            session.remove("d"),
            Err(FlowError::CanvasLocked(CanvasState::WaitToRunning))
        ));

        session.start_failed("backend unavailable").unwrap();
        assert_eq!(session.canvas_state(), CanvasState::Edit);
        session.remove("d").unwrap();
    }

    #[test]
    fn test_execution_updates_publish_once_per_change() {
        let (mut session, sink, _sub) = loaded();
        session.request_start().unwrap();
        sink.clear();

        let record = ExecutionRecord::new("inst", ExecutionStatus::Running)
            .with_task(TaskExecution::new("b", TaskStatus::InProgress));
        assert!(session.apply_execution(record.clone()));
        assert!(!session.apply_execution(record));

        let updates = sink
            .events()
            .iter()
            .filter(|e| matches!(e, FlowEvent::ExecutionUpdated { .. }))
            .count();
        assert_eq!(updates, 1);
        assert_eq!(session.node_state("b"), NodeExecutionState::Running);
    }

    #[test]
    fn test_restore_sub_workflow_toggles_layout() {
        let inline = Task::sub_workflow("sub", "child", Some(vec![Task::simple("inner")]));
        let (mut session, _sink, _sub) =
            session_with(WorkflowVersion::new("wf", 1).with_tasks(vec![inline]));
        assert!(session.graph().find_node("inner").is_none());

        session.restore_sub_workflow("sub").unwrap();
        assert!(session.graph().find_node("inner").is_some());

        session.collapse_sub_workflow("sub").unwrap();
        assert!(session.graph().find_node("inner").is_none());
        assert!(session.restore_sub_workflow("missing").is_err());
    }

    fn with_sub_workflow(workflow: &str) -> (FlowSession, Arc<VecEventSink>, Subscription) {
        session_with(WorkflowVersion::new("wf", 1).with_tasks(vec![
            Task::simple("a"),
            Task::sub_workflow("sw", workflow, None),
        ]))
    }

    #[test]
    fn test_restore_fills_children_from_registered_definition() {
        let (mut session, _sink, _sub) = with_sub_workflow("child");
        session
            .register_workflows(&[WorkflowVersion::new("child", 1)
                .with_tasks(vec![Task::simple("a"), Task::simple("b")])])
            .unwrap();
        let saved = session.tasks().to_vec();

        session.restore_sub_workflow("sw").unwrap();
        assert!(session.is_restored("sw"));
        let nested = session.graph().find_node("sw/a").unwrap();
        assert_eq!(nested.parent_id.as_deref(), Some("sw"));
        assert!(session.graph().find_node("a").is_some());
        assert_eq!(session.tasks(), saved.as_slice());

        // Edits elsewhere keep the expansion
        session.insert_after("a", Task::simple("a2")).unwrap();
        assert!(session.graph().find_node("sw/b").is_some());

        session.collapse_sub_workflow("sw").unwrap();
        assert!(session.graph().find_node("sw/a").is_none());
        assert!(session.expansions().is_empty());
    }

    #[test]
    fn test_restore_without_any_definition_is_rejected() {
        let (mut session, _sink, _sub) = with_sub_workflow("child");
        let err = session.restore_sub_workflow("sw").unwrap_err();
        assert!(matches!(err, FlowError::InvalidTarget { .. }));
        assert!(!session.is_restored("sw"));
    }

    #[test]
    fn test_restore_rejects_workflow_containing_itself() {
        let (mut session, sink, _sub) = with_sub_workflow("wf");
        let definition = WorkflowVersion::new("wf", 1).with_tasks(vec![Task::simple("a")]);
        session.register_workflows(&[definition]).unwrap();
        sink.clear();

        let err = session.restore_sub_workflow("sw").unwrap_err();
        assert!(matches!(
            err,
            FlowError::SubWorkflowCycle { ref workflow, .. } if workflow == "wf"
        ));
        assert!(!session.is_restored("sw"));
        assert!(matches!(sink.events()[0], FlowEvent::Warning { .. }));
    }

    #[test]
    fn test_restore_rejects_indirect_self_reference() {
        let (mut session, _sink, _sub) = with_sub_workflow("child");
        session
            .register_workflows(&[
                WorkflowVersion::new("child", 1)
                    .with_tasks(vec![Task::sub_workflow("to_grand", "grand", None)]),
                WorkflowVersion::new("grand", 1)
                    .with_tasks(vec![Task::sub_workflow("to_child", "child", None)]),
            ])
            .unwrap();

        let err = session.restore_sub_workflow("sw").unwrap_err();
        assert!(matches!(err, FlowError::SubWorkflowCycle { .. }));
        assert!(session.expansions().is_empty());
    }

    #[test]
    fn test_insert_rejects_call_to_the_open_workflow() {
        let (mut session, _sink, _sub) = loaded();
        let err = session
            .insert_after("a", Task::sub_workflow("again", "wf", None))
            .unwrap_err();
        assert!(matches!(err, FlowError::SubWorkflowCycle { .. }));
        assert!(!session.tree().contains("again"));
    }

    #[test]
    fn test_unregistered_sub_workflows_follow_definitions() {
        let (mut session, _sink, _sub) = with_sub_workflow("child");
        assert_eq!(
            session.unregistered_sub_workflows().into_iter().collect::<Vec<_>>(),
            vec!["child".to_string()]
        );

        session
            .register_workflows(&[WorkflowVersion::new("child", 1)
                .with_tasks(vec![Task::sub_workflow("to_grand", "grand", None)])])
            .unwrap();
        assert_eq!(
            session.unregistered_sub_workflows().into_iter().collect::<Vec<_>>(),
            vec!["grand".to_string()]
        );
        assert_eq!(
            session.graph().find_node("sw").unwrap().tool_status,
            crate::graph::ToolStatus::Known
        );
    }

    #[test]
    fn test_child_execution_fills_expanded_nodes() {
        let (mut session, _sink, _sub) = with_sub_workflow("child");
        session
            .register_workflows(&[WorkflowVersion::new("child", 1)
                .with_tasks(vec![Task::simple("x")])])
            .unwrap();
        session.restore_sub_workflow("sw").unwrap();

        let run = ExecutionRecord::new("inst", ExecutionStatus::Running)
            .with_task(TaskExecution::new("a", TaskStatus::Completed))
            .with_task(
                TaskExecution::new("sw", TaskStatus::InProgress)
                    .with_output("subWorkflowId", json!("child-1")),
            );
        let children = session.child_executions(&run, None);
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].1, "child-1");
        session.request_start().unwrap();
        session.apply_execution(run);

        let (scope, _) = children.into_iter().next().unwrap();
        let child = ExecutionRecord::new("child-1", ExecutionStatus::Running)
            .with_task(TaskExecution::new("x", TaskStatus::InProgress));
        assert!(session.apply_child_execution(scope, child));
        assert_eq!(session.node_state("sw/x"), NodeExecutionState::Running);
        assert_eq!(session.node_state("x"), NodeExecutionState::Idle);

        assert!(session.remove_execution("child-1"));
        assert_eq!(session.node_state("sw/x"), NodeExecutionState::Idle);
    }

    #[test]
    fn test_validate_reports_dangling_reference() {
        let mut tasks = scenario();
        tasks[3] = Task::simple("d").with_input("x", json!("${gone.output.text}"));
        let (session, _sink, _sub) = session_with(WorkflowVersion::new("wf", 1).with_tasks(tasks));

        let issues = session.validate();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].node_id(), "d");
    }
}
