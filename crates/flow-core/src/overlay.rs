//! Execution overlay and canvas lock
//!
//! The overlay maps polled [`ExecutionRecord`]s onto per-node execution
//! states without touching the task list. Poll data is authoritative: node
//! states are recomputed wholesale from every record, never set
//! optimistically when a start/pause/resume request is sent. Child instances
//! started by sub-workflow tasks are tracked next to the run and fill the
//! nodes of restored sub-workflows.
//!
//! The [`CanvasLock`] arbitrates whether the canvas may be edited:
//!
//! ```text
//! EDIT -> WAIT_TO_RUNNING -> RUNNING -> EDIT      (latest version)
//!                                   \-> READONLY  (older version)
//! ```
//!
//! A rejected start rolls WAIT_TO_RUNNING back to the state held before the
//! request. READONLY is also forced for non-latest versions and while a
//! historical execution is inspected.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::execution::{ExecutionRecord, ExecutionStatus, TaskStatus};
use crate::nested::nested_node_id;
use crate::types::{NodeId, END_NODE_ID, START_NODE_ID};

/// Execution state of one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeExecutionState {
    #[default]
    Idle,
    Scheduled,
    Running,
    Paused,
    Completed,
    Failed,
    Canceled,
    TimedOut,
}

impl NodeExecutionState {
    /// Map an orchestrator task status, given the instance's status
    pub fn from_task(status: &TaskStatus, workflow: &ExecutionStatus) -> Self {
        match status {
            TaskStatus::Scheduled => NodeExecutionState::Scheduled,
            TaskStatus::InProgress if *workflow == ExecutionStatus::Paused => {
                NodeExecutionState::Paused
            }
            TaskStatus::InProgress => NodeExecutionState::Running,
            TaskStatus::Paused => NodeExecutionState::Paused,
            TaskStatus::Completed | TaskStatus::CompletedWithErrors | TaskStatus::Skipped => {
                NodeExecutionState::Completed
            }
            TaskStatus::Failed | TaskStatus::FailedWithTerminalError => NodeExecutionState::Failed,
            TaskStatus::Canceled => NodeExecutionState::Canceled,
            TaskStatus::TimedOut => NodeExecutionState::TimedOut,
            TaskStatus::Other(_) => NodeExecutionState::Idle,
        }
    }

    /// Completed, failed, canceled or timed out
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeExecutionState::Completed
                | NodeExecutionState::Failed
                | NodeExecutionState::Canceled
                | NodeExecutionState::TimedOut
        )
    }

    /// Whether the state machine has an edge from `self` to `next`
    ///
    /// Skipped intermediate states are allowed since polls are sampled.
    pub fn can_advance_to(&self, next: NodeExecutionState) -> bool {
        use NodeExecutionState::*;
        match (self, next) {
            (a, b) if *a == b => true,
            (Idle, _) => true,
            (Scheduled, Running | Paused) => true,
            (Scheduled, b) => b.is_terminal(),
            (Running, Paused) | (Paused, Running) => true,
            (Running | Paused, b) => b.is_terminal(),
            _ => false,
        }
    }
}

/// Editing mode of the canvas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CanvasState {
    Edit,
    Readonly,
    Running,
    WaitToRunning,
}

/// One step taken by the canvas lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanvasTransition {
    pub from: CanvasState,
    pub to: CanvasState,
}

/// Canvas lock state machine
#[derive(Debug, Clone)]
pub struct CanvasLock {
    state: CanvasState,
    /// State held when the pending start was requested
    before_start: Option<CanvasState>,
    inspecting: bool,
    latest: bool,
}

impl Default for CanvasLock {
    fn default() -> Self {
        Self::new(true)
    }
}

impl CanvasLock {
    /// Lock in EDIT for the latest version, READONLY otherwise
    pub fn new(latest: bool) -> Self {
        Self {
            state: if latest {
                CanvasState::Edit
            } else {
                CanvasState::Readonly
            },
            before_start: None,
            inspecting: false,
            latest,
        }
    }

    /// Current canvas state
    pub fn state(&self) -> CanvasState {
        self.state
    }

    /// A historical execution is on display
    pub fn is_inspecting(&self) -> bool {
        self.inspecting
    }

    /// Structural mutation is only allowed in EDIT
    pub fn ensure_editable(&self) -> Result<()> {
        match self.state {
            CanvasState::Edit => Ok(()),
            other => Err(FlowError::CanvasLocked(other)),
        }
    }

    /// State an idle canvas settles in
    fn resting_state(&self) -> CanvasState {
        if self.latest && !self.inspecting {
            CanvasState::Edit
        } else {
            CanvasState::Readonly
        }
    }

    fn step(&mut self, to: CanvasState) -> CanvasTransition {
        let transition = CanvasTransition {
            from: self.state,
            to,
        };
        log::debug!("Canvas {:?} -> {:?}", transition.from, transition.to);
        self.state = to;
        transition
    }

    /// Move along one of the run edges, rejecting anything else
    pub fn transition(&mut self, to: CanvasState) -> Result<CanvasTransition> {
        use CanvasState::*;
        let allowed = matches!(
            (self.state, to),
            (Edit, WaitToRunning) | (WaitToRunning, Running) | (Running, Edit) | (Running, Readonly)
        );
        if !allowed {
            return Err(FlowError::InvalidCanvasTransition {
                from: self.state,
                to,
            });
        }
        if to == WaitToRunning {
            self.before_start = Some(self.state);
        }
        Ok(self.step(to))
    }

    /// A start request was sent: EDIT -> WAIT_TO_RUNNING
    pub fn request_start(&mut self) -> Result<CanvasTransition> {
        self.transition(CanvasState::WaitToRunning)
    }

    /// The backend rejected the start request; roll back
    pub fn start_failed(&mut self) -> Result<CanvasTransition> {
        if self.state != CanvasState::WaitToRunning {
            return Err(FlowError::InvalidCanvasTransition {
                from: self.state,
                to: self.before_start.unwrap_or(CanvasState::Edit),
            });
        }
        let previous = self.before_start.take().unwrap_or(CanvasState::Edit);
        Ok(self.step(previous))
    }

    /// Follow the instance status reported by a poll
    ///
    /// A terminal status seen while still waiting passes through RUNNING.
    pub fn on_status(&mut self, status: &ExecutionStatus) -> Vec<CanvasTransition> {
        let mut steps = Vec::new();
        if (status.is_active() || status.is_terminal()) && self.state == CanvasState::WaitToRunning
        {
            self.before_start = None;
            steps.push(self.step(CanvasState::Running));
        }
        if status.is_terminal() && self.state == CanvasState::Running {
            let rest = self.resting_state();
            steps.push(self.step(rest));
        }
        steps
    }

    /// Record whether the active version is the latest
    ///
    /// Outside a run this flips an idle canvas between EDIT and READONLY.
    pub fn set_latest(&mut self, latest: bool) -> Option<CanvasTransition> {
        self.latest = latest;
        self.settle()
    }

    /// Force READONLY while a historical execution is shown
    pub fn begin_inspection(&mut self) -> Result<Option<CanvasTransition>> {
        if matches!(self.state, CanvasState::Running | CanvasState::WaitToRunning) {
            return Err(FlowError::InvalidCanvasTransition {
                from: self.state,
                to: CanvasState::Readonly,
            });
        }
        self.inspecting = true;
        Ok(self.settle())
    }

    /// Leave inspection; `None` if the state did not move
    pub fn end_inspection(&mut self) -> Option<CanvasTransition> {
        self.inspecting = false;
        self.settle()
    }

    fn settle(&mut self) -> Option<CanvasTransition> {
        if !matches!(self.state, CanvasState::Edit | CanvasState::Readonly) {
            return None;
        }
        let rest = self.resting_state();
        (rest != self.state).then(|| self.step(rest))
    }
}

/// Wall-clock run timer, in epoch milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ElapsedTimer {
    started_at: Option<i64>,
    frozen: Option<i64>,
}

impl ElapsedTimer {
    /// Start counting from `at_ms`
    pub fn start(&mut self, at_ms: i64) {
        self.started_at = Some(at_ms);
        self.frozen = None;
    }

    /// Freeze the timer at `end - start`
    pub fn stop(&mut self, at_ms: i64) {
        if let Some(started) = self.started_at {
            self.frozen = Some((at_ms - started).max(0));
        }
    }

    /// Forget the start and any frozen value
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Started and not frozen
    pub fn is_running(&self) -> bool {
        self.started_at.is_some() && self.frozen.is_none()
    }

    /// Elapsed milliseconds at `now_ms`; `None` before the first start
    pub fn elapsed_at(&self, now_ms: i64) -> Option<i64> {
        match (self.started_at, self.frozen) {
            (_, Some(frozen)) => Some(frozen),
            (Some(started), None) => Some((now_ms - started).max(0)),
            (None, None) => None,
        }
    }

    /// Elapsed milliseconds against the wall clock
    pub fn elapsed_now(&self) -> Option<i64> {
        self.elapsed_at(chrono::Utc::now().timestamp_millis())
    }

    /// Follow a record: start at its start time, freeze once terminal
    fn sync(&mut self, record: &ExecutionRecord, now_ms: i64) {
        if self.started_at.is_none() || record.start_time.is_some() {
            self.started_at = Some(record.start_time.unwrap_or(now_ms));
        }
        if record.is_terminal() {
            let end = record.end_time.unwrap_or(now_ms);
            self.stop(end);
        } else {
            self.frozen = None;
        }
    }
}

/// What a poll changed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverlayUpdate {
    pub instance_id: String,
    pub status: Option<ExecutionStatus>,
    /// Nodes whose state differs from before, with their new state
    pub changed: Vec<(NodeId, NodeExecutionState)>,
    pub canvas: Vec<CanvasTransition>,
}

impl OverlayUpdate {
    /// Nothing changed
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.canvas.is_empty()
    }
}

/// Where a child instance's task states land
///
/// Tasks of an inline definition keep their own reference names; tasks of
/// an expanded definition are scoped under the sub-workflow node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildScope {
    /// Sub-workflow node that started the child instance
    pub parent_id: NodeId,
    pub scoped: bool,
}

impl ChildScope {
    /// Node showing the child task `reference`
    pub fn node_id(&self, reference: &str) -> NodeId {
        if self.scoped {
            nested_node_id(&self.parent_id, reference)
        } else {
            reference.to_string()
        }
    }
}

/// Live execution state laid over the graph
///
/// Records are kept per instance id: the run being shown plus any child
/// instances started by its sub-workflow tasks. Node states are the union
/// of the run's states and each child's states mapped through its
/// [`ChildScope`].
#[derive(Debug, Clone, Default)]
pub struct ExecutionOverlay {
    /// Instance of the run being shown
    main: Option<String>,
    records: BTreeMap<String, ExecutionRecord>,
    children: BTreeMap<String, ChildScope>,
    states: BTreeMap<NodeId, NodeExecutionState>,
    lock: CanvasLock,
    timer: ElapsedTimer,
}

impl ExecutionOverlay {
    /// Empty overlay with the canvas lock for `latest`
    pub fn new(latest: bool) -> Self {
        Self {
            lock: CanvasLock::new(latest),
            ..Self::default()
        }
    }

    /// State of a node; nodes absent from every record are idle
    pub fn state(&self, node_id: &str) -> NodeExecutionState {
        self.states.get(node_id).copied().unwrap_or_default()
    }

    /// Every non-idle node state, keyed by node id
    pub fn states(&self) -> &BTreeMap<NodeId, NodeExecutionState> {
        &self.states
    }

    /// Latest record of the run being shown
    pub fn record(&self) -> Option<&ExecutionRecord> {
        self.main.as_ref().and_then(|id| self.records.get(id))
    }

    /// Latest record of any tracked instance, children included
    pub fn record_of(&self, instance_id: &str) -> Option<&ExecutionRecord> {
        self.records.get(instance_id)
    }

    /// Id of the run being shown
    pub fn instance_id(&self) -> Option<&str> {
        self.main.as_deref()
    }

    /// Child instances and the sub-workflow nodes they belong to
    pub fn child_instances(&self) -> impl Iterator<Item = (&str, &ChildScope)> {
        self.children
            .iter()
            .map(|(instance, scope)| (instance.as_str(), scope))
    }

    /// The canvas lock
    pub fn lock(&self) -> &CanvasLock {
        &self.lock
    }

    /// Current canvas state
    pub fn canvas_state(&self) -> CanvasState {
        self.lock.state()
    }

    /// Run timer of the instance being shown
    pub fn timer(&self) -> &ElapsedTimer {
        &self.timer
    }

    /// A start request was sent; previous run states are cleared
    pub fn request_start(&mut self) -> Result<OverlayUpdate> {
        let transition = self.lock.request_start()?;
        self.forget_all();
        let mut update = self.replace_states(BTreeMap::new());
        update.canvas.push(transition);
        Ok(update)
    }

    /// The backend rejected the start request
    pub fn start_failed(&mut self) -> Result<CanvasTransition> {
        self.lock.start_failed()
    }

    /// Merge a polled record; returns `None` if nothing changed
    pub fn apply(&mut self, record: ExecutionRecord) -> Option<OverlayUpdate> {
        self.apply_at(record, chrono::Utc::now().timestamp_millis())
    }

    /// Merge a polled record of the run, or of a known child instance
    ///
    /// A record of any other instance replaces the run being shown.
    pub fn apply_at(&mut self, record: ExecutionRecord, now_ms: i64) -> Option<OverlayUpdate> {
        if self.records.get(&record.instance_id) == Some(&record) {
            return None;
        }
        if let Some(scope) = self.children.get(&record.instance_id).cloned() {
            return self.apply_child(scope, record);
        }
        if self.main.as_deref() != Some(record.instance_id.as_str()) {
            self.forget_all();
            self.main = Some(record.instance_id.clone());
        }

        let instance_id = record.instance_id.clone();
        let status = record.status.clone();
        let canvas = if self.lock.is_inspecting() {
            Vec::new()
        } else {
            self.lock.on_status(&status)
        };
        self.timer.sync(&record, now_ms);
        self.records.insert(instance_id.clone(), record);

        let next = self.compose_states();
        let mut update = self.replace_states(next);
        update.instance_id = instance_id;
        update.status = Some(status);
        update.canvas = canvas;
        Some(update)
    }

    /// Merge a record of a child instance started by the sub-workflow node
    /// `scope.parent_id`
    ///
    /// Only the node states under that sub-workflow change; the canvas and
    /// timer follow the run alone. Ignored while no run is shown.
    pub fn apply_child(
        &mut self,
        scope: ChildScope,
        record: ExecutionRecord,
    ) -> Option<OverlayUpdate> {
        let instance_id = record.instance_id.clone();
        if self.main.is_none() || self.main.as_deref() == Some(instance_id.as_str()) {
            return None;
        }
        if self.children.get(&instance_id) == Some(&scope)
            && self.records.get(&instance_id) == Some(&record)
        {
            return None;
        }

        let status = record.status.clone();
        self.children.insert(instance_id.clone(), scope);
        self.records.insert(instance_id.clone(), record);

        let next = self.compose_states();
        let mut update = self.replace_states(next);
        update.instance_id = instance_id;
        update.status = Some(status);
        Some(update)
    }

    /// Stop showing an instance
    ///
    /// Removing the run clears every state and the timer; removing a child
    /// only clears the states it contributed. `None` if the instance was not
    /// tracked.
    pub fn remove_execution(&mut self, instance_id: &str) -> Option<OverlayUpdate> {
        if self.main.as_deref() == Some(instance_id) {
            self.forget_all();
            self.timer.reset();
        } else if self.children.remove(instance_id).is_some() {
            self.records.remove(instance_id);
        } else {
            return None;
        }

        let next = self.compose_states();
        let mut update = self.replace_states(next);
        update.instance_id = instance_id.to_string();
        Some(update)
    }

    /// Show a finished execution without running it; forces READONLY
    pub fn inspect(&mut self, record: ExecutionRecord) -> Result<OverlayUpdate> {
        let transition = self.lock.begin_inspection()?;
        let now = chrono::Utc::now().timestamp_millis();
        self.forget_all();
        self.timer.reset();
        self.timer.sync(&record, now);

        let instance_id = record.instance_id.clone();
        let status = record.status.clone();
        self.main = Some(instance_id.clone());
        self.records.insert(instance_id.clone(), record);

        let next = self.compose_states();
        let mut update = self.replace_states(next);
        update.instance_id = instance_id;
        update.status = Some(status);
        update.canvas.extend(transition);
        Ok(update)
    }

    /// Leave inspection and clear the overlaid states
    pub fn close_inspection(&mut self) -> OverlayUpdate {
        let mut update = self.replace_states(BTreeMap::new());
        update.canvas.extend(self.lock.end_inspection());
        self.forget_all();
        self.timer.reset();
        update
    }

    /// Track the active version's latest flag
    pub fn set_latest(&mut self, latest: bool) -> Option<CanvasTransition> {
        self.lock.set_latest(latest)
    }

    fn forget_all(&mut self) {
        self.main = None;
        self.records.clear();
        self.children.clear();
    }

    /// States of the run plus every child mapped into its sub-workflow
    fn compose_states(&self) -> BTreeMap<NodeId, NodeExecutionState> {
        let Some(run) = self.record() else {
            return BTreeMap::new();
        };
        let mut states = derive_states(run);
        for (instance, scope) in &self.children {
            if let Some(record) = self.records.get(instance) {
                for (reference, state) in task_states(record) {
                    states.insert(scope.node_id(&reference), state);
                }
            }
        }
        states
    }

    fn replace_states(&mut self, next: BTreeMap<NodeId, NodeExecutionState>) -> OverlayUpdate {
        let mut changed = Vec::new();
        for (id, state) in &next {
            let previous = self.state(id);
            if previous != *state {
                if !previous.can_advance_to(*state) {
                    log::debug!("Node '{}' jumped {:?} -> {:?}", id, previous, state);
                }
                changed.push((id.clone(), *state));
            }
        }
        for id in self.states.keys() {
            if !next.contains_key(id) {
                changed.push((id.clone(), NodeExecutionState::Idle));
            }
        }
        self.states = next;
        OverlayUpdate {
            changed,
            ..OverlayUpdate::default()
        }
    }
}

/// State of each task in a record, keyed by reference name
fn task_states(record: &ExecutionRecord) -> BTreeMap<NodeId, NodeExecutionState> {
    record
        .per_task_status()
        .into_iter()
        .filter_map(|(name, task)| {
            let status = task.status.as_ref()?;
            Some((
                name.to_string(),
                NodeExecutionState::from_task(status, &record.status),
            ))
        })
        .collect()
}

/// Node states for a record, pseudo-nodes included
fn derive_states(record: &ExecutionRecord) -> BTreeMap<NodeId, NodeExecutionState> {
    let mut states = task_states(record);

    states.insert(START_NODE_ID.to_string(), NodeExecutionState::Completed);
    let end = match record.status {
        ExecutionStatus::Completed => NodeExecutionState::Completed,
        ExecutionStatus::Failed => NodeExecutionState::Failed,
        ExecutionStatus::TimedOut => NodeExecutionState::TimedOut,
        ExecutionStatus::Terminated | ExecutionStatus::Canceled => NodeExecutionState::Canceled,
        ExecutionStatus::Running | ExecutionStatus::Paused | ExecutionStatus::Other(_) => {
            NodeExecutionState::Idle
        }
    };
    if end != NodeExecutionState::Idle {
        states.insert(END_NODE_ID.to_string(), end);
    }
    states
}
