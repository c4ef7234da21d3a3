//! Flow Core - Workflow graph engine for the visual workflow editor
//!
//! This crate keeps an orchestrator-compatible task list as the single
//! source of truth and derives everything an editor shows from it:
//!
//! - Positioned nodes and routed edges for forks, decisions, loops and
//!   sub-workflows
//! - Structural edits (insert, move, remove, patch) that keep the list valid
//! - Scoped variable tables: which outputs each task may reference
//! - A live execution overlay with a canvas lock state machine
//! - Version-aware read-only gating and compressed undo/redo
//!
//! # Architecture
//!
//! - `TaskTree`: canonical task list with an id → location index
//! - `GraphBuilder`: pure, deterministic `tasks → FlowGraph`
//! - `Expansions`: read-only children of restored sub-workflows
//! - `VariableResolver`: scope-aware variable tables and reference checks
//! - `ExecutionOverlay`: polled records → node states, plus the `CanvasLock`
//! - `FlowSession`: per-workflow facade publishing typed `FlowEvent`s
//! - `FlowDriver`: async boundary over a `WorkflowBackend`
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use flow_core::{FlowConfig, FlowDriver, FlowSession, ToolRegistry};
//!
//! let session = FlowSession::new(Arc::new(ToolRegistry::with_builtins()), FlowConfig::default());
//! let driver = FlowDriver::new(session, backend);
//! driver.load_workflow("wf", None).await?;
//! driver.session().lock().insert_tool("a", InsertPosition::After, "llm")?;
//! driver.start(StartRequest::default()).await?;
//! ```

pub mod backend;
pub mod builder;
pub mod config;
pub mod descriptor;
pub mod driver;
pub mod error;
pub mod events;
pub mod execution;
pub mod graph;
pub mod mutation;
pub mod nested;
pub mod overlay;
pub mod poller;
pub mod registry;
pub mod requests;
pub mod session;
pub mod tree;
pub mod types;
pub mod undo;
pub mod validation;
pub mod variables;
pub mod version;

// Re-export key types
pub use backend::{
    DebugRequest, ExecutionSearchPage, ExecutionSearchRequest, ExecutionStarted, Pagination,
    StartRequest, WorkflowBackend,
};
pub use builder::GraphBuilder;
pub use config::{FlowConfig, HistoryConfig, LayoutConfig, LayoutDirection, PollConfig};
pub use descriptor::{ToolDefinition, ToolDescriptor, ToolDescriptorFn, ToolProperty};
pub use driver::FlowDriver;
pub use error::{FlowError, Result};
pub use events::{
    ChannelEventSink, EventBus, EventError, EventSink, FlowEvent, Subscription, VecEventSink,
};
pub use execution::{
    ExecutionRecord, ExecutionStatus, TaskExecution, TaskStatus, SUB_WORKFLOW_ID_KEY,
};
pub use graph::{Edge, FlowGraph, Node, NodeRole, Position, ToolStatus};
pub use mutation::InsertPosition;
pub use nested::{nested_node_id, Expansions};
pub use overlay::{CanvasLock, CanvasState, ChildScope, ExecutionOverlay, NodeExecutionState};
pub use poller::{ExecutionPoller, PollHandle};
pub use registry::{sub_workflow_tool_name, ToolRegistry};
pub use requests::{RequestKey, RequestTracker};
pub use session::FlowSession;
pub use tree::TaskTree;
pub use types::{BranchKey, NodeId, Task, TaskKind, TaskType};
pub use undo::UndoStack;
pub use validation::ValidationIssue;
pub use variables::{VariableResolver, WorkflowVariables};
pub use version::{VersionChange, VersionController, WorkflowVersion};
