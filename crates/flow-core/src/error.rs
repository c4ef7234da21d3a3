//! Error types for the flow core
//!
//! Contract violations (cycles, duplicate reference names, edits on a locked
//! canvas) surface as [`FlowError`]. Expected authoring problems such as
//! dangling variable references are not errors; they are reported as
//! [`ValidationIssue`](crate::validation::ValidationIssue) lists.

use thiserror::Error;

use crate::overlay::CanvasState;

/// Result type alias using FlowError
pub type Result<T> = std::result::Result<T, FlowError>;

/// Errors that can occur in the flow core
#[derive(Debug, Error)]
pub enum FlowError {
    /// A move would place a task inside its own subtree
    #[error("Moving '{node_id}' next to '{target_id}' would create a cycle")]
    StructuralCycle { node_id: String, target_id: String },

    /// Two tasks share a reference name
    #[error("Duplicate task reference name: {0}")]
    DuplicateReference(String),

    /// A task uses one of the pseudo-node ids
    #[error("Reference name '{0}' is reserved")]
    ReservedReference(String),

    /// No task or pseudo-node with this id
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    /// A sub-workflow would end up containing itself, directly or through
    /// the sub-workflows it nests
    #[error("Sub-workflow '{workflow}' at '{node_id}' would contain itself")]
    SubWorkflowCycle { node_id: String, workflow: String },

    /// A JOIN was addressed on its own instead of through its fork
    #[error("Join '{0}' can only be moved or removed together with its fork")]
    PairedJoin(String),

    /// The operation does not apply to this node
    #[error("Invalid target '{node_id}': {reason}")]
    InvalidTarget { node_id: String, reason: String },

    /// Mutation attempted on a version that is not the latest
    #[error("Workflow version {version} is read-only")]
    ReadOnlyVersion { version: u32 },

    /// Mutation attempted while the canvas is not editable
    #[error("Canvas is locked ({0:?})")]
    CanvasLocked(CanvasState),

    /// The canvas lock rejected a transition
    #[error("Invalid canvas transition: {from:?} -> {to:?}")]
    InvalidCanvasTransition { from: CanvasState, to: CanvasState },

    /// Polling or fetching gave up after bounded retries
    #[error("Poll failed for '{key}' after {attempts} attempts: {message}")]
    PollFailure {
        key: String,
        attempts: u32,
        message: String,
    },

    /// Backend request failed
    #[error("Backend error: {0}")]
    Backend(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Compression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Configuration could not be loaded or saved
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FlowError {
    /// Create a backend error with a message
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Create an invalid target error
    pub fn invalid_target(node_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTarget {
            node_id: node_id.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error should be shown to the user as a warning rather
    /// than treated as a failure
    pub fn is_user_warning(&self) -> bool {
        matches!(
            self,
            Self::ReadOnlyVersion { .. }
                | Self::CanvasLocked(_)
                | Self::StructuralCycle { .. }
                | Self::SubWorkflowCycle { .. }
        )
    }
}
