//! Derived view types produced by the graph builder
//!
//! Nothing in this module is persisted or edited directly. A [`FlowGraph`]
//! is rebuilt from the task list after every structural change.

use serde::{Deserialize, Serialize};

use crate::types::{BranchKey, CustomData, NodeId, Task};

/// Point on the canvas
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    /// Point at `x`, `y`
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Node box dimensions
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

/// What a node stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Workflow trigger
    Start,
    /// Workflow output preview
    End,
    /// A task from the task list
    Task,
    /// Insertion slot standing in for an empty lane
    Placeholder,
    /// A join target that names no task
    Missing,
}

/// Whether the node's tool is known to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Known,
    Unsupported,
}

/// Lane membership of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaneRef {
    /// Composite task owning the lane
    pub parent_id: NodeId,
    pub branch: BranchKey,
}

/// Action offered by a node controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControllerAction {
    /// Insert a new task after the owning node
    InsertAfter,
    /// Add a lane to a fork or a case to a decision
    AddBranch,
}

/// Clickable affordance attached to a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Controller {
    pub action: ControllerAction,
    pub position: Position,
}

/// Positioned view of one task or pseudo-node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    pub role: NodeRole,
    /// Snapshot of the task this node renders (absent for pseudo-nodes)
    pub task: Option<Task>,
    /// Top-left corner
    pub position: Position,
    pub size: Size,
    pub custom_data: CustomData,
    /// Enclosing composite task, if any
    pub parent_id: Option<NodeId>,
    pub lane: Option<LaneRef>,
    pub controllers: Vec<Controller>,
    pub tool_status: ToolStatus,
    /// Depth-first layout order; upstream nodes have smaller values
    pub order: usize,
}

impl Node {
    /// Point where incoming edges terminate
    pub fn entry_point(&self, horizontal: bool) -> Position {
        if horizontal {
            Position::new(self.position.x, self.position.y + self.size.height / 2.0)
        } else {
            Position::new(self.position.x + self.size.width / 2.0, self.position.y)
        }
    }

    /// Point where outgoing edges originate
    pub fn exit_point(&self, horizontal: bool) -> Position {
        if horizontal {
            Position::new(
                self.position.x + self.size.width,
                self.position.y + self.size.height / 2.0,
            )
        } else {
            Position::new(
                self.position.x + self.size.width / 2.0,
                self.position.y + self.size.height,
            )
        }
    }

    /// A node for a task, not a pseudo or placeholder node
    pub fn is_task(&self) -> bool {
        self.role == NodeRole::Task
    }
}

/// Drawing command of an edge path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathCommand {
    Move,
    Line,
    /// Quadratic curve; `axis` holds the control point then the end point
    Curve,
}

/// One segment of an edge path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathSegment {
    #[serde(rename = "type")]
    pub command: PathCommand,
    pub axis: Vec<[f64; 2]>,
}

impl PathSegment {
    /// Start a new subpath at `point`
    pub fn move_to(point: Position) -> Self {
        Self {
            command: PathCommand::Move,
            axis: vec![[point.x, point.y]],
        }
    }

    /// Straight line to `point`
    pub fn line_to(point: Position) -> Self {
        Self {
            command: PathCommand::Line,
            axis: vec![[point.x, point.y]],
        }
    }

    /// Quadratic curve through `control` to `end`
    pub fn curve_to(control: Position, end: Position) -> Self {
        Self {
            command: PathCommand::Curve,
            axis: vec![[control.x, control.y], [end.x, end.y]],
        }
    }
}

/// Derived connector between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub source: NodeId,
    pub target: NodeId,
    pub path: Vec<PathSegment>,
}

impl Edge {
    /// First point of the path
    pub fn origin(&self) -> Option<[f64; 2]> {
        self.path.first().and_then(|segment| segment.axis.first().copied())
    }

    /// Last point of the path
    pub fn terminal(&self) -> Option<[f64; 2]> {
        self.path.last().and_then(|segment| segment.axis.last().copied())
    }
}

/// Axis-aligned bounding box of the whole graph
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    /// Horizontal extent
    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    /// Vertical extent
    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}

/// Nodes and edges derived from one task list
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowGraph {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl FlowGraph {
    /// Find a node by ID
    pub fn find_node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id == id)
    }

    /// Get all edges ending at a node
    pub fn incoming_edges(&self, node_id: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|edge| edge.target == node_id).collect()
    }

    /// Get all edges starting at a node
    pub fn outgoing_edges(&self, node_id: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|edge| edge.source == node_id).collect()
    }

    /// Nodes directly inside the given lane
    pub fn lane_nodes(&self, parent_id: &str, branch: &BranchKey) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|node| {
                node.lane
                    .as_ref()
                    .is_some_and(|lane| lane.parent_id == parent_id && &lane.branch == branch)
            })
            .collect()
    }

    /// Distinct lanes owned by a composite node
    pub fn lanes_of(&self, parent_id: &str) -> Vec<BranchKey> {
        let mut lanes: Vec<BranchKey> = Vec::new();
        for node in &self.nodes {
            if let Some(lane) = &node.lane {
                if lane.parent_id == parent_id && !lanes.contains(&lane.branch) {
                    lanes.push(lane.branch.clone());
                }
            }
        }
        lanes
    }

    /// Number of nodes that stand for tasks
    pub fn task_node_count(&self) -> usize {
        self.nodes.iter().filter(|node| node.is_task()).count()
    }

    /// Bounding box over every node
    pub fn bounds(&self) -> Bounds {
        let mut nodes = self.nodes.iter();
        let Some(first) = nodes.next() else {
            return Bounds::default();
        };
        let mut bounds = Bounds {
            min_x: first.position.x,
            min_y: first.position.y,
            max_x: first.position.x + first.size.width,
            max_y: first.position.y + first.size.height,
        };
        for node in nodes {
            bounds.min_x = bounds.min_x.min(node.position.x);
            bounds.min_y = bounds.min_y.min(node.position.y);
            bounds.max_x = bounds.max_x.max(node.position.x + node.size.width);
            bounds.max_y = bounds.max_y.max(node.position.y + node.size.height);
        }
        bounds
    }
}
