//! Graph builder: task list to positioned nodes and edges
//!
//! The builder is a pure function of its inputs. It walks the task list depth
//! first, laying a run of tasks along the main axis and opening side-by-side
//! lanes for forks, decisions, loops and restored sub-workflows. All
//! arithmetic happens in (main, cross) coordinates and is mapped to x/y at the
//! end, so both layout directions share one algorithm.
//!
//! # Example
//!
//! ```ignore
//! let registry = ToolRegistry::with_builtins();
//! let config = LayoutConfig::default();
//! let graph = GraphBuilder::new(&registry, &config).build(&tasks)?;
//! assert!(graph.find_node("workflow_start").is_some());
//! ```

use std::collections::{HashMap, HashSet};

use crate::config::LayoutConfig;
use crate::error::Result;
use crate::graph::{
    Controller, ControllerAction, Edge, FlowGraph, LaneRef, Node, NodeRole, PathSegment, Position,
    Size, ToolStatus,
};
use crate::nested::Expansions;
use crate::registry::ToolRegistry;
use crate::tree::{build_index, placeholder_id, unit_span, Location};
use crate::types::{BranchKey, CustomData, NodeId, Task, TaskKind, END_NODE_ID, START_NODE_ID};

/// Id of the error placeholder shown for a join target that names no task
pub fn missing_node_id(join_id: &str, reference: &str) -> NodeId {
    format!("{}::missing-{}", join_id, reference)
}

/// Point in layout space
#[derive(Debug, Clone, Copy, PartialEq)]
struct AxisPoint {
    main: f64,
    cross: f64,
}

impl AxisPoint {
    fn new(main: f64, cross: f64) -> Self {
        Self { main, cross }
    }
}

/// Edge attachment point on a placed node
#[derive(Debug, Clone)]
struct Anchor {
    node: NodeId,
    point: AxisPoint,
}

/// Connection points of a placed list or unit
#[derive(Debug, Clone)]
struct Ports {
    entry: Anchor,
    exits: Vec<Anchor>,
    end_main: f64,
}

/// Lane a list is being placed in
#[derive(Debug, Clone)]
struct LaneCtx {
    parent: Option<NodeId>,
    branch: BranchKey,
}

impl LaneCtx {
    fn root() -> Self {
        Self {
            parent: None,
            branch: BranchKey::Root,
        }
    }

    fn lane(parent: &str, branch: BranchKey) -> Self {
        Self {
            parent: Some(parent.to_string()),
            branch,
        }
    }

    fn lane_ref(&self) -> Option<LaneRef> {
        self.parent.as_ref().map(|parent| LaneRef {
            parent_id: parent.clone(),
            branch: self.branch.clone(),
        })
    }
}

/// Builds a [`FlowGraph`] from a task list
pub struct GraphBuilder<'a> {
    registry: &'a ToolRegistry,
    config: &'a LayoutConfig,
    restored: Option<&'a HashSet<NodeId>>,
    expansions: Option<&'a Expansions>,
}

impl<'a> GraphBuilder<'a> {
    /// Builder over `registry` using `config` for sizes and gaps
    pub fn new(registry: &'a ToolRegistry, config: &'a LayoutConfig) -> Self {
        Self {
            registry,
            config,
            restored: None,
            expansions: None,
        }
    }

    /// Sub-workflows whose nested task list is laid out inline
    pub fn with_restored(mut self, restored: &'a HashSet<NodeId>) -> Self {
        self.restored = Some(restored);
        self
    }

    /// Children resolved from registered definitions, for restored
    /// sub-workflows that carry no inline definition
    pub fn with_expansions(mut self, expansions: &'a Expansions) -> Self {
        self.expansions = Some(expansions);
        self
    }

    /// Build nodes and edges for `tasks`
    ///
    /// Fails only on duplicate or reserved reference names. Unknown tools and
    /// join targets naming no task degrade to marked nodes instead.
    pub fn build(&self, tasks: &[Task]) -> Result<FlowGraph> {
        let index = build_index(tasks)?;
        let expanded = self
            .expansions
            .map(Expansions::node_ids)
            .unwrap_or_default();
        let mut layout = Layout {
            builder: self,
            index: &index,
            expanded: &expanded,
            nodes: Vec::new(),
            edges: Vec::new(),
        };

        let start = layout.push_pseudo(START_NODE_ID, NodeRole::Start, 0.0);
        let root_main = start.end_main + self.config.main_gap;
        let exits = match layout.place_list(tasks, &LaneCtx::root(), root_main, 0.0) {
            Some(ports) => {
                layout.connect(&start.exits, &ports.entry);
                ports
            }
            None => start,
        };
        let end = layout.push_pseudo(
            END_NODE_ID,
            NodeRole::End,
            exits.end_main + self.config.main_gap,
        );
        layout.connect(&exits.exits, &end.entry);

        let mut graph = FlowGraph {
            nodes: layout.nodes,
            edges: layout.edges,
        };
        self.normalize(&mut graph);
        log::debug!(
            "Built graph: {} nodes, {} edges",
            graph.nodes.len(),
            graph.edges.len()
        );
        Ok(graph)
    }

    fn to_position(&self, point: AxisPoint) -> Position {
        if self.config.is_horizontal() {
            Position::new(point.main, point.cross)
        } else {
            Position::new(point.cross, point.main)
        }
    }

    /// Shift everything so the smallest cross coordinate is zero
    fn normalize(&self, graph: &mut FlowGraph) {
        let horizontal = self.config.is_horizontal();
        let cross = |p: &Position| if horizontal { p.y } else { p.x };
        let min = graph
            .nodes
            .iter()
            .map(|node| cross(&node.position))
            .fold(f64::INFINITY, f64::min);
        if !min.is_finite() || min == 0.0 {
            return;
        }

        let shift = |p: &mut Position| {
            if horizontal {
                p.y -= min;
            } else {
                p.x -= min;
            }
        };
        for node in &mut graph.nodes {
            shift(&mut node.position);
            for controller in &mut node.controllers {
                shift(&mut controller.position);
            }
        }
        let axis = usize::from(horizontal);
        for edge in &mut graph.edges {
            for segment in &mut edge.path {
                for point in &mut segment.axis {
                    point[axis] -= min;
                }
            }
        }
    }

    fn is_restored(&self, task: &Task) -> bool {
        let id = &task.reference_name;
        self.restored.is_some_and(|restored| restored.contains(id))
            || self.expansions.is_some_and(|expansions| expansions.contains(id))
    }

    /// Tasks laid out inside a restored sub-workflow: the inline
    /// definition, else the expansion
    fn nested_tasks<'t>(&'t self, head: &'t Task) -> Option<&'t [Task]> {
        if !self.is_restored(head) {
            return None;
        }
        head.branches()
            .into_iter()
            .find(|(key, _)| *key == BranchKey::Nested)
            .map(|(_, tasks)| tasks)
            .or_else(|| {
                self.expansions
                    .and_then(|expansions| expansions.get(&head.reference_name))
            })
    }

    fn lanes_span(&self, widths: &[f64]) -> f64 {
        let gaps = widths.len().saturating_sub(1) as f64 * self.config.lane_gap;
        widths.iter().sum::<f64>() + gaps
    }

    fn custom_data(&self, task: &Task) -> CustomData {
        let alias = task.custom_data().unwrap_or_default();
        let tool = self.registry.get(&task.name);
        CustomData {
            icon: alias
                .icon
                .or_else(|| tool.and_then(|tool| tool.icon.clone())),
            title: alias.title.or_else(|| {
                Some(
                    tool.map(|tool| tool.display_name.clone())
                        .unwrap_or_else(|| task.name.clone()),
                )
            }),
            description: alias.description.or_else(|| {
                tool.map(|tool| tool.description.clone())
                    .filter(|description| !description.is_empty())
            }),
        }
    }

    fn tool_status(&self, task: &Task) -> ToolStatus {
        match task.kind() {
            TaskKind::Fork | TaskKind::Join | TaskKind::Decision | TaskKind::Loop => {
                ToolStatus::Known
            }
            TaskKind::Simple | TaskKind::SubWorkflow | TaskKind::Opaque => {
                if self.registry.has_tool(&task.name) {
                    ToolStatus::Known
                } else {
                    ToolStatus::Unsupported
                }
            }
        }
    }
}

/// Mutable state of one build
struct Layout<'b, 'a> {
    builder: &'b GraphBuilder<'a>,
    index: &'b HashMap<NodeId, Location>,
    /// Ids that exist only inside expansions
    expanded: &'b HashSet<NodeId>,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
}

impl<'b, 'a> Layout<'b, 'a> {
    fn config(&self) -> &LayoutConfig {
        self.builder.config
    }

    /// `joinOn` entries that name no task in the list being built
    fn missing_targets(&self, join: &Task) -> Vec<String> {
        join.join_on
            .iter()
            .flatten()
            .filter(|reference| {
                !self.index.contains_key(reference.as_str()) && !self.expanded.contains(*reference)
            })
            .cloned()
            .collect()
    }

    fn list_width(&self, tasks: &[Task]) -> f64 {
        let mut width = self.config().cross_extent();
        let mut i = 0;
        while i < tasks.len() {
            let (_, end) = unit_span(tasks, i);
            let end = end.max(i + 1);
            width = width.max(self.unit_width(&tasks[i..end]));
            i = end;
        }
        width
    }

    fn unit_width(&self, unit: &[Task]) -> f64 {
        let head = &unit[0];
        let node = self.config().cross_extent();
        match head.kind() {
            TaskKind::Fork | TaskKind::Decision => {
                self.builder.lanes_span(&self.lane_widths(head, unit.get(1))).max(node)
            }
            TaskKind::Loop => {
                let body = head.loop_over.as_deref().unwrap_or(&[]);
                self.list_width(body).max(node) + 2.0 * self.config().lane_gap
            }
            TaskKind::SubWorkflow => self
                .builder
                .nested_tasks(head)
                .map(|nested| self.list_width(nested))
                .unwrap_or(node)
                .max(node),
            TaskKind::Join => {
                // Placeholders sit beside the main line; reserve both sides
                let missing = self.missing_targets(head).len() as f64;
                node + 2.0 * missing * (node + self.config().lane_gap)
            }
            TaskKind::Simple | TaskKind::Opaque => node,
        }
    }

    /// Widths of each real lane followed by one slot per missing join target
    fn lane_widths(&self, head: &Task, join: Option<&Task>) -> Vec<f64> {
        let node = self.config().cross_extent();
        let mut widths: Vec<f64> = head
            .branches()
            .iter()
            .map(|(_, lane)| self.list_width(lane))
            .collect();
        if let Some(join) = join {
            widths.extend(std::iter::repeat(node).take(self.missing_targets(join).len()));
        }
        widths
    }

    fn push_node(
        &mut self,
        id: NodeId,
        role: NodeRole,
        task: Option<&Task>,
        ctx: &LaneCtx,
        main: f64,
        center: f64,
        actions: &[ControllerAction],
    ) -> Ports {
        let config = self.builder.config;
        let main_extent = config.main_extent();
        let cross_extent = config.cross_extent();

        let controllers = actions
            .iter()
            .map(|action| {
                let point = match action {
                    ControllerAction::InsertAfter => {
                        AxisPoint::new(main + main_extent + config.controller_offset, center)
                    }
                    ControllerAction::AddBranch => AxisPoint::new(
                        main + main_extent / 2.0,
                        center + cross_extent / 2.0 + config.controller_offset,
                    ),
                };
                Controller {
                    action: action.clone(),
                    position: self.builder.to_position(point),
                }
            })
            .collect();

        let (custom_data, tool_status) = match task {
            Some(task) => (self.builder.custom_data(task), self.builder.tool_status(task)),
            None => (pseudo_custom_data(role), ToolStatus::Known),
        };

        let order = self.nodes.len();
        self.nodes.push(Node {
            id: id.clone(),
            role,
            task: task.cloned(),
            position: self
                .builder
                .to_position(AxisPoint::new(main, center - cross_extent / 2.0)),
            size: Size {
                width: config.node_width,
                height: config.node_height,
            },
            custom_data,
            parent_id: ctx.parent.clone(),
            lane: ctx.lane_ref(),
            controllers,
            tool_status,
            order,
        });

        Ports {
            entry: Anchor {
                node: id.clone(),
                point: AxisPoint::new(main, center),
            },
            exits: vec![Anchor {
                node: id,
                point: AxisPoint::new(main + main_extent, center),
            }],
            end_main: main + main_extent,
        }
    }

    fn push_pseudo(&mut self, id: &str, role: NodeRole, main: f64) -> Ports {
        let actions: &[ControllerAction] = match role {
            NodeRole::Start => &[ControllerAction::InsertAfter],
            _ => &[],
        };
        self.push_node(id.to_string(), role, None, &LaneCtx::root(), main, 0.0, actions)
    }

    fn push_task(
        &mut self,
        task: &Task,
        ctx: &LaneCtx,
        main: f64,
        center: f64,
        actions: &[ControllerAction],
    ) -> Ports {
        self.push_node(
            task.reference_name.clone(),
            NodeRole::Task,
            Some(task),
            ctx,
            main,
            center,
            actions,
        )
    }

    /// Place a list; returns `None` only for an empty root list
    fn place_list(
        &mut self,
        tasks: &[Task],
        ctx: &LaneCtx,
        main: f64,
        center: f64,
    ) -> Option<Ports> {
        if tasks.is_empty() {
            let parent = ctx.parent.as_deref()?;
            let id = placeholder_id(parent, &ctx.branch);
            return Some(self.push_node(
                id,
                NodeRole::Placeholder,
                None,
                ctx,
                main,
                center,
                &[ControllerAction::InsertAfter],
            ));
        }

        let mut cursor = main;
        let mut first_entry: Option<Anchor> = None;
        let mut previous: Option<Ports> = None;
        let mut i = 0;
        while i < tasks.len() {
            let (_, end) = unit_span(tasks, i);
            let end = end.max(i + 1);
            let ports = self.place_unit(&tasks[i..end], ctx, cursor, center);
            if let Some(previous) = &previous {
                self.connect(&previous.exits, &ports.entry);
            }
            first_entry.get_or_insert_with(|| ports.entry.clone());
            cursor = ports.end_main + self.config().main_gap;
            previous = Some(ports);
            i = end;
        }

        let last = previous?;
        Some(Ports {
            entry: first_entry?,
            exits: last.exits,
            end_main: last.end_main,
        })
    }

    fn place_unit(&mut self, unit: &[Task], ctx: &LaneCtx, main: f64, center: f64) -> Ports {
        let head = &unit[0];
        match head.kind() {
            TaskKind::Fork | TaskKind::Decision => {
                self.place_branching(head, unit.get(1), ctx, main, center)
            }
            TaskKind::Loop => {
                let body = head.loop_over.as_deref().unwrap_or(&[]);
                self.place_inline(head, BranchKey::Loop, body, true, ctx, main, center)
            }
            TaskKind::SubWorkflow => match self.builder.nested_tasks(head) {
                Some(body) => {
                    self.place_inline(head, BranchKey::Nested, body, false, ctx, main, center)
                }
                None => self.push_task(head, ctx, main, center, &[ControllerAction::InsertAfter]),
            },
            TaskKind::Join => self.place_join(head, ctx, main, center),
            TaskKind::Simple | TaskKind::Opaque => {
                self.push_task(head, ctx, main, center, &[ControllerAction::InsertAfter])
            }
        }
    }

    /// JOIN outside a fork unit
    ///
    /// Each `joinOn` entry naming no task becomes a Missing node placed
    /// beside the main line and feeding the join.
    fn place_join(&mut self, join: &Task, ctx: &LaneCtx, main: f64, center: f64) -> Ports {
        let missing = self.missing_targets(join);
        if missing.is_empty() {
            return self.push_task(join, ctx, main, center, &[ControllerAction::InsertAfter]);
        }

        let node = self.config().cross_extent();
        let step = node + self.config().lane_gap;
        let mut exits = Vec::new();
        let mut end_main = main;
        for (slot, reference) in missing.iter().enumerate() {
            let ports = self.push_node(
                missing_node_id(&join.reference_name, reference),
                NodeRole::Missing,
                None,
                ctx,
                main,
                center + step * (slot + 1) as f64,
                &[],
            );
            end_main = end_main.max(ports.end_main);
            exits.extend(ports.exits);
        }

        let join_main = end_main + self.config().main_gap;
        let join_ports =
            self.push_task(join, ctx, join_main, center, &[ControllerAction::InsertAfter]);
        self.connect(&exits, &join_ports.entry);
        join_ports
    }

    /// Fork or decision: head node, side-by-side lanes, optional join
    fn place_branching(
        &mut self,
        head: &Task,
        join: Option<&Task>,
        ctx: &LaneCtx,
        main: f64,
        center: f64,
    ) -> Ports {
        let head_actions: &[ControllerAction] = if join.is_some() {
            &[ControllerAction::AddBranch]
        } else {
            &[ControllerAction::AddBranch, ControllerAction::InsertAfter]
        };
        let head_ports = self.push_task(head, ctx, main, center, head_actions);

        let widths = self.lane_widths(head, join);
        let missing = join.map(|join| self.missing_targets(join)).unwrap_or_default();
        if widths.is_empty() {
            return match join {
                Some(join) => {
                    let join_main = head_ports.end_main + self.config().main_gap;
                    let actions = [ControllerAction::InsertAfter];
                    let join_ports = self.push_task(join, ctx, join_main, center, &actions);
                    self.connect(&head_ports.exits, &join_ports.entry);
                    Ports {
                        entry: head_ports.entry,
                        exits: join_ports.exits,
                        end_main: join_ports.end_main,
                    }
                }
                None => head_ports,
            };
        }

        let lane_main = head_ports.end_main + self.config().main_gap;
        let mut cross = center - self.builder.lanes_span(&widths) / 2.0;
        let mut lane_exits: Vec<Anchor> = Vec::new();
        let mut lanes_end = lane_main;
        let mut lane_entries: Vec<Anchor> = Vec::new();

        let mut slots = widths.iter();

        for (key, lane) in head.branches() {
            let width = slots.next().copied().unwrap_or(self.config().cross_extent());
            let lane_center = cross + width / 2.0;
            let lane_ctx = LaneCtx::lane(&head.reference_name, key);
            if let Some(ports) = self.place_list(lane, &lane_ctx, lane_main, lane_center) {
                lane_entries.push(ports.entry);
                lanes_end = lanes_end.max(ports.end_main);
                lane_exits.extend(ports.exits);
            }
            cross += width + self.config().lane_gap;
        }

        if let Some(join) = join {
            for reference in &missing {
                let width = slots.next().copied().unwrap_or(self.config().cross_extent());
                let slot_center = cross + width / 2.0;
                let ports = self.push_node(
                    missing_node_id(&join.reference_name, reference),
                    NodeRole::Missing,
                    None,
                    ctx,
                    lane_main,
                    slot_center,
                    &[],
                );
                lanes_end = lanes_end.max(ports.end_main);
                lane_exits.extend(ports.exits);
                cross += width + self.config().lane_gap;
            }
        }

        let origin = head_ports.exits[0].clone();
        self.fan_out(&origin, &lane_entries);

        match join {
            Some(join) => {
                let join_main = lanes_end + self.config().main_gap;
                let join_ports =
                    self.push_task(join, ctx, join_main, center, &[ControllerAction::InsertAfter]);
                self.connect(&lane_exits, &join_ports.entry);
                Ports {
                    entry: head_ports.entry,
                    exits: join_ports.exits,
                    end_main: join_ports.end_main,
                }
            }
            None => Ports {
                entry: head_ports.entry,
                exits: lane_exits,
                end_main: lanes_end,
            },
        }
    }

    /// Loop or restored sub-workflow: head node followed by one inline lane
    fn place_inline(
        &mut self,
        head: &Task,
        branch: BranchKey,
        body: &[Task],
        loop_back: bool,
        ctx: &LaneCtx,
        main: f64,
        center: f64,
    ) -> Ports {
        let head_ports = self.push_task(head, ctx, main, center, &[ControllerAction::InsertAfter]);
        let body_width = self.list_width(body);

        let body_main = head_ports.end_main + self.config().main_gap;
        let body_ctx = LaneCtx::lane(&head.reference_name, branch);
        let Some(body_ports) = self.place_list(body, &body_ctx, body_main, center) else {
            return head_ports;
        };
        self.connect(&head_ports.exits, &body_ports.entry);

        if loop_back {
            let rail = center + body_width / 2.0 + self.config().lane_gap / 2.0;
            let head_side = AxisPoint::new(
                main + self.config().main_extent() / 2.0,
                center + self.config().cross_extent() / 2.0,
            );
            for exit in &body_ports.exits {
                let turn = exit.point.main + self.config().main_gap / 4.0;
                let path = vec![
                    self.segment_move(exit.point),
                    self.segment_line(AxisPoint::new(turn, exit.point.cross)),
                    self.segment_line(AxisPoint::new(turn, rail)),
                    self.segment_line(AxisPoint::new(head_side.main, rail)),
                    self.segment_line(head_side),
                ];
                self.edges.push(Edge {
                    id: format!("{}->{}:loop", exit.node, head.reference_name),
                    source: exit.node.clone(),
                    target: head.reference_name.clone(),
                    path,
                });
            }
        }

        Ports {
            entry: head_ports.entry,
            exits: body_ports.exits,
            end_main: body_ports.end_main,
        }
    }

    /// Edges from each exit to one shared entry point
    fn connect(&mut self, exits: &[Anchor], entry: &Anchor) {
        let bend = entry.point.main - self.config().main_gap / 2.0;
        for exit in exits {
            let path = self.route(exit.point, entry.point, bend);
            self.push_edge(&exit.node, &entry.node, path);
        }
    }

    /// Edges from one shared origin point to each entry
    fn fan_out(&mut self, origin: &Anchor, entries: &[Anchor]) {
        let bend = origin.point.main + self.config().main_gap / 2.0;
        for entry in entries {
            let path = self.route(origin.point, entry.point, bend);
            self.push_edge(&origin.node, &entry.node, path);
        }
    }

    fn push_edge(&mut self, source: &str, target: &str, path: Vec<PathSegment>) {
        self.edges.push(Edge {
            id: format!("{}->{}", source, target),
            source: source.to_string(),
            target: target.to_string(),
            path,
        });
    }

    /// Orthogonal route turning at `bend` along the main axis, with rounded
    /// corners where the cross coordinate changes
    fn route(&self, from: AxisPoint, to: AxisPoint, bend: f64) -> Vec<PathSegment> {
        let delta = to.cross - from.cross;
        if delta.abs() < f64::EPSILON {
            return vec![self.segment_move(from), self.segment_line(to)];
        }

        let radius = self
            .config()
            .bend_radius
            .min(delta.abs() / 2.0)
            .min((bend - from.main).abs())
            .min((to.main - bend).abs());
        let sign = delta.signum();

        vec![
            self.segment_move(from),
            self.segment_line(AxisPoint::new(bend - radius, from.cross)),
            self.segment_curve(
                AxisPoint::new(bend, from.cross),
                AxisPoint::new(bend, from.cross + sign * radius),
            ),
            self.segment_line(AxisPoint::new(bend, to.cross - sign * radius)),
            self.segment_curve(
                AxisPoint::new(bend, to.cross),
                AxisPoint::new(bend + radius, to.cross),
            ),
            self.segment_line(to),
        ]
    }

    fn segment_move(&self, point: AxisPoint) -> PathSegment {
        PathSegment::move_to(self.builder.to_position(point))
    }

    fn segment_line(&self, point: AxisPoint) -> PathSegment {
        PathSegment::line_to(self.builder.to_position(point))
    }

    fn segment_curve(&self, control: AxisPoint, end: AxisPoint) -> PathSegment {
        PathSegment::curve_to(self.builder.to_position(control), self.builder.to_position(end))
    }
}

fn pseudo_custom_data(role: NodeRole) -> CustomData {
    let title = match role {
        NodeRole::Start => "Start",
        NodeRole::End => "End",
        NodeRole::Placeholder => "Empty branch",
        NodeRole::Missing => "Missing task",
        NodeRole::Task => "",
    };
    CustomData {
        icon: None,
        title: Some(title.to_string()),
        description: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LayoutDirection;
    use crate::descriptor::ToolDefinition;
    use crate::graph::PathCommand;
    use crate::types::TaskType;

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        for name in ["a", "b", "c", "d", "e"] {
            registry.register(ToolDefinition::new(name, name.to_uppercase(), "test"));
        }
        registry
    }

    /// `[A, FORK{B | C}, JOIN, D]`
    fn scenario() -> Vec<Task> {
        vec![
            Task::simple("a"),
            Task::fork("fork", vec![vec![Task::simple("b")], vec![Task::simple("c")]]),
            Task::join("join", vec!["b".into(), "c".into()]),
            Task::simple("d"),
        ]
    }

    fn build(tasks: &[Task]) -> FlowGraph {
        let registry = registry();
        let config = LayoutConfig::default();
        GraphBuilder::new(&registry, &config).build(tasks).unwrap()
    }

    #[test]
    fn test_build_is_idempotent() {
        let tasks = scenario();
        assert_eq!(build(&tasks), build(&tasks));
    }

    #[test]
    fn test_pseudo_nodes_wrap_the_list() {
        let graph = build(&scenario());
        assert_eq!(graph.nodes.first().unwrap().id, START_NODE_ID);
        assert_eq!(graph.nodes.last().unwrap().id, END_NODE_ID);
        assert_eq!(graph.nodes.len(), 8);
        assert_eq!(graph.task_node_count(), 6);
    }

    #[test]
    fn test_fork_builds_two_lanes_with_shared_points() {
        let graph = build(&scenario());
        assert_eq!(
            graph.lanes_of("fork"),
            vec![BranchKey::Lane(0), BranchKey::Lane(1)]
        );

        let fan_out = graph.outgoing_edges("fork");
        assert_eq!(fan_out.len(), 2);
        assert_eq!(fan_out[0].origin(), fan_out[1].origin());

        let fan_in = graph.incoming_edges("join");
        assert_eq!(fan_in.len(), 2);
        assert_eq!(fan_in[0].terminal(), fan_in[1].terminal());

        let b = graph.find_node("b").unwrap();
        let c = graph.find_node("c").unwrap();
        assert_eq!(b.parent_id.as_deref(), Some("fork"));
        assert_eq!(b.position.y, c.position.y);
        assert!(b.position.x + b.size.width <= c.position.x);
    }

    #[test]
    fn test_join_follows_tallest_lane() {
        let tasks = vec![
            Task::fork(
                "fork",
                vec![
                    vec![Task::simple("b")],
                    vec![Task::simple("c"), Task::simple("e")],
                ],
            ),
            Task::join("join", vec!["b".into(), "e".into()]),
        ];
        let graph = build(&tasks);
        let e = graph.find_node("e").unwrap();
        let join = graph.find_node("join").unwrap();
        assert!(join.position.y > e.position.y + e.size.height);
    }

    #[test]
    fn test_nested_fork_lanes_do_not_overlap() {
        let inner = Task::fork(
            "inner",
            vec![vec![Task::simple("x")], vec![Task::simple("y")]],
        );
        let tasks = vec![
            Task::fork(
                "outer",
                vec![
                    vec![inner, Task::join("inner_join", vec!["x".into(), "y".into()])],
                    vec![Task::simple("z")],
                ],
            ),
            Task::join("outer_join", vec!["inner_join".into(), "z".into()]),
        ];
        let graph = build(&tasks);
        let y = graph.find_node("y").unwrap();
        let z = graph.find_node("z").unwrap();
        assert!(y.position.x + y.size.width <= z.position.x);
    }

    #[test]
    fn test_decision_has_lane_per_case_plus_default() {
        let tasks = vec![Task::decision(
            "switch",
            vec![
                ("high".to_string(), vec![Task::simple("b")]),
                ("low".to_string(), vec![Task::simple("c")]),
            ],
            vec![],
        )];
        let graph = build(&tasks);
        assert_eq!(graph.lanes_of("switch").len(), 3);
        let placeholder = placeholder_id("switch", &BranchKey::Default);
        assert_eq!(
            graph.find_node(&placeholder).unwrap().role,
            NodeRole::Placeholder
        );
        // Every lane converges on the end node.
        assert_eq!(graph.incoming_edges(END_NODE_ID).len(), 3);
    }

    #[test]
    fn test_unknown_tool_degrades() {
        let graph = build(&[Task::simple("mystery")]);
        let node = graph.find_node("mystery").unwrap();
        assert_eq!(node.tool_status, ToolStatus::Unsupported);
        assert_eq!(graph.find_node("workflow_end").unwrap().tool_status, ToolStatus::Known);
    }

    #[test]
    fn test_duplicate_reference_fails() {
        let registry = registry();
        let config = LayoutConfig::default();
        let tasks = vec![Task::simple("a"), Task::simple("a")];
        assert!(GraphBuilder::new(&registry, &config).build(&tasks).is_err());
    }

    #[test]
    fn test_missing_join_target_becomes_placeholder() {
        let mut tasks = scenario();
        tasks[2] = Task::join("join", vec!["b".into(), "gone".into()]);
        let graph = build(&tasks);

        let id = missing_node_id("join", "gone");
        let missing = graph.find_node(&id).unwrap();
        assert_eq!(missing.role, NodeRole::Missing);
        assert!(graph.incoming_edges("join").iter().any(|e| e.source == id));
    }

    #[test]
    fn test_standalone_join_shows_missing_targets() {
        let tasks = vec![
            Task::simple("a"),
            Task::join("j", vec!["a".into(), "ghost".into()]),
            Task::simple("b"),
        ];
        let graph = build(&tasks);

        let id = missing_node_id("j", "ghost");
        let missing = graph.find_node(&id).unwrap();
        assert_eq!(missing.role, NodeRole::Missing);
        assert!(graph.find_node(&missing_node_id("j", "a")).is_none());

        let sources: Vec<&str> = graph
            .incoming_edges("j")
            .iter()
            .map(|edge| edge.source.as_str())
            .collect();
        assert_eq!(sources.len(), 2);
        assert!(sources.contains(&"a"));
        assert!(sources.contains(&id.as_str()));

        let a = graph.find_node("a").unwrap();
        let j = graph.find_node("j").unwrap();
        assert_eq!(a.position.x, j.position.x);
        assert!(missing.position.x >= a.position.x + a.size.width);
        assert!(missing.position.y < j.position.y);
    }

    #[test]
    fn test_sub_workflow_restore_splices_nested_tasks() {
        let tasks = vec![Task::sub_workflow(
            "sub",
            "child",
            Some(vec![Task::simple("inner_a"), Task::simple("inner_b")]),
        )];

        let collapsed = build(&tasks);
        assert!(collapsed.find_node("inner_a").is_none());

        let registry = registry();
        let config = LayoutConfig::default();
        let restored: HashSet<NodeId> = ["sub".to_string()].into_iter().collect();
        let graph = GraphBuilder::new(&registry, &config)
            .with_restored(&restored)
            .build(&tasks)
            .unwrap();
        let inner = graph.find_node("inner_b").unwrap();
        assert_eq!(inner.parent_id.as_deref(), Some("sub"));
        assert_eq!(inner.lane.as_ref().unwrap().branch, BranchKey::Nested);
    }

    #[test]
    fn test_expanded_sub_workflow_uses_scoped_ids() {
        let mut registry = registry();
        let child = crate::version::WorkflowVersion::new("child", 1).with_tasks(vec![
            Task::fork("fork", vec![vec![Task::simple("a")], vec![Task::simple("b")]]),
            Task::join("join", vec!["a".into(), "b".into()]),
        ]);
        registry.register_workflows([&child]);
        let tasks = vec![Task::simple("a"), Task::sub_workflow("sw", "child", None)];
        let mut expansions = Expansions::new();
        expansions.expand(&registry, &tasks[1], Some("wf")).unwrap();

        let config = LayoutConfig::default();
        let graph = GraphBuilder::new(&registry, &config)
            .with_expansions(&expansions)
            .build(&tasks)
            .unwrap();

        let nested = graph.find_node("sw/a").unwrap();
        assert_eq!(nested.parent_id.as_deref(), Some("sw/fork"));
        assert!(graph.find_node("a").is_some());
        assert!(graph.find_node(&missing_node_id("sw/join", "sw/a")).is_none());
        assert!(graph
            .incoming_edges("sw/fork")
            .iter()
            .any(|edge| edge.source == "sw"));
        assert_eq!(graph.find_node("sw").unwrap().tool_status, ToolStatus::Known);
    }

    #[test]
    fn test_loop_has_back_edge() {
        let tasks = vec![Task::do_while("loop", vec![Task::simple("b")])];
        let graph = build(&tasks);
        assert!(graph
            .edges
            .iter()
            .any(|edge| edge.source == "b" && edge.target == "loop"));
    }

    #[test]
    fn test_horizontal_layout_swaps_axes() {
        let registry = registry();
        let config = LayoutConfig {
            direction: LayoutDirection::Horizontal,
            ..LayoutConfig::default()
        };
        let graph = GraphBuilder::new(&registry, &config)
            .build(&[Task::simple("a"), Task::simple("b")])
            .unwrap();
        let a = graph.find_node("a").unwrap();
        let b = graph.find_node("b").unwrap();
        assert_eq!(a.position.y, b.position.y);
        assert!(a.position.x < b.position.x);
    }

    #[test]
    fn test_edges_are_move_then_draw() {
        let graph = build(&scenario());
        for edge in &graph.edges {
            assert_eq!(edge.path[0].command, PathCommand::Move);
            assert!(edge.path.len() >= 2);
        }
        assert!(graph
            .outgoing_edges("fork")
            .iter()
            .any(|edge| edge.path.iter().any(|s| s.command == PathCommand::Curve)));
    }

    #[test]
    fn test_order_follows_depth_first_walk() {
        let graph = build(&scenario());
        let order = |id: &str| graph.find_node(id).unwrap().order;
        assert!(order("a") < order("fork"));
        assert!(order("fork") < order("b"));
        assert!(order("b") < order("c"));
        assert!(order("c") < order("join"));
        assert!(order("join") < order("d"));
    }

    #[test]
    fn test_empty_workflow_connects_start_to_end() {
        let graph = build(&[]);
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].source, START_NODE_ID);
        assert_eq!(graph.edges[0].target, END_NODE_ID);
    }

    #[test]
    fn test_opaque_task_lays_out_like_simple() {
        let task = Task::new("http", "call", TaskType::Other("HTTP".into()));
        let graph = build(&[task]);
        assert_eq!(graph.find_node("call").unwrap().role, NodeRole::Task);
    }
}
