//! Sub-workflow expansion
//!
//! A restored sub-workflow without an inline definition is filled from the
//! definition its tool carries (see [`ToolRegistry::sub_workflow_tasks`]).
//! Expanded tasks are a view only: they are never written back into the task
//! list, and their node ids are scoped under the sub-workflow node
//! (`parent/child`) so they can not collide with the outer workflow's
//! reference names. Nested sub-workflows with a registered definition are
//! expanded too, and a workflow that would contain itself is rejected.

use std::collections::{HashMap, HashSet};

use crate::error::{FlowError, Result};
use crate::registry::ToolRegistry;
use crate::types::{BranchKey, NodeId, Task, TaskKind};

const NESTED_SEPARATOR: char = '/';

/// Node id of `reference` expanded under the sub-workflow node `parent_id`
pub fn nested_node_id(parent_id: &str, reference: &str) -> NodeId {
    format!("{}{}{}", parent_id, NESTED_SEPARATOR, reference)
}

/// Expanded children, keyed by the sub-workflow node they belong to
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Expansions {
    lists: HashMap<NodeId, Vec<Task>>,
}

impl Expansions {
    /// No expansions
    pub fn new() -> Self {
        Self::default()
    }

    /// Expanded children of the sub-workflow node `id`
    pub fn get(&self, id: &str) -> Option<&[Task]> {
        self.lists.get(id).map(Vec::as_slice)
    }

    /// `id` has expanded children
    pub fn contains(&self, id: &str) -> bool {
        self.lists.contains_key(id)
    }

    /// Nothing is expanded
    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    /// Every node id that only exists through an expansion
    pub fn node_ids(&self) -> HashSet<NodeId> {
        let mut ids = HashSet::new();
        for list in self.lists.values() {
            for task in list {
                task.walk(&mut |task| {
                    ids.insert(task.reference_name.clone());
                });
            }
        }
        ids
    }

    /// Expand the sub-workflow `task` from registered definitions
    ///
    /// `outer_workflow` is the workflow being edited; a sub-workflow naming
    /// it, or naming any workflow it is already nested in, fails with
    /// [`FlowError::SubWorkflowCycle`]. Nothing is recorded on failure.
    pub fn expand(
        &mut self,
        registry: &ToolRegistry,
        task: &Task,
        outer_workflow: Option<&str>,
    ) -> Result<()> {
        let mut path: Vec<String> = outer_workflow.map(str::to_string).into_iter().collect();
        let mut found = HashMap::new();
        expand_into(registry, task, &mut path, &mut found)?;
        if !found.contains_key(&task.reference_name) {
            return Err(FlowError::invalid_target(
                &task.reference_name,
                "sub-workflow has no definition to expand",
            ));
        }
        log::debug!(
            "Expanded sub-workflow '{}' ({} nested lists)",
            task.reference_name,
            found.len()
        );
        self.lists.extend(found);
        Ok(())
    }

    /// Drop the expansion of `id` and every expansion nested under it
    pub fn remove(&mut self, id: &str) -> bool {
        let prefix = nested_node_id(id, "");
        let before = self.lists.len();
        self.lists
            .retain(|key, _| key != id && !key.starts_with(&prefix));
        self.lists.len() != before
    }

    /// Keep only expansions whose outermost sub-workflow satisfies `keep`
    pub fn retain_roots(&mut self, keep: impl Fn(&str) -> bool) {
        self.lists.retain(|key, _| {
            let root = key.split(NESTED_SEPARATOR).next().unwrap_or(key);
            keep(root)
        });
    }

    /// Drop every expansion
    pub fn clear(&mut self) {
        self.lists.clear();
    }
}

fn expand_into(
    registry: &ToolRegistry,
    task: &Task,
    path: &mut Vec<String>,
    found: &mut HashMap<NodeId, Vec<Task>>,
) -> Result<()> {
    let Some(workflow) = task.sub_workflow_name() else {
        return Ok(());
    };
    if path.iter().any(|seen| seen == workflow) {
        return Err(FlowError::SubWorkflowCycle {
            node_id: task.reference_name.clone(),
            workflow: workflow.to_string(),
        });
    }
    let Some(tasks) = registry.sub_workflow_tasks(&task.name) else {
        return Ok(());
    };

    let scoped: Vec<Task> = tasks
        .into_iter()
        .map(|child| scope_task(&task.reference_name, child))
        .collect();

    path.push(workflow.to_string());
    let mut collapsed: Vec<&Task> = Vec::new();
    for child in &scoped {
        child.walk(&mut |nested| {
            if nested.kind() == TaskKind::SubWorkflow && nested.branches().is_empty() {
                collapsed.push(nested);
            }
        });
    }
    for nested in collapsed {
        expand_into(registry, nested, path, found)?;
    }
    path.pop();

    found.insert(task.reference_name.clone(), scoped);
    Ok(())
}

/// Rename a task and everything under it into the scope of `parent_id`
fn scope_task(parent_id: &str, mut task: Task) -> Task {
    task.reference_name = nested_node_id(parent_id, &task.reference_name);
    if let Some(join_on) = task.join_on.as_mut() {
        for reference in join_on.iter_mut() {
            *reference = nested_node_id(parent_id, reference);
        }
    }
    let keys: Vec<BranchKey> = task.branches().into_iter().map(|(key, _)| key).collect();
    for key in keys {
        if let Some(lane) = task.branch_mut(&key) {
            let scoped = std::mem::take(lane)
                .into_iter()
                .map(|child| scope_task(parent_id, child))
                .collect();
            *lane = scoped;
        }
    }
    task
}
