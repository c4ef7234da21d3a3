//! Structural edits on the task list
//!
//! Every change to a workflow's structure goes through one of the operations
//! below. Each runs as a transaction on [`TaskTree`]: the edit is applied to a
//! draft, the draft is re-indexed (which re-checks reference-name
//! uniqueness), and only then committed. A rejected edit leaves the tree
//! untouched.
//!
//! A FORK and the JOIN directly after it move, and are removed, as one unit.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{FlowError, Result};
use crate::tree::{
    build_index, is_paired_join, list_mut, parse_placeholder_id, task_mut, unit_span, Location,
    TaskTree,
};
use crate::types::{BranchKey, NodeId, Task, TaskKind, END_NODE_ID, START_NODE_ID};

/// Side of the target a task is inserted on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPosition {
    Before,
    After,
}

impl InsertPosition {
    /// `true` maps to `After`
    pub fn from_insert_after(insert_after: bool) -> Self {
        if insert_after {
            InsertPosition::After
        } else {
            InsertPosition::Before
        }
    }
}

/// Concrete list position an insert resolves to
#[derive(Debug, Clone, PartialEq, Eq)]
struct Slot {
    parent: Option<NodeId>,
    branch: BranchKey,
    index: usize,
}

/// Resolve an insert target (task, pseudo-node or lane placeholder) to a slot
fn resolve_slot(
    tasks: &[Task],
    index: &HashMap<NodeId, Location>,
    target: &str,
    position: InsertPosition,
) -> Result<Slot> {
    if target == START_NODE_ID {
        return match position {
            InsertPosition::After => Ok(Slot {
                parent: None,
                branch: BranchKey::Root,
                index: 0,
            }),
            InsertPosition::Before => Err(FlowError::invalid_target(
                target,
                "nothing can precede the start node",
            )),
        };
    }
    if target == END_NODE_ID {
        return match position {
            InsertPosition::Before => Ok(Slot {
                parent: None,
                branch: BranchKey::Root,
                index: tasks.len(),
            }),
            InsertPosition::After => Err(FlowError::invalid_target(
                target,
                "nothing can follow the end node",
            )),
        };
    }

    if let Some(location) = index.get(target) {
        let list = lookup_list(tasks, index, location.parent.as_deref(), &location.branch)
            .ok_or_else(|| FlowError::UnknownNode(target.to_string()))?;
        let (start, end) = unit_span(list, location.index);
        return Ok(Slot {
            parent: location.parent.clone(),
            branch: location.branch.clone(),
            index: match position {
                InsertPosition::Before => start,
                InsertPosition::After => end,
            },
        });
    }

    if let Some((parent, branch)) = parse_placeholder_id(target) {
        if index.contains_key(parent) {
            let len = lookup_list(tasks, index, Some(parent), &branch)
                .map(<[Task]>::len)
                .unwrap_or(0);
            return Ok(Slot {
                parent: Some(parent.to_string()),
                branch,
                index: match position {
                    InsertPosition::Before => 0,
                    InsertPosition::After => len,
                },
            });
        }
    }

    Err(FlowError::UnknownNode(target.to_string()))
}

fn lookup_list<'a>(
    tasks: &'a [Task],
    index: &HashMap<NodeId, Location>,
    parent: Option<&str>,
    branch: &BranchKey,
) -> Option<&'a [Task]> {
    let Some(parent_id) = parent else {
        return Some(tasks);
    };
    let location = index.get(parent_id)?;
    let list = lookup_list(tasks, index, location.parent.as_deref(), &location.branch)?;
    list.get(location.index)?
        .branches()
        .into_iter()
        .find(|(key, _)| key == branch)
        .map(|(_, lane)| lane)
}

/// Splice `new_tasks` into the slot, creating lane containers as needed
fn splice_into(
    tasks: &mut Vec<Task>,
    index: &HashMap<NodeId, Location>,
    slot: &Slot,
    new_tasks: Vec<Task>,
) -> Result<()> {
    let parent_label = slot.parent.clone().unwrap_or_default();
    let list = list_mut(tasks, index, slot.parent.as_deref(), &slot.branch).ok_or_else(|| {
        FlowError::invalid_target(parent_label, format!("has no branch {}", slot.branch))
    })?;
    let tail = list.split_off(slot.index.min(list.len()));
    list.extend(new_tasks);
    list.extend(tail);
    Ok(())
}

/// Reject sub-workflows that would be nested inside a workflow of the same
/// name
///
/// `enclosing` lists the workflows around the insertion point, outermost
/// first. Inline definitions inside `tasks` are checked as well.
pub fn ensure_acyclic_nesting(enclosing: &[String], tasks: &[Task]) -> Result<()> {
    let mut path = enclosing.to_vec();
    check_nesting(&mut path, tasks)
}

fn check_nesting(path: &mut Vec<String>, tasks: &[Task]) -> Result<()> {
    for task in tasks {
        let workflow = task.sub_workflow_name();
        if let Some(workflow) = workflow {
            if path.iter().any(|seen| seen == workflow) {
                return Err(FlowError::SubWorkflowCycle {
                    node_id: task.reference_name.clone(),
                    workflow: workflow.to_string(),
                });
            }
            path.push(workflow.to_string());
        }
        for (_, lane) in task.branches() {
            check_nesting(path, lane)?;
        }
        if workflow.is_some() {
            path.pop();
        }
    }
    Ok(())
}

/// Reject JOINs addressed on their own and pseudo-nodes
fn ensure_movable(tree: &TaskTree, id: &str) -> Result<Location> {
    if id == START_NODE_ID || id == END_NODE_ID {
        return Err(FlowError::invalid_target(id, "pseudo-nodes can not be edited"));
    }
    let location = tree
        .location(id)
        .cloned()
        .ok_or_else(|| FlowError::UnknownNode(id.to_string()))?;
    let list = tree
        .list(location.parent.as_deref(), &location.branch)
        .ok_or_else(|| FlowError::UnknownNode(id.to_string()))?;
    if is_paired_join(list, location.index) {
        return Err(FlowError::PairedJoin(id.to_string()));
    }
    Ok(location)
}

/// Take the structural unit at `location` out of the list
fn detach(
    tasks: &mut Vec<Task>,
    index: &HashMap<NodeId, Location>,
    location: &Location,
) -> Result<Vec<Task>> {
    let parent_label = location.parent.clone().unwrap_or_default();
    let list = list_mut(tasks, index, location.parent.as_deref(), &location.branch)
        .ok_or_else(|| FlowError::UnknownNode(parent_label))?;
    let (start, end) = unit_span(list, location.index);
    Ok(list.drain(start..end).collect())
}

/// RFC 7386 JSON merge patch
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

impl TaskTree {
    /// Workflows of the sub-workflow tasks enclosing `parent`, outermost
    /// first, `parent` itself included
    fn enclosing_workflows(&self, parent: Option<&str>) -> Vec<String> {
        let Some(parent) = parent else {
            return Vec::new();
        };
        let mut chain = self.ancestors(parent);
        chain.reverse();
        chain.push(parent.to_string());
        chain
            .iter()
            .filter_map(|id| self.get(id))
            .filter_map(Task::sub_workflow_name)
            .map(str::to_string)
            .collect()
    }

    /// Insert tasks next to `target`
    ///
    /// `target` may be a task, the start/end pseudo-node, or a lane
    /// placeholder id. Inserting next to a fork or its JOIN places the tasks
    /// outside the fork unit. A sub-workflow can not be inserted inside a
    /// sub-workflow of the same workflow, at any depth.
    pub fn insert(
        &mut self,
        target: &str,
        position: InsertPosition,
        new_tasks: Vec<Task>,
    ) -> Result<()> {
        if new_tasks.is_empty() {
            return Ok(());
        }
        let slot = resolve_slot(&self.tasks, &self.index, target, position)?;
        ensure_acyclic_nesting(&self.enclosing_workflows(slot.parent.as_deref()), &new_tasks)?;
        let index = self.index.clone();
        self.transaction(|tasks| splice_into(tasks, &index, &slot, new_tasks))?;
        log::debug!("Inserted tasks {:?} {}", position, target);
        Ok(())
    }

    /// Insert `task` before `target`
    pub fn insert_before(&mut self, target: &str, task: Task) -> Result<()> {
        self.insert(target, InsertPosition::Before, vec![task])
    }

    /// Insert `task` after `target`
    pub fn insert_after(&mut self, target: &str, task: Task) -> Result<()> {
        self.insert(target, InsertPosition::After, vec![task])
    }

    /// Remove a task and its subtree, returning what was removed
    ///
    /// Removing a fork also removes its JOIN.
    pub fn remove(&mut self, id: &str) -> Result<Vec<Task>> {
        let location = ensure_movable(self, id)?;
        let index = self.index.clone();
        let removed = self.transaction(|tasks| detach(tasks, &index, &location))?;
        log::debug!("Removed '{}' ({} top-level tasks)", id, removed.len());
        Ok(removed)
    }

    /// Move the subtree at `id` next to `target`
    ///
    /// Fails with `StructuralCycle` when `target` lies inside the moved
    /// subtree, and with `InvalidTarget` when `target` is the task itself.
    /// Task count and the set of reference names are unchanged.
    pub fn move_task(&mut self, id: &str, target: &str, insert_after: bool) -> Result<()> {
        let location = ensure_movable(self, id)?;
        if target == id {
            return Err(FlowError::invalid_target(id, "a task can not be moved next to itself"));
        }

        let target_anchor = parse_placeholder_id(target)
            .filter(|(parent, _)| !self.contains(target) && self.contains(parent))
            .map(|(parent, _)| parent.to_string())
            .unwrap_or_else(|| target.to_string());

        let own_join = self
            .list(location.parent.as_deref(), &location.branch)
            .and_then(|list| {
                let (start, end) = unit_span(list, location.index);
                (end - start == 2).then(|| list[start + 1].reference_name.clone())
            });

        if target_anchor == id
            || self.is_descendant(&target_anchor, id)
            || own_join.as_deref() == Some(target_anchor.as_str())
        {
            return Err(FlowError::StructuralCycle {
                node_id: id.to_string(),
                target_id: target.to_string(),
            });
        }

        let position = InsertPosition::from_insert_after(insert_after);
        // Fail early on unknown targets, before anything is detached.
        let slot = resolve_slot(&self.tasks, &self.index, target, position)?;
        if let Some(moved) = self.get(id) {
            ensure_acyclic_nesting(
                &self.enclosing_workflows(slot.parent.as_deref()),
                std::slice::from_ref(moved),
            )?;
        }

        let index = self.index.clone();
        self.transaction(|tasks| {
            let moved = detach(tasks, &index, &location)?;
            let detached_index = build_index(tasks)?;
            let slot = resolve_slot(tasks, &detached_index, target, position)?;
            splice_into(tasks, &detached_index, &slot, moved)
        })?;
        log::debug!("Moved '{}' {:?} '{}'", id, position, target);
        Ok(())
    }

    /// Apply a JSON merge patch to a task
    ///
    /// The patch addresses the task's serialized form, so it can touch
    /// `inputParameters`, `__alias` or any preserved field. A patch that
    /// renames the task must keep reference names unique.
    pub fn update_raw(&mut self, id: &str, patch: &Value) -> Result<()> {
        if !self.contains(id) {
            return Err(FlowError::UnknownNode(id.to_string()));
        }
        let index = self.index.clone();
        self.transaction(|tasks| {
            let task = task_mut(tasks, &index, id)
                .ok_or_else(|| FlowError::UnknownNode(id.to_string()))?;
            let mut raw = serde_json::to_value(&*task)?;
            merge_patch(&mut raw, patch);
            *task = serde_json::from_value(raw)?;
            Ok(())
        })
    }

    /// Replace a task wholesale, keeping its position
    pub fn replace_task(&mut self, id: &str, replacement: Task) -> Result<()> {
        if !self.contains(id) {
            return Err(FlowError::UnknownNode(id.to_string()));
        }
        let index = self.index.clone();
        self.transaction(|tasks| {
            let task = task_mut(tasks, &index, id)
                .ok_or_else(|| FlowError::UnknownNode(id.to_string()))?;
            *task = replacement;
            Ok(())
        })
    }

    /// Add an empty lane to a fork or a new case to a decision
    pub fn add_branch(&mut self, id: &str) -> Result<BranchKey> {
        let task = self
            .get(id)
            .ok_or_else(|| FlowError::UnknownNode(id.to_string()))?;
        let key = match task.kind() {
            TaskKind::Fork => BranchKey::Lane(task.fork_tasks.as_ref().map_or(0, Vec::len)),
            TaskKind::Decision => {
                let cases = task.decision_cases.as_ref();
                let mut n = cases.map_or(0, |c| c.len()) + 1;
                while cases.is_some_and(|c| c.contains_key(&format!("case_{}", n))) {
                    n += 1;
                }
                BranchKey::Case(format!("case_{}", n))
            }
            _ => {
                return Err(FlowError::invalid_target(
                    id,
                    "only forks and decisions have branches",
                ))
            }
        };

        let index = self.index.clone();
        let new_key = key.clone();
        self.transaction(|tasks| {
            let task = task_mut(tasks, &index, id)
                .ok_or_else(|| FlowError::UnknownNode(id.to_string()))?;
            match &new_key {
                BranchKey::Lane(_) => task.fork_tasks.get_or_insert_with(Vec::new).push(Vec::new()),
                BranchKey::Case(name) => {
                    task.decision_cases
                        .get_or_insert_with(Default::default)
                        .insert(name.clone(), Vec::new());
                }
                _ => {}
            }
            Ok(())
        })?;
        Ok(key)
    }

    /// Point every paired JOIN at the last task of each lane of its fork
    ///
    /// Returns the ids of the joins whose `joinOn` changed.
    pub fn sync_join_targets(&mut self) -> Vec<NodeId> {
        let mut changed = Vec::new();
        sync_list(&mut self.tasks, &mut changed);
        if !changed.is_empty() {
            log::debug!("Resynced join targets of {:?}", changed);
        }
        changed
    }
}

fn sync_list(tasks: &mut [Task], changed: &mut Vec<NodeId>) {
    for index in 0..tasks.len() {
        if is_paired_join(tasks, index) {
            let targets: Vec<String> = tasks[index - 1]
                .fork_tasks
                .iter()
                .flatten()
                .filter_map(|lane| lane.last())
                .map(|task| task.reference_name.clone())
                .collect();
            let join = &mut tasks[index];
            if join.join_on.as_ref() != Some(&targets) {
                join.join_on = Some(targets);
                changed.push(join.reference_name.clone());
            }
        }

        let task = &mut tasks[index];
        let keys: Vec<BranchKey> = task.branches().into_iter().map(|(key, _)| key).collect();
        for key in keys {
            if let Some(lane) = task.branch_mut(&key) {
                sync_list(lane, changed);
            }
        }
    }
}
