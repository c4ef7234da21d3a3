//! Id-indexed task arena
//!
//! [`TaskTree`] owns the canonical task list and an index from reference name
//! to the task's location (enclosing composite, branch, position). The index
//! is rebuilt from scratch whenever the list changes, and rebuilding is also
//! where reference-name uniqueness is enforced.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::types::{count_tasks, BranchKey, NodeId, Task, TaskKind, END_NODE_ID, START_NODE_ID};

/// Where a task sits in the tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    /// Enclosing composite task, `None` for the root list
    pub parent: Option<NodeId>,
    pub branch: BranchKey,
    pub index: usize,
}

/// Separator between the parent id and branch key in placeholder ids
const PLACEHOLDER_SEPARATOR: &str = "::";

/// Id of the insertion placeholder shown for an empty lane
pub fn placeholder_id(parent_id: &str, branch: &BranchKey) -> NodeId {
    format!("{}{}{}", parent_id, PLACEHOLDER_SEPARATOR, branch)
}

/// Split a placeholder id into its parent id and branch key
pub fn parse_placeholder_id(id: &str) -> Option<(&str, BranchKey)> {
    let (parent, branch) = id.rsplit_once(PLACEHOLDER_SEPARATOR)?;
    let branch = match branch {
        "default" => BranchKey::Default,
        "loop" => BranchKey::Loop,
        "nested" => BranchKey::Nested,
        other => {
            if let Some(index) = other.strip_prefix("lane-") {
                BranchKey::Lane(index.parse().ok()?)
            } else if let Some(name) = other.strip_prefix("case-") {
                BranchKey::Case(name.to_string())
            } else {
                return None;
            }
        }
    };
    Some((parent, branch))
}

/// Index span `[start, end)` of the structural unit at `index`
///
/// A fork and the JOIN directly after it form one unit; addressing either
/// one yields the span covering both.
pub fn unit_span(list: &[Task], index: usize) -> (usize, usize) {
    let kind = list.get(index).map(Task::kind);
    let next_is_join = list.get(index + 1).map(Task::kind) == Some(TaskKind::Join);
    let prev_is_fork = index > 0 && list.get(index - 1).map(Task::kind) == Some(TaskKind::Fork);

    match kind {
        Some(TaskKind::Fork) if next_is_join => (index, index + 2),
        Some(TaskKind::Join) if prev_is_fork => (index - 1, index + 1),
        _ => (index, index + 1),
    }
}

/// Whether the task at `index` is a JOIN owned by the fork before it
pub fn is_paired_join(list: &[Task], index: usize) -> bool {
    list.get(index).map(Task::kind) == Some(TaskKind::Join)
        && index > 0
        && list.get(index - 1).map(Task::kind) == Some(TaskKind::Fork)
}

/// Build the location index, failing on duplicate or reserved names
pub(crate) fn build_index(tasks: &[Task]) -> Result<HashMap<NodeId, Location>> {
    let mut index = HashMap::with_capacity(count_tasks(tasks));
    index_list(tasks, None, &BranchKey::Root, &mut index)?;
    Ok(index)
}

fn index_list(
    tasks: &[Task],
    parent: Option<&str>,
    branch: &BranchKey,
    index: &mut HashMap<NodeId, Location>,
) -> Result<()> {
    for (position, task) in tasks.iter().enumerate() {
        let name = task.reference_name.as_str();
        if name == START_NODE_ID || name == END_NODE_ID {
            return Err(FlowError::ReservedReference(name.to_string()));
        }
        let location = Location {
            parent: parent.map(str::to_string),
            branch: branch.clone(),
            index: position,
        };
        if index.insert(name.to_string(), location).is_some() {
            return Err(FlowError::DuplicateReference(name.to_string()));
        }
        for (key, lane) in task.branches() {
            index_list(lane, Some(name), &key, index)?;
        }
    }
    Ok(())
}

/// Canonical task list plus its location index
#[derive(Debug, Clone, Default)]
pub struct TaskTree {
    pub(crate) tasks: Vec<Task>,
    pub(crate) index: HashMap<NodeId, Location>,
}

impl TaskTree {
    /// Create a tree, rejecting duplicate or reserved reference names
    pub fn new(tasks: Vec<Task>) -> Result<Self> {
        let index = build_index(&tasks)?;
        Ok(Self { tasks, index })
    }

    /// The canonical task list
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Give up the index and return the task list
    pub fn into_tasks(self) -> Vec<Task> {
        self.tasks
    }

    /// Total number of tasks, nested ones included
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// No tasks at all
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// `id` names a task in the tree
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Where `id` sits: parent, branch and position
    pub fn location(&self, id: &str) -> Option<&Location> {
        self.index.get(id)
    }

    /// Every reference name in the tree
    pub fn reference_names(&self) -> BTreeSet<String> {
        self.index.keys().cloned().collect()
    }

    /// Chain of composite ids enclosing `id`, innermost first
    pub fn ancestors(&self, id: &str) -> Vec<NodeId> {
        let mut ancestors = Vec::new();
        let mut current = self.index.get(id).and_then(|loc| loc.parent.clone());
        while let Some(parent) = current {
            current = self.index.get(&parent).and_then(|loc| loc.parent.clone());
            ancestors.push(parent);
        }
        ancestors
    }

    /// Whether `id` is nested (at any depth) under `ancestor`
    pub fn is_descendant(&self, id: &str, ancestor: &str) -> bool {
        self.ancestors(id).iter().any(|a| a == ancestor)
    }

    /// Steps from the root down to `id`: the branch and position at each level
    fn path_to(&self, id: &str) -> Option<Vec<(BranchKey, usize)>> {
        let mut steps = Vec::new();
        let mut current = Some(id.to_string());
        while let Some(node_id) = current {
            let location = self.index.get(&node_id)?;
            steps.push((location.branch.clone(), location.index));
            current = location.parent.clone();
        }
        steps.reverse();
        Some(steps)
    }

    /// Look up a task by reference name
    pub fn get(&self, id: &str) -> Option<&Task> {
        let steps = self.path_to(id)?;
        let ((_, first), rest) = steps.split_first()?;
        let mut task = self.tasks.get(*first)?;
        for (branch, index) in rest {
            task = task
                .branches()
                .into_iter()
                .find(|(key, _)| key == branch)
                .and_then(|(_, lane)| lane.get(*index))?;
        }
        Some(task)
    }

    /// The list a task lives in, given its parent and branch
    pub fn list(&self, parent: Option<&str>, branch: &BranchKey) -> Option<&[Task]> {
        match parent {
            None => Some(&self.tasks),
            Some(parent_id) => self
                .get(parent_id)?
                .branches()
                .into_iter()
                .find(|(key, _)| key == branch)
                .map(|(_, lane)| lane),
        }
    }

    /// Rebuild the index after the task list was replaced wholesale
    pub fn replace(&mut self, tasks: Vec<Task>) -> Result<()> {
        let index = build_index(&tasks)?;
        self.tasks = tasks;
        self.index = index;
        Ok(())
    }

    /// Run `edit` on a copy of the list and commit it only if it succeeds
    /// and the result still has unique reference names
    pub(crate) fn transaction<R>(
        &mut self,
        edit: impl FnOnce(&mut Vec<Task>) -> Result<R>,
    ) -> Result<R> {
        let mut draft = self.tasks.clone();
        let output = edit(&mut draft)?;
        let index = build_index(&draft)?;
        self.tasks = draft;
        self.index = index;
        Ok(output)
    }
}

/// Mutable access to the list identified by `parent`/`branch` inside `tasks`
pub(crate) fn list_mut<'a>(
    tasks: &'a mut Vec<Task>,
    index: &HashMap<NodeId, Location>,
    parent: Option<&str>,
    branch: &BranchKey,
) -> Option<&'a mut Vec<Task>> {
    match parent {
        None => Some(tasks),
        Some(parent_id) => task_mut(tasks, index, parent_id)?.branch_mut(branch),
    }
}

/// Mutable access to the task `id` inside `tasks`, located through `index`
pub(crate) fn task_mut<'a>(
    tasks: &'a mut Vec<Task>,
    index: &HashMap<NodeId, Location>,
    id: &str,
) -> Option<&'a mut Task> {
    let mut steps = Vec::new();
    let mut current = Some(id.to_string());
    while let Some(node_id) = current {
        let location = index.get(&node_id)?;
        steps.push((location.branch.clone(), location.index));
        current = location.parent.clone();
    }
    steps.reverse();

    let ((_, first), rest) = steps.split_first()?;
    let mut task = tasks.get_mut(*first)?;
    for (branch, position) in rest {
        task = task.branch_mut(branch)?.get_mut(*position)?;
    }
    Some(task)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Task> {
        vec![
            Task::simple("a"),
            Task::fork(
                "fork",
                vec![vec![Task::simple("b")], vec![Task::simple("c")]],
            ),
            Task::join("join", vec!["b".into(), "c".into()]),
            Task::simple("d"),
        ]
    }

    #[test]
    fn test_index_covers_nested_tasks() {
        let tree = TaskTree::new(sample()).unwrap();
        assert_eq!(tree.len(), 6);
        assert_eq!(
            tree.location("c"),
            Some(&Location {
                parent: Some("fork".into()),
                branch: BranchKey::Lane(1),
                index: 0,
            })
        );
        assert_eq!(tree.get("c").unwrap().reference_name, "c");
    }

    #[test]
    fn test_duplicate_reference_rejected() {
        let mut tasks = sample();
        tasks.push(Task::simple("b"));
        let err = TaskTree::new(tasks).unwrap_err();
        assert!(matches!(err, FlowError::DuplicateReference(name) if name == "b"));
    }

    #[test]
    fn test_reserved_reference_rejected() {
        let err = TaskTree::new(vec![Task::simple(START_NODE_ID)]).unwrap_err();
        assert!(matches!(err, FlowError::ReservedReference(_)));
    }

    #[test]
    fn test_descendants() {
        let tree = TaskTree::new(sample()).unwrap();
        assert!(tree.is_descendant("b", "fork"));
        assert!(!tree.is_descendant("a", "fork"));
        assert!(!tree.is_descendant("fork", "fork"));
        assert_eq!(tree.ancestors("b"), vec!["fork".to_string()]);
    }

    #[test]
    fn test_unit_span_pairs_fork_and_join() {
        let tasks = sample();
        assert_eq!(unit_span(&tasks, 0), (0, 1));
        assert_eq!(unit_span(&tasks, 1), (1, 3));
        assert_eq!(unit_span(&tasks, 2), (1, 3));
        assert!(is_paired_join(&tasks, 2));
        assert!(!is_paired_join(&tasks, 3));
    }

    #[test]
    fn test_placeholder_id_round_trip() {
        for branch in [
            BranchKey::Lane(3),
            BranchKey::Case("yes".into()),
            BranchKey::Default,
            BranchKey::Loop,
        ] {
            let id = placeholder_id("switch_1", &branch);
            assert_eq!(parse_placeholder_id(&id), Some(("switch_1", branch)));
        }
        assert_eq!(parse_placeholder_id("plain"), None);
    }

    #[test]
    fn test_transaction_rolls_back_on_duplicate() {
        let mut tree = TaskTree::new(sample()).unwrap();
        let result = tree.transaction(|tasks| {
            tasks.push(Task::simple("a"));
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(tree.len(), 6);
        assert_eq!(tree.tasks().len(), 4);
    }
}
