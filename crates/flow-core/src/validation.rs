//! Workflow validation
//!
//! Authoring problems are reported as data rather than errors: a workflow
//! with a dangling reference still builds, renders and saves, the issue is
//! just attached to the node that holds it.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::registry::ToolRegistry;
use crate::types::{BranchKey, NodeId, Task, TaskKind};
use crate::variables::{VariableResolver, WorkflowVariables};

/// One problem found in a task list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ValidationIssue {
    /// A reference names a task or field that does not exist
    #[serde(rename_all = "camelCase")]
    DanglingReference {
        node_id: NodeId,
        expression: String,
        target: String,
    },
    /// A reference names a task that is not upstream of the consumer
    #[serde(rename_all = "camelCase")]
    OutOfScopeReference {
        node_id: NodeId,
        expression: String,
        target: String,
    },
    /// The task's tool is not in the registry
    #[serde(rename_all = "camelCase")]
    UnknownTool { node_id: NodeId, tool: String },
    /// A fork lane, decision case or loop body holds no tasks
    #[serde(rename_all = "camelCase")]
    EmptyBranch { node_id: NodeId, branch: BranchKey },
    /// A fork is not directly followed by its JOIN
    #[serde(rename_all = "camelCase")]
    MissingJoin { node_id: NodeId },
    /// A JOIN waits on a task that does not exist
    #[serde(rename_all = "camelCase")]
    UnresolvedJoin { node_id: NodeId, target: String },
}

impl ValidationIssue {
    /// Node the issue is attached to
    pub fn node_id(&self) -> &str {
        match self {
            ValidationIssue::DanglingReference { node_id, .. }
            | ValidationIssue::OutOfScopeReference { node_id, .. }
            | ValidationIssue::UnknownTool { node_id, .. }
            | ValidationIssue::EmptyBranch { node_id, .. }
            | ValidationIssue::MissingJoin { node_id }
            | ValidationIssue::UnresolvedJoin { node_id, .. } => node_id,
        }
    }

    /// Whether the workflow can not be started while this issue exists
    ///
    /// Empty lanes and broken fork/join pairs would be rejected by the
    /// orchestrator; reference problems only surface at run time.
    pub fn blocks_execution(&self) -> bool {
        matches!(
            self,
            ValidationIssue::EmptyBranch { .. }
                | ValidationIssue::MissingJoin { .. }
                | ValidationIssue::UnresolvedJoin { .. }
        )
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::DanglingReference {
                node_id,
                expression,
                ..
            } => write!(f, "'{}' references missing value {}", node_id, expression),
            ValidationIssue::OutOfScopeReference {
                node_id,
                expression,
                target,
            } => write!(
                f,
                "'{}' references {} but '{}' does not run before it",
                node_id, expression, target
            ),
            ValidationIssue::UnknownTool { node_id, tool } => {
                write!(f, "'{}' uses unknown tool '{}'", node_id, tool)
            }
            ValidationIssue::EmptyBranch { node_id, branch } => {
                write!(f, "'{}' has an empty branch ({})", node_id, branch)
            }
            ValidationIssue::MissingJoin { node_id } => {
                write!(f, "Fork '{}' is not followed by a join", node_id)
            }
            ValidationIssue::UnresolvedJoin { node_id, target } => {
                write!(f, "Join '{}' waits on missing task '{}'", node_id, target)
            }
        }
    }
}

/// Structural checks: unknown tools, empty branches and fork/join pairing
pub fn validate_structure(tasks: &[Task], registry: &ToolRegistry) -> Vec<ValidationIssue> {
    let mut existing = HashSet::new();
    for task in tasks {
        task.walk(&mut |t| {
            existing.insert(t.reference_name.as_str());
        });
    }

    let mut issues = Vec::new();
    check_list(tasks, registry, &existing, &mut issues);
    issues
}

fn check_list(
    tasks: &[Task],
    registry: &ToolRegistry,
    existing: &HashSet<&str>,
    issues: &mut Vec<ValidationIssue>,
) {
    for (index, task) in tasks.iter().enumerate() {
        let node_id = task.reference_name.clone();
        match task.kind() {
            TaskKind::Fork => {
                if tasks.get(index + 1).map(Task::kind) != Some(TaskKind::Join) {
                    issues.push(ValidationIssue::MissingJoin {
                        node_id: node_id.clone(),
                    });
                }
            }
            TaskKind::Join => {
                for target in task.join_on.iter().flatten() {
                    if !existing.contains(target.as_str()) {
                        issues.push(ValidationIssue::UnresolvedJoin {
                            node_id: node_id.clone(),
                            target: target.clone(),
                        });
                    }
                }
            }
            TaskKind::Simple | TaskKind::SubWorkflow | TaskKind::Opaque => {
                if !registry.has_tool(&task.name) {
                    issues.push(ValidationIssue::UnknownTool {
                        node_id: node_id.clone(),
                        tool: task.name.clone(),
                    });
                }
            }
            TaskKind::Decision | TaskKind::Loop => {}
        }

        for (branch, lane) in task.branches() {
            // An empty default case simply falls through.
            if lane.is_empty() && branch != BranchKey::Default && branch != BranchKey::Nested {
                issues.push(ValidationIssue::EmptyBranch {
                    node_id: node_id.clone(),
                    branch: branch.clone(),
                });
            }
            check_list(lane, registry, existing, issues);
        }
    }
}

/// Every check: structure plus variable references
pub fn validate_workflow(
    tasks: &[Task],
    registry: &ToolRegistry,
    resolver: &VariableResolver<'_>,
    variables: &WorkflowVariables,
) -> Vec<ValidationIssue> {
    let mut issues = validate_structure(tasks, registry);
    issues.extend(resolver.check_references(tasks, variables));
    if !issues.is_empty() {
        log::debug!("Validation found {} issues", issues.len());
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ToolDefinition;

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        for name in ["a", "b", "c"] {
            registry.register(ToolDefinition::new(name, name, "test"));
        }
        registry
    }

    #[test]
    fn test_valid_workflow_has_no_issues() {
        let tasks = vec![
            Task::simple("a"),
            Task::fork("fork", vec![vec![Task::simple("b")], vec![Task::simple("c")]]),
            Task::join("join", vec!["b".into(), "c".into()]),
        ];
        assert!(validate_structure(&tasks, &registry()).is_empty());
    }

    #[test]
    fn test_structural_issues() {
        let tasks = vec![
            Task::simple("mystery"),
            Task::fork("fork", vec![vec![Task::simple("b")], vec![]]),
            Task::simple("a"),
            Task::join("join", vec!["b".into(), "gone".into()]),
        ];
        let issues = validate_structure(&tasks, &registry());

        assert!(issues.contains(&ValidationIssue::UnknownTool {
            node_id: "mystery".into(),
            tool: "mystery".into(),
        }));
        assert!(issues.contains(&ValidationIssue::MissingJoin {
            node_id: "fork".into()
        }));
        assert!(issues.contains(&ValidationIssue::EmptyBranch {
            node_id: "fork".into(),
            branch: BranchKey::Lane(1),
        }));
        assert!(issues.contains(&ValidationIssue::UnresolvedJoin {
            node_id: "join".into(),
            target: "gone".into(),
        }));
        assert_eq!(issues.len(), 4);
        assert!(issues.iter().all(|issue| issue.node_id() != "a"));
    }

    #[test]
    fn test_empty_default_case_is_allowed() {
        let tasks = vec![Task::decision(
            "switch",
            vec![("x".to_string(), vec![Task::simple("a")])],
            vec![],
        )];
        assert!(validate_structure(&tasks, &registry()).is_empty());
    }

    #[test]
    fn test_blocking_issues() {
        let empty = ValidationIssue::EmptyBranch {
            node_id: "f".into(),
            branch: BranchKey::Lane(0),
        };
        let unknown = ValidationIssue::UnknownTool {
            node_id: "x".into(),
            tool: "x".into(),
        };
        assert!(empty.blocks_execution());
        assert!(!unknown.blocks_execution());
        assert_eq!(empty.to_string(), "'f' has an empty branch (lane-0)");
    }
}
