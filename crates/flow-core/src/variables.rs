//! Variable resolver
//!
//! Derives the symbol table of values a task may reference: workflow inputs,
//! plus the declared outputs of every task upstream of it. A lane under a
//! fork or decision sees everything before the composite but nothing from
//! its sibling lanes; whatever follows the composite (its JOIN included)
//! sees every lane.
//!
//! Variables are addressed as `${<ref>.output.<field>}` with the JSONPath
//! `$.<ref>.output.<field>`; workflow inputs use the pseudo reference
//! `workflow` and the `input` segment.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::descriptor::ToolProperty;
use crate::registry::ToolRegistry;
use crate::tree::unit_span;
use crate::types::{NodeId, Task, TaskKind, WORKFLOW_REFERENCE};
use crate::validation::ValidationIssue;

/// Matches `${ref.output.path}` / `${workflow.input.name}`
static REFERENCE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{\s*([^.}\s]+)\.(input|output)((?:\.[^}\s]+)?)\s*\}")
        .expect("reference pattern is a valid regex")
});

/// One addressable value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    /// Template form, e.g. `${chat.output.text}`
    pub id: String,
    pub jsonpath: String,
    /// Dotted path below the `output`/`input` segment
    pub path: String,
    pub display_name: String,
    #[serde(rename = "type")]
    pub property_type: String,
    pub multiple: bool,
    /// Nested fields of object-typed values
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Variable>,
}

/// Variables exposed by one task, or by the workflow inputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableGroup {
    /// Producing task's reference name, or `workflow`
    pub reference: String,
    pub title: String,
    pub variables: Vec<Variable>,
}

/// Flattened lookup entry of the variables mapper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableField {
    pub id: String,
    pub jsonpath: String,
    pub reference: String,
    /// `<producer title> / <field label>`
    pub display_name: String,
    #[serde(rename = "type")]
    pub property_type: String,
}

/// Resolver output: groups in layout order plus scoping and lookup tables
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowVariables {
    /// Workflow inputs first, then one group per task in layout order
    pub groups: Vec<VariableGroup>,
    /// Keyed by both the template id and the JSONPath of every variable
    pub mapper: HashMap<String, VariableField>,
    /// Producers visible to each task
    scopes: HashMap<NodeId, Vec<NodeId>>,
}

impl WorkflowVariables {
    /// Look up a variable by template id or JSONPath
    pub fn lookup(&self, name: &str) -> Option<&VariableField> {
        self.mapper.get(name)
    }

    /// Producers whose outputs `node_id` may reference, in layout order
    pub fn scope(&self, node_id: &str) -> &[NodeId] {
        self.scopes.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether `consumer` may reference outputs of `producer`
    pub fn can_see(&self, consumer: &str, producer: &str) -> bool {
        producer == WORKFLOW_REFERENCE || self.scope(consumer).iter().any(|p| p == producer)
    }

    /// Groups visible to `node_id`: workflow inputs plus upstream producers
    pub fn visible_to(&self, node_id: &str) -> Vec<&VariableGroup> {
        self.groups
            .iter()
            .filter(|group| self.can_see(node_id, &group.reference))
            .collect()
    }

    /// Number of distinct variables, nested fields included
    pub fn variable_count(&self) -> usize {
        fn count(variables: &[Variable]) -> usize {
            variables.iter().map(|v| 1 + count(&v.children)).sum()
        }
        self.groups.iter().map(|group| count(&group.variables)).sum()
    }

    /// Output group of one node
    pub fn group(&self, reference: &str) -> Option<&VariableGroup> {
        self.groups.iter().find(|group| group.reference == reference)
    }
}

/// Builds [`WorkflowVariables`] from a task list
pub struct VariableResolver<'a> {
    registry: &'a ToolRegistry,
    inputs: &'a [ToolProperty],
}

impl<'a> VariableResolver<'a> {
    /// Resolver over `registry` outputs and the workflow's `inputs`
    pub fn new(registry: &'a ToolRegistry, inputs: &'a [ToolProperty]) -> Self {
        Self { registry, inputs }
    }

    /// Generate the symbol table for `tasks`
    pub fn generate(&self, tasks: &[Task]) -> WorkflowVariables {
        let mut variables = WorkflowVariables::default();

        let workflow_group = VariableGroup {
            reference: WORKFLOW_REFERENCE.to_string(),
            title: "Workflow input".to_string(),
            variables: self
                .inputs
                .iter()
                .map(|input| variable(WORKFLOW_REFERENCE, "input", input, None))
                .collect(),
        };
        register_group(&mut variables.mapper, &workflow_group);
        variables.groups.push(workflow_group);

        let mut visible = Vec::new();
        self.scope_list(tasks, &mut visible, &mut variables);
        variables
    }

    fn scope_list(
        &self,
        tasks: &[Task],
        visible: &mut Vec<NodeId>,
        variables: &mut WorkflowVariables,
    ) {
        let mut i = 0;
        while i < tasks.len() {
            let (_, end) = unit_span(tasks, i);
            let end = end.max(i + 1);
            let head = &tasks[i];
            self.enter(head, visible, variables);

            match head.kind() {
                TaskKind::Fork | TaskKind::Decision => {
                    let mut base = visible.clone();
                    base.push(head.reference_name.clone());
                    let mut produced = Vec::new();
                    for (_, lane) in head.branches() {
                        let mut lane_visible = base.clone();
                        self.scope_list(lane, &mut lane_visible, variables);
                        produced.extend(lane_visible.into_iter().skip(base.len()));
                    }
                    visible.push(head.reference_name.clone());
                    visible.extend(produced);
                    if let Some(join) = tasks.get(i + 1).filter(|_| end == i + 2) {
                        self.enter(join, visible, variables);
                        visible.push(join.reference_name.clone());
                    }
                }
                TaskKind::Loop => {
                    visible.push(head.reference_name.clone());
                    for (_, body) in head.branches() {
                        self.scope_list(body, visible, variables);
                    }
                }
                TaskKind::SubWorkflow => {
                    // The inline definition is its own workflow: it starts
                    // from an empty scope and leaks nothing outward.
                    for (_, nested) in head.branches() {
                        self.scope_list(nested, &mut Vec::new(), variables);
                    }
                    visible.push(head.reference_name.clone());
                }
                TaskKind::Simple | TaskKind::Join | TaskKind::Opaque => {
                    visible.push(head.reference_name.clone());
                }
            }
            i = end;
        }
    }

    /// Record the scope of `task` and its output group
    fn enter(&self, task: &Task, visible: &[NodeId], variables: &mut WorkflowVariables) {
        variables
            .scopes
            .insert(task.reference_name.clone(), visible.to_vec());

        let tool = self.registry.get(&task.name);
        let title = task
            .custom_data()
            .and_then(|data| data.title)
            .or_else(|| tool.map(|tool| tool.display_name.clone()))
            .unwrap_or_else(|| task.reference_name.clone());
        let group = VariableGroup {
            reference: task.reference_name.clone(),
            title,
            variables: tool
                .map(|tool| {
                    tool.output
                        .iter()
                        .map(|output| variable(&task.reference_name, "output", output, None))
                        .collect()
                })
                .unwrap_or_default(),
        };
        register_group(&mut variables.mapper, &group);
        variables.groups.push(group);
    }

    /// Scan every task's `inputParameters` for references that point at a
    /// missing task, a missing field, or a task that is not upstream
    pub fn check_references(
        &self,
        tasks: &[Task],
        variables: &WorkflowVariables,
    ) -> Vec<ValidationIssue> {
        let mut existing: HashMap<&str, &Task> = HashMap::new();
        for task in tasks {
            task.walk(&mut |t| {
                existing.insert(t.reference_name.as_str(), t);
            });
        }
        let input_names: HashSet<&str> = self.inputs.iter().map(|i| i.name.as_str()).collect();

        let mut issues = Vec::new();
        for task in tasks {
            task.walk(&mut |consumer| {
                let Some(params) = &consumer.input_parameters else {
                    return;
                };
                let mut strings = Vec::new();
                for value in params.values() {
                    collect_strings(value, &mut strings);
                }
                for text in strings {
                    for captures in REFERENCE_PATTERN.captures_iter(text) {
                        let expression = captures[0].to_string();
                        let target = captures[1].to_string();
                        let segment = &captures[2];
                        let field = captures
                            .get(3)
                            .map(|m| m.as_str().trim_start_matches('.'))
                            .unwrap_or("");
                        let node_id = consumer.reference_name.clone();

                        if target == WORKFLOW_REFERENCE {
                            if segment == "input" && !input_names.contains(first_segment(field)) {
                                issues.push(ValidationIssue::DanglingReference {
                                    node_id,
                                    expression,
                                    target,
                                });
                            }
                            continue;
                        }

                        let Some(producer) = existing.get(target.as_str()) else {
                            issues.push(ValidationIssue::DanglingReference {
                                node_id,
                                expression,
                                target,
                            });
                            continue;
                        };

                        if !variables.can_see(&node_id, &target) {
                            issues.push(ValidationIssue::OutOfScopeReference {
                                node_id,
                                expression,
                                target,
                            });
                            continue;
                        }

                        if segment == "output" && !self.declares_output(producer, field) {
                            issues.push(ValidationIssue::DanglingReference {
                                node_id,
                                expression,
                                target,
                            });
                        }
                    }
                }
            });
        }
        issues
    }

    /// Whether the producer's tool declares the first segment of `field`
    ///
    /// Producers without a known tool, or with an undeclared schema, accept
    /// any field.
    fn declares_output(&self, producer: &Task, field: &str) -> bool {
        let Some(tool) = self.registry.get(&producer.name) else {
            return true;
        };
        tool.output.is_empty()
            || field.is_empty()
            || tool
                .output
                .iter()
                .any(|output| output.name == first_segment(field))
    }
}

fn first_segment(field: &str) -> &str {
    field
        .split(['.', '['])
        .next()
        .unwrap_or(field)
}

fn collect_strings<'v>(value: &'v Value, out: &mut Vec<&'v str>) {
    match value {
        Value::String(text) => out.push(text),
        Value::Array(items) => items.iter().for_each(|item| collect_strings(item, out)),
        Value::Object(map) => map.values().for_each(|item| collect_strings(item, out)),
        _ => {}
    }
}

/// Build the variable for `property`, recursing into nested fields
fn variable(
    reference: &str,
    segment: &str,
    property: &ToolProperty,
    parent: Option<(&str, bool)>,
) -> Variable {
    let path = match parent {
        Some((prefix, true)) => format!("{}[0].{}", prefix, property.name),
        Some((prefix, false)) => format!("{}.{}", prefix, property.name),
        None => property.name.clone(),
    };
    let multiple = property.is_multiple();
    let children = property
        .properties
        .iter()
        .flatten()
        .map(|child| variable(reference, segment, child, Some((path.as_str(), multiple))))
        .collect();

    Variable {
        id: format!("${{{}.{}.{}}}", reference, segment, path),
        jsonpath: format!("$.{}.{}.{}", reference, segment, path),
        path,
        display_name: property.display_name.clone(),
        property_type: property.property_type.clone(),
        multiple,
        children,
    }
}

fn register_group(mapper: &mut HashMap<String, VariableField>, group: &VariableGroup) {
    fn register(
        mapper: &mut HashMap<String, VariableField>,
        group: &VariableGroup,
        variable: &Variable,
    ) {
        let field = VariableField {
            id: variable.id.clone(),
            jsonpath: variable.jsonpath.clone(),
            reference: group.reference.clone(),
            display_name: format!("{} / {}", group.title, variable.display_name),
            property_type: variable.property_type.clone(),
        };
        mapper.insert(variable.jsonpath.clone(), field.clone());
        mapper.insert(variable.id.clone(), field);
        for child in &variable.children {
            register(mapper, group, child);
        }
    }

    for variable in &group.variables {
        register(mapper, group, variable);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ToolDefinition;
    use serde_json::json;

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        for name in ["a", "b", "c", "d"] {
            registry.register(
                ToolDefinition::new(name, name.to_uppercase(), "test")
                    .with_output(ToolProperty::optional("text", "Text", "string")),
            );
        }
        registry.register(
            ToolDefinition::new("search", "Search", "web").with_output(
                ToolProperty::optional("hits", "Hits", "json")
                    .multiple()
                    .with_properties(vec![ToolProperty::optional("url", "URL", "string")]),
            ),
        );
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

    #[test]
    fn test_fork_lanes_are_isolated() {
        let registry = registry();
        let variables = VariableResolver::new(&registry, &[]).generate(&scenario());

        assert!(variables.can_see("b", "a"));
        assert!(!variables.can_see("b", "c"));
        assert!(!variables.can_see("c", "b"));
        assert!(variables.can_see("d", "b"));
        assert!(variables.can_see("d", "c"));
        assert!(variables.can_see("join", "b"));
        assert!(!variables.can_see("a", "d"));
    }

    #[test]
    fn test_visible_groups_for_d() {
        let registry = registry();
        let variables = VariableResolver::new(&registry, &[]).generate(&scenario());
        let visible: Vec<&str> = variables
            .visible_to("d")
            .iter()
            .map(|group| group.reference.as_str())
            .collect();
        assert_eq!(visible, vec!["workflow", "a", "fork", "b", "c", "join"]);
    }

    #[test]
    fn test_mapper_keys_by_id_and_jsonpath() {
        let registry = registry();
        let variables = VariableResolver::new(&registry, &[]).generate(&scenario());

        let by_id = variables.lookup("${b.output.text}").unwrap();
        let by_path = variables.lookup("$.b.output.text").unwrap();
        assert_eq!(by_id, by_path);
        assert_eq!(by_id.reference, "b");
        assert_eq!(by_id.display_name, "B / Text");
    }

    #[test]
    fn test_nested_multiple_values_use_first_index() {
        let registry = registry();
        let search = Task::new("search", "s", Default::default());
        let variables = VariableResolver::new(&registry, &[]).generate(&[search]);
        assert!(variables.lookup("${s.output.hits[0].url}").is_some());
    }

    #[test]
    fn test_workflow_inputs_visible_everywhere() {
        let registry = registry();
        let inputs = vec![ToolProperty::required("topic", "Topic", "string")];
        let variables = VariableResolver::new(&registry, &inputs).generate(&scenario());
        assert!(variables.lookup("${workflow.input.topic}").is_some());
        assert!(variables.can_see("a", WORKFLOW_REFERENCE));
    }

    #[test]
    fn test_decision_cases_are_isolated() {
        let registry = registry();
        let tasks = vec![
            Task::decision(
                "switch",
                vec![
                    ("x".to_string(), vec![Task::simple("b")]),
                    ("y".to_string(), vec![Task::simple("c")]),
                ],
                vec![],
            ),
            Task::simple("d"),
        ];
        let variables = VariableResolver::new(&registry, &[]).generate(&tasks);
        assert!(!variables.can_see("c", "b"));
        assert!(variables.can_see("d", "b"));
        assert!(variables.can_see("d", "c"));
    }

    #[test]
    fn test_check_references_reports_issues() {
        let registry = registry();
        let inputs = vec![ToolProperty::required("topic", "Topic", "string")];
        let mut tasks = scenario();
        tasks[3] = Task::simple("d").with_input(
            "prompt",
            json!("${b.output.text} ${gone.output.text} ${workflow.input.topic}"),
        );
        tasks[1].fork_tasks.as_mut().unwrap()[1][0] = Task::simple("c").with_input(
            "nested",
            json!({"list": ["${b.output.text}", "${a.output.missing_field}"]}),
        );

        let resolver = VariableResolver::new(&registry, &inputs);
        let variables = resolver.generate(&tasks);
        let issues = resolver.check_references(&tasks, &variables);

        assert_eq!(issues.len(), 3);
        assert!(issues.iter().any(|issue| matches!(
            issue,
            ValidationIssue::DanglingReference { node_id, target, .. }
                if node_id == "d" && target == "gone"
        )));
        assert!(issues.iter().any(|issue| matches!(
            issue,
            ValidationIssue::OutOfScopeReference { node_id, target, .. }
                if node_id == "c" && target == "b"
        )));
        assert!(issues.iter().any(|issue| matches!(
            issue,
            ValidationIssue::DanglingReference { node_id, target, .. }
                if node_id == "c" && target == "a"
        )));
    }

    #[test]
    fn test_unknown_workflow_input_is_dangling() {
        let registry = registry();
        let tasks = vec![Task::simple("a").with_input("x", json!("${workflow.input.nope}"))];
        let resolver = VariableResolver::new(&registry, &[]);
        let variables = resolver.generate(&tasks);
        let issues = resolver.check_references(&tasks, &variables);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].node_id(), "a");
    }
}
