//! Tool registry
//!
//! Maps a task's `name` to the [`ToolDefinition`] describing it. The
//! registry is filled once per session from the backend's tool list, the
//! team's workflows (exposed as sub-workflow tools) and the built-ins
//! collected at link time.
//!
//! # Usage
//!
//! ```ignore
//! use flow_core::ToolRegistry;
//!
//! let mut registry = ToolRegistry::with_builtins();
//! registry.register_all(backend.list_tools().await?);
//! let chat = registry.get("llm_chat");
//! ```

use std::collections::HashMap;

use crate::descriptor::{ToolDefinition, ToolDescriptorFn, ToolProperty};
use crate::types::{Task, TaskType, SUB_WORKFLOW_PREFIX};
use crate::version::WorkflowVersion;

/// Category for tools that wrap another workflow
pub const SUB_WORKFLOW_CATEGORY: &str = "sub_workflow";

/// Key of the wrapped workflow's definition in a sub-workflow tool's extras
pub const WORKFLOW_DEF_KEY: &str = "workflowDef";

/// Name of the tool that invokes the given workflow as a sub-workflow
pub fn sub_workflow_tool_name(workflow_id: &str) -> String {
    format!("{}{}", SUB_WORKFLOW_PREFIX, workflow_id)
}

/// Registry of tools keyed by name
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolDefinition>,
    /// Category display order; unknown categories sort last
    category_order: Vec<String>,
}

impl ToolRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding every built-in tool linked into the binary
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for descriptor in inventory::iter::<ToolDescriptorFn> {
            registry.register((descriptor.0)());
        }
        log::debug!("Registered {} built-in tools", registry.len());
        registry
    }

    /// Set the order in which categories are listed
    pub fn with_category_order(mut self, order: Vec<String>) -> Self {
        self.category_order = order;
        self
    }

    /// Register a tool, replacing any tool of the same name
    pub fn register(&mut self, tool: ToolDefinition) {
        self.tools.insert(tool.name.clone(), tool);
    }

    /// Register every tool from a fetched list
    pub fn register_all(&mut self, tools: impl IntoIterator<Item = ToolDefinition>) {
        let before = self.tools.len();
        for tool in tools {
            self.register(tool);
        }
        log::info!(
            "Tool registry loaded: {} tools ({} new)",
            self.tools.len(),
            self.tools.len().saturating_sub(before)
        );
    }

    /// Expose workflows as sub-workflow tools
    ///
    /// Inputs come from the workflow's variables and outputs from its output
    /// mapping keys. The workflow's tasks are kept under
    /// `extra.workflowDef.tasks` so a sub-workflow node can be expanded.
    pub fn register_workflows<'a>(
        &mut self,
        workflows: impl IntoIterator<Item = &'a WorkflowVersion>,
    ) {
        for workflow in workflows {
            let display_name = workflow
                .display_name
                .clone()
                .unwrap_or_else(|| workflow.workflow_id.clone());
            let mut tool = ToolDefinition::new(
                sub_workflow_tool_name(&workflow.workflow_id),
                display_name,
                SUB_WORKFLOW_CATEGORY,
            )
            .with_task_type(TaskType::SubWorkflow)
            .with_description(workflow.description.clone().unwrap_or_default());
            tool.icon = workflow.icon_url.clone();
            tool.input = workflow.variables.clone();
            tool.output = workflow
                .output
                .iter()
                .map(|mapping| ToolProperty::optional(&mapping.key, &mapping.key, "string"))
                .collect();
            tool.extra.insert(
                WORKFLOW_DEF_KEY.to_string(),
                serde_json::json!({ "tasks": workflow.tasks }),
            );
            self.register(tool);
        }
    }

    /// Task list of the workflow behind a sub-workflow tool
    ///
    /// `None` when the tool is unknown, carries no definition, or the
    /// definition is empty or malformed.
    pub fn sub_workflow_tasks(&self, tool_name: &str) -> Option<Vec<Task>> {
        let tasks = self
            .tools
            .get(tool_name)?
            .extra
            .get(WORKFLOW_DEF_KEY)?
            .get("tasks")?;
        match serde_json::from_value::<Vec<Task>>(tasks.clone()) {
            Ok(tasks) if !tasks.is_empty() => Some(tasks),
            Ok(_) => None,
            Err(e) => {
                log::warn!("Ignoring malformed definition of '{}': {}", tool_name, e);
                None
            }
        }
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name)
    }

    /// Check if a tool is registered
    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// All tools, sorted by name for stable output
    pub fn all_tools(&self) -> Vec<&ToolDefinition> {
        let mut tools: Vec<&ToolDefinition> = self.tools.values().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Tools matching `search`, grouped by category in display order
    pub fn tools_by_category(&self, search: &str) -> Vec<(String, Vec<&ToolDefinition>)> {
        let mut grouped: HashMap<&str, Vec<&ToolDefinition>> = HashMap::new();
        for tool in self.tools.values().filter(|tool| tool.matches(search)) {
            grouped.entry(tool.category.as_str()).or_default().push(tool);
        }

        let mut categories: Vec<(String, Vec<&ToolDefinition>)> = grouped
            .into_iter()
            .map(|(category, mut tools)| {
                tools.sort_by(|a, b| a.name.cmp(&b.name));
                (category.to_string(), tools)
            })
            .collect();
        categories.sort_by_key(|(category, _)| (self.category_rank(category), category.clone()));
        categories
    }

    fn category_rank(&self, category: &str) -> usize {
        self.category_order
            .iter()
            .position(|known| known == category)
            .unwrap_or(self.category_order.len())
    }

    /// Merge another registry into this one
    ///
    /// Tools from `other` override tools in `self` if they share a name.
    pub fn merge(&mut self, other: ToolRegistry) {
        self.tools.extend(other.tools);
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// No tools registered
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::OutputMapping;

    fn tool(name: &str, category: &str) -> ToolDefinition {
        ToolDefinition::new(name, format!("Tool {}", name), category)
            .with_output(ToolProperty::optional("result", "Result", "string"))
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(tool("echo", "utility"));

        assert!(registry.has_tool("echo"));
        assert!(!registry.has_tool("unknown"));
        assert_eq!(registry.get("echo").unwrap().display_name, "Tool echo");
    }

    #[test]
    fn test_merge_override() {
        let mut first = ToolRegistry::new();
        first.register(tool("a", "x"));

        let mut second = ToolRegistry::new();
        let mut replacement = tool("a", "x");
        replacement.display_name = "Override".to_string();
        second.register(replacement);
        second.register(tool("b", "x"));

        first.merge(second);
        assert_eq!(first.len(), 2);
        assert_eq!(first.get("a").unwrap().display_name, "Override");
    }

    #[test]
    fn test_tools_by_category_respects_order_and_search() {
        let mut registry =
            ToolRegistry::new().with_category_order(vec!["text".into(), "image".into()]);
        registry.register_all(vec![
            tool("draw", "image"),
            tool("write", "text"),
            tool("misc_tool", "zzz"),
            tool("summarise", "text"),
        ]);

        let grouped = registry.tools_by_category("");
        let categories: Vec<&str> = grouped.iter().map(|(c, _)| c.as_str()).collect();
        assert_eq!(categories, vec!["text", "image", "zzz"]);
        let text_tools: Vec<&str> = grouped[0].1.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(text_tools, vec!["summarise", "write"]);

        let filtered = registry.tools_by_category("draw");
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].0, "image");
    }

    #[test]
    fn test_register_workflows_as_sub_workflow_tools() {
        let mut workflow = WorkflowVersion::new("wf-42", 1);
        workflow.display_name = Some("Summariser".to_string());
        workflow.variables = vec![ToolProperty::required("text", "Text", "string")];
        workflow.output = vec![OutputMapping {
            key: "summary".to_string(),
            value: "${s.output.text}".to_string(),
        }];

        let mut registry = ToolRegistry::new();
        registry.register_workflows([&workflow]);

        let tool = registry.get("sub_workflow_wf-42").unwrap();
        assert_eq!(tool.task_type, TaskType::SubWorkflow);
        assert_eq!(tool.display_name, "Summariser");
        assert_eq!(tool.input.len(), 1);
        assert_eq!(tool.output[0].name, "summary");
    }

    #[test]
    fn test_sub_workflow_tool_keeps_definition() {
        let workflow = WorkflowVersion::new("child", 2)
            .with_tasks(vec![Task::simple("x"), Task::simple("y")]);
        let mut registry = ToolRegistry::new();
        registry.register_workflows([&workflow]);

        let tasks = registry.sub_workflow_tasks("sub_workflow_child").unwrap();
        let names: Vec<&str> = tasks.iter().map(|t| t.reference_name.as_str()).collect();
        assert_eq!(names, vec!["x", "y"]);
        assert!(registry.sub_workflow_tasks("sub_workflow_other").is_none());

        let mut broken =
            ToolDefinition::new("sub_workflow_broken", "Broken", SUB_WORKFLOW_CATEGORY);
        broken
            .extra
            .insert(WORKFLOW_DEF_KEY.to_string(), serde_json::json!({ "tasks": 3 }));
        registry.register(broken);
        assert!(registry.sub_workflow_tasks("sub_workflow_broken").is_none());
    }
}
