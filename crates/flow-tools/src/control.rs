//! Control tools
//!
//! Structural tools that create composite tasks: parallel lanes, decisions,
//! loops and early termination. Their task types drive layout and scoping in
//! the flow core; the inputs here are only what the orchestrator needs.

use flow_core::{TaskType, ToolDefinition, ToolDescriptor, ToolProperty};
use serde_json::json;

/// Palette category shared by every control tool
pub const CATEGORY: &str = "control";

/// Parallel lanes, closed by a JOIN
///
/// Creating a task from this tool yields the FORK_JOIN and its JOIN.
pub struct ForkJoinTool;

impl ForkJoinTool {
    pub const NAME: &'static str = "fork_join";
}

impl ToolDescriptor for ForkJoinTool {
    fn descriptor() -> ToolDefinition {
        ToolDefinition::new(Self::NAME, "Parallel", CATEGORY)
            .with_task_type(TaskType::ForkJoin)
            .with_description("Run several lanes at the same time")
            .with_icon("emoji:🔀:#e6f4ff")
    }
}

inventory::submit!(flow_core::ToolDescriptorFn(ForkJoinTool::descriptor));

/// Waits for the last task of every lane of the preceding fork
pub struct JoinTool;

impl JoinTool {
    pub const NAME: &'static str = "join";
}

impl ToolDescriptor for JoinTool {
    fn descriptor() -> ToolDefinition {
        ToolDefinition::new(Self::NAME, "Join", CATEGORY)
            .with_task_type(TaskType::Join)
            .with_description("Wait for all parallel lanes to finish")
    }
}

inventory::submit!(flow_core::ToolDescriptorFn(JoinTool::descriptor));

/// Routes to the case whose name matches the switch value
///
/// # Inputs
/// - `switchCaseValue` (required) - Value compared against the case names
pub struct SwitchTool;

impl SwitchTool {
    pub const NAME: &'static str = "switch";
    pub const INPUT_CASE_VALUE: &'static str = "switchCaseValue";
}

impl ToolDescriptor for SwitchTool {
    fn descriptor() -> ToolDefinition {
        ToolDefinition::new(Self::NAME, "Decision", CATEGORY)
            .with_task_type(TaskType::Switch)
            .with_description("Choose one branch by value, with a default branch")
            .with_icon("emoji:🔁:#fff1e6")
            .with_input(ToolProperty::required(
                Self::INPUT_CASE_VALUE,
                "Case value",
                "string",
            ))
    }
}

inventory::submit!(flow_core::ToolDescriptorFn(SwitchTool::descriptor));

/// Repeats its body while the loop condition holds
///
/// # Inputs
/// - `loopCount` (optional) - Number of iterations for count-based loops
pub struct DoWhileTool;

impl DoWhileTool {
    pub const NAME: &'static str = "do_while";
    pub const INPUT_LOOP_COUNT: &'static str = "loopCount";
}

impl ToolDescriptor for DoWhileTool {
    fn descriptor() -> ToolDefinition {
        ToolDefinition::new(Self::NAME, "Loop", CATEGORY)
            .with_task_type(TaskType::DoWhile)
            .with_description("Repeat the body a number of times")
            .with_icon("emoji:🔄:#eafbe7")
            .with_input(
                ToolProperty::optional(Self::INPUT_LOOP_COUNT, "Loop count", "number")
                    .with_default(json!(1)),
            )
    }
}

inventory::submit!(flow_core::ToolDescriptorFn(DoWhileTool::descriptor));

/// Ends the workflow early with a status and output
///
/// # Inputs
/// - `terminationStatus` (optional) - `COMPLETED` or `FAILED`
/// - `workflowOutput` (optional) - Output reported by the instance
pub struct TerminateTool;

impl TerminateTool {
    pub const NAME: &'static str = "terminate";
}

impl ToolDescriptor for TerminateTool {
    fn descriptor() -> ToolDefinition {
        ToolDefinition::new(Self::NAME, "End workflow", CATEGORY)
            .with_task_type(TaskType::Other("TERMINATE".to_string()))
            .with_description("Stop the workflow here")
            .with_icon("emoji:⏹️:#ffe7e7")
            .with_input(
                ToolProperty::optional("terminationStatus", "Status", "string")
                    .with_default(json!("COMPLETED")),
            )
            .with_input(ToolProperty::optional("workflowOutput", "Output", "json"))
    }
}

inventory::submit!(flow_core::ToolDescriptorFn(TerminateTool::descriptor));
