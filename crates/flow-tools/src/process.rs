//! Processing tools

use flow_core::{ToolDefinition, ToolDescriptor, ToolProperty};

/// Collects the outputs of every iteration of a loop task
///
/// # Inputs
/// - `doWhileTaskReferenceName` (required) - Loop task to read from
/// - `jsonPathExpression` (optional) - Filter applied to the collected list
///
/// # Outputs
/// - `data` - One entry per iteration
pub struct CollectLoopOutputTool;

impl CollectLoopOutputTool {
    pub const NAME: &'static str = "collect_dowhile_output";
}

impl ToolDescriptor for CollectLoopOutputTool {
    fn descriptor() -> ToolDefinition {
        ToolDefinition::new(Self::NAME, "Collect loop output", "process")
            .with_description("Gather the results of every loop iteration")
            .with_icon("emoji:🤖️:#7fa3f8")
            .with_input(ToolProperty::required(
                "doWhileTaskReferenceName",
                "Loop task",
                "string",
            ))
            .with_input(ToolProperty::optional(
                "jsonPathExpression",
                "JSONPath expression",
                "string",
            ))
            .with_output(ToolProperty::optional("data", "Iterations", "json").multiple())
    }
}

inventory::submit!(flow_core::ToolDescriptorFn(CollectLoopOutputTool::descriptor));
