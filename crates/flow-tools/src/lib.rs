//! Flow Tools
//!
//! Built-in tool definitions for the flow core. Each tool describes itself
//! through `ToolDescriptor` and is collected at link time, so
//! `ToolRegistry::with_builtins()` sees every tool in this crate once it is
//! linked into the binary.
//!
//! # Categories
//!
//! - **Control**: forks, joins, decisions, loops and early termination
//! - **Process**: helpers that reshape task outputs

pub mod control;
pub mod process;

pub use control::*;
pub use process::*;

#[cfg(test)]
mod tests {
    use super::*;
    use flow_core::{FlowConfig, FlowSession, TaskKind, ToolDescriptor, ToolRegistry};
    use std::sync::Arc;

    #[test]
    fn test_inventory_collects_all_builtins() {
        let registry = ToolRegistry::with_builtins();
        assert_eq!(registry.len(), 6, "Expected 6 built-in tools");

        assert!(registry.has_tool(ForkJoinTool::NAME));
        assert!(registry.has_tool(JoinTool::NAME));
        assert!(registry.has_tool(SwitchTool::NAME));
        assert!(registry.has_tool(DoWhileTool::NAME));
        assert!(registry.has_tool(TerminateTool::NAME));
        assert!(registry.has_tool(CollectLoopOutputTool::NAME));
    }

    #[test]
    fn test_control_tools_create_composites() {
        let session = FlowSession::new(
            Arc::new(ToolRegistry::with_builtins()),
            FlowConfig::default(),
        );

        let fork = session.create_task(ForkJoinTool::NAME).unwrap();
        assert_eq!(fork.len(), 2);
        assert_eq!(fork[0].fork_tasks.as_ref().map(Vec::len), Some(2));

        let switch = session.create_task(SwitchTool::NAME).unwrap();
        assert_eq!(switch[0].kind(), TaskKind::Decision);
        assert!(switch[0].default_case.is_some());

        let terminate = session.create_task(TerminateTool::NAME).unwrap();
        assert_eq!(terminate[0].kind(), TaskKind::Opaque);
        assert_eq!(
            terminate[0].input_parameters.as_ref().unwrap()["terminationStatus"],
            "COMPLETED"
        );
    }

    #[test]
    fn test_loop_output_is_a_list() {
        let tool = CollectLoopOutputTool::descriptor();
        assert!(tool.output[0].is_multiple());
        assert!(tool.input[0].required);
    }
}
