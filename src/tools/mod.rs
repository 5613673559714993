//! Tool system: trait, execution context, schema validation, registry.

pub mod arguments;
pub mod registry;
pub mod task;
pub mod tool;
pub mod truncation;
pub mod types;
pub mod validation;

pub use arguments::ToolArguments;
pub use registry::Registry;
pub use task::{TaskTool, TASK_TOOL_ID};
pub use tool::{invoke, AgentTool, MetadataUpdate, Tool, ToolAsk, ToolContext};
pub use types::{ParameterBuilder, ToolDefinition, ToolOutput, ToolParameters};
pub use validation::validate_arguments;
