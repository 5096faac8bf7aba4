//! Capability-tagged tools and their registry.

pub mod completion;
pub mod http;
pub mod registry;
pub mod sql;

pub use completion::{CompletionClient, CompletionTool};
pub use http::HttpCallTool;
pub use registry::{
    Capability, ParamSpec, ParamType, ToolDescriptor, ToolHandler, ToolInput, ToolOutput,
    ToolRegistry, validate_input,
};
pub use sql::SqlQueryTool;
