//! The RPC Surface (C8): JSON-RPC 2.0 over stdio and HTTP.

pub mod dispatcher;
pub mod http;
pub mod protocol;
pub mod tools;

pub use dispatcher::Dispatcher;
pub use protocol::{
    methods, InitializeResult, McpHandler, McpRequest, McpResponse, McpServer, ToolCallResult,
};
pub use tools::{get_tool_definitions, TOOL_DEFINITIONS};
