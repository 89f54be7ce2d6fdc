//! 工具层：注册表、带允许列表与审计的执行器、回复协议 Schema

pub mod echo;
pub mod executor;
pub mod registry;
pub mod schema;

pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use registry::{Tool, ToolRegistry};
pub use schema::{reply_protocol_prompt, tool_call_schema_json};
