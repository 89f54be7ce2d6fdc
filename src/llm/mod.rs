//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock / 脚本化），弹性装饰器与结构化输出解析

pub mod mock;
pub mod openai;
pub mod resilient;
pub mod structured;
pub mod traits;

pub use mock::{MockLlmClient, ScriptStep, ScriptedLlmClient};
pub use openai::OpenAiClient;
pub use resilient::ResilientLlmClient;
pub use structured::{extract_json_str, parse_json, parse_tool_call};
pub use traits::{LlmClient, LlmRequest, LlmResponse, TokenUsage, ToolCallRequest};
