//! Agent 层：声明、注册表、执行契约与上下文、产出校验、通用 LLM agent

pub mod context;
pub mod deliverable;
pub mod fn_agent;
pub mod llm_agent;
pub mod registry;
pub mod spec;
pub mod traits;

pub use context::{AgentContext, AgentServices};
pub use deliverable::validate_deliverable;
pub use fn_agent::FnAgent;
pub use llm_agent::{parse_reply, AgentReply, LlmAgent};
pub use registry::{AgentEntry, AgentRegistry};
pub use spec::AgentSpec;
pub use traits::{Agent, AgentOutcome};
