//! Hive - 多智能体编排运行时
//!
//! 模块划分：
//! - **agent**: Agent 声明、注册表、执行契约、通用 LLM agent
//! - **checkpoint**: 检查点存储（内存 / 文件）与时间旅行
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、执行状态、会话监管、任务调度
//! - **events**: 统一事件信封与事件总线
//! - **graph**: 执行图、各协作拓扑的构建器与节点
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock / 脚本化）
//! - **memory**: 对话消息、固定事实、Token 预算、时间线、压缩
//! - **resilience**: 重试退避与熔断
//! - **runtime**: 编排器（stream / resume / abort / 时间旅行）
//! - **state**: 黑板、状态补丁、请求队列、待办与计划
//! - **tools**: 工具箱与执行器

pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod core;
pub mod events;
pub mod graph;
pub mod llm;
pub mod memory;
pub mod resilience;
pub mod runtime;
pub mod state;
pub mod tools;

pub use agent::{Agent, AgentContext, AgentOutcome, AgentSpec, FnAgent, LlmAgent};
pub use checkpoint::{TimeTravelResult, TravelMode};
pub use crate::core::{AgentError, OrchestratorError};
pub use events::{EventType, StreamEvent};
pub use graph::ProcessMode;
pub use runtime::{EventStream, Orchestrator, OrchestratorBuilder};
pub use state::Blackboard;
