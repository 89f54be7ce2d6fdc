//! 错误分类与恢复动作
//!
//! 所有 LLM / 工具 / Agent 失败都落到 ErrorCategory 上，每个类别映射到唯一的 RecoveryAction：
//! transient / timeout / rate_limit 重试；context 在调用点压缩后重试一次；其余快速失败。
//! FailureKind 区分业务失败（任务本身不可满足，永不重试）与系统失败（运行时或依赖故障）。

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transient,
    Timeout,
    RateLimit,
    /// 上下文长度超限
    Context,
    InvalidInput,
    StructuredOutput,
    AuthFailure,
    NotFound,
    Internal,
    CircuitOpen,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Context => "context",
            ErrorCategory::InvalidInput => "invalid_input",
            ErrorCategory::StructuredOutput => "structured_output",
            ErrorCategory::AuthFailure => "auth_failure",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Internal => "internal",
            ErrorCategory::CircuitOpen => "circuit_open",
        }
    }

    /// 类别 -> 恢复动作（一一对应）
    pub fn recovery_action(&self) -> RecoveryAction {
        match self {
            ErrorCategory::Transient | ErrorCategory::Timeout | ErrorCategory::RateLimit => {
                RecoveryAction::Retry
            }
            ErrorCategory::Context => RecoveryAction::CompactThenRetry,
            _ => RecoveryAction::FailFast,
        }
    }

    /// 是否计入熔断器的连续失败次数
    pub fn trips_breaker(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Transient
                | ErrorCategory::Timeout
                | ErrorCategory::RateLimit
                | ErrorCategory::Internal
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 恢复动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// 指数退避后重试
    Retry,
    /// 不可直接重试：调用点先压缩上下文，再重试一次
    CompactThenRetry,
    /// 立即失败
    FailFast,
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecoveryAction::Retry => "retry",
            RecoveryAction::CompactThenRetry => "compact_then_retry",
            RecoveryAction::FailFast => "fail_fast",
        };
        f.write_str(s)
    }
}

/// 失败性质
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 任务或输入本身不可满足
    Business,
    /// 运行时或依赖故障
    System,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Business => f.write_str("business"),
            FailureKind::System => f.write_str("system"),
        }
    }
}

/// Agent 级错误的来源归类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorOrigin {
    Business,
    System,
    /// 输出契约 / 委派规则被违反
    Protocol,
    /// 外部依赖（LLM、工具）
    Dependency,
}

impl fmt::Display for ErrorOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorOrigin::Business => "business",
            ErrorOrigin::System => "system",
            ErrorOrigin::Protocol => "protocol",
            ErrorOrigin::Dependency => "dependency",
        };
        f.write_str(s)
    }
}

/// 已分类的依赖错误（LLM / 工具调用失败）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("[{category}] {message}")]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub message: String,
}

impl ClassifiedError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Transient, message)
    }

    pub fn context_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Context, message)
    }
}

/// Agent 执行期间的错误
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    #[error("LLM call failed: {0}")]
    Llm(ClassifiedError),

    #[error("Tool '{tool}' failed: {source}")]
    Tool {
        tool: String,
        #[source]
        source: ClassifiedError,
    },

    #[error("Tool '{tool}' is not available to agent '{agent}'")]
    ToolNotAllowed { tool: String, agent: String },

    #[error("Delegation from '{from}' to '{to}' rejected: {reason}")]
    DelegationRejected {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Deliverable of '{agent}' violates its schema: {detail}")]
    InvalidDeliverable { agent: String, detail: String },

    #[error("Structured output error: {0}")]
    StructuredOutput(String),

    /// 任务本身无法完成（业务失败）
    #[error("Business failure: {0}")]
    Business(String),

    /// 并行层等汇总出的运行时故障
    #[error("System failure: {0}")]
    System(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Agent '{agent_id}' failed ({origin}, {action}): {source}")]
    Wrapped {
        agent_id: String,
        origin: ErrorOrigin,
        action: RecoveryAction,
        #[source]
        source: Box<AgentError>,
    },
}

impl AgentError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            AgentError::Llm(e) => e.category,
            AgentError::Tool { source, .. } => source.category,
            AgentError::ToolNotAllowed { .. } => ErrorCategory::InvalidInput,
            AgentError::DelegationRejected { .. } => ErrorCategory::InvalidInput,
            AgentError::InvalidDeliverable { .. } => ErrorCategory::StructuredOutput,
            AgentError::StructuredOutput(_) => ErrorCategory::StructuredOutput,
            AgentError::Business(_) => ErrorCategory::InvalidInput,
            AgentError::System(_) | AgentError::Cancelled => ErrorCategory::Internal,
            AgentError::Wrapped { source, .. } => source.category(),
        }
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            AgentError::Business(_) => FailureKind::Business,
            AgentError::Wrapped { source, .. } => source.failure_kind(),
            _ => FailureKind::System,
        }
    }

    /// 业务失败永远快速失败；其余按类别决定
    pub fn recovery_action(&self) -> RecoveryAction {
        match self.failure_kind() {
            FailureKind::Business => RecoveryAction::FailFast,
            FailureKind::System => self.category().recovery_action(),
        }
    }

    pub fn retryable(&self) -> bool {
        self.recovery_action() == RecoveryAction::Retry
    }

    pub fn origin(&self) -> ErrorOrigin {
        match self {
            AgentError::Business(_) => ErrorOrigin::Business,
            AgentError::Llm(_) | AgentError::Tool { .. } => ErrorOrigin::Dependency,
            AgentError::ToolNotAllowed { .. }
            | AgentError::DelegationRejected { .. }
            | AgentError::InvalidDeliverable { .. }
            | AgentError::StructuredOutput(_) => ErrorOrigin::Protocol,
            AgentError::System(_) | AgentError::Cancelled => ErrorOrigin::System,
            AgentError::Wrapped { origin, .. } => *origin,
        }
    }

    /// 附加来源 agent id；已包装的错误不重复包装
    pub fn wrap(self, agent_id: &str) -> AgentError {
        if let AgentError::Wrapped { .. } = self {
            return self;
        }
        AgentError::Wrapped {
            agent_id: agent_id.to_string(),
            origin: self.origin(),
            action: self.recovery_action(),
            source: Box::new(self),
        }
    }

    pub fn agent_id(&self) -> Option<&str> {
        match self {
            AgentError::Wrapped { agent_id, .. } => Some(agent_id),
            _ => None,
        }
    }

    /// 面向用户的错误类型名
    pub fn error_type(&self) -> &'static str {
        match self {
            AgentError::Wrapped { source, .. } => source.error_type(),
            AgentError::Business(_) => "business",
            AgentError::DelegationRejected { .. } => "delegation_rejected",
            AgentError::ToolNotAllowed { .. } => "tool_not_allowed",
            AgentError::Cancelled => "cancelled",
            AgentError::System(_) => "system",
            other => other.category().as_str(),
        }
    }

    /// agent.failed 事件的 detail 字段
    pub fn detail(&self) -> String {
        format!(
            "category={}; action={}; failure_kind={}",
            self.origin(),
            self.recovery_action(),
            self.failure_kind()
        )
    }
}

impl From<ClassifiedError> for AgentError {
    fn from(e: ClassifiedError) -> Self {
        AgentError::Llm(e)
    }
}

/// 编排层错误
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Cyclic dependency among agents: {0:?}")]
    CyclicDependency(Vec<String>),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Duplicate agent id: {0}")]
    DuplicateAgent(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Checkpoint '{checkpoint_id}' not found in session {session}")]
    CheckpointNotFound {
        session: String,
        checkpoint_id: String,
    },

    #[error("No pending human request in session {0}")]
    NoPendingRequest(String),

    #[error("Session {0} is already running")]
    SessionBusy(String),

    #[error(transparent)]
    Store(#[from] crate::checkpoint::StoreError),

    #[error(transparent)]
    State(#[from] crate::state::StateError),

    #[error(transparent)]
    Agent(#[from] AgentError),
}

impl OrchestratorError {
    pub fn error_type(&self) -> &'static str {
        match self {
            OrchestratorError::Agent(e) => e.error_type(),
            OrchestratorError::Config(_)
            | OrchestratorError::CyclicDependency(_)
            | OrchestratorError::UnknownAgent(_)
            | OrchestratorError::DuplicateAgent(_) => "config",
            OrchestratorError::State(_) => "protocol",
            OrchestratorError::Store(_) => "store",
            _ => "invalid_input",
        }
    }

    pub fn retryable(&self) -> bool {
        match self {
            OrchestratorError::Agent(e) => e.retryable(),
            _ => false,
        }
    }
}
