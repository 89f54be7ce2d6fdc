//! 核心层：错误分类与恢复、执行状态、会话监管、并行调度

pub mod error;
pub mod recovery;
pub mod session_supervisor;
pub mod status;
pub mod task_scheduler;

pub use error::{
    AgentError, ClassifiedError, ErrorCategory, ErrorOrigin, FailureKind, OrchestratorError,
    RecoveryAction,
};
pub use recovery::RecoveryEngine;
pub use session_supervisor::SessionSupervisor;
pub use status::ExecutionStatus;
pub use task_scheduler::TaskScheduler;
