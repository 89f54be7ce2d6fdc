//! 共享状态：黑板、补丁合并、请求队列、待办、计划与用量

pub mod blackboard;
pub mod patch;
pub mod plan;
pub mod request;
pub mod session;
pub mod todo;
pub mod usage;

pub use blackboard::Blackboard;
pub use patch::{OverlapPolicy, StateError, StatePatch};
pub use plan::{Plan, PlanTask, TaskDraft};
pub use request::{cancel_pending_delegates, first_pending_human, BlackboardRequest, RequestKind, RequestStatus};
pub use session::SessionKey;
pub use todo::{SessionTodo, TodoItem, TodoPlanOp, TodoUpdate};
pub use usage::SessionUsage;
