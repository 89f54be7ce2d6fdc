//! 上下文与记忆：对话消息、固定事实、执行时间线、token 预算、上下文组装与按需压缩

pub mod assembler;
pub mod compactor;
pub mod conversation;
pub mod pinned;
pub mod timeline;
pub mod token_budget;

pub use assembler::{AssemblyInput, ContextAssembler};
pub use compactor::{CompactPolicy, CompactResult, CompactScope, CompactTrigger, Compactor};
pub use conversation::{history_window, recent_window, Message, Role};
pub use pinned::{PinnedFact, PinnedFacts, PinnedKind};
pub use timeline::{CheckpointType, Timeline, TimelineDraft, TimelineEntry, TimelineStats};
pub use token_budget::{truncate_to_tokens, ContextSegment, TokenBudget, TokenEstimator};
