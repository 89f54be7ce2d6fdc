//! 黑板：单个会话贯穿所有步骤的共享状态
//!
//! 只通过 StatePatch 修改（见 patch.rs），每次合并 version + 1。
//! 黑板整体可序列化，检查点保存的就是它的快照。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{ExecutionStatus, FailureKind};
use crate::memory::{Message, PinnedFacts, Timeline};
use crate::state::{BlackboardRequest, Plan, RequestKind, SessionKey, SessionTodo, SessionUsage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blackboard {
    pub key: SessionKey,
    pub version: u64,
    #[serde(default)]
    pub goal: Option<String>,
    /// 只追加；仅压缩会整体替换
    pub messages: Vec<Message>,
    /// 下一个要运行的 agent；None 表示结束
    pub active_agent: Option<String>,
    pub assigned_task: Option<String>,
    pub pending_requests: Vec<BlackboardRequest>,
    pub last_status: Option<ExecutionStatus>,
    pub last_failure_kind: Option<FailureKind>,
    pub todo: SessionTodo,
    /// agent id -> 已校验的结构化产出
    pub deliverables: BTreeMap<String, Value>,
    pub deliverable_versions: BTreeMap<String, u32>,
    pub iteration_count: u32,
    pub max_iterations: u32,
    pub error: Option<String>,
    #[serde(default)]
    pub pinned: PinnedFacts,
    #[serde(default)]
    pub timeline: Timeline,
    #[serde(default)]
    pub plan: Option<Plan>,
    /// 跨轮累计，不随新一轮重置
    #[serde(default)]
    pub usage: SessionUsage,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl Blackboard {
    pub fn new(key: SessionKey, max_iterations: u32) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            key,
            version: 0,
            goal: None,
            messages: Vec::new(),
            active_agent: None,
            assigned_task: None,
            pending_requests: Vec::new(),
            last_status: None,
            last_failure_kind: None,
            todo: SessionTodo::new(),
            deliverables: BTreeMap::new(),
            deliverable_versions: BTreeMap::new(),
            iteration_count: 0,
            max_iterations,
            error: None,
            pinned: PinnedFacts::new(),
            timeline: Timeline::new(),
            plan: None,
            usage: SessionUsage::default(),
            created_at_ms: now,
            updated_at_ms: now,
        }
    }

    pub fn deliverable(&self, agent_id: &str) -> Option<&Value> {
        self.deliverables.get(agent_id)
    }

    pub fn deliverable_version(&self, agent_id: &str) -> u32 {
        self.deliverable_versions.get(agent_id).copied().unwrap_or(0)
    }

    pub fn has_pending_human(&self) -> bool {
        crate::state::request::first_pending_human(&self.pending_requests).is_some()
    }

    /// 循环保护是否已触发
    pub fn iterations_exhausted(&self) -> bool {
        self.iteration_count >= self.max_iterations
    }

    /// 最近一条用户消息
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == crate::memory::Role::User)
            .map(|m| m.content.as_str())
    }

    /// 开始新的一轮运行：保留历史与产出，清空运行态
    pub fn reset_for_new_turn(&mut self, goal: &str) {
        self.goal = Some(goal.to_string());
        self.active_agent = None;
        self.assigned_task = None;
        self.last_status = None;
        self.last_failure_kind = None;
        self.iteration_count = 0;
        self.error = None;
        self.plan = None;
        // 只有等待用户回答的请求能跨轮；委派属于上一轮运行
        self.pending_requests
            .retain(|r| r.kind == RequestKind::Human && r.is_pending());
    }
}
