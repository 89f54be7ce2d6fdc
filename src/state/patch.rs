//! 状态补丁与合并规则
//!
//! 每个节点执行返回一个 StatePatch，按字段合并进黑板：
//! - messages 追加（replace_messages 仅供压缩使用，先于追加生效）
//! - active_agent / assigned_task / last_status 等标量覆盖
//! - pending_requests 整体替换为补丁给出的队列
//! - deliverables 按 agent id 逐个写入并递增版本
//! - usage 累加，不参与冲突检测
//!
//! 并行层内每个 agent 的补丁独立合并；两个补丁写同一标量字段时按 OverlapPolicy 处理。

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use thiserror::Error;

use crate::core::{ExecutionStatus, FailureKind};
use crate::llm::TokenUsage;
use crate::memory::{Message, PinnedFact, TimelineDraft};
use crate::state::{Blackboard, BlackboardRequest, Plan, SessionTodo, SessionUsage};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("Agents {agents:?} wrote overlapping field '{field}' in one parallel layer")]
    OverlappingWrite { field: String, agents: Vec<String> },
}

/// 并行层内标量字段写冲突的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlapPolicy {
    /// 拒绝整层合并，黑板保持不变
    Reject,
    /// 按层内顺序后写覆盖先写
    LastWriterWins,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    pub messages: Vec<Message>,
    pub replace_messages: Option<Vec<Message>>,
    pub goal: Option<String>,
    pub active_agent: Option<Option<String>>,
    pub assigned_task: Option<Option<String>>,
    pub last_status: Option<ExecutionStatus>,
    pub last_failure_kind: Option<Option<FailureKind>>,
    pub pending_requests: Option<Vec<BlackboardRequest>>,
    pub todo: Option<SessionTodo>,
    pub deliverables: BTreeMap<String, Value>,
    pub error: Option<Option<String>>,
    pub plan: Option<Option<Plan>>,
    pub pinned: Vec<PinnedFact>,
    /// 追加到时间线的条目
    pub timeline: Vec<TimelineDraft>,
    /// 本次新增的 token 用量，合并时累加
    pub usage: SessionUsage,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    pub fn replace_messages(mut self, messages: Vec<Message>) -> Self {
        self.replace_messages = Some(messages);
        self
    }

    pub fn goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = Some(goal.into());
        self
    }

    pub fn activate(mut self, agent_id: impl Into<String>) -> Self {
        self.active_agent = Some(Some(agent_id.into()));
        self
    }

    pub fn deactivate(mut self) -> Self {
        self.active_agent = Some(None);
        self
    }

    pub fn task(mut self, task: Option<String>) -> Self {
        self.assigned_task = Some(task);
        self
    }

    pub fn status(mut self, status: ExecutionStatus) -> Self {
        self.last_status = Some(status);
        self
    }

    /// 记录失败：状态、失败性质与错误摘要
    pub fn failure(mut self, kind: FailureKind, error: impl Into<String>) -> Self {
        self.last_status = Some(ExecutionStatus::Failed);
        self.last_failure_kind = Some(Some(kind));
        self.error = Some(Some(error.into()));
        self
    }

    /// 成功时清除上一次的失败信息
    pub fn clear_failure(mut self) -> Self {
        self.last_failure_kind = Some(None);
        self.error = Some(None);
        self
    }

    pub fn requests(mut self, requests: Vec<BlackboardRequest>) -> Self {
        self.pending_requests = Some(requests);
        self
    }

    pub fn todo(mut self, todo: SessionTodo) -> Self {
        self.todo = Some(todo);
        self
    }

    pub fn deliverable(mut self, agent_id: impl Into<String>, value: Value) -> Self {
        self.deliverables.insert(agent_id.into(), value);
        self
    }

    pub fn plan(mut self, plan: Option<Plan>) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn pin(mut self, fact: PinnedFact) -> Self {
        self.pinned.push(fact);
        self
    }

    pub fn record(mut self, draft: TimelineDraft) -> Self {
        self.timeline.push(draft);
        self
    }

    pub fn usage(mut self, agent_id: &str, usage: TokenUsage) -> Self {
        self.usage.record(agent_id, usage);
        self
    }

    /// 合并另一个补丁（同一节点内的多段产出）；后者的标量覆盖前者
    pub fn merge(mut self, other: StatePatch) -> Self {
        self.messages.extend(other.messages);
        if other.replace_messages.is_some() {
            self.replace_messages = other.replace_messages;
        }
        self.goal = other.goal.or(self.goal);
        self.active_agent = other.active_agent.or(self.active_agent);
        self.assigned_task = other.assigned_task.or(self.assigned_task);
        self.last_status = other.last_status.or(self.last_status);
        self.last_failure_kind = other.last_failure_kind.or(self.last_failure_kind);
        self.pending_requests = other.pending_requests.or(self.pending_requests);
        self.todo = other.todo.or(self.todo);
        self.error = other.error.or(self.error);
        self.plan = other.plan.or(self.plan);
        self.deliverables.extend(other.deliverables);
        self.pinned.extend(other.pinned);
        self.timeline.extend(other.timeline);
        self.usage.absorb(other.usage);
        self
    }

    /// 本补丁写了哪些标量字段（并行层冲突检测用）
    pub fn scalar_writes(&self) -> Vec<String> {
        let mut fields = Vec::new();
        let mut check = |name: &str, set: bool| {
            if set {
                fields.push(name.to_string());
            }
        };
        check("replace_messages", self.replace_messages.is_some());
        check("goal", self.goal.is_some());
        check("active_agent", self.active_agent.is_some());
        check("assigned_task", self.assigned_task.is_some());
        check("last_status", self.last_status.is_some());
        check("last_failure_kind", self.last_failure_kind.is_some());
        check("pending_requests", self.pending_requests.is_some());
        check("todo", self.todo.is_some());
        check("error", self.error.is_some());
        check("plan", self.plan.is_some());
        for key in self.deliverables.keys() {
            fields.push(format!("deliverables.{key}"));
        }
        fields
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
            && self.pinned.is_empty()
            && self.timeline.is_empty()
            && self.usage.is_empty()
            && self.scalar_writes().is_empty()
    }
}

impl Blackboard {
    /// 按字段规则合并补丁
    pub fn apply(&mut self, patch: StatePatch) {
        if let Some(messages) = patch.replace_messages {
            self.messages = messages;
        }
        self.messages.extend(patch.messages);
        if let Some(goal) = patch.goal {
            self.goal = Some(goal);
        }
        if let Some(active) = patch.active_agent {
            self.active_agent = active;
        }
        if let Some(task) = patch.assigned_task {
            self.assigned_task = task;
        }
        if let Some(status) = patch.last_status {
            self.last_status = Some(status);
        }
        if let Some(kind) = patch.last_failure_kind {
            self.last_failure_kind = kind;
        }
        if let Some(requests) = patch.pending_requests {
            self.pending_requests = requests;
        }
        if let Some(todo) = patch.todo {
            self.todo = todo;
        }
        for (agent_id, value) in patch.deliverables {
            *self.deliverable_versions.entry(agent_id.clone()).or_insert(0) += 1;
            self.deliverables.insert(agent_id, value);
        }
        if let Some(error) = patch.error {
            self.error = error;
        }
        if let Some(plan) = patch.plan {
            self.plan = plan;
        }
        for fact in patch.pinned {
            self.pinned.pin(fact);
        }
        for draft in patch.timeline {
            self.timeline.add(draft);
        }
        self.usage.absorb(patch.usage);
        self.version += 1;
        self.updated_at_ms = chrono::Utc::now().timestamp_millis();
    }

    /// 并行层合并：先做冲突检测，Reject 时整层不生效
    pub fn apply_layer(
        &mut self,
        patches: Vec<(String, StatePatch)>,
        policy: OverlapPolicy,
    ) -> Result<(), StateError> {
        let merged = StatePatch::merge_layer(patches, policy)?;
        self.apply(merged);
        Ok(())
    }
}

impl StatePatch {
    /// 把一层内各 agent 的补丁按层内顺序合成一个；标量字段重叠时按策略拒绝或后写覆盖
    pub fn merge_layer(
        patches: Vec<(String, StatePatch)>,
        policy: OverlapPolicy,
    ) -> Result<StatePatch, StateError> {
        let mut writers: HashMap<String, Vec<String>> = HashMap::new();
        for (agent, patch) in &patches {
            for field in patch.scalar_writes() {
                writers.entry(field).or_default().push(agent.clone());
            }
        }
        let mut overlaps: Vec<(String, Vec<String>)> = writers
            .into_iter()
            .filter(|(_, agents)| agents.len() > 1)
            .collect();
        overlaps.sort();

        if let Some((field, agents)) = overlaps.into_iter().next() {
            match policy {
                OverlapPolicy::Reject => {
                    return Err(StateError::OverlappingWrite { field, agents });
                }
                OverlapPolicy::LastWriterWins => {
                    tracing::warn!(
                        field = %field,
                        agents = ?agents,
                        "overlapping layer write resolved by layer order"
                    );
                }
            }
        }

        Ok(patches
            .into_iter()
            .fold(StatePatch::new(), |acc, (_, patch)| acc.merge(patch)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SessionKey;
    use serde_json::json;

    fn board() -> Blackboard {
        Blackboard::new(SessionKey::new("ns", "s"), 10)
    }

    #[test]
    fn test_field_merge_rules() {
        let mut bb = board();
        bb.apply(
            StatePatch::new()
                .message(Message::user("goal"))
                .activate("analyst")
                .task(Some("analyze".into())),
        );
        bb.apply(
            StatePatch::new()
                .message(Message::assistant("done").named("analyst"))
                .deactivate()
                .status(ExecutionStatus::Completed)
                .deliverable("analyst", json!({"ok": true})),
        );
        assert_eq!(bb.messages.len(), 2);
        assert_eq!(bb.active_agent, None);
        // 未写出的标量保持原值
        assert_eq!(bb.assigned_task.as_deref(), Some("analyze"));
        assert_eq!(bb.deliverable_version("analyst"), 1);
        assert_eq!(bb.version, 2);
    }

    #[test]
    fn test_requests_replaced_wholesale() {
        let mut bb = board();
        let req = BlackboardRequest::human("a", json!({}));
        bb.apply(StatePatch::new().requests(vec![req.clone(), req]));
        assert_eq!(bb.pending_requests.len(), 2);
        bb.apply(StatePatch::new().requests(vec![]));
        assert!(bb.pending_requests.is_empty());
    }

    #[test]
    fn test_replace_messages_then_append() {
        let mut bb = board();
        bb.apply(StatePatch::new().message(Message::user("a")).message(Message::user("b")));
        bb.apply(
            StatePatch::new()
                .replace_messages(vec![Message::system("summary")])
                .message(Message::user("c")),
        );
        let contents: Vec<_> = bb.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["summary", "c"]);
    }

    #[test]
    fn test_layer_disjoint_writes_merge() {
        let mut bb = board();
        let patches = vec![
            ("x".to_string(), StatePatch::new().deliverable("x", json!(1))),
            ("y".to_string(), StatePatch::new().deliverable("y", json!(2))),
        ];
        bb.apply_layer(patches, OverlapPolicy::Reject).unwrap();
        assert_eq!(bb.deliverables.len(), 2);
    }

    #[test]
    fn test_layer_usage_sums_without_conflict() {
        let mut bb = board();
        bb.apply(StatePatch::new().usage("x", TokenUsage::new(10, 1)));
        let patches = vec![
            ("x".to_string(), StatePatch::new().usage("x", TokenUsage::new(20, 2))),
            ("y".to_string(), StatePatch::new().usage("y", TokenUsage::new(30, 3))),
        ];
        bb.apply_layer(patches, OverlapPolicy::Reject).unwrap();
        assert_eq!(bb.usage.llm_calls, 3);
        assert_eq!(bb.usage.total, TokenUsage::new(60, 6));
        assert_eq!(bb.usage.agent("x"), TokenUsage::new(30, 3));
    }

    #[test]
    fn test_layer_overlap_rejected_leaves_board_unchanged() {
        let mut bb = board();
        let before = bb.clone();
        let patches = vec![
            ("x".to_string(), StatePatch::new().activate("x")),
            ("y".to_string(), StatePatch::new().activate("y")),
        ];
        let err = bb.apply_layer(patches, OverlapPolicy::Reject).unwrap_err();
        assert_eq!(
            err,
            StateError::OverlappingWrite {
                field: "active_agent".into(),
                agents: vec!["x".into(), "y".into()],
            }
        );
        assert_eq!(bb, before);
    }

    #[test]
    fn test_layer_overlap_last_writer_wins() {
        let mut bb = board();
        let patches = vec![
            ("x".to_string(), StatePatch::new().task(Some("from x".into()))),
            ("y".to_string(), StatePatch::new().task(Some("from y".into()))),
        ];
        bb.apply_layer(patches, OverlapPolicy::LastWriterWins).unwrap();
        assert_eq!(bb.assigned_task.as_deref(), Some("from y"));
    }

    #[test]
    fn test_patch_merge_prefers_later_scalars() {
        let p = StatePatch::new()
            .status(ExecutionStatus::Running)
            .message(Message::user("1"))
            .merge(StatePatch::new().status(ExecutionStatus::Completed).message(Message::user("2")));
        assert_eq!(p.last_status, Some(ExecutionStatus::Completed));
        assert_eq!(p.messages.len(), 2);
    }
}
