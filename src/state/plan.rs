//! 任务计划：map-reduce 的规划结果与计划-执行-反思循环共用

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{ExecutionStatus, FailureKind};

/// 规划器产出的任务草稿
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct TaskDraft {
    /// 负责执行的 agent id
    pub agent: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanTask {
    pub id: String,
    pub agent_id: String,
    pub description: String,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
}

impl PlanTask {
    pub fn complete(&mut self, output: Value) {
        self.status = ExecutionStatus::Completed;
        self.output = Some(output);
        self.error = None;
        self.failure_kind = None;
    }

    pub fn fail(&mut self, error: impl Into<String>, kind: FailureKind) {
        self.status = ExecutionStatus::Failed;
        self.error = Some(error.into());
        self.failure_kind = Some(kind);
    }

    pub fn reset(&mut self) {
        self.status = ExecutionStatus::Pending;
        self.error = None;
        self.failure_kind = None;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub goal: String,
    pub tasks: Vec<PlanTask>,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub current_task_id: Option<String>,
    #[serde(default)]
    pub replan_count: u32,
    /// 当前任务的系统失败快速重试次数
    #[serde(default)]
    pub error_retry_count: u32,
    next_task_id: u32,
}

impl Plan {
    pub fn new(goal: impl Into<String>, drafts: Vec<TaskDraft>) -> Self {
        let mut plan = Self {
            goal: goal.into(),
            tasks: Vec::new(),
            status: ExecutionStatus::Running,
            current_task_id: None,
            replan_count: 0,
            error_retry_count: 0,
            next_task_id: 1,
        };
        plan.extend(drafts);
        plan
    }

    pub fn extend(&mut self, drafts: Vec<TaskDraft>) {
        for d in drafts {
            self.tasks.push(PlanTask {
                id: format!("task_{}", self.next_task_id),
                agent_id: d.agent,
                description: d.description,
                status: ExecutionStatus::Pending,
                output: None,
                error: None,
                failure_kind: None,
            });
            self.next_task_id += 1;
        }
    }

    /// 保留已完成任务，其余替换为新草稿
    pub fn revise(&mut self, drafts: Vec<TaskDraft>) {
        self.tasks.retain(|t| t.status == ExecutionStatus::Completed);
        self.extend(drafts);
        self.current_task_id = None;
        self.error_retry_count = 0;
        self.replan_count += 1;
        self.status = ExecutionStatus::Running;
    }

    pub fn task(&self, id: &str) -> Option<&PlanTask> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut PlanTask> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    pub fn current(&self) -> Option<&PlanTask> {
        self.current_task_id.as_deref().and_then(|id| self.task(id))
    }

    pub fn current_mut(&mut self) -> Option<&mut PlanTask> {
        let id = self.current_task_id.clone()?;
        self.task_mut(&id)
    }

    pub fn next_pending(&self) -> Option<&PlanTask> {
        self.tasks
            .iter()
            .find(|t| t.status == ExecutionStatus::Pending)
    }

    pub fn has_failed(&self) -> bool {
        self.tasks.iter().any(|t| t.status == ExecutionStatus::Failed)
    }

    pub fn all_completed(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().all(|t| t.status == ExecutionStatus::Completed)
    }

    pub fn to_prompt(&self) -> String {
        let mut out = format!("## Plan (goal: {})\n", self.goal);
        for t in &self.tasks {
            out.push_str(&format!("- [{}] {} @{}: {}", t.status, t.id, t.agent_id, t.description));
            if let Some(e) = &t.error {
                out.push_str(&format!(" (error: {e})"));
            }
            out.push('\n');
        }
        out
    }
}
