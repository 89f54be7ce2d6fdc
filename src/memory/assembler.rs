//! 上下文组装
//!
//! 每个 agent 回合：系统提示（指令、能力、固定事实、待办、上游产出、知识、时间线按预算分配）
//! + 有界的历史窗口（固定消息始终保留）+ 当前任务。

use crate::memory::{history_window, ContextSegment, Message, TokenBudget};
use crate::state::Blackboard;

/// 单次组装所需的 agent 侧输入
#[derive(Debug, Clone, Default)]
pub struct AssemblyInput<'a> {
    pub agent_id: &'a str,
    pub instructions: &'a str,
    /// 工具、委派目标与回复格式说明
    pub capabilities: String,
    pub knowledge: Option<String>,
    /// 需要注入的上游产出；为空时注入除自己以外的全部产出
    pub upstream: &'a [String],
    pub task: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct ContextAssembler {
    budget: TokenBudget,
    history_window: usize,
    timeline_entries: usize,
}

impl Default for ContextAssembler {
    fn default() -> Self {
        Self::new(TokenBudget::default(), 20)
    }
}

impl ContextAssembler {
    pub fn new(budget: TokenBudget, history_window: usize) -> Self {
        Self {
            budget,
            history_window,
            timeline_entries: 20,
        }
    }

    pub fn history_window(&self) -> usize {
        self.history_window
    }

    pub fn assemble(&self, input: &AssemblyInput<'_>, board: &Blackboard) -> Vec<Message> {
        let segments = vec![
            (ContextSegment::Instructions, input.instructions.to_string()),
            (ContextSegment::Capabilities, input.capabilities.clone()),
            (ContextSegment::PinnedFacts, board.pinned.to_prompt()),
            (ContextSegment::Todo, board.todo.to_prompt()),
            (ContextSegment::Deliverables, deliverables_prompt(input, board)),
            (ContextSegment::Knowledge, input.knowledge.clone().unwrap_or_default()),
            (ContextSegment::Timeline, board.timeline.to_prompt(self.timeline_entries)),
        ];
        let system = self
            .budget
            .allocate(&segments)
            .into_iter()
            .map(|(_, text)| text)
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut messages = vec![Message::system(system)];
        messages.extend(history_window(&board.messages, self.history_window));

        let task = input.task.or(board.goal.as_deref());
        if let Some(task) = task {
            let already_last = messages.last().map(|m| m.content == task).unwrap_or(false);
            if !already_last {
                messages.push(Message::user(task));
            }
        }
        messages
    }
}

fn deliverables_prompt(input: &AssemblyInput<'_>, board: &Blackboard) -> String {
    let selected: Vec<(&String, &serde_json::Value)> = board
        .deliverables
        .iter()
        .filter(|(id, _)| {
            if input.upstream.is_empty() {
                id.as_str() != input.agent_id
            } else {
                input.upstream.contains(id)
            }
        })
        .collect();
    if selected.is_empty() {
        return String::new();
    }
    let mut out = String::from("## Upstream deliverables\n");
    for (id, value) in selected {
        let body = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
        out.push_str(&format!("### {id}\n{body}\n"));
    }
    out
}
