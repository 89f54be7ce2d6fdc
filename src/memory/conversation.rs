//! 对话消息
//!
//! 黑板上的 messages 只追加，唯一的整体替换来自压缩；这里提供消息类型与窗口截取。

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// 产出该消息的 agent 或工具名
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// 固定消息不会被压缩掉
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pinned: bool,
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            pinned: false,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    pub fn tool(tool_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self::with_role(Role::Tool, content).named(tool_name)
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn pin(mut self) -> Self {
        self.pinned = true;
        self
    }
}

/// 最近 max 条消息（不含固定消息之外的截断标记）
pub fn recent_window(messages: &[Message], max: usize) -> &[Message] {
    if messages.len() <= max {
        messages
    } else {
        &messages[messages.len() - max..]
    }
}

/// 历史窗口：固定消息总是带上，其余取最近 max 条，保持原顺序
pub fn history_window(messages: &[Message], max: usize) -> Vec<Message> {
    let cutoff = messages.len().saturating_sub(max);
    messages
        .iter()
        .enumerate()
        .filter(|(i, m)| m.pinned || *i >= cutoff)
        .map(|(_, m)| m.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_keeps_pinned() {
        let mut msgs = vec![Message::user("decision: use postgres").pin()];
        for i in 0..10 {
            msgs.push(Message::assistant(format!("turn {i}")));
        }
        let w = history_window(&msgs, 3);
        assert_eq!(w.len(), 4);
        assert!(w[0].pinned);
        assert_eq!(w[3].content, "turn 9");
        assert_eq!(recent_window(&msgs, 2).len(), 2);
    }

    #[test]
    fn test_pinned_flag_skipped_when_false() {
        let v = serde_json::to_value(Message::user("hi")).unwrap();
        assert!(v.get("pinned").is_none());
        assert_eq!(v["role"], "user");
    }
}
