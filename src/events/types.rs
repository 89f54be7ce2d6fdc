//! 事件信封
//!
//! 每个流事件序列化为 `{v, ts, event, namespace, session_id, agent?, span?, duration_ms?, data?}`。
//! 同一套 EventType 也用作时间线条目的类型。

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::SessionKey;

pub const EVENT_SCHEMA_VERSION: u8 = 1;

/// 事件类型词表
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "session.start")]
    SessionStart,
    #[serde(rename = "session.end")]
    SessionEnd,
    #[serde(rename = "session.aborted")]
    SessionAborted,
    #[serde(rename = "agent.start")]
    AgentStart,
    #[serde(rename = "agent.end")]
    AgentEnd,
    #[serde(rename = "agent.failed")]
    AgentFailed,
    #[serde(rename = "agent.thinking")]
    AgentThinking,
    #[serde(rename = "agent.interrupt")]
    AgentInterrupt,
    #[serde(rename = "tool.call")]
    ToolCall,
    #[serde(rename = "tool.result")]
    ToolResult,
    #[serde(rename = "tool.error")]
    ToolError,
    #[serde(rename = "llm.start")]
    LlmStart,
    #[serde(rename = "llm.end")]
    LlmEnd,
    #[serde(rename = "llm.chunk")]
    LlmChunk,
    #[serde(rename = "delegation.start")]
    DelegationStart,
    #[serde(rename = "delegation.end")]
    DelegationEnd,
    #[serde(rename = "checkpoint.create")]
    CheckpointCreate,
    #[serde(rename = "checkpoint.restore")]
    CheckpointRestore,
    #[serde(rename = "todo.update")]
    TodoUpdate,
    #[serde(rename = "plan.update")]
    PlanUpdate,
    #[serde(rename = "memory.compact")]
    MemoryCompact,
    #[serde(rename = "user.message")]
    UserMessage,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SessionStart => "session.start",
            EventType::SessionEnd => "session.end",
            EventType::SessionAborted => "session.aborted",
            EventType::AgentStart => "agent.start",
            EventType::AgentEnd => "agent.end",
            EventType::AgentFailed => "agent.failed",
            EventType::AgentThinking => "agent.thinking",
            EventType::AgentInterrupt => "agent.interrupt",
            EventType::ToolCall => "tool.call",
            EventType::ToolResult => "tool.result",
            EventType::ToolError => "tool.error",
            EventType::LlmStart => "llm.start",
            EventType::LlmEnd => "llm.end",
            EventType::LlmChunk => "llm.chunk",
            EventType::DelegationStart => "delegation.start",
            EventType::DelegationEnd => "delegation.end",
            EventType::CheckpointCreate => "checkpoint.create",
            EventType::CheckpointRestore => "checkpoint.restore",
            EventType::TodoUpdate => "todo.update",
            EventType::PlanUpdate => "plan.update",
            EventType::MemoryCompact => "memory.compact",
            EventType::UserMessage => "user.message",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRef {
    pub id: String,
    pub name: String,
}

/// 调用链：run_id 为本次节点执行，parent_run_id 为所属会话运行
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub v: u8,
    /// 毫秒时间戳
    pub ts: i64,
    pub event: EventType,
    pub namespace: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<Span>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl StreamEvent {
    pub fn new(event: EventType, key: &SessionKey) -> Self {
        Self {
            v: EVENT_SCHEMA_VERSION,
            ts: chrono::Utc::now().timestamp_millis(),
            event,
            namespace: key.namespace.clone(),
            session_id: key.session_id.clone(),
            agent: None,
            span: None,
            duration_ms: None,
            data: None,
        }
    }

    pub fn with_agent(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.agent = Some(AgentRef {
            id: id.into(),
            name: name.into(),
        });
        self
    }

    pub fn with_span(mut self, run_id: impl Into<String>, parent_run_id: Option<String>) -> Self {
        self.span = Some(Span {
            run_id: run_id.into(),
            parent_run_id,
        });
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// 结束一次 stream 的事件
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.event,
            EventType::SessionEnd
                | EventType::SessionAborted
                | EventType::AgentInterrupt
                | EventType::AgentFailed
        )
    }

    pub fn agent_id(&self) -> Option<&str> {
        self.agent.as_ref().map(|a| a.id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_shape() {
        let key = SessionKey::new("etl", "s1");
        let ev = StreamEvent::new(EventType::AgentStart, &key)
            .with_agent("analyst", "Analyst")
            .with_span("run-2", Some("run-1".into()))
            .with_duration(12)
            .with_data(json!({"task": "x"}));
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["v"], 1);
        assert_eq!(v["event"], "agent.start");
        assert_eq!(v["namespace"], "etl");
        assert_eq!(v["session_id"], "s1");
        assert_eq!(v["agent"]["id"], "analyst");
        assert_eq!(v["span"]["parent_run_id"], "run-1");
        assert_eq!(v["duration_ms"], 12);
    }

    #[test]
    fn test_optional_fields_omitted() {
        let key = SessionKey::new("etl", "s1");
        let v = serde_json::to_value(StreamEvent::new(EventType::SessionStart, &key)).unwrap();
        let obj = v.as_object().unwrap();
        assert!(!obj.contains_key("agent"));
        assert!(!obj.contains_key("span"));
        assert!(!obj.contains_key("data"));
    }
}
