//! 执行时间线
//!
//! 每次有意义的状态变化追加一条不可变的 TimelineEntry（单调递增 seq）。
//! 检查点条目标记时间旅行可回到的位置；truncate_to_checkpoint 删除其后的全部条目。

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::EventType;

/// 检查点类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    Auto,
    Manual,
    AgentEnd,
    UserMessage,
    ErrorRecovery,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub id: String,
    pub seq: u64,
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_type: Option<CheckpointType>,
    #[serde(default)]
    pub is_checkpoint: bool,
}

impl TimelineEntry {
    pub fn to_display(&self) -> String {
        let agent = self
            .agent_id
            .as_ref()
            .map(|a| format!("[{a}] "))
            .unwrap_or_default();
        let duration = self
            .duration_ms
            .map(|d| format!(" ({d}ms)"))
            .unwrap_or_default();
        format!("{agent}{}: {}{duration}", self.event_type, self.content)
    }
}

/// 待写入的条目
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineDraft {
    pub event_type: EventType,
    pub agent_id: Option<String>,
    pub content: String,
    pub metadata: Value,
    pub duration_ms: Option<u64>,
}

impl TimelineDraft {
    pub fn new(event_type: EventType, content: impl Into<String>) -> Self {
        Self {
            event_type,
            agent_id: None,
            content: content.into(),
            metadata: Value::Null,
            duration_ms: None,
        }
    }

    pub fn agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    entries: Vec<TimelineEntry>,
    next_seq: u64,
    checkpoint_ids: Vec<String>,
    #[serde(default)]
    current_checkpoint_id: Option<String>,
    #[serde(default)]
    total_duration_ms: u64,
}

impl Default for Timeline {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_seq: 1,
            checkpoint_ids: Vec::new(),
            current_checkpoint_id: None,
            total_duration_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineStats {
    pub total_entries: usize,
    pub checkpoint_count: usize,
    pub agents: Vec<String>,
    pub total_duration_ms: u64,
    pub type_counts: BTreeMap<String, usize>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, draft: TimelineDraft) -> &TimelineEntry {
        self.push(draft, None, None)
    }

    pub fn add_checkpoint(
        &mut self,
        checkpoint_id: impl Into<String>,
        checkpoint_type: CheckpointType,
        agent_id: Option<String>,
        content: impl Into<String>,
    ) -> &TimelineEntry {
        let checkpoint_id = checkpoint_id.into();
        self.checkpoint_ids.push(checkpoint_id.clone());
        self.current_checkpoint_id = Some(checkpoint_id.clone());
        let mut draft = TimelineDraft::new(EventType::CheckpointCreate, content);
        draft.agent_id = agent_id;
        self.push(draft, Some(checkpoint_id), Some(checkpoint_type))
    }

    fn push(
        &mut self,
        draft: TimelineDraft,
        checkpoint_id: Option<String>,
        checkpoint_type: Option<CheckpointType>,
    ) -> &TimelineEntry {
        if let Some(d) = draft.duration_ms {
            self.total_duration_ms += d;
        }
        let entry = TimelineEntry {
            id: uuid::Uuid::new_v4().simple().to_string()[..12].to_string(),
            seq: self.next_seq,
            event_type: draft.event_type,
            agent_id: draft.agent_id,
            content: draft.content,
            metadata: draft.metadata,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            duration_ms: draft.duration_ms,
            is_checkpoint: checkpoint_id.is_some(),
            checkpoint_id,
            checkpoint_type,
        };
        self.next_seq += 1;
        self.entries.push(entry);
        &self.entries[self.entries.len() - 1]
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn checkpoint_ids(&self) -> &[String] {
        &self.checkpoint_ids
    }

    pub fn current_checkpoint_id(&self) -> Option<&str> {
        self.current_checkpoint_id.as_deref()
    }

    pub fn total_duration_ms(&self) -> u64 {
        self.total_duration_ms
    }

    pub fn entry_by_checkpoint(&self, checkpoint_id: &str) -> Option<&TimelineEntry> {
        self.entries
            .iter()
            .find(|e| e.checkpoint_id.as_deref() == Some(checkpoint_id))
    }

    pub fn entries_by_agent<'a>(&'a self, agent_id: &'a str) -> impl Iterator<Item = &'a TimelineEntry> {
        self.entries
            .iter()
            .filter(move |e| e.agent_id.as_deref() == Some(agent_id))
    }

    pub fn entries_by_type(&self, event_type: EventType) -> impl Iterator<Item = &TimelineEntry> {
        self.entries.iter().filter(move |e| e.event_type == event_type)
    }

    pub fn latest_checkpoint(&self) -> Option<&TimelineEntry> {
        self.entries.iter().rev().find(|e| e.is_checkpoint)
    }

    /// 删除指定检查点之后的所有条目，返回删除数量；检查点不存在时返回 None
    pub fn truncate_to_checkpoint(&mut self, checkpoint_id: &str) -> Option<usize> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.checkpoint_id.as_deref() == Some(checkpoint_id))?;
        let removed = self.entries.len() - idx - 1;
        self.entries.truncate(idx + 1);

        let kept: BTreeSet<&str> = self
            .entries
            .iter()
            .filter_map(|e| e.checkpoint_id.as_deref())
            .collect();
        self.checkpoint_ids.retain(|c| kept.contains(c.as_str()));
        self.next_seq = self.entries.last().map(|e| e.seq + 1).unwrap_or(1);
        self.current_checkpoint_id = Some(checkpoint_id.to_string());
        self.total_duration_ms = self.entries.iter().filter_map(|e| e.duration_ms).sum();
        Some(removed)
    }

    pub fn to_prompt(&self, max_entries: usize) -> String {
        if self.entries.is_empty() {
            return String::new();
        }
        let start = self.entries.len().saturating_sub(max_entries);
        let mut out = String::from("## Execution timeline\n");
        if start > 0 {
            out.push_str(&format!(
                "(showing last {} of {})\n",
                self.entries.len() - start,
                self.entries.len()
            ));
        }
        for e in &self.entries[start..] {
            out.push_str("- ");
            out.push_str(&e.to_display());
            out.push('\n');
        }
        out
    }

    pub fn stats(&self) -> TimelineStats {
        let mut type_counts = BTreeMap::new();
        let mut agents = BTreeSet::new();
        for e in &self.entries {
            *type_counts.entry(e.event_type.to_string()).or_insert(0) += 1;
            if let Some(a) = &e.agent_id {
                agents.insert(a.clone());
            }
        }
        TimelineStats {
            total_entries: self.entries.len(),
            checkpoint_count: self.checkpoint_ids.len(),
            agents: agents.into_iter().collect(),
            total_duration_ms: self.total_duration_ms,
            type_counts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Timeline {
        let mut tl = Timeline::new();
        tl.add(TimelineDraft::new(EventType::SessionStart, "start"));
        tl.add(TimelineDraft::new(EventType::AgentEnd, "analyst done").agent("analyst").duration(40));
        tl.add_checkpoint("cp1", CheckpointType::AgentEnd, Some("analyst".into()), "after analyst");
        tl.add(TimelineDraft::new(EventType::AgentEnd, "dev done").agent("developer").duration(60));
        tl.add_checkpoint("cp2", CheckpointType::Auto, None, "after developer");
        tl.add(TimelineDraft::new(EventType::SessionEnd, "end"));
        tl
    }

    #[test]
    fn test_seq_starts_at_one_and_increments() {
        let tl = sample();
        let seqs: Vec<u64> = tl.entries().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(tl.next_seq(), 7);
        assert_eq!(tl.total_duration_ms(), 100);
    }

    #[test]
    fn test_truncate_to_checkpoint() {
        let mut tl = sample();
        let cp_seq = tl.entry_by_checkpoint("cp1").unwrap().seq;
        assert_eq!(tl.truncate_to_checkpoint("cp1"), Some(3));
        assert!(tl.entries().iter().all(|e| e.seq <= cp_seq));
        assert_eq!(tl.checkpoint_ids(), &["cp1".to_string()]);
        assert_eq!(tl.next_seq(), cp_seq + 1);
        assert_eq!(tl.current_checkpoint_id(), Some("cp1"));
        assert_eq!(tl.total_duration_ms(), 40);
        assert_eq!(tl.truncate_to_checkpoint("missing"), None);
    }

    #[test]
    fn test_queries_and_stats() {
        let tl = sample();
        assert_eq!(tl.entries_by_agent("analyst").count(), 2);
        assert_eq!(tl.entries_by_type(EventType::CheckpointCreate).count(), 2);
        assert_eq!(tl.latest_checkpoint().unwrap().checkpoint_id.as_deref(), Some("cp2"));
        let stats = tl.stats();
        assert_eq!(stats.total_entries, 6);
        assert_eq!(stats.checkpoint_count, 2);
        assert_eq!(stats.agents, vec!["analyst".to_string(), "developer".to_string()]);
    }

    #[test]
    fn test_to_prompt_limits_entries() {
        let tl = sample();
        let p = tl.to_prompt(2);
        assert!(p.contains("showing last 2 of 6"));
        assert!(p.contains("session.end: end"));
        assert!(!p.contains("session.start"));
    }
}
