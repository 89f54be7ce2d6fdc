//! 固定事实：决策、产物引用、约束；每轮都注入上下文，压缩时原样保留

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinnedKind {
    Decision,
    Artifact,
    Constraint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinnedFact {
    pub kind: PinnedKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub created_at_ms: i64,
}

impl PinnedFact {
    pub fn new(kind: PinnedKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            agent_id: None,
            created_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn decision(content: impl Into<String>) -> Self {
        Self::new(PinnedKind::Decision, content)
    }

    pub fn artifact(content: impl Into<String>) -> Self {
        Self::new(PinnedKind::Artifact, content)
    }

    pub fn by(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PinnedFacts {
    facts: Vec<PinnedFact>,
}

impl PinnedFacts {
    pub fn new() -> Self {
        Self::default()
    }

    /// 相同类别 + 内容的事实只保留一份
    pub fn pin(&mut self, fact: PinnedFact) {
        if self
            .facts
            .iter()
            .any(|f| f.kind == fact.kind && f.content == fact.content)
        {
            return;
        }
        self.facts.push(fact);
    }

    pub fn iter(&self) -> impl Iterator<Item = &PinnedFact> {
        self.facts.iter()
    }

    pub fn of_kind(&self, kind: PinnedKind) -> impl Iterator<Item = &PinnedFact> {
        self.facts.iter().filter(move |f| f.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    pub fn to_prompt(&self) -> String {
        if self.facts.is_empty() {
            return String::new();
        }
        let mut out = String::from("## Pinned facts\n");
        for f in &self.facts {
            let label = match f.kind {
                PinnedKind::Decision => "decision",
                PinnedKind::Artifact => "artifact",
                PinnedKind::Constraint => "constraint",
            };
            match &f.agent_id {
                Some(agent) => out.push_str(&format!("- [{label}] {} ({agent})\n", f.content)),
                None => out.push_str(&format!("- [{label}] {}\n", f.content)),
            }
        }
        out
    }
}
