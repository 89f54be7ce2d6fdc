//! 会话级 token 用量：按 agent 累计，随黑板持久化

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::llm::TokenUsage;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUsage {
    #[serde(default)]
    pub total: TokenUsage,
    #[serde(default)]
    pub llm_calls: u64,
    #[serde(default)]
    pub by_agent: BTreeMap<String, TokenUsage>,
}

impl SessionUsage {
    /// 记一次成功的 LLM 调用
    pub fn record(&mut self, agent_id: &str, usage: TokenUsage) {
        self.total += usage;
        self.llm_calls += 1;
        *self.by_agent.entry(agent_id.to_string()).or_default() += usage;
    }

    /// 累加另一份用量（补丁合并与应用都走这里）
    pub fn absorb(&mut self, other: SessionUsage) {
        self.total += other.total;
        self.llm_calls += other.llm_calls;
        for (agent, usage) in other.by_agent {
            *self.by_agent.entry(agent).or_default() += usage;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.llm_calls == 0
    }

    pub fn agent(&self, agent_id: &str) -> TokenUsage {
        self.by_agent.get(agent_id).copied().unwrap_or_default()
    }
}
