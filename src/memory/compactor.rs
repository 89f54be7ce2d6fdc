//! 上下文压缩
//!
//! 只在 LLM 调用被分类为 context（上下文超限）或显式请求时触发，不做预估式压缩。
//! 结果 = 固定消息 + 一条摘要 system 消息 + 最近 keep_recent 条原文。

use std::sync::Arc;

use serde::Serialize;

use crate::llm::{LlmClient, LlmRequest};
use crate::memory::{truncate_to_tokens, Message, Role};

pub const SUMMARY_PREFIX: &str = "Previous conversation summary:";

/// 压缩范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactScope {
    /// 整段历史
    Full,
    /// 只看最近 n 条，更早的非固定消息直接丢弃
    TrailingWindow(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactTrigger {
    ContextOverflow,
    ExplicitRequest,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompactPolicy {
    pub scope: CompactScope,
    pub keep_recent: usize,
    pub max_summary_tokens: usize,
}

impl Default for CompactPolicy {
    fn default() -> Self {
        Self {
            scope: CompactScope::Full,
            keep_recent: 4,
            max_summary_tokens: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompactResult {
    pub trigger: CompactTrigger,
    pub messages: Vec<Message>,
    /// 被摘要或丢弃的消息数
    pub removed: usize,
    pub summary: Option<String>,
}

impl CompactResult {
    pub fn is_noop(&self) -> bool {
        self.summary.is_none() && self.removed == 0
    }
}

pub struct Compactor {
    policy: CompactPolicy,
    llm: Option<Arc<dyn LlmClient>>,
}

impl Compactor {
    pub fn new(policy: CompactPolicy) -> Self {
        Self { policy, llm: None }
    }

    /// 使用 LLM 生成摘要；未配置或调用失败时退回截断拼接
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn policy(&self) -> &CompactPolicy {
        &self.policy
    }

    pub async fn compact(&self, messages: &[Message], trigger: CompactTrigger) -> CompactResult {
        let window_start = match self.policy.scope {
            CompactScope::Full => 0,
            CompactScope::TrailingWindow(n) => messages.len().saturating_sub(n),
        };
        let tail_start = messages.len().saturating_sub(self.policy.keep_recent).max(window_start);

        let mut pinned = Vec::new();
        let mut to_summarize = Vec::new();
        let mut dropped = 0;
        for (i, m) in messages[..tail_start].iter().enumerate() {
            if m.pinned {
                pinned.push(m.clone());
            } else if i < window_start {
                dropped += 1;
            } else {
                to_summarize.push(m);
            }
        }

        if to_summarize.is_empty() && dropped == 0 {
            return CompactResult {
                trigger,
                messages: messages.to_vec(),
                removed: 0,
                summary: None,
            };
        }

        let summary = if to_summarize.is_empty() {
            None
        } else {
            Some(self.summarize(&to_summarize).await)
        };

        let mut out = pinned;
        if let Some(s) = &summary {
            out.push(Message::system(format!("{SUMMARY_PREFIX}\n\n{s}")));
        }
        out.extend(messages[tail_start..].iter().cloned());

        let removed = to_summarize.len() + dropped;
        tracing::info!(
            removed,
            kept = out.len(),
            trigger = ?trigger,
            "context compacted"
        );
        CompactResult {
            trigger,
            messages: out,
            removed,
            summary,
        }
    }

    async fn summarize(&self, messages: &[&Message]) -> String {
        let transcript = transcript(messages);
        if let Some(llm) = &self.llm {
            let request = LlmRequest::new(vec![
                Message::system(
                    "Summarize the conversation below. Keep decisions, constraints, open questions and produced artifacts. Be concise.",
                ),
                Message::user(transcript.clone()),
            ]);
            match llm.complete(&request).await {
                Ok(resp) if !resp.content.trim().is_empty() => {
                    return truncate_to_tokens(resp.content.trim(), self.policy.max_summary_tokens);
                }
                Ok(_) => tracing::warn!("empty summary from llm, using transcript"),
                Err(e) => tracing::warn!(error = %e, "summary llm call failed, using transcript"),
            }
        }
        truncate_to_tokens(&transcript, self.policy.max_summary_tokens)
    }
}

fn transcript(messages: &[&Message]) -> String {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };
            match &m.name {
                Some(name) => format!("{role}({name}): {}", m.content),
                None => format!("{role}: {}", m.content),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
