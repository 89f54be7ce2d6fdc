//! Token 预算
//!
//! 系统提示由若干上下文段拼成，各段按优先级竞争同一份预算；超出的段被截断。

use std::collections::HashMap;

/// Token 估算器（字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 英文约 4 字符/token，中文约 1.5 字符/token
    pub fn estimate(text: &str) -> usize {
        let mut ascii_chars = 0;
        let mut non_ascii_chars = 0;
        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }
        let tokens = ascii_chars / 4 + (non_ascii_chars as f64 / 1.5).ceil() as usize;
        tokens.max(1)
    }

    pub fn estimate_messages(messages: &[crate::memory::Message]) -> usize {
        // 每条消息额外约 4 个 token 的角色 / 分隔开销
        messages
            .iter()
            .map(|m| Self::estimate(&m.content) + 4)
            .sum()
    }
}

/// 上下文段（按优先级排序）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextSegment {
    /// Agent 指令（最高优先级）
    Instructions,
    /// 可用工具与委派目标
    Capabilities,
    PinnedFacts,
    Todo,
    /// 上游 Agent 的产出
    Deliverables,
    /// 按需注入的知识
    Knowledge,
    Timeline,
}

impl ContextSegment {
    /// 数字越小优先级越高
    pub fn priority(&self) -> u8 {
        match self {
            ContextSegment::Instructions => 0,
            ContextSegment::Capabilities => 1,
            ContextSegment::PinnedFacts => 2,
            ContextSegment::Todo => 3,
            ContextSegment::Deliverables => 4,
            ContextSegment::Knowledge => 5,
            ContextSegment::Timeline => 6,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TokenBudget {
    total_budget: usize,
    segment_limits: HashMap<ContextSegment, usize>,
}

impl TokenBudget {
    pub fn new(total_budget: usize) -> Self {
        Self {
            total_budget,
            segment_limits: HashMap::new(),
        }
    }

    pub fn with_segment_limit(mut self, segment: ContextSegment, limit: usize) -> Self {
        self.segment_limits.insert(segment, limit);
        self
    }

    pub fn total_budget(&self) -> usize {
        self.total_budget
    }

    /// 按优先级分配预算，返回截断后的各段（已排序，空段被丢弃）
    pub fn allocate(&self, segments: &[(ContextSegment, String)]) -> Vec<(ContextSegment, String)> {
        let mut result = Vec::new();
        let mut remaining = self.total_budget;

        let mut sorted: Vec<_> = segments.to_vec();
        sorted.sort_by_key(|(seg, _)| seg.priority());

        for (segment, content) in sorted {
            if content.is_empty() {
                continue;
            }
            let estimated = TokenEstimator::estimate(&content);
            let limit = self
                .segment_limits
                .get(&segment)
                .copied()
                .unwrap_or(remaining);
            let allowed = remaining.min(limit);

            if estimated <= allowed {
                result.push((segment, content));
                remaining = remaining.saturating_sub(estimated);
            } else if allowed > 0 {
                let truncated = truncate_to_tokens(&content, allowed);
                remaining = remaining.saturating_sub(TokenEstimator::estimate(&truncated));
                result.push((segment, truncated));
            }
        }
        result
    }
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self::new(8000)
    }
}

/// 按比例截断，保留开头
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    let estimated = TokenEstimator::estimate(text);
    if estimated <= max_tokens {
        return text.to_string();
    }
    let ratio = max_tokens as f64 / estimated as f64;
    // 留 10% 余量
    let target_chars = (text.chars().count() as f64 * ratio * 0.9) as usize;
    let truncated: String = text.chars().take(target_chars).collect();
    format!("{}...\n[truncated]", truncated.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate() {
        assert_eq!(TokenEstimator::estimate("abcdefgh"), 2);
        assert_eq!(TokenEstimator::estimate("你好"), 2);
        assert_eq!(TokenEstimator::estimate(""), 1);
    }

    #[test]
    fn test_allocate_by_priority() {
        let budget = TokenBudget::new(30);
        let segments = vec![
            (ContextSegment::Timeline, "t".repeat(400)),
            (ContextSegment::Instructions, "i".repeat(80)),
            (ContextSegment::Todo, String::new()),
        ];
        let out = budget.allocate(&segments);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].0, ContextSegment::Instructions);
        assert_eq!(out[0].1.len(), 80);
        assert!(out[1].1.ends_with("[truncated]"));
    }

    #[test]
    fn test_segment_limit() {
        let budget = TokenBudget::new(1000).with_segment_limit(ContextSegment::Knowledge, 5);
        let out = budget.allocate(&[(ContextSegment::Knowledge, "k".repeat(200))]);
        assert!(out[0].1.contains("[truncated]"));
    }
}
