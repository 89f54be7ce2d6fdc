//! 错误分类引擎
//!
//! 把原始的依赖失败（HTTP 状态码、厂商错误码、错误文本）归入 ErrorCategory，
//! 再由 ErrorCategory 给出 RecoveryAction。各 LLM 后端共用同一套规则。

use crate::core::{AgentError, ClassifiedError, ErrorCategory, RecoveryAction};

/// 厂商返回的「上下文超长」错误码
const CONTEXT_CODES: &[&str] = &[
    "context_length_exceeded",
    "context_window_exceeded",
    "max_tokens_exceeded",
    "prompt_too_long",
];

/// 错误文本中常见的上下文超长描述
const CONTEXT_PHRASES: &[&str] = &[
    "context length",
    "context window",
    "maximum context",
    "too many tokens",
    "prompt is too long",
];

#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// 错误 -> 恢复动作
    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        err.recovery_action()
    }

    /// 按 HTTP 状态码 + 厂商错误码分类
    pub fn classify_status(&self, status: u16, code: Option<&str>, message: &str) -> ClassifiedError {
        if let Some(code) = code {
            if CONTEXT_CODES.contains(&code) {
                return ClassifiedError::new(ErrorCategory::Context, message);
            }
            if code == "model_not_found" {
                return ClassifiedError::new(ErrorCategory::NotFound, message);
            }
        }
        let category = match status {
            401 | 403 => ErrorCategory::AuthFailure,
            404 => ErrorCategory::NotFound,
            408 | 504 => ErrorCategory::Timeout,
            429 => ErrorCategory::RateLimit,
            400 if is_context_message(message) => ErrorCategory::Context,
            400 | 422 => ErrorCategory::InvalidInput,
            500..=599 => ErrorCategory::Transient,
            _ => ErrorCategory::Internal,
        };
        ClassifiedError::new(category, message)
    }

    /// 没有状态码时按错误码 / 文本分类（SDK 封装后的错误）
    pub fn classify_message(&self, code: Option<&str>, message: &str) -> ClassifiedError {
        if let Some(code) = code {
            if CONTEXT_CODES.contains(&code) {
                return ClassifiedError::new(ErrorCategory::Context, message);
            }
            match code {
                "rate_limit_exceeded" => {
                    return ClassifiedError::new(ErrorCategory::RateLimit, message)
                }
                "invalid_api_key" => {
                    return ClassifiedError::new(ErrorCategory::AuthFailure, message)
                }
                "model_not_found" => return ClassifiedError::new(ErrorCategory::NotFound, message),
                _ => {}
            }
        }

        let lower = message.to_lowercase();
        let category = if is_context_message(&lower) {
            ErrorCategory::Context
        } else if lower.contains("rate limit") || lower.contains("429") {
            ErrorCategory::RateLimit
        } else if lower.contains("timed out") || lower.contains("timeout") {
            ErrorCategory::Timeout
        } else if lower.contains("unauthorized") || lower.contains("401") || lower.contains("403") {
            ErrorCategory::AuthFailure
        } else if lower.contains("connection")
            || lower.contains("temporarily")
            || lower.contains("overloaded")
            || lower.contains("502")
            || lower.contains("503")
        {
            ErrorCategory::Transient
        } else if lower.contains("deserialize") || lower.contains("invalid json") {
            ErrorCategory::StructuredOutput
        } else {
            ErrorCategory::Internal
        };
        ClassifiedError::new(category, message)
    }
}

fn is_context_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    CONTEXT_CODES.iter().any(|c| lower.contains(c)) || CONTEXT_PHRASES.iter().any(|p| lower.contains(p))
}
