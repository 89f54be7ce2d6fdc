//! 测试用 LLM 客户端（无需 API）
//!
//! MockLlmClient 把最后一条用户消息包装成交付物回显；ScriptedLlmClient 按脚本依次返回
//! 预设回复或错误，并记录每次请求，便于断言调用次数与上下文内容。

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::core::{ClassifiedError, ErrorCategory};
use crate::llm::{LlmClient, LlmRequest, LlmResponse, TokenUsage};
use crate::memory::{Role, TokenEstimator};

#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, ClassifiedError> {
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        let content = serde_json::json!({ "deliverable": { "echo": last_user } }).to_string();
        let prompt = TokenEstimator::estimate_messages(&request.messages) as u64;
        Ok(LlmResponse {
            usage: TokenUsage::new(prompt, TokenEstimator::estimate(&content) as u64),
            content,
            tool_calls: Vec::new(),
        })
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

#[derive(Debug, Clone)]
pub enum ScriptStep {
    Reply(String),
    Fail(ClassifiedError),
}

#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<ScriptStep>>,
    calls: Mutex<Vec<LlmRequest>>,
    fallback: Option<String>,
}

impl ScriptedLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, content: impl Into<String>) -> Self {
        self.script.lock().push_back(ScriptStep::Reply(content.into()));
        self
    }

    pub fn fail(self, error: ClassifiedError) -> Self {
        self.script.lock().push_back(ScriptStep::Fail(error));
        self
    }

    /// 脚本耗尽后的固定回复
    pub fn with_fallback(mut self, content: impl Into<String>) -> Self {
        self.fallback = Some(content.into());
        self
    }

    pub fn push(&self, step: ScriptStep) {
        self.script.lock().push_back(step);
    }

    pub fn calls(&self) -> Vec<LlmRequest> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, ClassifiedError> {
        self.calls.lock().push(request.clone());
        let step = self.script.lock().pop_front();
        match step {
            Some(ScriptStep::Reply(content)) => Ok(LlmResponse::text(content)),
            Some(ScriptStep::Fail(e)) => Err(e),
            None => match &self.fallback {
                Some(content) => Ok(LlmResponse::text(content.clone())),
                None => Err(ClassifiedError::new(
                    ErrorCategory::Internal,
                    "scripted client exhausted",
                )),
            },
        }
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}
