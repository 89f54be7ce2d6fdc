//! 会话监管：每个会话一个取消令牌
//!
//! stream / resume 开始时登记会话，abort 时触发对应令牌；图驱动在节点边界检查令牌，
//! 并行层内的任务使用子令牌。会话之间互不影响。

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct SessionSupervisor {
    running: Mutex<HashMap<String, CancellationToken>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一次运行；同一会话已有运行时返回 None
    pub fn begin(&self, session: &str) -> Option<CancellationToken> {
        let mut running = self.running.lock();
        if running.contains_key(session) {
            return None;
        }
        let token = CancellationToken::new();
        running.insert(session.to_string(), token.clone());
        Some(token)
    }

    /// 运行结束，移除登记
    pub fn finish(&self, session: &str) {
        self.running.lock().remove(session);
    }

    /// 触发取消；会话不在运行时返回 false
    pub fn abort(&self, session: &str) -> bool {
        match self.running.lock().get(session) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, session: &str) -> bool {
        self.running.lock().contains_key(session)
    }

    /// 子令牌（并行层单个任务使用）
    pub fn child_token(&self, session: &str) -> Option<CancellationToken> {
        self.running.lock().get(session).map(|t| t.child_token())
    }
}
