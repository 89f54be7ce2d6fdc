//! 黑板请求：human（需要用户输入）与 delegate（需要另一个 Agent 完成子任务）

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Human,
    Delegate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Completed,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlackboardRequest {
    pub request_id: String,
    pub kind: RequestKind,
    pub status: RequestStatus,
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_to: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
}

impl BlackboardRequest {
    /// 向用户提问；满足后回到 created_by
    pub fn human(created_by: impl Into<String>, payload: Value) -> Self {
        let created_by = created_by.into();
        Self {
            request_id: new_request_id(),
            kind: RequestKind::Human,
            status: RequestStatus::Pending,
            resume_to: Some(created_by.clone()),
            created_by,
            target_agent: None,
            payload,
            response: None,
        }
    }

    /// 委派子任务；target 完成后回到 created_by
    pub fn delegate(
        created_by: impl Into<String>,
        target_agent: impl Into<String>,
        task: impl Into<String>,
    ) -> Self {
        let created_by = created_by.into();
        Self {
            request_id: new_request_id(),
            kind: RequestKind::Delegate,
            status: RequestStatus::Pending,
            resume_to: Some(created_by.clone()),
            created_by,
            target_agent: Some(target_agent.into()),
            payload: serde_json::json!({ "task": task.into() }),
            response: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == RequestStatus::Pending
    }

    pub fn complete(&mut self, response: Value) {
        self.response = Some(response);
        self.status = RequestStatus::Completed;
    }

    pub fn cancel(&mut self) {
        self.status = RequestStatus::Canceled;
    }
}

fn new_request_id() -> String {
    format!("req_{}", &uuid::Uuid::new_v4().simple().to_string()[..12])
}

/// 第一个待处理的 human 请求
pub fn first_pending_human(requests: &[BlackboardRequest]) -> Option<&BlackboardRequest> {
    requests
        .iter()
        .find(|r| r.kind == RequestKind::Human && r.is_pending())
}

/// 取消全部待处理的委派：返回（保留的队列，被取消的请求）
///
/// 委派只在一次运行内有意义；运行失败或中止后不能留给下一轮。
pub fn cancel_pending_delegates(
    requests: &[BlackboardRequest],
) -> (Vec<BlackboardRequest>, Vec<BlackboardRequest>) {
    let mut kept = Vec::with_capacity(requests.len());
    let mut canceled = Vec::new();
    for req in requests {
        if req.kind == RequestKind::Delegate && req.is_pending() {
            let mut req = req.clone();
            req.cancel();
            canceled.push(req);
        } else {
            kept.push(req.clone());
        }
    }
    (kept, canceled)
}
