//! Agent 回复协议的 JSON Schema（schemars 生成），拼入系统提示以减少格式错误

use std::collections::HashMap;

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 工具调用：`{"tool": "...", "args": {...}}`
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 工具名，必须在本 agent 的工具列表中
    tool: String,
    args: HashMap<String, Value>,
}

#[allow(dead_code)]
#[derive(JsonSchema)]
struct DelegateTarget {
    /// 目标 agent id，必须在 can_delegate_to 中
    target: String,
    task: String,
}

/// 委派：`{"delegate": {"target": "...", "task": "..."}}`
#[allow(dead_code)]
#[derive(JsonSchema)]
struct DelegateFormat {
    delegate: DelegateTarget,
}

/// 请求人工澄清：`{"clarify": {"question": "..."}}`
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ClarifyFormat {
    clarify: HashMap<String, Value>,
}

/// 最终产出：`{"deliverable": {...}}`
#[allow(dead_code)]
#[derive(JsonSchema)]
struct DeliverableFormat {
    deliverable: Value,
}

fn pretty<T: JsonSchema>() -> String {
    serde_json::to_string_pretty(&schema_for!(T)).unwrap_or_default()
}

pub fn tool_call_schema_json() -> String {
    pretty::<ToolCallFormat>()
}

/// 四种回复形式的 Schema 说明
pub fn reply_protocol_prompt(can_use_tools: bool, can_delegate: bool) -> String {
    let mut out = String::from("## Reply format\nReply with exactly one JSON object.\n");
    if can_use_tools {
        out.push_str("\nCall a tool:\n");
        out.push_str(&tool_call_schema_json());
        out.push('\n');
    }
    if can_delegate {
        out.push_str("\nDelegate to another agent:\n");
        out.push_str(&pretty::<DelegateFormat>());
        out.push('\n');
    }
    out.push_str("\nAsk the user for clarification:\n");
    out.push_str(&pretty::<ClarifyFormat>());
    out.push_str("\n\nFinish with your deliverable:\n");
    out.push_str(&pretty::<DeliverableFormat>());
    out.push('\n');
    out
}
