//! 结构化输出提取
//!
//! 模型输出可能是纯 JSON、```json 代码块，或夹在说明文字中的对象；这里统一取出 JSON 再反序列化。

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::core::AgentError;
use crate::llm::ToolCallRequest;

/// 取出文本中的 JSON 片段；没有对象时返回 None
pub fn extract_json_str(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&trimmed[start..=end])
}

pub fn parse_json<T: DeserializeOwned>(output: &str) -> Result<T, AgentError> {
    let json = extract_json_str(output)
        .ok_or_else(|| AgentError::StructuredOutput(format!("no JSON object in: {}", preview(output))))?;
    serde_json::from_str(json)
        .map_err(|e| AgentError::StructuredOutput(format!("{e}: {}", preview(json))))
}

/// `{"tool": "...", "args": {...}}` 形式的工具调用
pub fn parse_tool_call(output: &str) -> Option<ToolCallRequest> {
    let json = extract_json_str(output)?;
    let value: Value = serde_json::from_str(json).ok()?;
    let name = value.get("tool")?.as_str()?.trim();
    if name.is_empty() {
        return None;
    }
    Some(ToolCallRequest {
        name: name.to_string(),
        arguments: value.get("args").cloned().unwrap_or(Value::Null),
    })
}

fn preview(s: &str) -> String {
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s.to_string()
    }
}
