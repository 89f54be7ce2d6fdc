//! Echo 工具：回显文本（演示与测试）

use async_trait::async_trait;
use serde_json::Value;

use crate::core::{ClassifiedError, ErrorCategory};
use crate::tools::Tool;

pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back. Args: {\"text\": \"message\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, ClassifiedError> {
        args.get("text")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| ClassifiedError::new(ErrorCategory::InvalidInput, "missing 'text'"))
    }
}
