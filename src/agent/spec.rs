//! Agent 声明：身份、工具与委派白名单、产出契约、依赖
//!
//! 构建期注册、运行期只读。

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// 系统指令
    #[serde(default)]
    pub instructions: String,
    /// 允许调用的工具名
    #[serde(default)]
    pub tools: Vec<String>,
    /// 允许委派的目标 agent id；在委派发生时检查
    #[serde(default)]
    pub can_delegate_to: Vec<String>,
    /// 最终产出必须满足的 JSON Schema
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliverable_schema: Option<Value>,
    #[serde(default)]
    pub knowledge_domains: Vec<String>,
    /// 仅并行拓扑使用
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// 单回合内工具循环上限
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
}

fn default_max_steps() -> u32 {
    8
}

impl AgentSpec {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            instructions: String::new(),
            tools: Vec::new(),
            can_delegate_to: Vec::new(),
            deliverable_schema: None,
            knowledge_domains: Vec::new(),
            depends_on: Vec::new(),
            temperature: None,
            max_steps: default_max_steps(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn delegates_to<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.can_delegate_to = targets.into_iter().map(Into::into).collect();
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn knowledge<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.knowledge_domains = domains.into_iter().map(Into::into).collect();
        self
    }

    pub fn deliverable_schema(mut self, schema: Value) -> Self {
        self.deliverable_schema = Some(schema);
        self
    }

    /// 由 Rust 类型生成产出 Schema
    pub fn with_deliverable<T: JsonSchema>(self) -> Self {
        let schema = serde_json::to_value(schema_for!(T)).unwrap_or(Value::Null);
        if schema.is_null() {
            return self;
        }
        self.deliverable_schema(schema)
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    pub fn can_delegate(&self, target: &str) -> bool {
        self.can_delegate_to.iter().any(|t| t == target)
    }

    pub fn can_use_tool(&self, tool: &str) -> bool {
        self.tools.iter().any(|t| t == tool)
    }
}
