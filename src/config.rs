//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如
//! `HIVE__RESILIENCE__RETRY__MAX_RETRIES=5`）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::graph::{NodeSettings, ProcessMode};
use crate::memory::{CompactPolicy, CompactScope};
use crate::resilience::{CircuitBreakerConfig, RateLimitConfig, RetryPolicy};
use crate::state::OverlapPolicy;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub resilience: ResilienceSection,
    pub context: ContextSection,
    pub runtime: RuntimeSection,
    pub events: EventsSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 会话命名空间（事件与检查点键的前缀）
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// 设置后使用文件检查点存储，否则内存存储
    pub checkpoint_dir: Option<PathBuf>,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            namespace: default_namespace(),
            checkpoint_dir: None,
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// openai（任意 OpenAI 兼容端点）/ mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 存放 API Key 的环境变量名
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
    #[serde(default)]
    pub rate_limit: RateLimitSection,
}

fn default_provider() -> String {
    "mock".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            api_key_env: default_api_key_env(),
            timeouts: LlmTimeoutsSection::default(),
            rate_limit: RateLimitSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    /// 单次请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

/// [llm.rate_limit]：默认限额，可按 provider 覆盖
///
/// ```toml
/// [llm.rate_limit.providers.openai]
/// rpm = 500
/// max_concurrent = 20
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_rpm")]
    pub rpm: u32,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default)]
    pub providers: HashMap<String, ProviderRateLimit>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderRateLimit {
    pub rpm: Option<u32>,
    pub max_concurrent: Option<usize>,
}

fn default_rpm() -> u32 {
    60
}

fn default_max_concurrent() -> usize {
    10
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            enabled: true,
            rpm: default_rpm(),
            max_concurrent: default_max_concurrent(),
            providers: HashMap::new(),
        }
    }
}

impl RateLimitSection {
    /// provider 名不区分大小写；关闭时返回 None
    pub fn for_provider(&self, provider: &str) -> Option<RateLimitConfig> {
        if !self.enabled {
            return None;
        }
        let overrides = self.providers.get(&provider.to_lowercase());
        Some(RateLimitConfig {
            rpm: overrides.and_then(|o| o.rpm).unwrap_or(self.rpm),
            max_concurrent: overrides.and_then(|o| o.max_concurrent).unwrap_or(self.max_concurrent),
        })
    }
}

/// [resilience] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ResilienceSection {
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSection,
}

/// [resilience.retry]
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_exponential_base() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            exponential_base: default_exponential_base(),
            jitter: true,
        }
    }
}

impl RetrySection {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            exponential_base: self.exponential_base,
            jitter: self.jitter,
        }
    }
}

/// [resilience.circuit_breaker]
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerSection {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> u64 {
    60
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
        }
    }
}

impl CircuitBreakerSection {
    pub fn to_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_secs(self.recovery_timeout_secs),
        }
    }
}

/// [context] 段：上下文窗口与压缩
#[derive(Debug, Clone, Deserialize)]
pub struct ContextSection {
    /// 每轮带入的历史消息条数上限
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// 系统提示各段的总 token 预算
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    /// 压缩时原样保留的最近消息数
    #[serde(default = "default_compact_keep_recent")]
    pub compact_keep_recent: usize,
    #[serde(default = "default_compact_max_summary_tokens")]
    pub compact_max_summary_tokens: usize,
    /// full / window
    #[serde(default = "default_compact_scope")]
    pub compact_scope: String,
    /// compact_scope = window 时参与压缩的尾部消息数
    #[serde(default = "default_compact_window")]
    pub compact_window: usize,
}

fn default_history_window() -> usize {
    20
}

fn default_token_budget() -> usize {
    8000
}

fn default_compact_keep_recent() -> usize {
    4
}

fn default_compact_max_summary_tokens() -> usize {
    500
}

fn default_compact_scope() -> String {
    "full".to_string()
}

fn default_compact_window() -> usize {
    40
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            history_window: default_history_window(),
            token_budget: default_token_budget(),
            compact_keep_recent: default_compact_keep_recent(),
            compact_max_summary_tokens: default_compact_max_summary_tokens(),
            compact_scope: default_compact_scope(),
            compact_window: default_compact_window(),
        }
    }
}

impl ContextSection {
    pub fn scope(&self) -> CompactScope {
        match self.compact_scope.as_str() {
            "window" => CompactScope::TrailingWindow(self.compact_window),
            _ => CompactScope::Full,
        }
    }

    pub fn compact_policy(&self) -> CompactPolicy {
        CompactPolicy {
            scope: self.scope(),
            keep_recent: self.compact_keep_recent,
            max_summary_tokens: self.compact_max_summary_tokens,
        }
    }
}

/// [runtime] 段：循环保护、并发、工具超时
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeSection {
    /// sequential / dynamic / hierarchical / parallel / map_reduce / react
    #[serde(default = "default_process_mode")]
    pub process_mode: String,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_max_parallel_agents")]
    pub max_parallel_agents: usize,
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// reject / last_writer_wins
    #[serde(default = "default_overlap_policy")]
    pub overlap_policy: String,
    /// 计划模式下系统失败的快速重试次数
    #[serde(default = "default_max_error_retries")]
    pub max_error_retries: u32,
    #[serde(default = "default_max_replan_depth")]
    pub max_replan_depth: u32,
}

fn default_process_mode() -> String {
    "sequential".to_string()
}

fn default_max_iterations() -> u32 {
    20
}

fn default_max_parallel_agents() -> usize {
    4
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_overlap_policy() -> String {
    "reject".to_string()
}

fn default_max_error_retries() -> u32 {
    3
}

fn default_max_replan_depth() -> u32 {
    5
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            process_mode: default_process_mode(),
            max_iterations: default_max_iterations(),
            max_parallel_agents: default_max_parallel_agents(),
            tool_timeout_secs: default_tool_timeout_secs(),
            overlap_policy: default_overlap_policy(),
            max_error_retries: default_max_error_retries(),
            max_replan_depth: default_max_replan_depth(),
        }
    }
}

impl RuntimeSection {
    pub fn overlap_policy(&self) -> OverlapPolicy {
        match self.overlap_policy.as_str() {
            "last_writer_wins" => OverlapPolicy::LastWriterWins,
            _ => OverlapPolicy::Reject,
        }
    }

    pub fn process_mode(&self) -> Result<ProcessMode, config::ConfigError> {
        self.process_mode.parse().map_err(config::ConfigError::Message)
    }

    pub fn node_settings(&self) -> NodeSettings {
        NodeSettings {
            overlap_policy: self.overlap_policy(),
            max_error_retries: self.max_error_retries,
            max_replan_depth: self.max_replan_depth,
        }
    }
}

/// [events] 段
#[derive(Debug, Clone, Deserialize)]
pub struct EventsSection {
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
}

fn default_bus_capacity() -> usize {
    1024
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            bus_capacity: default_bus_capacity(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.app.namespace, "default");
        assert_eq!(cfg.resilience.retry.max_retries, 3);
        assert_eq!(cfg.resilience.retry.initial_delay_ms, 500);
        assert_eq!(cfg.resilience.circuit_breaker.failure_threshold, 5);
        assert_eq!(cfg.runtime.max_iterations, 20);
        assert_eq!(cfg.runtime.overlap_policy(), OverlapPolicy::Reject);
        assert_eq!(cfg.context.scope(), CompactScope::Full);
        assert_eq!(cfg.runtime.process_mode().unwrap(), ProcessMode::Sequential);
        assert_eq!(
            cfg.llm.rate_limit.for_provider("mock"),
            Some(RateLimitConfig { rpm: 60, max_concurrent: 10 })
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hive.toml");
        std::fs::write(
            &path,
            r#"
[app]
namespace = "etl"

[resilience.retry]
max_retries = 7
jitter = false

[context]
compact_scope = "window"
compact_window = 12

[runtime]
overlap_policy = "last_writer_wins"
process_mode = "map_reduce"
max_error_retries = 1

[llm.rate_limit]
rpm = 30

[llm.rate_limit.providers.openai]
max_concurrent = 2
"#,
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.app.namespace, "etl");
        assert_eq!(cfg.resilience.retry.max_retries, 7);
        assert!(!cfg.resilience.retry.to_policy().jitter);
        // 未写出的键保留默认值
        assert_eq!(cfg.resilience.retry.initial_delay_ms, 500);
        assert_eq!(cfg.context.scope(), CompactScope::TrailingWindow(12));
        assert_eq!(cfg.runtime.overlap_policy(), OverlapPolicy::LastWriterWins);
        assert_eq!(cfg.runtime.process_mode().unwrap(), ProcessMode::MapReduce);
        assert_eq!(cfg.runtime.node_settings().max_error_retries, 1);
        let openai = cfg.llm.rate_limit.for_provider("OpenAI").unwrap();
        assert_eq!(openai, RateLimitConfig { rpm: 30, max_concurrent: 2 });
        assert_eq!(cfg.llm.rate_limit.for_provider("mock").unwrap().max_concurrent, 10);
    }

    #[test]
    fn test_rate_limit_can_be_disabled() {
        let section = RateLimitSection {
            enabled: false,
            ..RateLimitSection::default()
        };
        assert!(section.for_provider("openai").is_none());
    }

    #[test]
    fn test_unknown_process_mode_rejected() {
        let runtime = RuntimeSection {
            process_mode: "swarm".into(),
            ..RuntimeSection::default()
        };
        assert!(runtime.process_mode().is_err());
    }
}
