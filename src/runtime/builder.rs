//! 编排器构建器：统一的运行时初始化逻辑
//!
//! 由 AppConfig 组装弹性 LLM 客户端、工具执行器、压缩器与检查点存储；
//! build 时立即编译默认拓扑的执行图，依赖环与未知 agent 在这里暴露。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::agent::{Agent, AgentRegistry, AgentServices, AgentSpec};
use crate::checkpoint::{CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};
use crate::config::{AppConfig, LlmSection};
use crate::core::{OrchestratorError, SessionSupervisor, TaskScheduler};
use crate::events::EventBus;
use crate::graph::ProcessMode;
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient, ResilientLlmClient};
use crate::memory::{Compactor, ContextAssembler, TokenBudget};
use crate::resilience::{CircuitBreakerRegistry, RateLimiter};
use crate::runtime::orchestrator::{Orchestrator, OrchestratorInner};
use crate::tools::{Tool, ToolExecutor, ToolRegistry};

/// 按 [llm] 段选择后端：provider = openai 且环境变量中有 Key 时用 OpenAI 兼容端点，否则 Mock
pub fn llm_from_config(cfg: &LlmSection) -> Arc<dyn LlmClient> {
    let api_key = std::env::var(&cfg.api_key_env).ok();
    match (cfg.provider.to_lowercase().as_str(), api_key) {
        ("openai", Some(key)) => {
            tracing::info!(model = %cfg.model, "Using OpenAI-compatible LLM");
            Arc::new(OpenAiClient::new(cfg.base_url.as_deref(), &cfg.model, Some(key)))
        }
        ("mock", _) => Arc::new(MockLlmClient),
        (provider, _) => {
            tracing::warn!(provider, env = %cfg.api_key_env, "No API key set or provider unknown, using Mock LLM");
            Arc::new(MockLlmClient)
        }
    }
}

pub struct OrchestratorBuilder {
    config: AppConfig,
    registry: AgentRegistry,
    pending: Vec<(AgentSpec, Arc<dyn Agent>)>,
    tools: ToolRegistry,
    llm: Option<Arc<dyn LlmClient>>,
    store: Option<Arc<dyn CheckpointStore>>,
    bus: Option<EventBus>,
    mode: Option<ProcessMode>,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new(AppConfig::default())
    }
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            registry: AgentRegistry::new(),
            pending: Vec::new(),
            tools: ToolRegistry::new(),
            llm: None,
            store: None,
            bus: None,
            mode: None,
        }
    }

    pub fn config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    /// 注册一个 agent；重复 id 在 build 时报错
    pub fn agent(mut self, spec: AgentSpec, agent: impl Agent + 'static) -> Self {
        self.pending.push((spec, Arc::new(agent)));
        self
    }

    pub fn registry(mut self, registry: AgentRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.register(tool);
        self
    }

    /// 覆盖配置中的 LLM 后端（仍会套上重试与熔断）
    pub fn llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn mode(mut self, mode: ProcessMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn build(self) -> Result<Orchestrator, OrchestratorError> {
        let Self {
            config,
            mut registry,
            pending,
            tools,
            llm,
            store,
            bus,
            mode,
        } = self;

        for (spec, agent) in pending {
            registry.register_arc(spec, agent)?;
        }
        let mode = match mode {
            Some(mode) => mode,
            None => config
                .runtime
                .process_mode()
                .map_err(|e| OrchestratorError::Config(e.to_string()))?,
        };

        let breakers = Arc::new(CircuitBreakerRegistry::new(
            config.resilience.circuit_breaker.to_config(),
        ));
        let raw_llm = llm.unwrap_or_else(|| llm_from_config(&config.llm));
        let mut resilient = ResilientLlmClient::new(
            raw_llm,
            config.resilience.retry.to_policy(),
            breakers.get("llm"),
            Duration::from_secs(config.llm.timeouts.request),
        );
        if let Some(limits) = config.llm.rate_limit.for_provider(&config.llm.provider) {
            tracing::debug!(
                provider = %config.llm.provider,
                rpm = limits.rpm,
                max_concurrent = limits.max_concurrent,
                "LLM rate limit"
            );
            let limiter = RateLimiter::new(config.llm.provider.to_lowercase(), limits);
            resilient = resilient.with_rate_limit(Arc::new(limiter));
        }
        let llm: Arc<dyn LlmClient> = Arc::new(resilient);
        let services = Arc::new(AgentServices {
            llm: llm.clone(),
            tools: Arc::new(ToolExecutor::new(
                tools,
                config.runtime.tool_timeout_secs,
                config.resilience.retry.to_policy(),
                breakers,
            )),
            compactor: Arc::new(Compactor::new(config.context.compact_policy()).with_llm(llm)),
            assembler: ContextAssembler::new(
                TokenBudget::new(config.context.token_budget),
                config.context.history_window,
            ),
        });

        let store = store.unwrap_or_else(|| match &config.app.checkpoint_dir {
            Some(dir) => {
                tracing::info!(dir = %dir.display(), "Using file checkpoint store");
                Arc::new(FileCheckpointStore::new(dir)) as Arc<dyn CheckpointStore>
            }
            None => Arc::new(InMemoryCheckpointStore::new()),
        });

        let orchestrator = Orchestrator::from_inner(OrchestratorInner {
            namespace: config.app.namespace.clone(),
            mode,
            max_iterations: config.runtime.max_iterations,
            registry: Arc::new(registry),
            services,
            store,
            bus: bus.unwrap_or_else(|| EventBus::new(config.events.bus_capacity)),
            supervisor: SessionSupervisor::new(),
            scheduler: Arc::new(TaskScheduler::new(config.runtime.max_parallel_agents)),
            settings: config.runtime.node_settings(),
            graphs: Mutex::new(HashMap::new()),
        });
        orchestrator.graph(mode)?;
        tracing::info!(%mode, agents = orchestrator.registry().len(), "orchestrator ready");
        Ok(orchestrator)
    }
}
