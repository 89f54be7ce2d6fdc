//! 集成测试共用的配置与事件收集工具
#![allow(dead_code)]

use futures_util::StreamExt;
use hive::config::AppConfig;
use hive::{EventStream, EventType, OrchestratorError, StreamEvent};

/// 默认配置，但重试退避缩短到毫秒级，限流只保留并发上限
pub fn config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.resilience.retry.initial_delay_ms = 1;
    cfg.resilience.retry.max_delay_ms = 5;
    cfg.resilience.retry.jitter = false;
    cfg.llm.rate_limit.rpm = 0;
    cfg
}

/// 读完整个流；终止错误单独返回
pub async fn collect(mut stream: EventStream) -> (Vec<StreamEvent>, Option<OrchestratorError>) {
    let mut events = Vec::new();
    let mut error = None;
    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => events.push(event),
            Err(e) => error = Some(e),
        }
    }
    (events, error)
}

/// agent.start 事件里的 agent id，按出现顺序
pub fn agent_starts(events: &[StreamEvent]) -> Vec<String> {
    events
        .iter()
        .filter(|e| e.event == EventType::AgentStart)
        .filter_map(|e| e.agent_id().map(str::to_string))
        .collect()
}

pub fn count(events: &[StreamEvent], event_type: EventType) -> usize {
    events.iter().filter(|e| e.event == event_type).count()
}

pub fn last_event(events: &[StreamEvent]) -> EventType {
    events.last().map(|e| e.event).expect("stream produced no events")
}
