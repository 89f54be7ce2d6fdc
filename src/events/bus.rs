//! 事件总线：tokio broadcast 实现的发布订阅
//!
//! 编排器把每个事件发布到总线（供观测、SSE 等订阅者），同时通过 EventEmitter 推给当前 stream 的调用方。

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::core::OrchestratorError;
use crate::events::StreamEvent;
use crate::state::SessionKey;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    #[error("Event bus closed")]
    Closed,
    #[error("Receiver lagged by {0} events")]
    Lagged(u64),
    #[error("No event available")]
    Empty,
}

#[derive(Clone, Debug)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<StreamEvent>>,
}

impl EventBus {
    /// capacity 为每个订阅者可缓冲的事件数，慢订阅者会丢弃最旧的事件
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn publish(&self, event: StreamEvent) {
        let receivers = self.sender.send(event).unwrap_or(0);
        if receivers == 0 {
            debug!("No subscribers listening to event");
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// 只接收某个会话的事件
    pub fn subscribe_session(&self, key: &SessionKey) -> SessionEventReceiver {
        SessionEventReceiver {
            receiver: self.sender.subscribe(),
            key: key.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

fn map_recv(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<StreamEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<StreamEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv)
    }

    pub fn try_recv(&mut self) -> Result<StreamEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => EventBusError::Lagged(n),
        })
    }
}

pub struct SessionEventReceiver {
    receiver: broadcast::Receiver<StreamEvent>,
    key: SessionKey,
}

impl SessionEventReceiver {
    pub async fn recv(&mut self) -> Result<StreamEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv)?;
            if event.namespace == self.key.namespace && event.session_id == self.key.session_id {
                return Ok(event);
            }
        }
    }
}

/// 单次运行的事件出口：发布到总线并推送给 stream 调用方
#[derive(Clone)]
pub struct EventEmitter {
    key: SessionKey,
    bus: EventBus,
    sink: Option<mpsc::UnboundedSender<Result<StreamEvent, OrchestratorError>>>,
    run_id: String,
}

impl EventEmitter {
    pub fn new(
        key: SessionKey,
        bus: EventBus,
        sink: Option<mpsc::UnboundedSender<Result<StreamEvent, OrchestratorError>>>,
    ) -> Self {
        Self {
            key,
            bus,
            sink,
            run_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// 只发布到总线（测试 / 后台任务）
    pub fn detached(key: SessionKey, bus: EventBus) -> Self {
        Self::new(key, bus, None)
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// 会话运行的 run_id，作为节点 span 的 parent
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn event(&self, event: crate::events::EventType) -> StreamEvent {
        StreamEvent::new(event, &self.key)
    }

    pub fn emit(&self, event: StreamEvent) {
        if let Some(sink) = &self.sink {
            // 调用方已丢弃 stream 时忽略
            let _ = sink.send(Ok(event.clone()));
        }
        self.bus.publish(event);
    }

    /// 推送终止错误（只给 stream 调用方）
    pub fn fail(&self, err: OrchestratorError) {
        if let Some(sink) = &self.sink {
            let _ = sink.send(Err(err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let key = SessionKey::new("ns", "s1");
        bus.publish(StreamEvent::new(EventType::SessionStart, &key));
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.event, EventType::SessionStart);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_session_filter() {
        let bus = EventBus::new(16);
        let mine = SessionKey::new("ns", "mine");
        let other = SessionKey::new("ns", "other");
        let mut rx = bus.subscribe_session(&mine);
        bus.publish(StreamEvent::new(EventType::SessionStart, &other));
        bus.publish(StreamEvent::new(EventType::SessionEnd, &mine));
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.session_id, "mine");
        assert_eq!(ev.event, EventType::SessionEnd);
    }

    #[tokio::test]
    async fn test_emitter_fans_out() {
        let bus = EventBus::new(16);
        let mut bus_rx = bus.subscribe();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let emitter = EventEmitter::new(SessionKey::new("ns", "s"), bus, Some(tx));
        emitter.emit(emitter.event(EventType::AgentStart));
        assert_eq!(rx.recv().await.unwrap().unwrap().event, EventType::AgentStart);
        assert_eq!(bus_rx.recv().await.unwrap().event, EventType::AgentStart);
    }

    #[test]
    fn test_lagged_receiver() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        let key = SessionKey::new("ns", "s");
        for _ in 0..5 {
            bus.publish(StreamEvent::new(EventType::LlmChunk, &key));
        }
        assert!(matches!(rx.try_recv(), Err(EventBusError::Lagged(_))));
    }
}
