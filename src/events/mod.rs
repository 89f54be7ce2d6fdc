//! 事件层：统一事件信封、事件类型词表、发布订阅总线

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventBusError, EventEmitter, EventReceiver, SessionEventReceiver};
pub use types::{AgentRef, EventType, Span, StreamEvent, EVENT_SCHEMA_VERSION};
