//! 运行时：图驱动器、会话级编排器与构建器

pub mod builder;
pub mod driver;
pub mod orchestrator;

pub use builder::{llm_from_config, OrchestratorBuilder};
pub use driver::{GraphDriver, RunEnd};
pub use orchestrator::{CheckpointInfo, EventStream, Orchestrator, SessionStats};
