//! 检查点：存储契约、内存 / 文件实现、时间旅行

pub mod store;
pub mod time_travel;

pub use store::{Checkpoint, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore, StoreError};
pub use time_travel::{checkpoint_ids, history_prefix, travel, TimeTravelResult, TravelMode};
