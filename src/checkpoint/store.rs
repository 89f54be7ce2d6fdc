//! 检查点存储契约与两个实现
//!
//! 按不透明的 thread id 存取黑板快照：会话头 `ns:sid`，历史检查点 `ns:sid@cp`。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::CheckpointType;
use crate::state::Blackboard;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// 一次检查点：黑板快照 + 元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub checkpoint_type: CheckpointType,
    pub created_at_ms: i64,
    pub state: Blackboard,
}

impl Checkpoint {
    pub fn new(checkpoint_id: impl Into<String>, checkpoint_type: CheckpointType, state: Blackboard) -> Self {
        Self {
            checkpoint_id: checkpoint_id.into(),
            checkpoint_type,
            created_at_ms: chrono::Utc::now().timestamp_millis(),
            state,
        }
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, thread_id: &str, checkpoint: &Checkpoint) -> Result<(), StoreError>;

    /// 最新快照；不存在时返回 None
    async fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>, StoreError>;

    /// 返回是否确实删除了数据
    async fn delete(&self, thread_id: &str) -> Result<bool, StoreError>;

    /// 以 prefix 开头的全部 thread id（有序）
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    threads: RwLock<BTreeMap<String, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, thread_id: &str, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        self.threads
            .write()
            .insert(thread_id.to_string(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self.threads.read().get(thread_id).cloned())
    }

    async fn delete(&self, thread_id: &str) -> Result<bool, StoreError> {
        Ok(self.threads.write().remove(thread_id).is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .threads
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// 每个 thread 一个 JSON 文件；先写临时文件再 rename，进程重启后可恢复
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, thread_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode(thread_id)))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, thread_id: &str, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(thread_id);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(checkpoint)?;
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!(thread = %thread_id, path = %path.display(), "checkpoint written");
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        match tokio::fs::read(self.path_for(thread_id)).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, thread_id: &str) -> Result<bool, StoreError> {
        match tokio::fs::remove_file(self.path_for(thread_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            if let Some(thread_id) = decode(stem) {
                if thread_id.starts_with(prefix) {
                    out.push(thread_id);
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

/// 文件名安全编码：字母数字与 `-_.` 原样保留，其余字节写成 %XX
fn encode(thread_id: &str) -> String {
    let mut out = String::with_capacity(thread_id.len());
    for b in thread_id.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

fn decode(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
