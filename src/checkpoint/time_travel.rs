//! 时间旅行：回到某个检查点（覆盖会话头）或从检查点分叉出新会话

use serde::{Deserialize, Serialize};

use crate::checkpoint::{Checkpoint, CheckpointStore, StoreError};
use crate::core::OrchestratorError;
use crate::state::SessionKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TravelMode {
    /// 会话头回到检查点，之后的时间线条目被丢弃
    Rewind,
    /// 以检查点为起点创建新会话，原会话不变
    Branch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeTravelResult {
    pub success: bool,
    pub session_id: String,
    pub checkpoint_id: String,
    pub removed_entries: usize,
    pub message: String,
}

/// 某会话全部历史检查点的 thread id 前缀
pub fn history_prefix(key: &SessionKey) -> String {
    format!("{}@", key.thread_id())
}

/// 会话的历史检查点 id（按时间线顺序）
pub async fn checkpoint_ids(
    store: &dyn CheckpointStore,
    key: &SessionKey,
) -> Result<Vec<String>, OrchestratorError> {
    let head = store
        .load(&key.thread_id())
        .await?
        .ok_or_else(|| OrchestratorError::SessionNotFound(key.to_string()))?;
    Ok(head.state.timeline.checkpoint_ids().to_vec())
}

pub async fn travel(
    store: &dyn CheckpointStore,
    key: &SessionKey,
    checkpoint_id: &str,
    mode: TravelMode,
) -> Result<(TimeTravelResult, Checkpoint), OrchestratorError> {
    let not_found = || OrchestratorError::CheckpointNotFound {
        session: key.to_string(),
        checkpoint_id: checkpoint_id.to_string(),
    };
    let head = store
        .load(&key.thread_id())
        .await?
        .ok_or_else(|| OrchestratorError::SessionNotFound(key.to_string()))?;
    let snapshot = store
        .load(&key.checkpoint_thread(checkpoint_id))
        .await?
        .ok_or_else(not_found)?;

    let mut timeline = head.state.timeline.clone();
    let removed = timeline.truncate_to_checkpoint(checkpoint_id).ok_or_else(not_found)?;

    let mut restored = snapshot.clone();
    restored.state.timeline = timeline;

    match mode {
        TravelMode::Rewind => {
            store.save(&key.thread_id(), &restored).await?;
            let kept = restored.state.timeline.checkpoint_ids().to_vec();
            for thread in store.list(&history_prefix(key)).await? {
                let cp = thread.rsplit('@').next().unwrap_or_default();
                if !kept.iter().any(|k| k == cp) {
                    store.delete(&thread).await?;
                }
            }
            tracing::info!(session = %key, checkpoint = %checkpoint_id, removed, "session rewound");
            let result = TimeTravelResult {
                success: true,
                session_id: key.session_id.clone(),
                checkpoint_id: checkpoint_id.to_string(),
                removed_entries: removed,
                message: format!("Rewound to checkpoint {checkpoint_id}, removed {removed} timeline entries"),
            };
            Ok((result, restored))
        }
        TravelMode::Branch => {
            let short = uuid::Uuid::new_v4().simple().to_string();
            let branch_key = key.with_session(format!("{}-branch-{}", key.session_id, &short[..8]));
            restored.state.key = branch_key.clone();
            copy_history(store, key, &branch_key, restored.state.timeline.checkpoint_ids()).await?;
            store.save(&branch_key.thread_id(), &restored).await?;
            tracing::info!(
                session = %key,
                branch = %branch_key,
                checkpoint = %checkpoint_id,
                "session branched"
            );
            let result = TimeTravelResult {
                success: true,
                session_id: branch_key.session_id.clone(),
                checkpoint_id: checkpoint_id.to_string(),
                removed_entries: removed,
                message: format!(
                    "Branched session {} from checkpoint {checkpoint_id}",
                    branch_key.session_id
                ),
            };
            Ok((result, restored))
        }
    }
}

async fn copy_history(
    store: &dyn CheckpointStore,
    from: &SessionKey,
    to: &SessionKey,
    checkpoint_ids: &[String],
) -> Result<(), StoreError> {
    for cp in checkpoint_ids {
        if let Some(mut snapshot) = store.load(&from.checkpoint_thread(cp)).await? {
            snapshot.state.key = to.clone();
            store.save(&to.checkpoint_thread(cp), &snapshot).await?;
        }
    }
    Ok(())
}
