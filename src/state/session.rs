//! 会话键：namespace + session_id，会话之间完全隔离

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub namespace: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(namespace: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            session_id: session_id.into(),
        }
    }

    /// 检查点存储中会话头的线程 id
    pub fn thread_id(&self) -> String {
        format!("{}:{}", self.namespace, self.session_id)
    }

    /// 历史检查点的线程 id
    pub fn checkpoint_thread(&self, checkpoint_id: &str) -> String {
        format!("{}:{}@{}", self.namespace, self.session_id, checkpoint_id)
    }

    pub fn with_session(&self, session_id: impl Into<String>) -> Self {
        Self::new(self.namespace.clone(), session_id)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.session_id)
    }
}
