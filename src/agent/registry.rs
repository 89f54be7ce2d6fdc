//! Agent 注册表：id -> (不可变声明, 执行体)，保持注册顺序

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::agent::{Agent, AgentSpec};
use crate::core::OrchestratorError;

#[derive(Clone)]
pub struct AgentEntry {
    pub spec: Arc<AgentSpec>,
    pub agent: Arc<dyn Agent>,
}

#[derive(Clone, Default)]
pub struct AgentRegistry {
    entries: Vec<AgentEntry>,
    index: HashMap<String, usize>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        spec: AgentSpec,
        agent: impl Agent + 'static,
    ) -> Result<(), OrchestratorError> {
        self.register_arc(spec, Arc::new(agent))
    }

    pub fn register_arc(
        &mut self,
        spec: AgentSpec,
        agent: Arc<dyn Agent>,
    ) -> Result<(), OrchestratorError> {
        if self.index.contains_key(&spec.id) {
            return Err(OrchestratorError::DuplicateAgent(spec.id));
        }
        self.index.insert(spec.id.clone(), self.entries.len());
        self.entries.push(AgentEntry {
            spec: Arc::new(spec),
            agent,
        });
        Ok(())
    }

    /// 委派目标与依赖都必须是已注册的 agent
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.entries.is_empty() {
            return Err(OrchestratorError::Config("no agents registered".into()));
        }
        for entry in &self.entries {
            for id in entry.spec.can_delegate_to.iter().chain(&entry.spec.depends_on) {
                if !self.index.contains_key(id) {
                    return Err(OrchestratorError::UnknownAgent(format!(
                        "{id} (referenced by {})",
                        entry.spec.id
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&AgentEntry> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    pub fn spec(&self, id: &str) -> Option<&Arc<AgentSpec>> {
        self.get(id).map(|e| &e.spec)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn entries(&self) -> &[AgentEntry] {
        &self.entries
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.spec.id.clone()).collect()
    }

    pub fn first(&self) -> Option<&AgentEntry> {
        self.entries.first()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 声明集合的指纹，编译图缓存以此为键
    pub fn fingerprint(&self) -> String {
        let mut hasher = DefaultHasher::new();
        for entry in &self.entries {
            serde_json::to_string(entry.spec.as_ref())
                .unwrap_or_default()
                .hash(&mut hasher);
        }
        format!("{:016x}", hasher.finish())
    }
}
