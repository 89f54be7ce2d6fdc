//! 执行图：节点 + 出边（静态 / 条件路由），回边只是普通的边

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::agent::{AgentRegistry, AgentSpec};
use crate::graph::{Node, Route};
use crate::state::Blackboard;

/// 结束标记
pub const END: &str = "__end__";

/// 协作拓扑
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessMode {
    Sequential,
    Dynamic,
    Hierarchical,
    Parallel,
    MapReduce,
    React,
}

impl ProcessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessMode::Sequential => "sequential",
            ProcessMode::Dynamic => "dynamic",
            ProcessMode::Hierarchical => "hierarchical",
            ProcessMode::Parallel => "parallel",
            ProcessMode::MapReduce => "map_reduce",
            ProcessMode::React => "react",
        }
    }
}

impl fmt::Display for ProcessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProcessMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(ProcessMode::Sequential),
            "dynamic" => Ok(ProcessMode::Dynamic),
            "hierarchical" => Ok(ProcessMode::Hierarchical),
            "parallel" => Ok(ProcessMode::Parallel),
            "map_reduce" | "mapreduce" => Ok(ProcessMode::MapReduce),
            "react" => Ok(ProcessMode::React),
            other => Err(format!("unknown process mode: {other}")),
        }
    }
}

/// 拓扑允许的委派范围，覆盖 agent 自己声明的白名单
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelegationScope {
    /// 按各自的 can_delegate_to
    AllowList,
    /// 只有管理者可以委派；其白名单为空时可委派给任一下属
    ManagerOnly(String),
    /// 路由完全由拓扑决定
    Disabled,
}

impl DelegationScope {
    pub fn for_mode(mode: ProcessMode, entry: &str) -> Self {
        match mode {
            ProcessMode::Dynamic => DelegationScope::AllowList,
            ProcessMode::Hierarchical => DelegationScope::ManagerOnly(entry.to_string()),
            ProcessMode::Sequential | ProcessMode::Parallel | ProcessMode::MapReduce | ProcessMode::React => {
                DelegationScope::Disabled
            }
        }
    }

    /// 本拓扑下 agent 实际可用的委派目标
    pub fn targets(&self, spec: &AgentSpec, registry: &AgentRegistry) -> Vec<String> {
        match self {
            DelegationScope::AllowList => spec.can_delegate_to.clone(),
            DelegationScope::ManagerOnly(manager) if *manager == spec.id => {
                if spec.can_delegate_to.is_empty() {
                    registry.ids().into_iter().filter(|id| *id != spec.id).collect()
                } else {
                    spec.can_delegate_to.clone()
                }
            }
            DelegationScope::ManagerOnly(_) | DelegationScope::Disabled => Vec::new(),
        }
    }

    /// 返回白名单按本拓扑改写后的声明；无变化时原样返回
    pub fn scope_spec(&self, spec: Arc<AgentSpec>, registry: &AgentRegistry) -> Arc<AgentSpec> {
        let targets = self.targets(&spec, registry);
        if targets == spec.can_delegate_to {
            return spec;
        }
        let mut scoped = (*spec).clone();
        scoped.can_delegate_to = targets;
        Arc::new(scoped)
    }
}

/// 条件路由：读黑板，返回下一个节点名或 END
pub type Router = Arc<dyn Fn(&Blackboard) -> String + Send + Sync>;

#[derive(Clone)]
pub enum Edge {
    Static(String),
    Conditional(Router),
}

pub struct ExecutionGraph {
    mode: ProcessMode,
    entry: String,
    nodes: HashMap<String, Arc<dyn Node>>,
    order: Vec<String>,
    edges: HashMap<String, Edge>,
    /// 并行拓扑的分层（agent id）
    layers: Vec<Vec<String>>,
    delegation: DelegationScope,
}

impl ExecutionGraph {
    pub fn new(mode: ProcessMode, entry: impl Into<String>) -> Self {
        let entry = entry.into();
        Self {
            mode,
            delegation: DelegationScope::for_mode(mode, &entry),
            entry,
            nodes: HashMap::new(),
            order: Vec::new(),
            edges: HashMap::new(),
            layers: Vec::new(),
        }
    }

    pub fn add_node(&mut self, node: impl Node + 'static) {
        let name = node.name().to_string();
        if !self.nodes.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.nodes.insert(name, Arc::new(node));
    }

    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) {
        self.edges.insert(from.into(), Edge::Static(to.into()));
    }

    pub fn add_conditional_edge<F>(&mut self, from: impl Into<String>, router: F)
    where
        F: Fn(&Blackboard) -> String + Send + Sync + 'static,
    {
        self.edges.insert(from.into(), Edge::Conditional(Arc::new(router)));
    }

    pub fn set_layers(&mut self, layers: Vec<Vec<String>>) {
        self.layers = layers;
    }

    pub fn mode(&self) -> ProcessMode {
        self.mode
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn node(&self, name: &str) -> Option<Arc<dyn Node>> {
        self.nodes.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn node_names(&self) -> &[String] {
        &self.order
    }

    pub fn layers(&self) -> &[Vec<String>] {
        &self.layers
    }

    pub fn delegation(&self) -> &DelegationScope {
        &self.delegation
    }

    /// 节点执行完、补丁已合并后的下一跳
    pub fn next(&self, from: &str, route: &Route, board: &Blackboard) -> String {
        let target = match route {
            Route::End => return END.to_string(),
            Route::Goto(target) => target.clone(),
            Route::Edge => match self.edges.get(from) {
                Some(Edge::Static(to)) => to.clone(),
                Some(Edge::Conditional(router)) => router(board),
                None => END.to_string(),
            },
        };
        if target == END || self.nodes.contains_key(&target) {
            target
        } else {
            tracing::warn!(from, target = %target, "route to unknown node, ending");
            END.to_string()
        }
    }

    /// 恢复时的入口：active_agent 对应的节点优先
    pub fn resume_node(&self, board: &Blackboard) -> String {
        match board.active_agent.as_deref() {
            Some(agent) if self.nodes.contains_key(agent) => agent.to_string(),
            _ => self.entry.clone(),
        }
    }
}

impl fmt::Debug for ExecutionGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionGraph")
            .field("mode", &self.mode)
            .field("entry", &self.entry)
            .field("nodes", &self.order)
            .field("layers", &self.layers)
            .field("delegation", &self.delegation)
            .finish()
    }
}
