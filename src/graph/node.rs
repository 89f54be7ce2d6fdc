//! 图节点：执行一次（agent 回合、并行层、规划、归约、控制器），返回补丁与路由决定

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentRegistry, AgentServices};
use crate::core::{OrchestratorError, TaskScheduler};
use crate::events::EventEmitter;
use crate::graph::DelegationScope;
use crate::state::{Blackboard, OverlapPolicy, StatePatch};

/// 节点执行结果；驱动器按此决定下一跳
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    /// 合并补丁后沿出边路由
    Continue(StatePatch),
    /// 合并补丁后跳到指定节点
    Goto(StatePatch, String),
    /// 合并补丁后结束本次运行
    End(StatePatch),
}

impl NodeOutcome {
    pub fn patch(&self) -> &StatePatch {
        match self {
            NodeOutcome::Continue(p) | NodeOutcome::Goto(p, _) | NodeOutcome::End(p) => p,
        }
    }

    pub fn into_patch(self) -> StatePatch {
        self.split().0
    }

    /// 拆成补丁与路由：驱动器先合并补丁，再按合并后的黑板路由
    pub fn split(self) -> (StatePatch, Route) {
        match self {
            NodeOutcome::Continue(p) => (p, Route::Edge),
            NodeOutcome::Goto(p, target) => (p, Route::Goto(target)),
            NodeOutcome::End(p) => (p, Route::End),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// 沿出边（静态或条件路由）
    Edge,
    Goto(String),
    End,
}

/// 计划模式与并行层的运行参数
#[derive(Debug, Clone, Copy)]
pub struct NodeSettings {
    pub overlap_policy: OverlapPolicy,
    pub max_error_retries: u32,
    pub max_replan_depth: u32,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            overlap_policy: OverlapPolicy::Reject,
            max_error_retries: 3,
            max_replan_depth: 5,
        }
    }
}

/// 节点执行环境：一次会话运行内共享
#[derive(Clone)]
pub struct NodeEnv {
    pub registry: Arc<AgentRegistry>,
    pub services: Arc<AgentServices>,
    pub emitter: EventEmitter,
    pub cancel: CancellationToken,
    pub scheduler: Arc<TaskScheduler>,
    pub settings: NodeSettings,
    pub delegation: DelegationScope,
}

#[async_trait]
pub trait Node: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, board: &Blackboard, env: &NodeEnv) -> Result<NodeOutcome, OrchestratorError>;
}
