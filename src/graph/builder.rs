//! 拓扑编译：把有序的 agent 声明编译成执行图
//!
//! 节点名即 agent id；规划器、归约器、控制器与并行层使用保留名。

use crate::agent::AgentRegistry;
use crate::core::OrchestratorError;
use crate::graph::agent_node::AgentNode;
use crate::graph::execution::{ExecutionGraph, ProcessMode, END};
use crate::graph::parallel::{layer_name, topological_layers, LayerNode, PlannerNode, ReducerNode, PLANNER, REDUCER};
use crate::graph::react::{ControllerNode, CONTROLLER};
use crate::state::Blackboard;

fn is_reserved(id: &str) -> bool {
    id == END
        || id == PLANNER
        || id == REDUCER
        || id == CONTROLLER
        || id
            .strip_prefix("layer_")
            .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
}

fn halted(board: &Blackboard) -> bool {
    board.last_status.is_some_and(|s| s.is_halting())
}

/// 按拓扑编译；注册表先做引用校验，并行拓扑的环在这里报错（先于任何节点运行）
pub fn build_graph(mode: ProcessMode, registry: &AgentRegistry) -> Result<ExecutionGraph, OrchestratorError> {
    registry.validate()?;
    if let Some(id) = registry.ids().into_iter().find(|id| is_reserved(id)) {
        return Err(OrchestratorError::Config(format!("agent id '{id}' is reserved")));
    }
    let graph = match mode {
        ProcessMode::Sequential => sequential(registry),
        ProcessMode::Dynamic => dynamic(registry),
        ProcessMode::Hierarchical => hierarchical(registry),
        ProcessMode::Parallel => parallel(registry, false)?,
        ProcessMode::MapReduce => parallel(registry, true)?,
        ProcessMode::React => react(registry),
    };
    tracing::debug!(?graph, "graph compiled");
    Ok(graph)
}

/// a1 → a2 → … → an → end；失败短路，active_agent 仍是自己时自环
fn sequential(registry: &AgentRegistry) -> ExecutionGraph {
    let ids = registry.ids();
    let mut graph = ExecutionGraph::new(ProcessMode::Sequential, ids[0].clone());
    for (i, id) in ids.iter().enumerate() {
        graph.add_node(AgentNode::new(id.clone()));
        let me = id.clone();
        let next = ids.get(i + 1).cloned().unwrap_or_else(|| END.to_string());
        graph.add_conditional_edge(id.clone(), move |board: &Blackboard| {
            if halted(board) {
                END.to_string()
            } else if board.active_agent.as_deref() == Some(me.as_str()) {
                me.clone()
            } else {
                next.clone()
            }
        });
    }
    graph
}

/// 任何 agent 都可以跳到任何 agent；委派合法性在委派发生处检查
fn dynamic(registry: &AgentRegistry) -> ExecutionGraph {
    let ids = registry.ids();
    let mut graph = ExecutionGraph::new(ProcessMode::Dynamic, ids[0].clone());
    for id in &ids {
        graph.add_node(AgentNode::new(id.clone()));
        let known = ids.clone();
        graph.add_conditional_edge(id.clone(), move |board: &Blackboard| {
            if halted(board) {
                return END.to_string();
            }
            match board.active_agent.as_deref() {
                Some(next) if known.iter().any(|k| k == next) => next.to_string(),
                _ => END.to_string(),
            }
        });
    }
    graph
}

/// 第一个 agent 为管理者；下属唯一的出边回到管理者
fn hierarchical(registry: &AgentRegistry) -> ExecutionGraph {
    let ids = registry.ids();
    let manager = ids[0].clone();
    let mut graph = ExecutionGraph::new(ProcessMode::Hierarchical, manager.clone());
    graph.add_node(AgentNode::new(manager.clone()));
    let known = ids.clone();
    graph.add_conditional_edge(manager.clone(), move |board: &Blackboard| {
        if halted(board) {
            return END.to_string();
        }
        match board.active_agent.as_deref() {
            Some(next) if known.iter().any(|k| k == next) => next.to_string(),
            _ => END.to_string(),
        }
    });
    for id in ids.iter().skip(1) {
        graph.add_node(AgentNode::new(id.clone()));
        graph.add_edge(id.clone(), manager.clone());
    }
    graph
}

/// 分层并行；map_reduce 时前置规划器、后置归约器
fn parallel(registry: &AgentRegistry, map_reduce: bool) -> Result<ExecutionGraph, OrchestratorError> {
    let layers = topological_layers(registry)?;
    let (mode, entry) = if map_reduce {
        (ProcessMode::MapReduce, PLANNER.to_string())
    } else {
        (ProcessMode::Parallel, layer_name(0))
    };
    let mut graph = ExecutionGraph::new(mode, entry);
    let tail = if map_reduce { REDUCER.to_string() } else { END.to_string() };

    if map_reduce {
        graph.add_node(PlannerNode);
        graph.add_edge(PLANNER, layer_name(0));
    }
    for (i, agents) in layers.iter().enumerate() {
        graph.add_node(LayerNode::new(i, agents.clone(), map_reduce));
        let next = if i + 1 < layers.len() {
            layer_name(i + 1)
        } else {
            tail.clone()
        };
        graph.add_edge(layer_name(i), next);
    }
    if map_reduce {
        graph.add_node(ReducerNode);
    }
    graph.set_layers(layers);
    Ok(graph)
}

/// 控制器 ↔ agent 的星形回路
fn react(registry: &AgentRegistry) -> ExecutionGraph {
    let mut graph = ExecutionGraph::new(ProcessMode::React, CONTROLLER);
    graph.add_node(ControllerNode);
    graph.add_edge(CONTROLLER, END);
    for id in registry.ids() {
        graph.add_node(AgentNode::new(id.clone()).capturing_errors());
        let me = id.clone();
        graph.add_conditional_edge(id, move |board: &Blackboard| {
            if !halted(board) && board.active_agent.as_deref() == Some(me.as_str()) {
                me.clone()
            } else {
                CONTROLLER.to_string()
            }
        });
    }
    graph
}
