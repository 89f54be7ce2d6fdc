//! 执行图：节点、路由、各拓扑的编译器
//!
//! 节点执行返回 `NodeOutcome {Continue, Goto, End}`，驱动器据此选下一跳；
//! 回边（回到管理者、回到控制器、自环）只是普通的边，由迭代上限保证终止。

pub mod agent_node;
pub mod builder;
pub mod execution;
pub mod node;
pub mod parallel;
pub mod planning;
pub mod react;

pub use agent_node::AgentNode;
pub use builder::build_graph;
pub use execution::{DelegationScope, Edge, ExecutionGraph, ProcessMode, Router, END};
pub use node::{Node, NodeEnv, NodeOutcome, NodeSettings, Route};
pub use parallel::{topological_layers, LayerNode, PlannerNode, ReducerNode, PLANNER, REDUCER};
pub use react::{ControllerNode, ReflectDecision, Reflection, CONTROLLER};
