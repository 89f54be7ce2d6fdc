//! 闭包驱动的 agent：测试替身与轻量的确定性 agent

use async_trait::async_trait;

use crate::agent::{Agent, AgentContext, AgentOutcome};
use crate::core::AgentError;

pub struct FnAgent<F> {
    f: F,
}

impl<F> FnAgent<F>
where
    F: Fn(&mut AgentContext) -> Result<AgentOutcome, AgentError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Agent for FnAgent<F>
where
    F: Fn(&mut AgentContext) -> Result<AgentOutcome, AgentError> + Send + Sync,
{
    async fn run(&self, ctx: &mut AgentContext) -> Result<AgentOutcome, AgentError> {
        (self.f)(ctx)
    }
}
