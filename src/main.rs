//! Hive 演示入口
//!
//! 用配置中的 LLM 后端组一个顺序团队（analyst -> developer -> reviewer），
//! 运行命令行给出的目标，并把事件流逐行打印为 JSON。

use anyhow::Context;
use futures_util::StreamExt;
use hive::config::load_config;
use hive::tools::EchoTool;
use hive::{AgentSpec, LlmAgent, OrchestratorBuilder};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(None).context("Failed to load config")?;
    let goal = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    let goal = if goal.trim().is_empty() {
        "Design a small REST API for a todo list".to_string()
    } else {
        goal
    };

    let orchestrator = OrchestratorBuilder::new(config)
        .tool(EchoTool)
        .agent(
            AgentSpec::new("analyst", "Analyst")
                .description("Breaks the goal into requirements")
                .instructions("List the requirements and open risks for the goal."),
            LlmAgent::new(),
        )
        .agent(
            AgentSpec::new("developer", "Developer")
                .description("Proposes an implementation")
                .instructions("Turn the analyst's requirements into a concrete design.")
                .tools(["echo"]),
            LlmAgent::new(),
        )
        .agent(
            AgentSpec::new("reviewer", "Reviewer")
                .description("Reviews the design")
                .instructions("Review the developer's design and list concrete issues."),
            LlmAgent::new(),
        )
        .build()
        .context("Failed to build orchestrator")?;

    let session = uuid::Uuid::new_v4().simple().to_string();
    let mut events = orchestrator.stream(goal, &session);
    while let Some(item) = events.next().await {
        match item {
            Ok(event) => println!("{}", serde_json::to_string(&event)?),
            Err(err) => {
                tracing::error!(error = %err, "run failed");
                return Err(err).context("Run failed");
            }
        }
    }

    let stats = orchestrator
        .session_stats(&session)
        .await
        .context("Failed to read session stats")?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
