//! SPOC-Shot CLI
//!
//! 对单个 prompt 跑一次会话，逐行打印事件（JSON），最后输出结果摘要。

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use spoc_shot::{
    config::load_config,
    core::Strategy,
    react::EventPayload,
    tools::ToolScope,
    Agent, AgentEvent,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "spoc-shot", about = "Self-correcting tool-calling orchestrator")]
struct Cli {
    /// 问题，如 "How many conversions did we get this week?"
    prompt: String,

    /// 配置文件（叠加在 config/default.toml 之上）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// independent_retry / continued_context
    #[arg(short, long)]
    strategy: Option<String>,

    /// 工具范围：sql / research / data_analysis / all
    #[arg(long)]
    scenario: Option<String>,

    /// 只打印最终结果，不打印 Token 流事件
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    spoc_shot::observability::init();
    let cli = Cli::parse();

    let mut cfg = load_config(cli.config.clone()).context("Failed to load config")?;
    if let Some(strategy) = &cli.strategy {
        let parsed = Strategy::parse(strategy)
            .with_context(|| format!("Unknown strategy '{}'", strategy))?;
        cfg.agent.strategy = parsed.as_str().to_string();
    }
    let agent = Agent::from_app_config(&cfg).context("Failed to create agent")?;

    let (tx, mut rx) = mpsc::unbounded_channel::<AgentEvent>();
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let quiet = cli.quiet;
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if quiet && matches!(event.payload, EventPayload::Stream { .. }) {
                continue;
            }
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!("Failed to serialize event: {}", e),
            }
        }
    });

    let scope = cli.scenario.as_deref().map(ToolScope::scenario);
    let result = agent.run(&cli.prompt, scope, Some(tx), cancel).await;
    printer.await.context("Event printer failed")?;

    if result.success {
        println!("\nAnswer: {}", result.answer.unwrap_or_default());
    } else {
        println!("\nError: {}", result.error.unwrap_or_default());
    }
    println!(
        "Metrics: {}",
        serde_json::to_string(&result.metrics).context("Failed to serialize metrics")?
    );
    Ok(())
}
