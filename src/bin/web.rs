//! SPOC-Shot Web 服务
//!
//! 启动: cargo run --bin spoc-shot-web --features web
//!
//! - POST /api/solve：跑一次会话，以 SSE 推送每个会话事件（JSON），终态事件后结束
//! - POST /api/execute_tool：直接执行一个工具
//! - GET /api/tools：工具 schema 与使用统计
//! - GET /api/config：当前配置（不含密钥）
//! - GET /api/health

#![cfg(feature = "web")]

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{self, Stream};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use spoc_shot::agent::create_llm_from_config;
use spoc_shot::config::{load_config, AppConfig};
use spoc_shot::core::Strategy;
use spoc_shot::llm::LlmClient;
use spoc_shot::tools::{ToolRegistry, ToolResult, ToolScope};
use spoc_shot::{Agent, AgentConfig, AgentEvent};

struct AppState {
    config: AppConfig,
    llm: Arc<dyn LlmClient>,
    registry: Arc<ToolRegistry>,
    agent_config: AgentConfig,
}

#[derive(Debug, Deserialize)]
struct SolveRequest {
    prompt: String,
    /// independent_retry / continued_context；缺省用配置
    strategy: Option<String>,
    /// sql / research / data_analysis / all
    scenario: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecuteToolRequest {
    name: String,
    #[serde(default)]
    args: Map<String, Value>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    spoc_shot::observability::init();

    let config = load_config(None).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    let llm = create_llm_from_config(&config).context("Failed to create LLM client")?;
    let registry = ToolRegistry::with_defaults()
        .with_timeout(std::time::Duration::from_secs(config.tools.timeout_secs));
    let state = Arc::new(AppState {
        agent_config: AgentConfig::from(&config),
        llm,
        registry: Arc::new(registry),
        config,
    });

    let app = Router::new()
        .route("/api/solve", post(api_solve))
        .route("/api/execute_tool", post(api_execute_tool))
        .route("/api/tools", get(api_tools))
        .route("/api/config", get(api_config))
        .route("/api/health", get(api_health))
        .with_state(Arc::clone(&state));

    let addr = format!("{}:{}", state.config.app.host, state.config.app.port);
    tracing::info!("SPOC-Shot Web: http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// POST /api/solve：会话事件流。客户端断开时取消会话
async fn api_solve(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SolveRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    let prompt = req.prompt.trim().to_string();
    if prompt.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "prompt is required".to_string()));
    }
    let mut config = state.agent_config.clone();
    if let Some(name) = &req.strategy {
        config.strategy = Strategy::parse(name)
            .ok_or_else(|| (StatusCode::BAD_REQUEST, format!("unknown strategy '{}'", name)))?;
    }

    let agent = Agent::new(Arc::clone(&state.llm), Arc::clone(&state.registry), config);
    let scope = req.scenario.as_deref().map(ToolScope::scenario);
    let (tx, rx) = mpsc::unbounded_channel::<AgentEvent>();
    let cancel = CancellationToken::new();
    let session_cancel = cancel.clone();
    tokio::spawn(async move {
        agent.run(&prompt, scope, Some(tx), session_cancel).await;
    });

    // guard 随 SSE 流一起释放：客户端断开即取消会话
    let guard = cancel.drop_guard();
    let events = stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let event = rx.recv().await?;
        let data = serde_json::to_string(&event).unwrap_or_default();
        Some((Ok(Event::default().data(data)), (rx, guard)))
    });
    Ok(Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keepalive"),
    ))
}

/// POST /api/execute_tool：失败也以 200 + ToolResult 返回
async fn api_execute_tool(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ExecuteToolRequest>,
) -> Json<ToolResult> {
    Json(state.registry.execute(&req.name, req.args).await)
}

async fn api_tools(State(state): State<Arc<AppState>>) -> Json<Value> {
    let tools: Vec<Value> = state
        .registry
        .tool_names()
        .iter()
        .filter_map(|n| state.registry.describe(n))
        .collect();
    Json(serde_json::json!({
        "tools": tools,
        "analytics": state.registry.analytics(),
    }))
}

async fn api_config(State(state): State<Arc<AppState>>) -> Json<AppConfig> {
    Json(state.config.clone())
}

async fn api_health() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
