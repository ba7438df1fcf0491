//! Agent 运行时
//!
//! Agent 持有共享的生成服务、工具注册表与验证器（均以 Arc 注入，无全局单例），
//! 每次 run 都新建一个会话（独立的 session_id 与记忆），可在多个任务中并发调用。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{AgentError, Strategy};
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::react::{
    run_session, AgentEvent, AgentResult, ReactSession, SuccessFlagVerifier, Verifier,
    DEFAULT_SENTINEL,
};
use crate::tools::{ToolRegistry, ToolScope};

/// 编排器配置
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub strategy: Strategy,
    /// 验证失败次数上限（至少 1）
    pub max_attempts: usize,
    /// 单次 PROPOSE 的超时
    pub propose_timeout: Duration,
    pub sentinel: String,
    pub stream: bool,
    pub include_signature: bool,
    /// 调用方未指定时使用的工具范围
    pub scope: ToolScope,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            max_attempts: 3,
            propose_timeout: Duration::from_secs(60),
            sentinel: DEFAULT_SENTINEL.to_string(),
            stream: true,
            include_signature: true,
            scope: ToolScope::scenario("sql"),
        }
    }
}

impl From<&AppConfig> for AgentConfig {
    fn from(cfg: &AppConfig) -> Self {
        let strategy = Strategy::parse(&cfg.agent.strategy).unwrap_or_else(|| {
            tracing::warn!(strategy = %cfg.agent.strategy, "unknown strategy, using independent_retry");
            Strategy::default()
        });
        Self {
            strategy,
            max_attempts: cfg.agent.max_attempts.max(1),
            propose_timeout: Duration::from_secs(cfg.llm.timeouts.propose),
            sentinel: effective_sentinel(cfg),
            stream: cfg.agent.stream,
            include_signature: cfg.agent.include_signature,
            scope: ToolScope::scenario(&cfg.agent.scenario),
        }
    }
}

/// 配置中的哨兵；为空时回退到默认值
fn effective_sentinel(cfg: &AppConfig) -> String {
    if cfg.agent.sentinel.trim().is_empty() {
        DEFAULT_SENTINEL.to_string()
    } else {
        cfg.agent.sentinel.clone()
    }
}

/// 按配置创建生成服务：mock 或 openai（OpenAI 兼容端点，如本地 vLLM）
pub fn create_llm_from_config(cfg: &AppConfig) -> Result<Arc<dyn LlmClient>, AgentError> {
    match cfg.llm.provider.to_lowercase().as_str() {
        "mock" => {
            tracing::info!("Using Mock LLM");
            Ok(Arc::new(MockLlmClient::new(effective_sentinel(cfg))))
        }
        "openai" => {
            let api_key = cfg
                .llm
                .api_key
                .clone()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
            tracing::info!(model = %cfg.llm.model, "Using OpenAI-compatible LLM");
            Ok(Arc::new(OpenAiClient::new(
                cfg.llm.base_url.as_deref(),
                &cfg.llm.model,
                api_key.as_deref(),
            )))
        }
        other => Err(AgentError::Config(format!("unknown llm provider '{}'", other))),
    }
}

/// 会话编排入口
pub struct Agent {
    llm: Arc<dyn LlmClient>,
    registry: Arc<ToolRegistry>,
    verifier: Arc<dyn Verifier>,
    config: AgentConfig,
}

impl Agent {
    pub fn new(llm: Arc<dyn LlmClient>, registry: Arc<ToolRegistry>, config: AgentConfig) -> Self {
        Self {
            llm,
            registry,
            verifier: Arc::new(SuccessFlagVerifier),
            config,
        }
    }

    /// 由应用配置构建：生成服务、内置工具（带配置的超时）与编排器配置
    pub fn from_app_config(cfg: &AppConfig) -> Result<Self, AgentError> {
        let llm = create_llm_from_config(cfg)?;
        let registry = ToolRegistry::with_defaults()
            .with_timeout(Duration::from_secs(cfg.tools.timeout_secs));
        Ok(Self::new(llm, Arc::new(registry), AgentConfig::from(cfg)))
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// 运行一次会话；scope 为 None 时使用配置中的默认范围
    pub async fn run(
        &self,
        prompt: &str,
        scope: Option<ToolScope>,
        event_tx: Option<mpsc::UnboundedSender<AgentEvent>>,
        cancel: CancellationToken,
    ) -> AgentResult {
        let mut session = ReactSession::new(
            self.llm.as_ref(),
            self.registry.as_ref(),
            self.verifier.as_ref(),
            &self.config,
        )
        .with_cancel_token(cancel);
        if let Some(scope) = scope {
            session = session.with_scope(scope);
        }
        if let Some(tx) = event_tx {
            session = session.with_event_tx(tx);
        }
        run_session(session, prompt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_config_from_app_config() {
        let mut app = AppConfig::default();
        app.agent.strategy = "single_pass".into();
        app.agent.max_attempts = 0;
        app.agent.scenario = "research".into();
        app.llm.timeouts.propose = 9;
        let cfg = AgentConfig::from(&app);
        assert_eq!(cfg.strategy, Strategy::ContinuedContext);
        assert_eq!(cfg.max_attempts, 1);
        assert_eq!(cfg.propose_timeout, Duration::from_secs(9));
        assert_eq!(cfg.scope, ToolScope::scenario("research"));
    }

    #[test]
    fn test_unknown_provider_is_config_error() {
        let mut app = AppConfig::default();
        app.llm.provider = "carrier-pigeon".into();
        let err = create_llm_from_config(&app).err().unwrap();
        assert_eq!(err.kind(), "config_error");
    }

    #[tokio::test]
    async fn test_blank_sentinel_falls_back_for_mock_and_extractor() {
        let mut app = AppConfig::default();
        app.agent.sentinel = "  ".into();
        assert_eq!(AgentConfig::from(&app).sentinel, DEFAULT_SENTINEL);
        let agent = Agent::from_app_config(&app).unwrap();
        let result = agent
            .run(
                "How many conversions did we get this week?",
                None,
                None,
                CancellationToken::new(),
            )
            .await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.metrics.tool_calls, 2);
    }

    #[tokio::test]
    async fn test_mock_agent_solves_conversions() {
        let agent = Agent::from_app_config(&AppConfig::default()).unwrap();
        let result = agent
            .run(
                "How many conversions did we get this week?",
                None,
                None,
                CancellationToken::new(),
            )
            .await;
        assert!(result.success, "{:?}", result.error);
        assert!(result.answer.unwrap().contains("12345"));
        assert_eq!(result.learning_patterns[0].solution, "Did you mean 'convs'?");
    }
}
