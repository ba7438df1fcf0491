//! 编排主循环
//!
//! INITIALIZE -> PROPOSE -> (EXTRACT) -> EXECUTE -> VERIFY -> {LEARN -> PROPOSE | FINALIZE -> SUCCESS}，任一步可进入 ERROR。
//! 两种策略共用同一个驱动：
//! - independent-retry：每轮 PROPOSE（含最终回答轮）都是新的顶层请求，带完整历史
//! - continued-context：首轮为顶层请求，之后的重试与最终回答都在同一 request id 上续写，不计入顶层调用
//!
//! 可恢复的失败（解析错误、未知工具、参数错误、工具失败、验证失败）都以失败的 ToolResult 写入记忆；
//! 只有传输错误、超过最大尝试次数、PROPOSE 超时与取消会终止会话。事件经 EventSink 发出，恰好一个终态。

use std::time::Instant;

use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::agent::AgentConfig;
use crate::core::{AgentError, FailureKind, Strategy};
use crate::llm::LlmClient;
use crate::memory::{ConversationMemory, LearningPattern, Message};
use crate::react::{
    AgentEvent, AgentMetrics, CallExtractor, EventPayload, EventSink, TurnOutcome, Verifier,
};
use crate::tools::{tool_call_schema_json, ToolCall, ToolRegistry, ToolResult, ToolScope};

const INDEPENDENT_RETRY_PROMPT: &str = r#"
You are an intelligent agent that learns from your mistakes and applies learned patterns.

CRITICAL RULES:
1. Look at your conversation history BEFORE making tool calls
2. If you see a previous tool failure with a hint, USE THAT HINT in your next attempt
3. Never repeat the exact same failed tool call
4. Learn from patterns and apply them consistently

When you see a tool result with "hint", that hint tells you exactly what to do next.
Example: If hint says "Did you mean 'convs'?", use 'convs' in your next tool call.
When the tool result is successful, reply with a concise final answer based on its data.
"#;

const CONTINUED_CONTEXT_PROMPT: &str = r#"
You are a single-pass agent that maintains continuous context and learns from failures.

CRITICAL RULES:
1. Maintain conversation context across all interactions
2. Learn from tool failures immediately and apply fixes
3. Use hints from tool results to correct your approach
4. Build on previous attempts rather than starting fresh

When the tool result is successful, reply with a concise final answer based on its data.
"#;

/// 空轮次后追加的提示
const EMPTY_TURN_NUDGE: &str =
    "Your last reply was empty. Either make a tool call or give the final answer.";

/// 会话终态摘要
#[derive(Debug, Clone, Serialize)]
pub struct AgentResult {
    pub session_id: String,
    pub success: bool,
    pub answer: Option<String>,
    pub error: Option<String>,
    /// 终止原因分类，如 max_attempts_exceeded
    pub error_kind: Option<String>,
    pub metrics: AgentMetrics,
    pub conversation: Vec<Message>,
    pub learning_patterns: Vec<LearningPattern>,
}

/// 单次会话所需的全部依赖与选项
pub struct ReactSession<'a> {
    pub llm: &'a dyn LlmClient,
    pub registry: &'a ToolRegistry,
    pub verifier: &'a dyn Verifier,
    pub config: &'a AgentConfig,
    pub scope: ToolScope,
    pub cancel_token: CancellationToken,
    pub event_tx: Option<mpsc::UnboundedSender<AgentEvent>>,
}

impl<'a> ReactSession<'a> {
    pub fn new(
        llm: &'a dyn LlmClient,
        registry: &'a ToolRegistry,
        verifier: &'a dyn Verifier,
        config: &'a AgentConfig,
    ) -> Self {
        Self {
            llm,
            registry,
            verifier,
            config,
            scope: config.scope.clone(),
            cancel_token: CancellationToken::new(),
            event_tx: None,
        }
    }

    pub fn with_scope(mut self, scope: ToolScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    pub fn with_event_tx(mut self, tx: mpsc::UnboundedSender<AgentEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }
}

/// 运行一次会话直到终态
pub async fn run_session(session: ReactSession<'_>, prompt: &str) -> AgentResult {
    let strategy = session.config.strategy;
    let session_id = format!("{}-{}", strategy.as_str(), uuid::Uuid::new_v4());
    let span = tracing::info_span!("session", session_id = %session_id, strategy = strategy.as_str());
    Driver::new(session, session_id)
        .run(prompt)
        .instrument(span)
        .await
}

/// 一次验证失败的记录：对应的调用（解析错误时没有）与结果
struct Failure {
    call: Option<ToolCall>,
    result: ToolResult,
}

struct Driver<'a> {
    s: ReactSession<'a>,
    memory: ConversationMemory,
    sink: EventSink,
    metrics: AgentMetrics,
    /// continued-context 策略续写所用的 request id
    request_id: String,
    tokens_at_start: u64,
}

impl<'a> Driver<'a> {
    fn new(mut s: ReactSession<'a>, session_id: String) -> Self {
        let sink = EventSink::new(session_id.clone(), s.event_tx.take());
        let tokens_at_start = s.llm.token_usage().2;
        Self {
            s,
            memory: ConversationMemory::new(session_id.clone()),
            sink,
            metrics: AgentMetrics::default(),
            request_id: session_id,
            tokens_at_start,
        }
    }

    async fn run(mut self, prompt: &str) -> AgentResult {
        let started = Instant::now();
        tracing::info!(prompt = %crate::memory::conversation::preview(prompt, 80), "session started");
        let outcome = self.drive(prompt).await;
        self.metrics.latency_ms = Some(started.elapsed().as_millis() as u64);
        self.refresh_tokens();

        let (answer, error, error_kind) = match outcome {
            Ok(answer) => {
                tracing::info!(
                    llm_calls = self.metrics.llm_calls,
                    continuations = self.metrics.continuations,
                    tool_calls = self.metrics.tool_calls,
                    "session succeeded"
                );
                self.emit(EventPayload::Success {
                    answer: answer.clone(),
                });
                (Some(answer), None, None)
            }
            Err(e) => {
                match &e {
                    AgentError::Transport(_) | AgentError::ProposeTimeout(_) => {
                        tracing::warn!(error = %e, "session aborted")
                    }
                    _ => tracing::info!(error = %e, "session ended without answer"),
                }
                self.emit(EventPayload::Error {
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                });
                (None, Some(e.to_string()), Some(e.kind().to_string()))
            }
        };

        AgentResult {
            session_id: self.memory.session_id().to_string(),
            success: answer.is_some(),
            answer,
            error,
            error_kind,
            metrics: self.metrics,
            conversation: self.memory.messages().to_vec(),
            learning_patterns: self.memory.patterns().to_vec(),
        }
    }

    fn emit(&mut self, payload: EventPayload) {
        self.sink.emit(self.metrics, payload);
    }

    fn strategy(&self) -> Strategy {
        self.s.config.strategy
    }

    fn max_attempts(&self) -> usize {
        self.s.config.max_attempts.max(1)
    }

    async fn drive(&mut self, prompt: &str) -> Result<String, AgentError> {
        self.initialize(prompt);

        let mut failures = 0usize;
        let mut continuation = false;
        loop {
            let turn = self.propose(failures + 1, continuation).await?;
            if self.strategy() == Strategy::ContinuedContext {
                continuation = true;
            }

            let failure = match turn {
                TurnOutcome::Answer(text) if !text.is_empty() => {
                    self.memory.push(Message::assistant(text.clone()));
                    return Ok(text);
                }
                TurnOutcome::Answer(_) => {
                    tracing::debug!("empty turn");
                    self.memory
                        .push(Message::user(EMPTY_TURN_NUDGE).with_meta("nudge", true));
                    None
                }
                TurnOutcome::Call { call, content } => {
                    self.memory
                        .push(Message::assistant(content).with_meta("tool_call", true));
                    let (result, verified) = self.execute(&call).await?;
                    if verified {
                        return self.finalize(failures + 1, continuation, &result).await;
                    }
                    Some(Failure {
                        call: Some(call),
                        result,
                    })
                }
                TurnOutcome::ParseError { content, reason } => {
                    tracing::debug!(%reason, "tool call payload rejected");
                    self.memory.push(Message::assistant(content));
                    let result = ToolResult::failure(
                        format!("Could not parse tool call: {}", reason),
                        Some(format!(
                            "Format tool calls as: {} {{\"name\": \"tool_name\", \"args\": {{\"param\": \"value\"}}}}",
                            self.s.config.sentinel
                        )),
                    )
                    .with_failure_kind(FailureKind::ParseError);
                    self.memory.push(Message::tool_result(&result));
                    self.emit(EventPayload::ParseError {
                        reason,
                        result: result.clone(),
                    });
                    Some(Failure { call: None, result })
                }
            };

            failures += 1;
            if failures >= self.max_attempts() {
                return Err(AgentError::MaxAttemptsExceeded(failures));
            }
            if let Some(failure) = failure {
                self.learn(failures, failure);
            }
        }
    }

    /// 写入策略对应的 system 消息与用户问题（可带工具签名）
    fn initialize(&mut self, prompt: &str) {
        let base = match self.strategy() {
            Strategy::IndependentRetry => INDEPENDENT_RETRY_PROMPT,
            Strategy::ContinuedContext => CONTINUED_CONTEXT_PROMPT,
        };
        let sentinel = &self.s.config.sentinel;
        let mut system = format!(
            "{}\nFormat tool calls as: {} {{\"name\": \"tool_name\", \"args\": {{\"param\": \"value\"}}}}\n",
            base.trim_start(),
            sentinel
        );
        if self.s.config.include_signature {
            system.push_str("\nTool call payload JSON schema:\n");
            system.push_str(&tool_call_schema_json());
            system.push('\n');
        }
        self.memory.push(Message::system(system));

        let user = if self.s.config.include_signature {
            format!(
                "Available tools:\n{}\n\nUser Prompt: {}",
                self.s.registry.signature(&self.s.scope),
                prompt
            )
        } else {
            prompt.to_string()
        };
        self.memory.push(Message::user(user));
    }

    /// 调用模型并把输出交给提取器；受取消令牌与单轮超时约束
    async fn propose(&mut self, attempt: usize, continuation: bool) -> Result<TurnOutcome, AgentError> {
        if continuation {
            self.metrics.continuations += 1;
        } else {
            self.metrics.llm_calls += 1;
        }
        self.emit(EventPayload::Propose {
            attempt,
            continuation,
        });

        let cancel = self.s.cancel_token.clone();
        let limit = self.s.config.propose_timeout;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            r = tokio::time::timeout(limit, self.generate(continuation)) => match r {
                Ok(r) => r,
                Err(_) => Err(AgentError::ProposeTimeout(limit.as_secs())),
            },
        };
        self.refresh_tokens();
        outcome
    }

    fn refresh_tokens(&mut self) {
        self.metrics.total_tokens = self
            .s
            .llm
            .token_usage()
            .2
            .saturating_sub(self.tokens_at_start);
    }

    async fn generate(&mut self, continuation: bool) -> Result<TurnOutcome, AgentError> {
        let mut extractor = CallExtractor::new(&self.s.config.sentinel);
        let llm = self.s.llm;

        if !self.s.config.stream {
            let text = if continuation {
                let mut stream = llm
                    .continue_stream(&self.request_id, self.memory.messages())
                    .await?;
                let mut text = String::new();
                while let Some(token) = stream.next().await {
                    text.push_str(&token?);
                }
                text
            } else {
                llm.complete(self.memory.messages()).await?
            };
            self.emit(EventPayload::Stream { text: text.clone() });
            extractor.push(&text);
            return Ok(extractor.finish());
        }

        let mut stream = if continuation {
            llm.continue_stream(&self.request_id, self.memory.messages())
                .await?
        } else {
            llm.complete_stream(self.memory.messages()).await?
        };
        while let Some(item) = stream.next().await {
            let token = item?;
            if token.is_empty() {
                continue;
            }
            self.emit(EventPayload::Stream {
                text: token.clone(),
            });
            if extractor.push(&token) != crate::react::ExtractStep::NeedMore {
                // 本轮已得出结论：丢弃流，释放请求
                break;
            }
        }
        Ok(extractor.finish())
    }

    /// 执行工具、写入 tool 消息并验证；返回 (结果, 是否通过验证)
    async fn execute(&mut self, call: &ToolCall) -> Result<(ToolResult, bool), AgentError> {
        self.metrics.tool_calls += 1;
        self.emit(EventPayload::Execute {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            args: serde_json::Value::Object(call.args.clone()),
        });

        let cancel = self.s.cancel_token.clone();
        let executed = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            r = self.s.registry.execute(&call.name, call.args.clone()) => Some(r),
        };
        let Some(mut result) = executed else {
            // 保持 execute / tool_result 成对
            let result = ToolResult::failure("cancelled", None);
            self.memory.push(Message::tool_result(&result));
            self.emit(EventPayload::ToolResult {
                call_id: call.id.clone(),
                tool: call.name.clone(),
                result,
            });
            return Err(AgentError::Cancelled);
        };

        let verified = self.s.verifier.verify(&result);
        if !verified && result.failure_kind().is_none() {
            result = result.with_failure_kind(FailureKind::VerificationFailure);
        }
        self.memory.push(Message::tool_result(&result));
        self.emit(EventPayload::ToolResult {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            result: result.clone(),
        });
        Ok((result, verified))
    }

    /// 验证失败后：提取模式，必要时注入学习提醒
    fn learn(&mut self, attempt: usize, failure: Failure) {
        let Failure { call, result } = failure;
        let (pattern, alert) = match &call {
            Some(call) => (
                self.memory.extract_learning_pattern(call, &result),
                self.memory.should_apply_learning(call),
            ),
            None => (None, None),
        };

        if let Some(alert) = &alert {
            let mut text = alert.clone();
            let section = self.memory.learned_patterns_section();
            if !section.is_empty() {
                text.push_str("\n\n");
                text.push_str(&section);
            }
            self.memory
                .push(Message::user(text).with_meta("learning_alert", true));
        }
        self.emit(EventPayload::Learn {
            attempt,
            pattern,
            alert,
        });
    }

    /// 验证通过后再生成一轮最终回答；continued-context 在同一请求上续写
    async fn finalize(
        &mut self,
        attempt: usize,
        continuation: bool,
        result: &ToolResult,
    ) -> Result<String, AgentError> {
        let turn = self.propose(attempt, continuation).await?;
        let text = match turn {
            TurnOutcome::Answer(text) => text,
            // 最终回答轮不再执行工具，只保留哨兵之前的文字
            TurnOutcome::Call { content, .. } | TurnOutcome::ParseError { content, .. } => content
                .split(self.s.config.sentinel.as_str())
                .next()
                .unwrap_or_default()
                .trim()
                .to_string(),
        };
        let answer = if text.is_empty() {
            render_tool_data(result)
        } else {
            text
        };
        self.memory.push(Message::assistant(answer.clone()));
        Ok(answer)
    }
}

/// 最终回答为空时的兜底：直接给出工具数据
fn render_tool_data(result: &ToolResult) -> String {
    match &result.data {
        Some(serde_json::Value::String(s)) => format!("The result is {}.", s),
        Some(data) => format!("The result is {}.", data),
        None => "The tool call succeeded.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, ScriptedLlmClient, ScriptedTurn};
    use crate::react::SuccessFlagVerifier;
    use std::time::Duration;

    fn config(strategy: Strategy) -> AgentConfig {
        AgentConfig {
            strategy,
            ..AgentConfig::default()
        }
    }

    async fn run(llm: &ScriptedLlmClient, cfg: &AgentConfig, prompt: &str) -> (AgentResult, Vec<AgentEvent>) {
        let registry = ToolRegistry::with_defaults();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = ReactSession::new(llm, &registry, &SuccessFlagVerifier, cfg).with_event_tx(tx);
        let result = run_session(session, prompt).await;
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        (result, events)
    }

    const BAD: &str = r#"Checking. TOOL_CALL: {"name": "sql_query", "args": {"column": "conversions"}}"#;
    const GOOD: &str = r#"TOOL_CALL: {"name": "sql_query", "args": {"column": "convs"}}"#;

    #[tokio::test]
    async fn test_direct_answer() {
        let llm = ScriptedLlmClient::from_texts(["Hello there."]);
        let (result, events) = run(&llm, &config(Strategy::IndependentRetry), "hi").await;
        assert!(result.success);
        assert_eq!(result.answer.as_deref(), Some("Hello there."));
        assert_eq!(result.metrics.tool_calls, 0);
        assert!(events.last().unwrap().payload.is_terminal());
    }

    #[tokio::test]
    async fn test_learning_alert_is_injected_after_hint() {
        let llm = ScriptedLlmClient::from_texts([BAD, GOOD, "We got 12345 conversions."]);
        let (result, _) = run(&llm, &config(Strategy::IndependentRetry), "conversions?").await;
        assert!(result.success);
        let alert = result
            .conversation
            .iter()
            .find(|m| m.metadata.contains_key("learning_alert"))
            .unwrap();
        assert!(alert.content.contains("Did you mean 'convs'?"));
        assert_eq!(result.learning_patterns.len(), 1);
        // 第二轮请求必须带上失败与提醒
        let second = &llm.calls()[1].messages;
        assert!(second.iter().any(|m| m.metadata.contains_key("learning_alert")));
    }

    #[tokio::test]
    async fn test_parse_error_counts_as_failure() {
        let llm = ScriptedLlmClient::from_texts([
            "TOOL_CALL: {\"name\": ",
            GOOD,
            "12345.",
        ]);
        let (result, events) = run(&llm, &config(Strategy::IndependentRetry), "q").await;
        assert!(result.success);
        let first_result = events
            .iter()
            .find_map(|e| match &e.payload {
                EventPayload::ParseError { result, .. } => Some(result.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(first_result.failure_kind(), Some("parse_error"));
        assert!(first_result.hint.unwrap().contains("TOOL_CALL:"));
        // 解析失败不执行工具，也不发 execute / tool_result
        assert_eq!(result.metrics.tool_calls, 1);
        let phases: Vec<_> = events
            .iter()
            .map(|e| e.phase())
            .filter(|p| *p != crate::core::AgentPhase::Stream)
            .collect();
        use crate::core::AgentPhase as P;
        assert_eq!(
            phases,
            vec![
                P::Propose,
                P::ParseError,
                P::Learn,
                P::Propose,
                P::Execute,
                P::ToolResult,
                P::Propose,
                P::Success
            ]
        );
    }

    #[tokio::test]
    async fn test_cancel_during_execute_closes_the_pair() {
        use crate::tools::{Tool, ToolCategory, ToolError, ToolMetadata, ToolSchema};
        use async_trait::async_trait;
        use serde_json::{Map, Value};

        struct SlowTool {
            schema: ToolSchema,
            metadata: ToolMetadata,
        }

        #[async_trait]
        impl Tool for SlowTool {
            fn schema(&self) -> &ToolSchema {
                &self.schema
            }

            fn metadata(&self) -> &ToolMetadata {
                &self.metadata
            }

            async fn run(&self, _args: &Map<String, Value>) -> Result<ToolResult, ToolError> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(ToolResult::ok("late"))
            }
        }

        let mut registry = ToolRegistry::new();
        registry.register(SlowTool {
            schema: ToolSchema::new("slow", "Sleeps for a while"),
            metadata: ToolMetadata::new(ToolCategory::Utility),
        });
        let llm = ScriptedLlmClient::from_texts([r#"TOOL_CALL: {"name": "slow", "args": {}}"#]);
        let cfg = config(Strategy::IndependentRetry);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = ReactSession::new(&llm, &registry, &SuccessFlagVerifier, &cfg)
            .with_scope(ToolScope::All)
            .with_cancel_token(cancel)
            .with_event_tx(tx);
        let result = run_session(session, "q").await;
        assert_eq!(result.error_kind.as_deref(), Some("cancelled"));

        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        let phases: Vec<_> = events
            .iter()
            .map(|e| e.phase())
            .filter(|p| *p != crate::core::AgentPhase::Stream)
            .collect();
        use crate::core::AgentPhase as P;
        assert_eq!(phases, vec![P::Propose, P::Execute, P::ToolResult, P::Error]);
        let cancelled = events
            .iter()
            .find_map(|e| match &e.payload {
                EventPayload::ToolResult { result, .. } => Some(result.clone()),
                _ => None,
            })
            .unwrap();
        assert!(!cancelled.success);
        assert_eq!(cancelled.error.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn test_empty_final_answer_falls_back_to_data() {
        let llm = ScriptedLlmClient::from_texts([GOOD, "   "]);
        let (result, _) = run(&llm, &config(Strategy::IndependentRetry), "q").await;
        assert_eq!(result.answer.as_deref(), Some("The result is 12345."));
    }

    #[tokio::test]
    async fn test_empty_turns_exhaust_attempts() {
        let llm = ScriptedLlmClient::from_texts(["", "", ""]);
        let (result, _) = run(&llm, &config(Strategy::IndependentRetry), "q").await;
        assert!(!result.success);
        assert_eq!(result.error_kind.as_deref(), Some("max_attempts_exceeded"));
    }

    #[tokio::test]
    async fn test_non_stream_mode() {
        let llm = ScriptedLlmClient::from_texts([GOOD, "Done: 12345."]);
        let cfg = AgentConfig {
            stream: false,
            ..config(Strategy::IndependentRetry)
        };
        let (result, events) = run(&llm, &cfg, "q").await;
        assert!(result.success);
        let streams = events
            .iter()
            .filter(|e| matches!(e.payload, EventPayload::Stream { .. }))
            .count();
        assert_eq!(streams, 2);
    }

    #[tokio::test]
    async fn test_mid_stream_failure_is_transport_error() {
        let llm = ScriptedLlmClient::new([ScriptedTurn::FailMidStream(
            vec!["TOOL".into()],
            LlmError::Stream("connection reset".into()),
        )]);
        let (result, _) = run(&llm, &config(Strategy::ContinuedContext), "q").await;
        assert_eq!(result.error_kind.as_deref(), Some("transport_error"));
    }

    #[tokio::test]
    async fn test_propose_timeout() {
        let llm = ScriptedLlmClient::new([ScriptedTurn::Hang]);
        let cfg = AgentConfig {
            propose_timeout: Duration::from_millis(50),
            ..config(Strategy::IndependentRetry)
        };
        let (result, events) = run(&llm, &cfg, "q").await;
        assert_eq!(result.error_kind.as_deref(), Some("propose_timeout"));
        assert_eq!(events.last().unwrap().phase(), crate::core::AgentPhase::Error);
    }

    #[tokio::test]
    async fn test_signature_prefix_in_first_user_message() {
        let llm = ScriptedLlmClient::from_texts(["ok."]);
        let (result, _) = run(&llm, &config(Strategy::IndependentRetry), "How many users?").await;
        let user = &result.conversation[1];
        assert!(user.content.starts_with("Available tools:"));
        assert!(user.content.contains("sql_query"));
        assert!(user.content.ends_with("User Prompt: How many users?"));
        assert!(result.session_id.starts_with("independent_retry-"));
    }
}
