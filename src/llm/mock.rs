//! Mock 生成服务（用于测试与离线演示，无需 API）
//!
//! - [`ScriptedLlmClient`]：按脚本逐轮回放输出（可注入传输错误、挂起、流中断），并记录每次调用
//! - [`MockLlmClient`]：规则模型，首轮按关键词猜参数，之后照着失败结果里的 hint 修正，成功后复述数据

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;

use crate::llm::{LlmClient, LlmError, TokenStream};
use crate::memory::{Message, Role};

/// 流式回放时每段字符数（模拟 Token 粒度）
const CHUNK_CHARS: usize = 4;

/// 脚本中的一轮输出
#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    /// 按 CHUNK_CHARS 切成 Token 流式输出
    Text(String),
    /// 原样按给定 Token 输出
    Tokens(Vec<String>),
    /// 打开请求即失败
    Fail(LlmError),
    /// 先输出若干 Token，再以错误结束
    FailMidStream(Vec<String>, LlmError),
    /// 永不产出（用于超时与取消测试）
    Hang,
}

impl ScriptedTurn {
    pub fn text(s: impl Into<String>) -> Self {
        ScriptedTurn::Text(s.into())
    }
}

/// 一次调用的记录
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// None 表示顶层请求，Some 表示 continue_stream 续写
    pub request_id: Option<String>,
    pub messages: Vec<Message>,
}

/// 脚本回放客户端
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    calls: Mutex<Vec<RecordedCall>>,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
}

impl ScriptedLlmClient {
    pub fn new(turns: impl IntoIterator<Item = ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into_iter().collect()),
            ..Default::default()
        }
    }

    /// 便捷构造：每轮都是纯文本
    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(texts.into_iter().map(|t| ScriptedTurn::Text(t.into())))
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// 顶层请求次数
    pub fn top_level_calls(&self) -> usize {
        self.calls().iter().filter(|c| c.request_id.is_none()).count()
    }

    /// 续写次数
    pub fn continuation_calls(&self) -> usize {
        self.calls().iter().filter(|c| c.request_id.is_some()).count()
    }

    /// 剩余未回放的轮数
    pub fn remaining(&self) -> usize {
        self.turns.lock().map(|t| t.len()).unwrap_or(0)
    }

    fn next_turn(&self, request_id: Option<&str>, messages: &[Message]) -> Result<ScriptedTurn, LlmError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                request_id: request_id.map(String::from),
                messages: messages.to_vec(),
            });
        }
        let prompt: usize = messages.iter().map(|m| m.content.len() / 4).sum();
        self.prompt_tokens.fetch_add(prompt as u64, Ordering::Relaxed);
        self.turns
            .lock()
            .ok()
            .and_then(|mut t| t.pop_front())
            .ok_or_else(|| LlmError::Api("script exhausted".to_string()))
    }

    fn open(&self, turn: ScriptedTurn) -> Result<TokenStream, LlmError> {
        let tokens = match turn {
            ScriptedTurn::Text(text) => chunk(&text),
            ScriptedTurn::Tokens(tokens) => tokens,
            ScriptedTurn::Fail(e) => return Err(e),
            ScriptedTurn::FailMidStream(tokens, e) => {
                self.completion_tokens
                    .fetch_add(tokens.len() as u64, Ordering::Relaxed);
                let items: Vec<Result<String, LlmError>> =
                    tokens.into_iter().map(Ok).chain(std::iter::once(Err(e))).collect();
                return Ok(Box::pin(stream::iter(items)));
            }
            ScriptedTurn::Hang => return Ok(Box::pin(stream::pending())),
        };
        self.completion_tokens
            .fetch_add(tokens.len() as u64, Ordering::Relaxed);
        Ok(Box::pin(stream::iter(tokens.into_iter().map(Ok))))
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        match self.next_turn(None, messages)? {
            ScriptedTurn::Text(text) => Ok(text),
            ScriptedTurn::Tokens(tokens) => Ok(tokens.concat()),
            ScriptedTurn::Fail(e) | ScriptedTurn::FailMidStream(_, e) => Err(e),
            ScriptedTurn::Hang => std::future::pending().await,
        }
    }

    async fn complete_stream(&self, messages: &[Message]) -> Result<TokenStream, LlmError> {
        let turn = self.next_turn(None, messages)?;
        self.open(turn)
    }

    async fn continue_stream(
        &self,
        request_id: &str,
        messages: &[Message],
    ) -> Result<TokenStream, LlmError> {
        let turn = self.next_turn(Some(request_id), messages)?;
        self.open(turn)
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        let p = self.prompt_tokens.load(Ordering::Relaxed);
        let c = self.completion_tokens.load(Ordering::Relaxed);
        (p, c, p + c)
    }
}

fn chunk(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(CHUNK_CHARS)
        .map(|c| c.iter().collect())
        .collect()
}

/// 规则模型：离线演示用，行为类似一个会读 hint 的小模型
#[derive(Debug, Clone)]
pub struct MockLlmClient {
    sentinel: String,
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new("TOOL_CALL:")
    }
}

impl MockLlmClient {
    pub fn new(sentinel: impl Into<String>) -> Self {
        Self {
            sentinel: sentinel.into(),
        }
    }

    fn respond(&self, messages: &[Message]) -> String {
        let last = messages.iter().rev().find(|m| m.role != Role::System);
        match last {
            Some(m) if m.role == Role::Tool => self.after_tool(messages, &m.content),
            // 学习提醒或纠错提示也是 user 消息：回看最近一次工具结果
            Some(m) if m.role == Role::User && m.metadata.contains_key("learning_alert") => {
                match messages.iter().rev().find(|m| m.role == Role::Tool) {
                    Some(t) => self.after_tool(messages, &t.content),
                    None => self.first_attempt(&m.content),
                }
            }
            Some(m) => self.first_attempt(&m.content),
            None => "Hello! Ask me something.".to_string(),
        }
    }

    fn first_attempt(&self, prompt: &str) -> String {
        // 忽略拼在前面的工具签名，只看用户问题
        let question = prompt.rsplit("User Prompt:").next().unwrap_or(prompt);
        let lower = question.to_lowercase();
        let (name, args) = if lower.contains("conversion") {
            ("sql_query", serde_json::json!({"column": "conversions"}))
        } else if let Some(col) = ["users", "revenue", "clicks", "impressions"]
            .iter()
            .find(|c| lower.contains(*c))
        {
            ("sql_query", serde_json::json!({"column": col}))
        } else if lower.contains("climate") {
            ("web_search", serde_json::json!({"query": "climate change data"}))
        } else if lower.contains("ai research") {
            ("web_search", serde_json::json!({"query": "latest ai research"}))
        } else {
            return "I could not find a suitable tool for this question.".to_string();
        };
        format!(
            "Let me look that up.\n{} {}",
            self.sentinel,
            serde_json::json!({"name": name, "args": args})
        )
    }

    fn after_tool(&self, messages: &[Message], tool_content: &str) -> String {
        let result: serde_json::Value = serde_json::from_str(tool_content).unwrap_or_default();
        if result.get("ok").and_then(|v| v.as_bool()) == Some(true) {
            let data = result.get("data").cloned().unwrap_or_default();
            return format!("The answer is {}.", render(&data));
        }
        let hint = result.get("hint").and_then(|v| v.as_str()).unwrap_or("");
        let previous = messages
            .iter()
            .rev()
            .filter(|m| m.role == Role::Assistant)
            .find_map(|m| m.content.split_once(self.sentinel.as_str()))
            .and_then(|(_, payload)| {
                serde_json::Deserializer::from_str(payload.trim())
                    .into_iter::<serde_json::Value>()
                    .next()
                    .and_then(|v| v.ok())
            });
        let Some(previous) = previous else {
            return format!("The tool failed and I cannot recover: {}", hint);
        };
        let name = previous.get("name").and_then(|v| v.as_str()).unwrap_or("");
        let Some(fixed) = quoted(hint) else {
            return format!("The tool failed: {}", hint);
        };
        let key = if name == "web_search" { "query" } else { "column" };
        format!(
            "The hint says to use '{}'. Retrying.\n{} {}",
            fixed,
            self.sentinel,
            serde_json::json!({"name": name, "args": {key: fixed}})
        )
    }
}

/// hint 中第一个单引号括起的片段，如 "Did you mean 'convs'?" → convs
fn quoted(hint: &str) -> Option<String> {
    let start = hint.find('\'')?;
    let rest = &hint[start + 1..];
    let end = rest.find('\'')?;
    let s = &rest[..end];
    (!s.is_empty()).then(|| s.to_string())
}

fn render(data: &serde_json::Value) -> String {
    match data {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        Ok(self.respond(messages))
    }

    async fn complete_stream(&self, messages: &[Message]) -> Result<TokenStream, LlmError> {
        let content = self.respond(messages);
        Ok(Box::pin(stream::iter(chunk(&content).into_iter().map(Ok))))
    }
}
