//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url），如本地 vLLM、OpenAI、自建代理。
//! tool 角色消息以 `EXEC_RESULT: ...` 的 user 消息发送。
//! continue_stream 在请求体中附带 `request_id`（vLLM 扩展字段），让同一会话的续写落在同一请求 id 上。
//! 流式请求开启 `stream_options.include_usage`，用量在最后一个块中返回；
//! 调用方提前丢弃流时，剩余部分在后台读完以记录用量。

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    ChatCompletionResponseStream, ChatCompletionStreamOptions, CreateChatCompletionRequest,
    CreateChatCompletionRequestArgs, CreateChatCompletionStreamResponse,
};
use async_openai::Client;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::Serialize;

use crate::llm::{LlmClient, LlmError, TokenStream};
use crate::memory::{Message, Role};

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容客户端：持有 Client 与 model 名
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiClient {
    /// api_key 为空时使用占位值（本地 vLLM 不校验 key）
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key.unwrap_or("none").to_string();
        let config = match base_url {
            Some(url) => OpenAIConfig::new().with_api_base(url).with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            usage: TokenUsage::new(),
        }
    }

    fn request(&self, messages: &[Message], stream: bool) -> Result<CreateChatCompletionRequest, LlmError> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model)
            .messages(to_openai_messages(messages)?)
            .temperature(0.0)
            .stream(stream);
        if stream {
            args.stream_options(ChatCompletionStreamOptions {
                include_usage: Some(true),
                include_obfuscation: None,
            });
        }
        args.build().map_err(invalid_request)
    }

    /// 把响应块流转换为 Token 流：记录用量块，取第一个 choice 的增量文本
    fn token_stream(&self, stream: ChatCompletionResponseStream) -> TokenStream {
        let usage = self.usage.clone();
        let tokens = stream.map(move |chunk| {
            let chunk = chunk.map_err(map_openai_error)?;
            if let Some(u) = &chunk.usage {
                usage.add(u.prompt_tokens as u64, u.completion_tokens as u64);
            }
            Ok(chunk
                .choices
                .first()
                .and_then(|c| c.delta.content.clone())
                .unwrap_or_default())
        });
        Box::pin(DrainOnDrop::new(Box::pin(tokens)))
    }
}

/// 续写请求：标准请求体 + vLLM 的 request_id 扩展字段
#[derive(Debug, Serialize)]
struct ContinuationRequest<'a> {
    #[serde(flatten)]
    inner: CreateChatCompletionRequest,
    request_id: &'a str,
}

/// 后台读完被提前丢弃的流的时间上限
const USAGE_DRAIN_LIMIT: Duration = Duration::from_secs(30);

/// 被丢弃时在后台读完剩余的块，使末尾的用量块仍被记录
struct DrainOnDrop {
    inner: Option<TokenStream>,
}

impl DrainOnDrop {
    fn new(inner: TokenStream) -> Self {
        Self { inner: Some(inner) }
    }
}

impl Stream for DrainOnDrop {
    type Item = Result<String, LlmError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };
        let next = inner.as_mut().poll_next(cx);
        if let Poll::Ready(None) = next {
            this.inner = None;
        }
        next
    }
}

impl Drop for DrainOnDrop {
    fn drop(&mut self) {
        let Some(mut rest) = self.inner.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let drain = async { while rest.next().await.is_some() {} };
                if tokio::time::timeout(USAGE_DRAIN_LIMIT, drain).await.is_err() {
                    tracing::debug!("usage drain timed out");
                }
            });
        }
    }
}

fn invalid_request(e: OpenAIError) -> LlmError {
    LlmError::InvalidRequest(e.to_string())
}

fn map_openai_error(e: OpenAIError) -> LlmError {
    match e {
        OpenAIError::Reqwest(e) => LlmError::Transport(e.to_string()),
        OpenAIError::ApiError(e) => LlmError::Api(e.message),
        OpenAIError::InvalidArgument(s) => LlmError::InvalidRequest(s),
        other => LlmError::Stream(other.to_string()),
    }
}

fn to_openai_messages(messages: &[Message]) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
    messages
        .iter()
        .map(|m| {
            let msg = match m.role {
                Role::System => ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map_err(invalid_request)?,
                ),
                Role::User => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map_err(invalid_request)?,
                ),
                Role::Tool => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(format!("EXEC_RESULT: {}", m.content))
                        .build()
                        .map_err(invalid_request)?,
                ),
                Role::Assistant => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map_err(invalid_request)?,
                ),
            };
            Ok(msg)
        })
        .collect()
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let request = self.request(messages, false)?;
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(map_openai_error)?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        Ok(response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default())
    }

    async fn complete_stream(&self, messages: &[Message]) -> Result<TokenStream, LlmError> {
        let request = self.request(messages, true)?;
        let stream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(map_openai_error)?;

        Ok(self.token_stream(stream))
    }

    async fn continue_stream(
        &self,
        request_id: &str,
        messages: &[Message],
    ) -> Result<TokenStream, LlmError> {
        let request = ContinuationRequest {
            inner: self.request(messages, true)?,
            request_id,
        };
        let stream: ChatCompletionResponseStream = self
            .client
            .chat()
            .create_stream_byot::<_, CreateChatCompletionStreamResponse>(request)
            .await
            .map_err(map_openai_error)?;
        Ok(self.token_stream(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_messages_become_exec_result() {
        let msgs = to_openai_messages(&[
            Message::system("sys"),
            Message::tool(r#"{"ok":true,"data":1}"#),
        ])
        .unwrap();
        assert_eq!(msgs.len(), 2);
        assert!(matches!(msgs[1], ChatCompletionRequestMessage::User(_)));
    }

    #[test]
    fn test_request_builds_with_stream_flag() {
        let client = OpenAiClient::new(Some("http://localhost:8000/v1"), "local-7b", None);
        let req = client.request(&[Message::user("hi")], true).unwrap();
        assert_eq!(req.model, "local-7b");
        assert_eq!(req.stream, Some(true));
        assert_eq!(req.stream_options.and_then(|o| o.include_usage), Some(true));

        let plain = client.request(&[Message::user("hi")], false).unwrap();
        assert!(plain.stream_options.is_none());
    }

    #[test]
    fn test_continuation_request_carries_request_id() {
        let client = OpenAiClient::new(None, "local-7b", None);
        let request = ContinuationRequest {
            inner: client.request(&[Message::user("hi")], true).unwrap(),
            request_id: "continued_context-1",
        };
        let v = serde_json::to_value(&request).unwrap();
        assert_eq!(v["request_id"], "continued_context-1");
        assert_eq!(v["model"], "local-7b");
        assert_eq!(v["stream"], true);
        assert_eq!(v["stream_options"]["include_usage"], true);
    }

    #[tokio::test]
    async fn test_dropped_stream_is_drained_for_usage() {
        let usage = TokenUsage::new();
        let recorder = usage.clone();
        let chunks = futures_util::stream::iter(["a", "b", "usage"]).map(move |t| -> Result<String, LlmError> {
            if t == "usage" {
                recorder.add(10, 5);
                return Ok(String::new());
            }
            Ok(t.to_string())
        });
        let mut stream = DrainOnDrop::new(Box::pin(chunks));
        assert_eq!(stream.next().await, Some(Ok("a".to_string())));
        drop(stream);
        for _ in 0..10 {
            if usage.get().2 == 15 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(usage.get(), (10, 5, 15));
    }
}
