//! 生成服务抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient：complete（非流式）、complete_stream（流式 Token）、
//! continue_stream（在同一 request id 上续写，供 continued-context 策略使用）。
//! 传输失败一律以 LlmError 返回，绝不混入 Token 内容。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;

use crate::memory::Message;

/// 流式 Token 序列；丢弃即释放底层请求
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// 生成服务错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    /// 连接失败、DNS、TLS 等
    #[error("transport: {0}")]
    Transport(String),

    /// 服务端返回错误
    #[error("api: {0}")]
    Api(String),

    /// 流中途断开或块格式错误
    #[error("stream: {0}")]
    Stream(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// 生成服务 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 流式完成，返回 Token 流（新的顶层请求）
    async fn complete_stream(&self, messages: &[Message]) -> Result<TokenStream, LlmError>;

    /// 在已有请求上继续生成。支持请求续写的后端（如带 request_id 的 vLLM）应覆盖此方法；
    /// 默认退化为新的 complete_stream
    async fn continue_stream(
        &self,
        request_id: &str,
        messages: &[Message],
    ) -> Result<TokenStream, LlmError> {
        let _ = request_id;
        self.complete_stream(messages).await
    }

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
