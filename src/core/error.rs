//! 会话级错误类型
//!
//! 只有终止会话的错误才以 AgentError 表达；解析失败、未知工具、参数错误、校验失败等可恢复错误
//! 一律转为失败的 ToolResult 写回对话（见 [`FailureKind`]）。

use thiserror::Error;

use crate::llm::LlmError;

/// 终止会话的错误（ERROR 事件的来源）
#[derive(Error, Debug)]
pub enum AgentError {
    /// 生成服务不可达或返回错误；本层不重试，由上层决定是否开新会话
    #[error("Transport error: {0}")]
    Transport(#[from] LlmError),

    #[error("Propose timed out after {0}s")]
    ProposeTimeout(u64),

    #[error("Agent failed to produce a verified tool result after {0} attempts")]
    MaxAttemptsExceeded(usize),

    #[error("Cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),
}

impl AgentError {
    /// 用于事件 payload 的简短分类名
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Transport(_) => "transport_error",
            AgentError::ProposeTimeout(_) => "propose_timeout",
            AgentError::MaxAttemptsExceeded(_) => "max_attempts_exceeded",
            AgentError::Cancelled => "cancelled",
            AgentError::Config(_) => "config_error",
        }
    }
}

/// 可恢复错误的分类，写入 ToolResult.metadata["failure_kind"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// TOOL_CALL 之后的 JSON 无法解析
    ParseError,
    ToolNotFound,
    /// 缺参、多参或类型不符
    ToolArgumentError,
    /// 工具内部报错、超时或 panic
    ToolFailed,
    /// 工具正常返回，但结果未通过校验
    VerificationFailure,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::ParseError => "parse_error",
            FailureKind::ToolNotFound => "tool_not_found",
            FailureKind::ToolArgumentError => "tool_argument_error",
            FailureKind::ToolFailed => "tool_failed",
            FailureKind::VerificationFailure => "verification_failure",
        }
    }
}
