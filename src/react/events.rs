//! 会话过程事件：用于流式/SSE 展示提议、工具调用、结果、学习与终态
//!
//! 每个事件携带 session_id、时间戳与当时的指标快照。EventSink 保证恰好一个终态事件（success | error）：
//! 终态一经发出即封口，之后的任何事件都被丢弃。

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::core::AgentPhase;
use crate::memory::LearningPattern;
use crate::tools::ToolResult;

/// 会话指标快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AgentMetrics {
    /// 顶层模型调用次数
    pub llm_calls: u32,
    /// 同一请求上的续写次数（continued-context）
    pub continuations: u32,
    pub tool_calls: u32,
    /// 本会话累计 token（后端不提供时为 0）
    pub total_tokens: u64,
    /// 会话结束时填入
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

/// 事件内容，按 phase 区分
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "phase", content = "payload", rename_all = "snake_case")]
pub enum EventPayload {
    /// 即将调用模型（顶层请求或续写）
    Propose { attempt: usize, continuation: bool },
    /// 模型输出的一段 Token
    Stream { text: String },
    /// 载荷解析失败：合成的失败结果（带格式提示），不对应任何工具调用
    ParseError { reason: String, result: ToolResult },
    /// 调用工具
    Execute {
        call_id: String,
        tool: String,
        args: Value,
    },
    /// 工具结果，紧随同一 call_id 的 Execute
    ToolResult {
        call_id: String,
        tool: String,
        result: ToolResult,
    },
    /// 验证失败后的学习：新学到（或复用）的模式与学习提醒
    Learn {
        attempt: usize,
        pattern: Option<LearningPattern>,
        alert: Option<String>,
    },
    Success { answer: String },
    Error { kind: String, message: String },
}

impl EventPayload {
    pub fn phase(&self) -> AgentPhase {
        match self {
            EventPayload::Propose { .. } => AgentPhase::Propose,
            EventPayload::Stream { .. } => AgentPhase::Stream,
            EventPayload::ParseError { .. } => AgentPhase::ParseError,
            EventPayload::Execute { .. } => AgentPhase::Execute,
            EventPayload::ToolResult { .. } => AgentPhase::ToolResult,
            EventPayload::Learn { .. } => AgentPhase::Learn,
            EventPayload::Success { .. } => AgentPhase::Success,
            EventPayload::Error { .. } => AgentPhase::Error,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase().is_terminal()
    }
}

/// 单个会话事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
pub struct AgentEvent {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub metrics: AgentMetrics,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl AgentEvent {
    pub fn phase(&self) -> AgentPhase {
        self.payload.phase()
    }
}

/// 会话事件出口：可选的 mpsc 发送端 + 终态封口标记
#[derive(Debug)]
pub struct EventSink {
    session_id: String,
    tx: Option<mpsc::UnboundedSender<AgentEvent>>,
    sealed: bool,
}

impl EventSink {
    pub fn new(session_id: impl Into<String>, tx: Option<mpsc::UnboundedSender<AgentEvent>>) -> Self {
        Self {
            session_id: session_id.into(),
            tx,
            sealed: false,
        }
    }

    /// 发送事件；已封口时丢弃并返回 false。接收端已关闭不算错误
    pub fn emit(&mut self, metrics: AgentMetrics, payload: EventPayload) -> bool {
        if self.sealed {
            tracing::debug!(phase = ?payload.phase(), "event after terminal dropped");
            return false;
        }
        if payload.is_terminal() {
            self.sealed = true;
        }
        if let Some(tx) = &self.tx {
            let _ = tx.send(AgentEvent {
                session_id: self.session_id.clone(),
                timestamp: Utc::now(),
                metrics,
                payload,
            });
        }
        true
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }
}
