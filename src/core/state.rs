//! 状态定义：编排阶段与重试策略
//!
//! AgentPhase 是对外事件的 phase 字段；Strategy 决定失败后如何重新请求模型。

use serde::{Deserialize, Serialize};

/// 对外事件的阶段（INITIALIZE 与 VERIFY 是内部步骤，不单独发事件）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Propose,
    /// 流式 Token（EXTRACT 过程中逐个推送）
    Stream,
    /// 本轮的 TOOL_CALL 载荷无法解析（不执行工具，单独成事件）
    ParseError,
    Execute,
    /// 与 Execute 成对出现
    ToolResult,
    Learn,
    Success,
    Error,
}

impl AgentPhase {
    /// 终止阶段：每个会话恰好一次
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentPhase::Success | AgentPhase::Error)
    }
}

/// 重试策略
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// 多轮：每次重试都把完整历史作为新的顶层请求重发，成功后再发一轮生成最终回答（计数）
    #[default]
    IndependentRetry,
    /// 单轮：在同一个生成请求上继续（同一 request id），续写不计为新的顶层调用
    ContinuedContext,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::IndependentRetry => "independent_retry",
            Strategy::ContinuedContext => "continued_context",
        }
    }

    /// 解析配置中的策略名；兼容旧名 multi_pass / single_pass
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().replace('-', "_").as_str() {
            "independent_retry" | "multi_pass" => Some(Strategy::IndependentRetry),
            "continued_context" | "single_pass" => Some(Strategy::ContinuedContext),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parse() {
        assert_eq!(Strategy::parse("independent_retry"), Some(Strategy::IndependentRetry));
        assert_eq!(Strategy::parse("Continued-Context"), Some(Strategy::ContinuedContext));
        assert_eq!(Strategy::parse("single_pass"), Some(Strategy::ContinuedContext));
        assert_eq!(Strategy::parse("bogus"), None);
    }

    #[test]
    fn test_terminal_phases() {
        assert!(AgentPhase::Success.is_terminal());
        assert!(AgentPhase::Error.is_terminal());
        assert!(!AgentPhase::Propose.is_terminal());
    }

    #[test]
    fn test_phase_serializes_snake_case() {
        let s = serde_json::to_string(&AgentPhase::ToolResult).unwrap();
        assert_eq!(s, "\"tool_result\"");
        let s = serde_json::to_string(&AgentPhase::ParseError).unwrap();
        assert_eq!(s, "\"parse_error\"");
    }
}
