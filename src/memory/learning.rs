//! 会话内学习：从失败结果的 hint 中提取模式，并在下一轮前判断是否需要注入学习提醒
//!
//! 置信度是固定策略常量（不根据成败统计计算）；模式只在当前会话内有效，不持久化、不跨会话。
//! 学习只通过上下文注入生效，从不直接改写 ToolCall 的参数。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::memory::{ConversationMemory, Role};
use crate::tools::{ToolCall, ToolResult};

/// 新模式的初始置信度
pub const LEARNED_PATTERN_CONFIDENCE: f64 = 0.8;

/// learned_patterns_section 中展示的最近模式条数
const RECENT_PATTERNS_SHOWN: usize = 3;

/// 模式类型；目前只有 hint 一种
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Hint,
}

/// 从失败中提取的学习模式
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LearningPattern {
    pub kind: PatternKind,
    /// 由工具名 + 参数快照派生的上下文键
    pub context: String,
    /// 来自失败结果的 hint 原文
    pub solution: String,
    pub confidence: f64,
    pub usage_count: u32,
}

/// 上下文键：`Tool 'sql_query' with args {"column":"conversions"}`
///
/// serde_json::Map 默认按键排序，同一组参数总是得到同一个键
pub fn context_key(tool_name: &str, args: &Map<String, Value>) -> String {
    format!("Tool '{}' with args {}", tool_name, Value::Object(args.clone()))
}

fn references_tool(context: &str, tool_name: &str) -> bool {
    context.starts_with(&format!("Tool '{}' ", tool_name))
}

impl ConversationMemory {
    /// 从失败的工具交互中提取模式；成功或无 hint 时返回 None。
    /// 同一上下文键重复失败时只递增 usage_count，返回已有模式
    pub fn extract_learning_pattern(
        &mut self,
        call: &ToolCall,
        result: &ToolResult,
    ) -> Option<LearningPattern> {
        if result.success {
            return None;
        }
        let hint = result.hint.as_deref().filter(|h| !h.is_empty())?;
        let context = context_key(&call.name, &call.args);

        if let Some(existing) = self.patterns.iter_mut().find(|p| p.context == context) {
            existing.usage_count += 1;
            tracing::debug!(context = %existing.context, usage = existing.usage_count, "pattern reused");
            return Some(existing.clone());
        }

        let pattern = LearningPattern {
            kind: PatternKind::Hint,
            context,
            solution: hint.to_string(),
            confidence: LEARNED_PATTERN_CONFIDENCE,
            usage_count: 0,
        };
        tracing::info!(solution = %pattern.solution, "learned new pattern");
        self.patterns.push(pattern.clone());
        Some(pattern)
    }

    /// 与 call 同一工具的模式，按置信度降序（同置信度保持插入顺序）
    pub fn relevant_patterns(&self, call: &ToolCall) -> Vec<LearningPattern> {
        let mut relevant: Vec<LearningPattern> = self
            .patterns
            .iter()
            .filter(|p| p.kind == PatternKind::Hint && references_tool(&p.context, &call.name))
            .cloned()
            .collect();
        // sort_by 是稳定排序
        relevant.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        relevant
    }

    /// 是否需要注入学习提醒：有相关模式、最近一条 tool 消息是带 hint 的失败、且某个模式的
    /// solution 是该 hint 的子串时返回提醒文本
    pub fn should_apply_learning(&self, call: &ToolCall) -> Option<String> {
        let patterns = self.relevant_patterns(call);
        if patterns.is_empty() {
            return None;
        }
        let last = self
            .messages()
            .iter()
            .rev()
            .find(|m| m.role == Role::Tool)
            .and_then(|m| ToolResult::from_wire_json(&m.content))?;
        if last.success {
            return None;
        }
        let hint = last.hint.as_deref()?;
        patterns
            .iter()
            .find(|p| hint.contains(p.solution.as_str()))
            .map(|p| {
                format!(
                    "LEARNING ALERT: Previous attempt failed with hint '{}'. Apply learned pattern: {}",
                    hint, p.solution
                )
            })
    }

    /// 最近几条模式的 solution 列表，拼到学习提醒后面
    pub fn learned_patterns_section(&self) -> String {
        if self.patterns.is_empty() {
            return String::new();
        }
        let start = self.patterns.len().saturating_sub(RECENT_PATTERNS_SHOWN);
        let mut out =
            String::from("LEARNED PATTERNS (apply these to avoid repeating mistakes):\n");
        for p in &self.patterns[start..] {
            out.push_str("- ");
            out.push_str(&p.solution);
            out.push('\n');
        }
        out
    }
}
