//! 流式工具调用提取器
//!
//! 逐 token 累积本轮输出，找到哨兵（默认 `TOOL_CALL:`）后对其后的负载做严格 JSON 解析：
//! - 负载不完整（解析器报 EOF）→ NeedMore，继续累积
//! - 语法/数据错误、不是合法调用对象、缓冲超限 → Malformed
//! - 解析成功 → Parsed，冻结缓冲作为本轮 assistant 内容；每轮至多一个调用，之后的 token 被忽略
//!
//! 流结束时由 finish 给出本轮结论：自然语言回答、工具调用或解析错误。

use serde_json::{Map, Value};

use crate::tools::ToolCall;

/// 默认哨兵
pub const DEFAULT_SENTINEL: &str = "TOOL_CALL:";

/// 单轮缓冲上限（1MB）
pub const MAX_BUFFER_SIZE: usize = 1_048_576;

/// push 单个 token 的结果
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractStep {
    NeedMore,
    Parsed(ToolCall),
    Malformed(String),
}

/// 一轮生成结束后的结论
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// 无哨兵：整轮文本即回答（已 trim，可能为空）
    Answer(String),
    /// 解析出工具调用；content 为冻结的本轮文本
    Call { call: ToolCall, content: String },
    ParseError { content: String, reason: String },
}

#[derive(Debug)]
enum State {
    Scanning,
    /// 已找到哨兵，负载从该字节偏移开始
    Payload(usize),
    Parsed(ToolCall),
    Malformed(String),
}

#[derive(Debug)]
pub struct CallExtractor {
    sentinel: String,
    buffer: String,
    state: State,
    max_buffer_size: usize,
}

impl Default for CallExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_SENTINEL)
    }
}

impl CallExtractor {
    pub fn new(sentinel: &str) -> Self {
        Self {
            sentinel: sentinel.to_string(),
            buffer: String::new(),
            state: State::Scanning,
            max_buffer_size: MAX_BUFFER_SIZE,
        }
    }

    pub fn with_max_buffer(mut self, max: usize) -> Self {
        self.max_buffer_size = max;
        self
    }

    /// 已得出结论（Parsed / Malformed），后续 token 不再处理
    pub fn is_sealed(&self) -> bool {
        matches!(self.state, State::Parsed(_) | State::Malformed(_))
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn push(&mut self, token: &str) -> ExtractStep {
        if self.is_sealed() {
            return ExtractStep::NeedMore;
        }
        if self.buffer.len() + token.len() > self.max_buffer_size {
            let reason = format!(
                "turn buffer exceeds maximum of {} bytes",
                self.max_buffer_size
            );
            self.state = State::Malformed(reason.clone());
            return ExtractStep::Malformed(reason);
        }

        // 哨兵可能跨 token：从上次末尾回退 sentinel.len() - 1 字节开始搜索
        let mut search_from = self
            .buffer
            .len()
            .saturating_sub(self.sentinel.len().saturating_sub(1));
        while !self.buffer.is_char_boundary(search_from) {
            search_from -= 1;
        }
        self.buffer.push_str(token);

        if let State::Scanning = self.state {
            match self.buffer[search_from..].find(&self.sentinel) {
                Some(pos) => {
                    self.state = State::Payload(search_from + pos + self.sentinel.len());
                }
                None => return ExtractStep::NeedMore,
            }
        }

        let State::Payload(start) = self.state else {
            return ExtractStep::NeedMore;
        };
        match parse_payload(&self.buffer[start..]) {
            Ok(None) => ExtractStep::NeedMore,
            Ok(Some(call)) => {
                self.state = State::Parsed(call.clone());
                ExtractStep::Parsed(call)
            }
            Err(reason) => {
                self.state = State::Malformed(reason.clone());
                ExtractStep::Malformed(reason)
            }
        }
    }

    /// 流结束：给出本轮结论
    pub fn finish(self) -> TurnOutcome {
        let content = self.buffer;
        match self.state {
            State::Scanning => TurnOutcome::Answer(content.trim().to_string()),
            State::Parsed(call) => TurnOutcome::Call { call, content },
            State::Malformed(reason) => TurnOutcome::ParseError { content, reason },
            State::Payload(start) => match parse_payload(&content[start..]) {
                Ok(Some(call)) => TurnOutcome::Call { call, content },
                Ok(None) => TurnOutcome::ParseError {
                    reason: "stream ended before the tool call payload was complete".to_string(),
                    content,
                },
                Err(reason) => TurnOutcome::ParseError { content, reason },
            },
        }
    }
}

/// Ok(None)：负载不完整；Err：不可恢复的格式错误
fn parse_payload(payload: &str) -> Result<Option<ToolCall>, String> {
    let payload = payload.trim_start();
    if payload.is_empty() {
        return Ok(None);
    }
    // 只取第一个 JSON 值，其后的文本忽略
    let mut values = serde_json::Deserializer::from_str(payload).into_iter::<Value>();
    match values.next() {
        None => Ok(None),
        Some(Err(e)) if e.is_eof() => Ok(None),
        Some(Err(e)) => Err(format!("invalid tool call JSON: {}", e)),
        Some(Ok(value)) => call_from_value(value).map(Some),
    }
}

fn call_from_value(value: Value) -> Result<ToolCall, String> {
    let Value::Object(mut obj) = value else {
        return Err("tool call payload must be a JSON object".to_string());
    };
    let name = match obj.remove("name") {
        Some(Value::String(name)) if !name.trim().is_empty() => name,
        _ => return Err("tool call payload needs a non-empty string 'name'".to_string()),
    };
    let raw_args = obj.remove("args").or_else(|| obj.remove("arguments"));
    let args = match raw_args {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(args)) => args,
        // OpenAI 风格：arguments 为 JSON 字符串
        Some(Value::String(s)) => match serde_json::from_str::<Value>(&s) {
            Ok(Value::Object(args)) => args,
            _ => return Err("tool call 'args' string is not a JSON object".to_string()),
        },
        Some(_) => return Err("tool call 'args' must be an object".to_string()),
    };
    Ok(ToolCall::new(name, args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn feed(tokens: &[&str]) -> (Vec<ExtractStep>, TurnOutcome) {
        let mut ex = CallExtractor::default();
        let steps = tokens.iter().map(|t| ex.push(t)).collect();
        (steps, ex.finish())
    }

    fn parsed(steps: &[ExtractStep]) -> Vec<&ToolCall> {
        steps
            .iter()
            .filter_map(|s| match s {
                ExtractStep::Parsed(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_single_call_after_free_text() {
        let (steps, outcome) = feed(&[
            "Let me check the data. TOO",
            "L_CALL: {\"name\": \"sql_",
            "query\", \"args\": {\"column\": \"convs\"}}",
        ]);
        let calls = parsed(&steps);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "sql_query");
        assert_eq!(calls[0].args["column"], "convs");
        match outcome {
            TurnOutcome::Call { content, .. } => assert!(content.starts_with("Let me check")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_truncated_payload_is_parse_error_only_at_end() {
        let (steps, outcome) = feed(&["TOOL_CALL: {\"name\": \"sql_query\", \"args\": {\"col"]);
        assert_eq!(steps, vec![ExtractStep::NeedMore]);
        assert!(matches!(outcome, TurnOutcome::ParseError { .. }));
    }

    #[test]
    fn test_only_first_of_multiple_sentinels() {
        let (steps, _) = feed(&[
            "TOOL_CALL: {\"name\": \"a\"}\n",
            "TOOL_CALL: {\"name\": \"b\"}",
        ]);
        let calls = parsed(&steps);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "a");
        assert!(calls[0].args.is_empty());
    }

    #[test]
    fn test_malformed_payloads() {
        for bad in [
            "TOOL_CALL: not json",
            "TOOL_CALL: [1, 2]",
            "TOOL_CALL: {\"args\": {}}",
            "TOOL_CALL: {\"name\": \"x\", \"args\": 3}",
        ] {
            let (steps, outcome) = feed(&[bad]);
            assert!(matches!(steps[0], ExtractStep::Malformed(_)), "{}", bad);
            assert!(matches!(outcome, TurnOutcome::ParseError { .. }));
        }
    }

    #[test]
    fn test_arguments_alias_and_trailing_text() {
        let (steps, _) = feed(&[
            "TOOL_CALL: {\"name\": \"web_search\", \"arguments\": {\"query\": \"ai research\"}} and then I'll wait",
        ]);
        let calls = parsed(&steps);
        assert_eq!(calls[0].args["query"], json!("ai research"));
    }

    #[test]
    fn test_arguments_as_json_string() {
        let (steps, _) = feed(&[r#"TOOL_CALL: {"name": "sql_query", "arguments": "{\"column\": \"users\"}"}"#]);
        assert_eq!(parsed(&steps)[0].args["column"], "users");
    }

    #[test]
    fn test_no_sentinel_is_answer() {
        let (steps, outcome) = feed(&["The answer ", "is 12345. "]);
        assert!(steps.iter().all(|s| *s == ExtractStep::NeedMore));
        assert_eq!(outcome, TurnOutcome::Answer("The answer is 12345.".to_string()));
    }

    #[test]
    fn test_tokens_after_parse_are_ignored() {
        let mut ex = CallExtractor::default();
        assert!(matches!(
            ex.push("TOOL_CALL: {\"name\": \"a\"}"),
            ExtractStep::Parsed(_)
        ));
        assert_eq!(ex.push(" TOOL_CALL: {\"name\": \"b\"}"), ExtractStep::NeedMore);
        assert!(!ex.buffer().contains("\"b\""));
    }

    #[test]
    fn test_buffer_cap() {
        let mut ex = CallExtractor::default().with_max_buffer(16);
        assert_eq!(ex.push("TOOL_CALL: {"), ExtractStep::NeedMore);
        assert!(matches!(ex.push("\"name\": \"x\"}"), ExtractStep::Malformed(_)));
    }

    #[test]
    fn test_custom_sentinel_and_multibyte_text() {
        let mut ex = CallExtractor::new("<<CALL>>");
        assert_eq!(ex.push("先查一下数据 <<CA"), ExtractStep::NeedMore);
        assert!(matches!(
            ex.push("LL>> {\"name\": \"sql_query\"}"),
            ExtractStep::Parsed(_)
        ));
    }
}
