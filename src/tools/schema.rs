//! TOOL_CALL 负载的 JSON Schema（schemars 自动生成）
//!
//! 拼入 system prompt，减少模型输出格式错误。

use schemars::{schema_for, JsonSchema};
use std::collections::HashMap;

/// `TOOL_CALL: {"name": "...", "args": {...}}` 的负载格式（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallPayload {
    /// 工具名，如 sql_query、web_search
    pub name: String,
    /// 工具参数，按工具 schema 而定（column、query 等）；可省略，缺省为 {}
    #[serde(default)]
    pub args: HashMap<String, serde_json::Value>,
}

/// 返回工具调用负载的 JSON Schema 字符串
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolCallPayload);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| String::new())
}
