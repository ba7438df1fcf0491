//! web_search 工具：返回预置的搜索结果（离线）
//!
//! 气候类查询不带 "recent" 时返回带 hint 的失败，提示加上时间限定。

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::tools::{
    ParamSpec, ParamType, Tool, ToolCategory, ToolError, ToolMetadata, ToolResult, ToolSchema,
};

pub struct WebSearchTool {
    schema: ToolSchema,
    metadata: ToolMetadata,
}

impl WebSearchTool {
    pub fn new() -> Self {
        Self {
            schema: ToolSchema::new(
                "web_search",
                "Search the web for information and recent data.",
            )
            .param(ParamSpec::required(
                "query",
                ParamType::String,
                "Search terms, e.g., 'recent climate change data'.",
            )),
            metadata: ToolMetadata::new(ToolCategory::WebSearch)
                .example(
                    "Search for recent climate data",
                    json!({"query": "recent climate change data"}),
                    json!({"ok": true, "data": {"results": [{"title": "2024 Climate Report"}]}}),
                )
                .common_error(
                    "no results",
                    "Try more specific search terms or add 'recent' for current information",
                )
                .learning_hint(
                    "old data",
                    "Add 'recent' or '2024' to get current information",
                )
                .tags(&["search", "web", "research"]),
        }
    }
}

impl Default for WebSearchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    async fn run(&self, args: &Map<String, Value>) -> Result<ToolResult, ToolError> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::MissingArgument("query".to_string()))?;
        let lower = query.to_lowercase();

        if lower.contains("climate change") {
            if !lower.contains("recent") {
                return Ok(ToolResult::failure(
                    format!("Results for '{}' are outdated", query),
                    Some(format!("Try searching for 'recent {}' for more current results", query)),
                )
                .with_meta("query", query));
            }
            return Ok(ToolResult::ok(json!({
                "results": [
                    {"title": "2024 Climate Report", "snippet": "Global temperatures rose 1.2°C above pre-industrial levels"},
                    {"title": "Arctic Ice Data", "snippet": "Sea ice extent decreased by 13% per decade since 1979"}
                ]
            }))
            .with_meta("query", query));
        }

        if lower.contains("ai research") {
            return Ok(ToolResult::ok(json!({
                "results": [
                    {"title": "Latest AI Breakthroughs", "snippet": "LLMs achieve 95% accuracy on reasoning benchmarks"},
                    {"title": "AI Safety Progress", "snippet": "New alignment techniques show promising results"}
                ]
            }))
            .with_meta("query", query));
        }

        Err(ToolError::Failed(format!("No results found for '{}'", query)))
    }
}
