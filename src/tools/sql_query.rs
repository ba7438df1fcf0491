//! sql_query 工具：查询模拟的公司指标库
//!
//! 列名拼错时返回带 hint 的失败（conversions → "Did you mean 'convs'?"），用于演示「失败 → 学习 → 修正」。

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::tools::{
    ParamSpec, ParamType, Tool, ToolCategory, ToolError, ToolMetadata, ToolResult, ToolSchema,
};

/// 模拟库表：(列名, 类型, 说明, 样例值)
const COLUMNS: &[(&str, &str, &str, f64)] = &[
    ("convs", "integer", "Conversion count", 12345.0),
    ("users", "integer", "User count", 87650.0),
    ("revenue", "float", "Revenue amount", 156789.5),
    ("clicks", "integer", "Click count", 234567.0),
    ("impressions", "integer", "Impression count", 1234567.0),
];

pub struct SqlQueryTool {
    schema: ToolSchema,
    metadata: ToolMetadata,
}

impl SqlQueryTool {
    pub fn new() -> Self {
        Self {
            schema: ToolSchema::new(
                "sql_query",
                "Query the company database for various metrics and data.",
            )
            .param(ParamSpec::required(
                "column",
                ParamType::String,
                "The column to query, e.g., 'users', 'revenue', 'convs'.",
            )),
            metadata: ToolMetadata::new(ToolCategory::Database)
                .example(
                    "Query conversion data",
                    json!({"column": "convs"}),
                    json!({"ok": true, "data": 12345}),
                )
                .common_error("'conversions'", "Did you mean 'convs'?")
                .common_error(
                    "not found",
                    "Check if the column name is spelled correctly. Common columns: 'convs', 'users', 'revenue'",
                )
                .learning_hint(
                    "conversion",
                    "The correct column name is 'convs', not 'conversion' or 'conversions'",
                )
                .tags(&["database", "analytics", "metrics"]),
        }
    }
}

impl Default for SqlQueryTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for SqlQueryTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    async fn run(&self, args: &Map<String, Value>) -> Result<ToolResult, ToolError> {
        let column = args
            .get("column")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::MissingArgument("column".to_string()))?;

        let Some((name, kind, description, value)) =
            COLUMNS.iter().find(|(name, ..)| *name == column)
        else {
            return Err(ToolError::Failed(format!("Column '{}' not found", column)));
        };

        let data = if *kind == "integer" {
            json!(*value as i64)
        } else {
            json!(value)
        };
        Ok(ToolResult::ok(data).with_meta(
            "column_info",
            json!({"name": name, "type": kind, "description": description}),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(column: &str) -> Map<String, Value> {
        json!({ "column": column }).as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_known_column() {
        let r = SqlQueryTool::new().run(&args("convs")).await.unwrap();
        assert!(r.success);
        assert_eq!(r.data, Some(json!(12345)));
        assert_eq!(r.metadata["column_info"]["type"], "integer");
    }

    #[tokio::test]
    async fn test_conversions_hint_through_registry() {
        let registry = crate::tools::ToolRegistry::with_defaults();
        let r = registry.execute("sql_query", args("conversions")).await;
        assert!(!r.success);
        assert_eq!(r.error.as_deref(), Some("Column 'conversions' not found"));
        assert_eq!(r.hint.as_deref(), Some("Did you mean 'convs'?"));
    }

    #[tokio::test]
    async fn test_other_unknown_column_gets_generic_hint() {
        let registry = crate::tools::ToolRegistry::with_defaults();
        let r = registry.execute("sql_query", args("signups")).await;
        assert!(r.hint.unwrap().contains("Common columns"));
    }
}
