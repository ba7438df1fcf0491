pub mod registry;
pub mod schema;
pub mod sql_query;
pub mod types;
pub mod web_search;

pub use registry::{Tool, ToolAnalytics, ToolPerformance, ToolRegistry, ToolScope, ToolStats};
pub use schema::tool_call_schema_json;
pub use sql_query::SqlQueryTool;
pub use types::{
    ParamSpec, ParamType, ToolCall, ToolCategory, ToolError, ToolExample, ToolMetadata,
    ToolResult, ToolSchema,
};
pub use web_search::WebSearchTool;
