//! 工具层数据类型：调用、结果、声明式 schema、元数据与错误

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::FailureKind;

/// 从模型输出中解析出的工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: Map<String, Value>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            args,
        }
    }
}

/// 工具执行结果；hint 只是给下一轮生成的建议，从不自动应用到参数
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl ToolResult {
    pub fn ok(data: impl Into<Value>) -> Self {
        Self {
            success: true,
            data: Some(data.into()),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>, hint: Option<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            hint,
            ..Default::default()
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn with_failure_kind(self, kind: FailureKind) -> Self {
        self.with_meta("failure_kind", kind.as_str())
    }

    pub fn failure_kind(&self) -> Option<&str> {
        self.metadata.get("failure_kind").and_then(|v| v.as_str())
    }

    /// 写入 tool 消息的线格式：{"ok","data","error","hint"}
    pub fn to_wire_json(&self) -> Value {
        serde_json::json!({
            "ok": self.success,
            "data": self.data,
            "error": self.error,
            "hint": self.hint,
        })
    }

    /// 解析线格式；兼容 "ok" 与 "success" 两种成功标记
    pub fn from_wire_json(content: &str) -> Option<Self> {
        let v: Value = serde_json::from_str(content).ok()?;
        let obj = v.as_object()?;
        let success = obj
            .get("ok")
            .or_else(|| obj.get("success"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let text = |key: &str| obj.get(key).and_then(|v| v.as_str()).map(String::from);
        Some(Self {
            success,
            data: obj.get("data").filter(|d| !d.is_null()).cloned(),
            error: text("error"),
            hint: text("hint"),
            metadata: Map::new(),
        })
    }
}

/// 工具分类，用于组织与发现
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Database,
    WebSearch,
    DataAnalysis,
    Math,
    FileSystem,
    Api,
    Utility,
}

impl ToolCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCategory::Database => "database",
            ToolCategory::WebSearch => "web_search",
            ToolCategory::DataAnalysis => "data_analysis",
            ToolCategory::Math => "math",
            ToolCategory::FileSystem => "file_system",
            ToolCategory::Api => "api",
            ToolCategory::Utility => "utility",
        }
    }
}

/// 工具用法示例（写入 schema 供模型参考）
#[derive(Debug, Clone, Serialize)]
pub struct ToolExample {
    pub description: String,
    pub args: Value,
    pub expected: Value,
}

/// 工具元数据：分类、示例、错误到 hint 的映射
#[derive(Debug, Clone)]
pub struct ToolMetadata {
    pub category: ToolCategory,
    pub examples: Vec<ToolExample>,
    /// (错误子串, hint)：错误信息（小写）包含子串时使用该 hint
    pub common_errors: Vec<(String, String)>,
    /// (参数子串, hint)：任一参数值（小写）包含子串时使用该 hint
    pub learning_hints: Vec<(String, String)>,
    pub tags: Vec<String>,
    pub version: String,
}

impl ToolMetadata {
    pub fn new(category: ToolCategory) -> Self {
        Self {
            category,
            examples: Vec::new(),
            common_errors: Vec::new(),
            learning_hints: Vec::new(),
            tags: Vec::new(),
            version: "1.0".to_string(),
        }
    }

    pub fn example(mut self, description: &str, args: Value, expected: Value) -> Self {
        self.examples.push(ToolExample {
            description: description.to_string(),
            args,
            expected,
        });
        self
    }

    pub fn common_error(mut self, pattern: &str, hint: &str) -> Self {
        self.common_errors.push((pattern.to_string(), hint.to_string()));
        self
    }

    pub fn learning_hint(mut self, pattern: &str, hint: &str) -> Self {
        self.learning_hints.push((pattern.to_string(), hint.to_string()));
        self
    }

    pub fn tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    /// 错误 → hint：先按错误子串匹配，再按参数值启发式匹配，都不中返回 None
    pub fn hint_for_error(&self, args: &Map<String, Value>, error: &str) -> Option<String> {
        let error = error.to_lowercase();
        if let Some((_, hint)) = self
            .common_errors
            .iter()
            .find(|(pattern, _)| error.contains(&pattern.to_lowercase()))
        {
            return Some(hint.clone());
        }
        self.learning_hints
            .iter()
            .find(|(pattern, _)| {
                let pattern = pattern.to_lowercase();
                args.values()
                    .any(|v| value_text(v).to_lowercase().contains(&pattern))
            })
            .map(|(_, hint)| hint.clone())
    }
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// 参数类型（JSON Schema 基本类型）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }

    pub fn accepts(&self, v: &Value) -> bool {
        match self {
            ParamType::String => v.is_string(),
            ParamType::Integer => v.is_i64() || v.is_u64(),
            ParamType::Number => v.is_number(),
            ParamType::Boolean => v.is_boolean(),
            ParamType::Array => v.is_array(),
            ParamType::Object => v.is_object(),
        }
    }
}

/// 单个参数声明
#[derive(Debug, Clone, Serialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParamType,
    pub description: String,
    pub required: bool,
}

impl ParamSpec {
    pub fn required(name: &str, kind: ParamType, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            description: description.to_string(),
            required: true,
        }
    }

    pub fn optional(name: &str, kind: ParamType, description: &str) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind, description)
        }
    }
}

/// 工具的声明式 schema：名称、描述、参数列表
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParamSpec>,
}

impl ToolSchema {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters: Vec::new(),
        }
    }

    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.parameters.push(spec);
        self
    }

    /// 转为 {"name","description","parameters":{"type":"object","properties",...,"required"}}
    pub fn to_json(&self) -> Value {
        let mut properties = Map::new();
        for p in &self.parameters {
            properties.insert(
                p.name.clone(),
                serde_json::json!({ "type": p.kind.as_str(), "description": p.description }),
            );
        }
        let required: Vec<&str> = self
            .parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "parameters": {
                "type": "object",
                "properties": properties,
                "required": required,
            }
        })
    }

    /// 按声明校验参数：缺必填、多余参数、类型不符
    pub fn validate(&self, args: &Map<String, Value>) -> Result<(), ToolError> {
        for p in self.parameters.iter().filter(|p| p.required) {
            if !args.contains_key(&p.name) {
                return Err(ToolError::MissingArgument(p.name.clone()));
            }
        }
        for (key, value) in args {
            let Some(spec) = self.parameters.iter().find(|p| &p.name == key) else {
                return Err(ToolError::UnexpectedArgument(key.clone()));
            };
            if !spec.kind.accepts(value) {
                return Err(ToolError::InvalidArgument {
                    name: key.clone(),
                    reason: format!("expected {}", spec.kind.as_str()),
                });
            }
        }
        Ok(())
    }

    /// 参数签名，如 `column: string, limit?: integer`
    pub fn signature(&self) -> String {
        self.parameters
            .iter()
            .map(|p| {
                format!(
                    "{}{}: {}",
                    p.name,
                    if p.required { "" } else { "?" },
                    p.kind.as_str()
                )
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// 工具内部错误；由 ToolRegistry 捕获并转为失败的 ToolResult，从不向编排器传播
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("missing required argument '{0}'")]
    MissingArgument(String),

    #[error("unexpected argument '{0}'")]
    UnexpectedArgument(String),

    #[error("invalid argument '{name}': {reason}")]
    InvalidArgument { name: String, reason: String },

    #[error("{0}")]
    Failed(String),

    #[error("tool timed out after {0}s")]
    Timeout(u64),

    #[error("tool panicked: {0}")]
    Panicked(String),
}

impl ToolError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ToolError::MissingArgument(_)
            | ToolError::UnexpectedArgument(_)
            | ToolError::InvalidArgument { .. } => FailureKind::ToolArgumentError,
            ToolError::Failed(_) | ToolError::Timeout(_) | ToolError::Panicked(_) => {
                FailureKind::ToolFailed
            }
        }
    }
}
