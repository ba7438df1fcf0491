//! 工具注册表
//!
//! 所有工具实现 Tool trait（schema / metadata / run），由 ToolRegistry 按名注册、按分类索引。
//! execute 是编排器调用工具的唯一入口：未知工具、参数错误、工具报错、超时乃至 panic 都被就地捕获，
//! 经工具的「错误 → hint」映射转为失败的 ToolResult；同时更新每个工具的调用/成功计数并输出审计日志。
//!
//! 注册应在并发使用前完成，之后以 Arc<ToolRegistry> 只读共享；计数器为原子量，可被多个会话同时更新。

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::core::FailureKind;
use crate::tools::{ToolCategory, ToolError, ToolMetadata, ToolResult, ToolSchema};

/// 工具默认超时（秒）
const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 30;

/// 工具 trait：声明式 schema + 元数据 + 异步执行。编排器不需要知道工具的内部实现
#[async_trait]
pub trait Tool: Send + Sync {
    /// 名称、描述、参数声明（供模型理解与参数校验）
    fn schema(&self) -> &ToolSchema;

    /// 分类、示例、错误到 hint 的映射
    fn metadata(&self) -> &ToolMetadata;

    /// 错误 → hint；默认按元数据中的错误子串、参数启发式依次匹配
    fn hint_for_error(&self, args: &Map<String, Value>, error: &ToolError) -> Option<String> {
        self.metadata().hint_for_error(args, &error.to_string())
    }

    /// 执行工具。Ok 中的结果本身也可以是失败（带 hint）
    async fn run(&self, args: &Map<String, Value>) -> Result<ToolResult, ToolError>;
}

/// 单个工具的调用统计
#[derive(Debug, Default)]
pub struct ToolStats {
    calls: AtomicU64,
    successes: AtomicU64,
}

impl ToolStats {
    fn record(&self, success: bool) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn success_rate(&self) -> f64 {
        let calls = self.calls();
        if calls == 0 {
            return 0.0;
        }
        self.successes() as f64 / calls as f64
    }
}

struct Entry {
    tool: Arc<dyn Tool>,
    stats: ToolStats,
}

/// 工具范围：决定向模型展示哪些工具签名
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolScope {
    All,
    /// 场景名：sql / research / data_analysis / all
    Scenario(String),
    Named(Vec<String>),
}

impl ToolScope {
    pub fn scenario(name: &str) -> Self {
        ToolScope::Scenario(name.to_string())
    }

    fn tool_names(&self, registry: &ToolRegistry) -> Vec<String> {
        match self {
            ToolScope::All => registry.tool_names(),
            ToolScope::Named(names) => names.clone(),
            ToolScope::Scenario(s) => match s.as_str() {
                "all" => registry.tool_names(),
                "research" => vec!["web_search".to_string()],
                "data_analysis" => vec!["sql_query".to_string(), "web_search".to_string()],
                _ => vec!["sql_query".to_string()],
            },
        }
    }
}

/// 单个工具的表现
#[derive(Debug, Clone, Serialize)]
pub struct ToolPerformance {
    pub call_count: u64,
    pub success_count: u64,
    pub success_rate: f64,
    pub category: &'static str,
}

/// 注册表整体统计
#[derive(Debug, Clone, Serialize)]
pub struct ToolAnalytics {
    pub total_tools: usize,
    pub categories: BTreeMap<&'static str, usize>,
    pub tool_performance: BTreeMap<String, ToolPerformance>,
}

/// 工具注册表
pub struct ToolRegistry {
    tools: HashMap<String, Entry>,
    categories: BTreeMap<ToolCategory, Vec<String>>,
    timeout: Duration,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self {
            tools: HashMap::new(),
            categories: BTreeMap::new(),
            timeout: Duration::from_secs(DEFAULT_TOOL_TIMEOUT_SECS),
        }
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 内置演示工具：sql_query、web_search
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(crate::tools::SqlQueryTool::new());
        registry.register(crate::tools::WebSearchTool::new());
        registry
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 注册（同名覆盖，统计清零）并更新分类索引
    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.schema().name.clone();
        let category = tool.metadata().category;
        for names in self.categories.values_mut() {
            names.retain(|n| n != &name);
        }
        self.categories.entry(category).or_default().push(name.clone());
        self.tools.insert(
            name,
            Entry {
                tool: Arc::new(tool),
                stats: ToolStats::default(),
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|e| Arc::clone(&e.tool))
    }

    pub fn stats(&self, name: &str) -> Option<&ToolStats> {
        self.tools.get(name).map(|e| &e.stats)
    }

    pub fn tools_by_category(&self, category: ToolCategory) -> Vec<Arc<dyn Tool>> {
        self.categories
            .get(&category)
            .map(|names| names.iter().filter_map(|n| self.get(n)).collect())
            .unwrap_or_default()
    }

    /// 已注册工具名（排序，保证 hint 文本稳定）
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 单个工具的声明式 schema，附带分类、标签、版本与示例
    pub fn describe(&self, name: &str) -> Option<Value> {
        let entry = self.tools.get(name)?;
        let metadata = entry.tool.metadata();
        let mut schema = entry.tool.schema().to_json();
        if let Some(obj) = schema.as_object_mut() {
            obj.insert("category".to_string(), Value::from(metadata.category.as_str()));
            if !metadata.tags.is_empty() {
                obj.insert("tags".to_string(), Value::from(metadata.tags.clone()));
            }
            obj.insert("version".to_string(), Value::from(metadata.version.clone()));
            if !metadata.examples.is_empty() {
                obj.insert(
                    "examples".to_string(),
                    serde_json::to_value(&metadata.examples).unwrap_or_default(),
                );
            }
        }
        Some(schema)
    }

    /// 范围内工具的 schema 数组（pretty JSON），拼入用户 prompt
    pub fn signature(&self, scope: &ToolScope) -> String {
        let schemas: Vec<Value> = scope
            .tool_names(self)
            .iter()
            .filter_map(|n| self.describe(n))
            .collect();
        serde_json::to_string_pretty(&schemas).unwrap_or_else(|_| "[]".to_string())
    }

    /// 执行工具；从不返回错误，所有失败都体现在 ToolResult 中
    pub async fn execute(&self, name: &str, args: Map<String, Value>) -> ToolResult {
        let start = Instant::now();
        let Some(entry) = self.tools.get(name) else {
            let available = self.tool_names();
            tracing::warn!(tool = name, "unknown tool requested");
            return ToolResult::failure(
                format!("Tool '{}' not found", name),
                Some(format!(
                    "Tool '{}' does not exist. Available tools: {}",
                    name,
                    available.join(", ")
                )),
            )
            .with_failure_kind(FailureKind::ToolNotFound)
            .with_meta("available_tools", available);
        };

        let result = self.run_contained(entry, &args).await;
        entry.stats.record(result.success);

        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": name,
            "ok": result.success,
            "outcome": result.failure_kind().unwrap_or("ok"),
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(&args),
        });
        tracing::info!(audit = %audit, "tool");
        result
    }

    async fn run_contained(&self, entry: &Entry, args: &Map<String, Value>) -> ToolResult {
        let tool = &entry.tool;
        if let Err(e) = tool.schema().validate(args) {
            let hint = tool.hint_for_error(args, &e).unwrap_or_else(|| {
                format!(
                    "Invalid arguments for tool '{}': {}. Expected: ({})",
                    tool.schema().name,
                    e,
                    tool.schema().signature()
                )
            });
            return Self::from_error(e, Some(hint));
        }

        let run = AssertUnwindSafe(tool.run(args)).catch_unwind();
        let err = match tokio::time::timeout(self.timeout, run).await {
            Ok(Ok(Ok(result))) if result.success || result.failure_kind().is_some() => {
                return result
            }
            Ok(Ok(Ok(result))) => return result.with_failure_kind(FailureKind::ToolFailed),
            Ok(Ok(Err(e))) => e,
            Ok(Err(panic)) => ToolError::Panicked(panic_message(panic.as_ref())),
            Err(_) => ToolError::Timeout(self.timeout.as_secs()),
        };
        let hint = tool.hint_for_error(args, &err);
        Self::from_error(err, hint)
    }

    fn from_error(err: ToolError, hint: Option<String>) -> ToolResult {
        let kind = err.failure_kind();
        ToolResult::failure(err.to_string(), hint).with_failure_kind(kind)
    }

    /// 工具使用统计
    pub fn analytics(&self) -> ToolAnalytics {
        let categories = self
            .categories
            .iter()
            .filter(|(_, names)| !names.is_empty())
            .map(|(cat, names)| (cat.as_str(), names.len()))
            .collect();
        let tool_performance = self
            .tools
            .iter()
            .map(|(name, e)| {
                (
                    name.clone(),
                    ToolPerformance {
                        call_count: e.stats.calls(),
                        success_count: e.stats.successes(),
                        success_rate: e.stats.success_rate(),
                        category: e.tool.metadata().category.as_str(),
                    },
                )
            })
            .collect();
        ToolAnalytics {
            total_tools: self.tools.len(),
            categories,
            tool_performance,
        }
    }
}

fn args_preview(args: &Map<String, Value>) -> String {
    let s = Value::Object(args.clone()).to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
