//! 会话记忆：有序消息日志 + 本会话学到的模式
//!
//! 只追加不删除：消息一旦写入不可变，模式只会原地更新 usage_count。
//! 每个 ConversationMemory 绑定一个 session_id，由编排器独占，不跨会话共享。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::memory::LearningPattern;
use crate::tools::ToolResult;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            metadata: Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(Role::Tool, content)
    }

    /// 追加元数据（仅在写入记忆之前使用）
    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// 工具结果消息：content 为 {"ok","data","error","hint"} JSON
    pub fn tool_result(result: &ToolResult) -> Self {
        let mut msg = Self::tool(result.to_wire_json().to_string());
        if let Some(kind) = result.metadata.get("failure_kind") {
            msg.metadata.insert("failure_kind".to_string(), kind.clone());
        }
        msg
    }
}

/// 会话记忆
#[derive(Clone, Debug)]
pub struct ConversationMemory {
    session_id: String,
    messages: Vec<Message>,
    pub(crate) patterns: Vec<LearningPattern>,
}

impl ConversationMemory {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            messages: Vec::new(),
            patterns: Vec::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn push(&mut self, msg: Message) {
        tracing::debug!(
            role = msg.role.as_str(),
            content = %preview(&msg.content, 100),
            "message appended"
        );
        self.messages.push(msg);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// 按角色过滤
    pub fn messages_by_role(&self, role: Role) -> Vec<&Message> {
        self.messages.iter().filter(|m| m.role == role).collect()
    }

    pub fn patterns(&self) -> &[LearningPattern] {
        &self.patterns
    }

    /// 最近一条可解析的 tool 消息还原出的 ToolResult
    pub fn last_tool_result(&self) -> Option<ToolResult> {
        self.messages
            .iter()
            .rev()
            .filter(|m| m.role == Role::Tool)
            .find_map(|m| ToolResult::from_wire_json(&m.content))
    }

    /// 转为 (role, content) 对，供不关心元数据的后端使用
    pub fn format_for_llm(&self) -> Vec<(&'static str, &str)> {
        self.messages
            .iter()
            .map(|m| (m.role.as_str(), m.content.as_str()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

pub(crate) fn preview(s: &str, max_chars: usize) -> String {
    if s.chars().count() > max_chars {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_get_unique_ids() {
        let a = Message::user("a");
        let b = Message::user("a");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_role_filter_and_order() {
        let mut mem = ConversationMemory::new("s-1");
        mem.push(Message::system("sys"));
        mem.push(Message::user("q"));
        mem.push(Message::assistant("a1"));
        mem.push(Message::assistant("a2"));
        let assistants = mem.messages_by_role(Role::Assistant);
        assert_eq!(assistants.len(), 2);
        assert_eq!(assistants[0].content, "a1");
        assert_eq!(mem.len(), 4);
        assert_eq!(mem.format_for_llm()[1], ("user", "q"));
    }

    #[test]
    fn test_last_tool_result_skips_unparseable() {
        let mut mem = ConversationMemory::new("s-1");
        mem.push(Message::tool_result(&ToolResult::failure("boom", Some("try 'x'".into()))));
        mem.push(Message::tool("not json"));
        let last = mem.last_tool_result().unwrap();
        assert!(!last.success);
        assert_eq!(last.hint.as_deref(), Some("try 'x'"));
    }

    #[test]
    fn test_tool_result_message_keeps_failure_kind() {
        let result = ToolResult::failure("nope", None)
            .with_failure_kind(crate::core::FailureKind::ToolNotFound);
        let msg = Message::tool_result(&result);
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.metadata["failure_kind"], "tool_not_found");
    }

    #[test]
    fn test_message_serializes_lowercase_role() {
        let v = serde_json::to_value(Message::assistant("hi")).unwrap();
        assert_eq!(v["role"], "assistant");
        assert!(v.get("metadata").is_none());
    }
}
