//! 记忆层：单会话的对话日志与学习模式

pub mod conversation;
pub mod learning;

pub use conversation::{ConversationMemory, Message, Role};
pub use learning::{context_key, LearningPattern, PatternKind, LEARNED_PATTERN_CONFIDENCE};
