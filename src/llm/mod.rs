//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock）

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::{MockLlmClient, RecordedCall, ScriptedLlmClient, ScriptedTurn};
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{LlmClient, LlmError, TokenStream};
