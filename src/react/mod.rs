//! 编排层：流式调用提取、验证、会话事件与主循环

pub mod events;
pub mod extractor;
pub mod loop_;
pub mod verifier;

pub use events::{AgentEvent, AgentMetrics, EventPayload, EventSink};
pub use extractor::{CallExtractor, ExtractStep, TurnOutcome, DEFAULT_SENTINEL, MAX_BUFFER_SIZE};
pub use loop_::{run_session, AgentResult, ReactSession};
pub use verifier::{SuccessFlagVerifier, Verifier};
