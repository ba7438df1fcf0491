//! 核心层：会话错误、可恢复失败分类、编排阶段与策略

pub mod error;
pub mod state;

pub use error::{AgentError, FailureKind};
pub use state::{AgentPhase, Strategy};
