//! SPOC-Shot - 自我纠错的工具调用编排器
//!
//! 模块划分：
//! - **agent**: Agent 运行时与编排器配置（按配置创建生成服务与内置工具）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 会话阶段、策略与错误类型
//! - **llm**: 生成服务抽象与实现（OpenAI 兼容 / Mock / 脚本回放）
//! - **memory**: 单会话对话日志与学习模式
//! - **observability**: tracing 日志初始化
//! - **react**: 流式调用提取、验证、会话事件与主循环
//! - **tools**: 工具 trait、注册表与内置演示工具（sql_query、web_search）

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;

pub use agent::{Agent, AgentConfig};
pub use react::{AgentEvent, AgentResult};
