//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SPOC__*` 覆盖（双下划线表示嵌套，如 `SPOC__AGENT__STRATEGY=continued_context`）。

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub agent: AgentSection,
    pub tools: ToolsSection,
}

/// [app] 段：应用名与 Web 服务监听地址
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    pub host: String,
    pub port: u16,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            host: "127.0.0.1".to_string(),
            port: 8004,
        }
    }
}

/// [llm] 段：后端选择、端点与超时
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：mock / openai
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 未设置时回退到 OPENAI_API_KEY 环境变量；不随 /api/config 输出
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model: "local-7b".to_string(),
            base_url: None,
            api_key: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 单次 PROPOSE 超时（秒）
    pub propose: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { propose: 60 }
    }
}

/// [agent] 段：策略、尝试上限、哨兵与提示选项
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentSection {
    /// independent_retry / continued_context
    pub strategy: String,
    pub max_attempts: usize,
    pub sentinel: String,
    pub stream: bool,
    /// 是否在用户问题前拼接工具签名
    pub include_signature: bool,
    /// 默认工具范围：sql / research / data_analysis / all
    pub scenario: String,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            strategy: "independent_retry".to_string(),
            max_attempts: 3,
            sentinel: crate::react::DEFAULT_SENTINEL.to_string(),
            stream: true,
            include_signature: true,
            scenario: "sql".to_string(),
        }
    }
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

/// 从 config 目录加载配置，环境变量 SPOC__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 SPOC__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("SPOC")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.llm.provider, "mock");
        assert_eq!(cfg.llm.timeouts.propose, 60);
        assert_eq!(cfg.agent.max_attempts, 3);
        assert_eq!(cfg.agent.sentinel, "TOOL_CALL:");
        assert!(cfg.agent.stream);
        assert_eq!(cfg.tools.timeout_secs, 30);
    }

    #[test]
    fn test_explicit_file_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[agent]\nstrategy = \"continued_context\"\nsentinel = \"CALL>>\"\n\n[llm.timeouts]\npropose = 5").unwrap();
        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.agent.strategy, "continued_context");
        assert_eq!(cfg.agent.sentinel, "CALL>>");
        assert_eq!(cfg.llm.timeouts.propose, 5);
        // 未覆盖的键保持默认
        assert!(cfg.agent.include_signature);
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("SPOC__TOOLS__TIMEOUT_SECS", "7");
        let cfg = load_config(None).unwrap();
        std::env::remove_var("SPOC__TOOLS__TIMEOUT_SECS");
        assert_eq!(cfg.tools.timeout_secs, 7);
    }

    #[test]
    fn test_api_key_is_not_serialized() {
        let mut cfg = AppConfig::default();
        cfg.llm.api_key = Some("sk-secret".into());
        let v = serde_json::to_value(&cfg).unwrap();
        assert!(v["llm"].get("api_key").is_none());
    }
}
