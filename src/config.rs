//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TRIPFLOW__*` 覆盖（双下划线表示嵌套，
//! 如 `TRIPFLOW__SERVER__PORT=8080`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub upstream: UpstreamSection,
    pub resilience: ResilienceSection,
    pub routing: RoutingSection,
    pub server: ServerSection,
}

/// [app] 段：会话与整轮时限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 会话不活跃回收时限（秒）
    pub session_timeout_secs: u64,
    /// 单轮对话总时限（秒）
    pub turn_deadline_secs: u64,
    /// 交给路由器/处理器的历史窗口条数
    pub history_window: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            session_timeout_secs: 1800,
            turn_deadline_secs: 60,
            history_window: 10,
        }
    }
}

/// [llm] 段：补全后端与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    /// 单次补全超时（秒）
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key: None,
            request_timeout_secs: 30,
        }
    }
}

/// [upstream] 段：旅行数据上游
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamSection {
    pub base_url: String,
    pub email: Option<String>,
    pub password: Option<String>,
    pub page_size: u32,
    pub request_timeout_secs: u64,
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000/api/v1".to_string(),
            email: None,
            password: None,
            page_size: 20,
            request_timeout_secs: 15,
        }
    }
}

/// [resilience] 段：重试、熔断、缓存、错误保留与限流处置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ResilienceSection {
    pub retry: RetrySection,
    pub circuit: CircuitSection,
    pub cache: CacheSection,
    pub errors: ErrorsSection,
    pub rate_limit: RateLimitSection,
}

/// [resilience.retry] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    pub attempt_timeout_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 300,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: true,
            attempt_timeout_secs: 20,
        }
    }
}

/// [resilience.circuit] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitSection {
    pub failure_threshold: u32,
    pub min_throughput: u32,
    pub recovery_timeout_secs: u64,
}

impl Default for CircuitSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            min_throughput: 5,
            recovery_timeout_secs: 30,
        }
    }
}

/// [resilience.cache] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub max_entries: usize,
    pub max_value_bytes: usize,
    pub default_ttl_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            max_entries: 500,
            max_value_bytes: 64 * 1024,
            default_ttl_secs: 300,
        }
    }
}

/// [resilience.errors] 段：分类器保留策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ErrorsSection {
    pub max_age_secs: u64,
    pub max_count: usize,
}

impl Default for ErrorsSection {
    fn default() -> Self {
        Self {
            max_age_secs: 3600,
            max_count: 1000,
        }
    }
}

/// [resilience.rate_limit] 段：限流恢复策略是否原地等待
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RateLimitSection {
    pub inline_wait: bool,
}

/// [routing] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingSection {
    pub confidence_floor: f64,
    pub deadline_secs: u64,
    pub history_window: usize,
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            confidence_floor: 0.4,
            deadline_secs: 10,
            history_window: 6,
        }
    }
}

/// [server] 段：HTTP 监听与请求体限制
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    /// 单请求最多携带的消息条数
    pub max_messages: usize,
    /// 单条消息内容最大长度（字符）
    pub max_content_len: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_messages: 50,
            max_content_len: 4000,
        }
    }
}

/// 从 config 目录加载配置，环境变量 TRIPFLOW__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TRIPFLOW__*（双下划线表示嵌套键）
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
        config::Environment::with_prefix("TRIPFLOW")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
