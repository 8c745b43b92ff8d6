//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__ROUTING__DAILY_BUDGET_USD=25`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::hitl::HitlConfig;
use crate::providers::{ProviderConfig, RoutingConfig};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub orchestrator: OrchestratorSection,
    pub routing: RoutingSection,
    pub failover: FailoverSection,
    pub hitl: HitlSection,
    pub stream: StreamSection,
    pub checkpoint: CheckpointSection,
    /// 启动时注册的 Provider
    pub providers: Vec<ProviderConfig>,
}

/// [orchestrator] 段
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    /// 同时执行的任务数上限
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
        }
    }
}

fn default_max_concurrency() -> usize {
    2
}

/// [routing] 段：API 回退开关、日预算、默认 token 估算
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingSection {
    #[serde(default = "default_true")]
    pub allow_api_fallback: bool,
    #[serde(default = "default_daily_budget_usd")]
    pub daily_budget_usd: f64,
    #[serde(default = "default_estimated_input_tokens")]
    pub estimated_input_tokens: u64,
    #[serde(default = "default_estimated_output_tokens")]
    pub estimated_output_tokens: u64,
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            allow_api_fallback: true,
            daily_budget_usd: default_daily_budget_usd(),
            estimated_input_tokens: default_estimated_input_tokens(),
            estimated_output_tokens: default_estimated_output_tokens(),
        }
    }
}

impl RoutingSection {
    pub fn to_routing_config(&self) -> RoutingConfig {
        RoutingConfig {
            allow_api_fallback: self.allow_api_fallback,
            daily_budget_usd: self.daily_budget_usd,
            estimated_input_tokens: self.estimated_input_tokens,
            estimated_output_tokens: self.estimated_output_tokens,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_daily_budget_usd() -> f64 {
    10.0
}

fn default_estimated_input_tokens() -> u64 {
    100_000
}

fn default_estimated_output_tokens() -> u64 {
    20_000
}

/// [failover] 段：可恢复错误时换 Provider 重试
#[derive(Debug, Clone, Deserialize)]
pub struct FailoverSection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// 每次重试的等待时间乘数（1.0 表示固定间隔）
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for FailoverSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

/// [hitl] 段
#[derive(Debug, Clone, Deserialize)]
pub struct HitlSection {
    #[serde(default = "default_approval_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default)]
    pub auto_approve_on_timeout: bool,
}

impl Default for HitlSection {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_approval_timeout_ms(),
            auto_approve_on_timeout: false,
        }
    }
}

impl HitlSection {
    pub fn to_hitl_config(&self) -> HitlConfig {
        HitlConfig {
            default_timeout: Duration::from_millis(self.default_timeout_ms),
            auto_approve_on_timeout: self.auto_approve_on_timeout,
        }
    }
}

fn default_approval_timeout_ms() -> u64 {
    300_000
}

/// [stream] 段：终态任务回放缓冲的保留时间
#[derive(Debug, Clone, Deserialize)]
pub struct StreamSection {
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
        }
    }
}

fn default_retention_secs() -> u64 {
    60
}

/// [checkpoint] 段：未设置 path 时使用内存存储
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckpointSection {
    pub path: Option<PathBuf>,
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
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
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
