//! Provider 目录数据模型：访问模式、限流配置、计费与能力描述
//!
//! 一个 Provider 可以有多个访问模式（订阅额度 / 计量 API / 免费层），
//! 每个模式有独立的优先级、限流窗口与单价。

use std::fmt;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

/// 访问模式类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessModeKind {
    /// 订阅额度（不计量，受每日/每小时配额限制）
    Subscription,
    /// 计量 API（按 token 计费，受每分钟限制）
    Api,
    /// 免费层
    Free,
}

impl AccessModeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Subscription => "subscription",
            Self::Api => "api",
            Self::Free => "free",
        }
    }

    /// 是否按用量计费
    pub fn is_metered(self) -> bool {
        matches!(self, Self::Api)
    }
}

impl fmt::Display for AccessModeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 订阅模式的配额（每日计数在 `daily_reset_time`（UTC）归零）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionLimits {
    #[serde(default)]
    pub requests_per_day: Option<u64>,
    #[serde(default)]
    pub requests_per_hour: Option<u64>,
    #[serde(default)]
    pub tokens_per_day: Option<u64>,
    #[serde(default = "default_daily_reset_time")]
    pub daily_reset_time: NaiveTime,
}

fn default_daily_reset_time() -> NaiveTime {
    NaiveTime::MIN
}

impl Default for SubscriptionLimits {
    fn default() -> Self {
        Self {
            requests_per_day: None,
            requests_per_hour: None,
            tokens_per_day: None,
            daily_reset_time: default_daily_reset_time(),
        }
    }
}

impl SubscriptionLimits {
    pub fn per_day(requests: u64) -> Self {
        Self {
            requests_per_day: Some(requests),
            ..Self::default()
        }
    }

    pub fn with_requests_per_hour(mut self, requests: u64) -> Self {
        self.requests_per_hour = Some(requests);
        self
    }

    pub fn with_tokens_per_day(mut self, tokens: u64) -> Self {
        self.tokens_per_day = Some(tokens);
        self
    }

    pub fn with_reset_time(mut self, reset: NaiveTime) -> Self {
        self.daily_reset_time = reset;
        self
    }
}

/// API 模式的每分钟限制（滚动窗口）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiLimits {
    #[serde(default)]
    pub requests_per_minute: Option<u64>,
    #[serde(default)]
    pub tokens_per_minute: Option<u64>,
}

/// 限流配置：订阅窗口或 API 窗口二选一
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RateLimits {
    Subscription(SubscriptionLimits),
    Api(ApiLimits),
}

/// 每百万 token 单价（美元）
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenCost {
    pub input: f64,
    pub output: f64,
}

impl TokenCost {
    pub fn new(input: f64, output: f64) -> Self {
        Self { input, output }
    }

    /// 按单价计算费用
    pub fn cost_of(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        input_tokens as f64 / 1e6 * self.input + output_tokens as f64 / 1e6 * self.output
    }
}

/// 单个访问模式
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessMode {
    pub mode: AccessModeKind,
    /// 越小越先尝试
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub limits: Option<RateLimits>,
    #[serde(default)]
    pub cost_per_million: Option<TokenCost>,
}

fn default_true() -> bool {
    true
}

impl AccessMode {
    pub fn subscription(priority: u32, limits: SubscriptionLimits) -> Self {
        Self {
            mode: AccessModeKind::Subscription,
            priority,
            enabled: true,
            limits: Some(RateLimits::Subscription(limits)),
            cost_per_million: None,
        }
    }

    pub fn api(priority: u32, limits: ApiLimits, cost: TokenCost) -> Self {
        Self {
            mode: AccessModeKind::Api,
            priority,
            enabled: true,
            limits: Some(RateLimits::Api(limits)),
            cost_per_million: Some(cost),
        }
    }

    pub fn free(priority: u32) -> Self {
        Self {
            mode: AccessModeKind::Free,
            priority,
            enabled: true,
            limits: None,
            cost_per_million: None,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Provider 能力描述
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    #[serde(default)]
    pub supports_streaming: bool,
    #[serde(default)]
    pub supports_tools: bool,
    #[serde(default)]
    pub supports_sessions: bool,
    #[serde(default)]
    pub max_context_tokens: Option<u64>,
    /// 自由标签（语言、框架等），用于 required_capabilities 匹配
    #[serde(default)]
    pub features: Vec<String>,
}

impl ProviderCapabilities {
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f.eq_ignore_ascii_case(feature))
    }
}

/// Provider 配置（启动时或由配置文件注册，运行期以读为主）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub access_modes: Vec<AccessMode>,
    #[serde(default)]
    pub capabilities: ProviderCapabilities,
}

impl ProviderConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            access_modes: Vec::new(),
            capabilities: ProviderCapabilities::default(),
        }
    }

    pub fn with_access_mode(mut self, mode: AccessMode) -> Self {
        self.access_modes.push(mode);
        self
    }

    pub fn with_capabilities(mut self, capabilities: ProviderCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// 已启用的访问模式，按 priority 升序（同优先级保持声明顺序）
    pub fn enabled_modes(&self) -> Vec<&AccessMode> {
        let mut modes: Vec<&AccessMode> = self.access_modes.iter().filter(|m| m.enabled).collect();
        modes.sort_by_key(|m| m.priority);
        modes
    }

    pub fn mode(&self, kind: AccessModeKind) -> Option<&AccessMode> {
        self.access_modes.iter().find(|m| m.mode == kind)
    }
}
