//! Provider 层：目录、限流账本、成本账本与 subscription-first 路由
//!
//! - **types**: 访问模式 / 限流 / 单价 / 能力
//! - **registry**: Provider 注册表
//! - **rate_limit**: 按 (provider, mode) 的窗口计数
//! - **cost**: 费用记录与聚合
//! - **router**: 选择 Provider 与访问模式，回写用量

pub mod cost;
pub mod rate_limit;
pub mod registry;
pub mod router;
pub mod types;

pub use cost::{CostFilter, CostRecord, CostSummary, CostTracker, DailyCost, ProviderUsage};
pub use rate_limit::{RateLimitStatus, RateLimitTracker};
pub use registry::ProviderRegistry;
pub use router::{
    CostConfirmation, CostConfirmationRequest, FixedConfirmation, ProviderRouter, ProviderSelection, RoutingConfig,
};
pub use types::{
    AccessMode, AccessModeKind, ApiLimits, ProviderCapabilities, ProviderConfig, RateLimits, SubscriptionLimits,
    TokenCost,
};
