//! Provider 路由器（subscription-first）
//!
//! 选择流程：
//! 1. 候选 = 已启用的 Provider，按 preferred / exclude / preferred_access_mode / required_capabilities 过滤
//! 2. 按注册顺序遍历候选，每个候选内按 priority 升序遍历已启用的访问模式
//! 3. 第一个未受限的订阅（或免费层）模式立即选中
//! 4. 否则在允许 API 回退时，对第一个可用 API 模式估算费用并做单任务上限 / 日预算检查，
//!    再交给成本确认回调（挂起点）决定
//!
//! 用量通过 record_usage 同时回写限流与成本两本账（两者之间不保证原子）。

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::cost::{CostRecord, CostTracker};
use super::rate_limit::RateLimitTracker;
use super::registry::ProviderRegistry;
use super::types::{AccessMode, AccessModeKind, ProviderConfig};
use crate::core::error::RoutingError;
use crate::core::task::TaskDefinition;

/// 一次选择的结果（每次调用新建，不持久化）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderSelection {
    pub provider_id: String,
    pub access_mode: AccessModeKind,
    pub reason: String,
    pub estimated_cost: Option<f64>,
}

/// 路由配置
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// 全局开关：是否允许从订阅回退到计量 API
    pub allow_api_fallback: bool,
    pub daily_budget_usd: f64,
    /// 任务未给出 token 估算时使用的默认值
    pub estimated_input_tokens: u64,
    pub estimated_output_tokens: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            allow_api_fallback: true,
            daily_budget_usd: 10.0,
            estimated_input_tokens: 100_000,
            estimated_output_tokens: 20_000,
        }
    }
}

/// 交给成本确认回调的信息
#[derive(Debug, Clone, Serialize)]
pub struct CostConfirmationRequest {
    pub provider_id: String,
    pub access_mode: AccessModeKind,
    pub estimated_cost: f64,
    pub daily_cost: f64,
    pub daily_budget: f64,
    pub prompt: String,
}

/// API 回退前的确认（人工或策略），返回 true 表示允许
#[async_trait]
pub trait CostConfirmation: Send + Sync {
    async fn confirm(&self, request: &CostConfirmationRequest) -> bool;
}

/// 固定答复的确认策略
#[derive(Debug, Clone, Copy)]
pub struct FixedConfirmation(pub bool);

#[async_trait]
impl CostConfirmation for FixedConfirmation {
    async fn confirm(&self, _request: &CostConfirmationRequest) -> bool {
        self.0
    }
}

/// Provider 路由器：组合注册表与限流 / 成本两本账
pub struct ProviderRouter {
    registry: Arc<ProviderRegistry>,
    rate_limits: Arc<RateLimitTracker>,
    costs: Arc<CostTracker>,
    config: RoutingConfig,
    confirmation: RwLock<Option<Arc<dyn CostConfirmation>>>,
}

impl ProviderRouter {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        rate_limits: Arc<RateLimitTracker>,
        costs: Arc<CostTracker>,
        config: RoutingConfig,
    ) -> Self {
        Self {
            registry,
            rate_limits,
            costs,
            config,
            confirmation: RwLock::new(None),
        }
    }

    /// 新建独立的注册表与两本账
    pub fn standalone(config: RoutingConfig) -> Self {
        Self::new(
            Arc::new(ProviderRegistry::new()),
            Arc::new(RateLimitTracker::new()),
            Arc::new(CostTracker::new()),
            config,
        )
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn rate_limits(&self) -> &Arc<RateLimitTracker> {
        &self.rate_limits
    }

    pub fn costs(&self) -> &Arc<CostTracker> {
        &self.costs
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// 注册（upsert）Provider，并按访问模式配置限流与单价
    pub fn register_provider(&self, provider: ProviderConfig) {
        for mode in &provider.access_modes {
            if let Some(limits) = &mode.limits {
                self.rate_limits.configure(&provider.id, mode.mode, limits.clone());
            }
            if let Some(cost) = mode.cost_per_million {
                self.costs.configure_pricing(&provider.id, mode.mode, cost);
            }
        }
        tracing::info!(provider = %provider.id, modes = provider.access_modes.len(), "Provider registered");
        self.registry.register(provider);
    }

    /// 注册成本确认回调；未注册时预算检查通过即视为批准
    pub fn set_cost_confirmation(&self, confirmation: Arc<dyn CostConfirmation>) {
        *self.confirmation.write().unwrap_or_else(PoisonError::into_inner) = Some(confirmation);
    }

    pub async fn select_provider(&self, task: &TaskDefinition) -> Result<ProviderSelection, RoutingError> {
        self.select_provider_excluding(task, &[]).await
    }

    /// 额外排除若干 Provider 后选择（用于失败后的 failover）
    pub async fn select_provider_excluding(
        &self,
        task: &TaskDefinition,
        extra_excluded: &[String],
    ) -> Result<ProviderSelection, RoutingError> {
        let candidates = self.candidates(task, extra_excluded);
        if candidates.is_empty() {
            return Err(RoutingError::ProviderUnavailable(
                "no enabled provider matches the task constraints".to_string(),
            ));
        }

        let mut earliest_reset: Option<DateTime<Utc>> = None;
        let mut api_candidate: Option<(String, AccessMode)> = None;

        for provider in &candidates {
            for mode in modes_for(provider, task) {
                let status = self.rate_limits.get_status(&provider.id, mode.mode);
                if status.is_limited {
                    earliest_reset = match (earliest_reset, status.resets_at) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (a, b) => a.or(b),
                    };
                    continue;
                }
                match mode.mode {
                    AccessModeKind::Subscription | AccessModeKind::Free => {
                        let reason = if mode.mode == AccessModeKind::Free {
                            "free tier available"
                        } else {
                            "subscription available"
                        };
                        tracing::debug!(provider = %provider.id, mode = %mode.mode, "Provider selected");
                        return Ok(ProviderSelection {
                            provider_id: provider.id.clone(),
                            access_mode: mode.mode,
                            reason: reason.to_string(),
                            estimated_cost: None,
                        });
                    }
                    AccessModeKind::Api => {
                        if api_candidate.is_none() {
                            api_candidate = Some((provider.id.clone(), mode.clone()));
                        }
                    }
                }
            }
        }

        // 即使偏好 api 模式，也必须显式开启 allow_api_failover 才会产生费用
        let fallback_allowed = self.config.allow_api_fallback && task.allow_api_failover;
        let rate_limited = |detail: &str| RoutingError::RateLimited {
            message: match earliest_reset {
                Some(at) => format!("{detail}; resets at {}", at.to_rfc3339()),
                None => detail.to_string(),
            },
            resets_at: earliest_reset,
        };

        if !fallback_allowed {
            return Err(rate_limited("all subscription access modes are exhausted"));
        }
        let Some((provider_id, mode)) = api_candidate else {
            return Err(rate_limited("no api access mode available for fallback"));
        };

        let estimated_cost = self.estimate_cost(task, &mode);
        let daily_cost = self.costs.get_daily_cost();
        if estimated_cost > task.max_api_cost_usd || daily_cost + estimated_cost > self.config.daily_budget_usd {
            tracing::warn!(provider = %provider_id, estimated_cost, daily_cost, "Api fallback over budget");
            return Err(RoutingError::CostLimitExceeded {
                estimated_cost,
                max_task_cost: task.max_api_cost_usd,
                daily_cost,
                daily_budget: self.config.daily_budget_usd,
            });
        }

        let confirmation = self
            .confirmation
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(confirmation) = confirmation {
            let request = CostConfirmationRequest {
                provider_id: provider_id.clone(),
                access_mode: mode.mode,
                estimated_cost,
                daily_cost,
                daily_budget: self.config.daily_budget_usd,
                prompt: task.prompt.clone(),
            };
            if !confirmation.confirm(&request).await {
                tracing::info!(provider = %provider_id, estimated_cost, "Api fallback declined");
                return Err(rate_limited("api fallback declined"));
            }
        }

        tracing::info!(provider = %provider_id, estimated_cost, "Api fallback approved");
        Ok(ProviderSelection {
            provider_id,
            access_mode: mode.mode,
            reason: "api fallback approved".to_string(),
            estimated_cost: Some(estimated_cost),
        })
    }

    /// 执行结束后回写用量（限流 + 成本）
    pub fn record_usage(
        &self,
        provider_id: &str,
        mode: AccessModeKind,
        request_count: u64,
        input_tokens: u64,
        output_tokens: u64,
    ) -> CostRecord {
        self.rate_limits
            .record_usage(provider_id, mode, request_count, input_tokens, output_tokens);
        self.costs
            .record_usage(provider_id, mode, request_count, input_tokens, output_tokens)
    }

    /// Adapter 报告被限流时，立即把该模式标记为受限
    pub fn mark_rate_limited(&self, provider_id: &str, mode: AccessModeKind, resets_at: Option<DateTime<Utc>>) {
        tracing::warn!(provider = provider_id, mode = %mode, ?resets_at, "Provider reported rate limit");
        self.rate_limits.mark_limited(provider_id, mode, resets_at);
    }

    fn candidates(&self, task: &TaskDefinition, extra_excluded: &[String]) -> Vec<ProviderConfig> {
        let required = task
            .constraints
            .as_ref()
            .map(|c| c.required_capabilities.as_slice())
            .unwrap_or_default();

        self.registry
            .list_enabled()
            .into_iter()
            .filter(|p| {
                task.preferred_providers
                    .as_ref()
                    .map_or(true, |preferred| preferred.contains(&p.id))
            })
            .filter(|p| !task.exclude_providers.contains(&p.id) && !extra_excluded.contains(&p.id))
            .filter(|p| required.iter().all(|feature| p.capabilities.has_feature(feature)))
            .filter(|p| !modes_for(p, task).is_empty())
            .collect()
    }

    fn estimate_cost(&self, task: &TaskDefinition, mode: &AccessMode) -> f64 {
        let constraints = task.constraints.as_ref();
        let input = constraints
            .and_then(|c| c.estimated_input_tokens)
            .unwrap_or(self.config.estimated_input_tokens);
        let output = constraints
            .and_then(|c| c.estimated_output_tokens)
            .unwrap_or(self.config.estimated_output_tokens);
        mode.cost_per_million
            .map(|cost| cost.cost_of(input, output))
            .unwrap_or(0.0)
    }
}

/// 该 Provider 可参与选择的访问模式（已启用 + 符合 preferred_access_mode），按 priority 升序
fn modes_for<'a>(provider: &'a ProviderConfig, task: &TaskDefinition) -> Vec<&'a AccessMode> {
    provider
        .enabled_modes()
        .into_iter()
        .filter(|m| task.preferred_access_mode.map_or(true, |preferred| m.mode == preferred))
        .collect()
}
