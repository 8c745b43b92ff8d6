//! 成本追踪：按请求累计费用，查询时按天 / Provider / 访问模式聚合
//!
//! 记录只追加；所有聚合在查询时对记录集计算。

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use super::types::{AccessModeKind, TokenCost};

/// 单次用量记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostRecord {
    pub provider_id: String,
    pub mode: AccessModeKind,
    pub timestamp: DateTime<Utc>,
    pub request_count: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// 美元
    pub cost: f64,
}

/// 查询过滤条件
#[derive(Debug, Clone, Default)]
pub struct CostFilter {
    pub start_date: Option<DateTime<Utc>>,
    pub provider_id: Option<String>,
}

impl CostFilter {
    pub fn since(start: DateTime<Utc>) -> Self {
        Self {
            start_date: Some(start),
            provider_id: None,
        }
    }

    pub fn for_provider(provider_id: impl Into<String>) -> Self {
        Self {
            start_date: None,
            provider_id: Some(provider_id.into()),
        }
    }

    fn matches(&self, record: &CostRecord) -> bool {
        self.start_date.map_or(true, |start| record.timestamp >= start)
            && self
                .provider_id
                .as_deref()
                .map_or(true, |id| record.provider_id == id)
    }
}

/// 汇总：总量 + 按 Provider / 访问模式拆分的费用
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CostSummary {
    pub total_cost: f64,
    pub total_requests: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub by_provider: BTreeMap<String, f64>,
    pub by_mode: BTreeMap<AccessModeKind, f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProviderUsage {
    pub provider_id: String,
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyCost {
    pub date: NaiveDate,
    pub requests: u64,
    pub cost: f64,
}

/// 成本追踪器
#[derive(Debug, Default)]
pub struct CostTracker {
    pricing: RwLock<HashMap<(String, AccessModeKind), TokenCost>>,
    records: RwLock<Vec<CostRecord>>,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置 (provider, mode) 的单价；未配置的模式按 0 计费（订阅 / 免费层）
    pub fn configure_pricing(&self, provider_id: &str, mode: AccessModeKind, cost: TokenCost) {
        self.pricing
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((provider_id.to_string(), mode), cost);
    }

    pub fn pricing(&self, provider_id: &str, mode: AccessModeKind) -> Option<TokenCost> {
        self.pricing
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(provider_id.to_string(), mode))
            .copied()
    }

    pub fn record_usage(
        &self,
        provider_id: &str,
        mode: AccessModeKind,
        request_count: u64,
        input_tokens: u64,
        output_tokens: u64,
    ) -> CostRecord {
        self.record_usage_at(provider_id, mode, request_count, input_tokens, output_tokens, Utc::now())
    }

    pub fn record_usage_at(
        &self,
        provider_id: &str,
        mode: AccessModeKind,
        request_count: u64,
        input_tokens: u64,
        output_tokens: u64,
        timestamp: DateTime<Utc>,
    ) -> CostRecord {
        let cost = self
            .pricing(provider_id, mode)
            .map(|p| p.cost_of(input_tokens, output_tokens))
            .unwrap_or(0.0);
        let record = CostRecord {
            provider_id: provider_id.to_string(),
            mode,
            timestamp,
            request_count,
            input_tokens,
            output_tokens,
            cost,
        };
        tracing::debug!(provider = provider_id, mode = %mode, cost, "Usage recorded");
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        record
    }

    /// 今日（UTC）累计费用
    pub fn get_daily_cost(&self) -> f64 {
        self.get_daily_cost_at(Utc::now())
    }

    pub fn get_daily_cost_at(&self, now: DateTime<Utc>) -> f64 {
        let today = now.date_naive();
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.timestamp.date_naive() == today)
            .map(|r| r.cost)
            .sum()
    }

    pub fn get_summary(&self, filter: &CostFilter) -> CostSummary {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        records
            .iter()
            .filter(|r| filter.matches(r))
            .fold(CostSummary::default(), |mut summary, r| {
                summary.total_cost += r.cost;
                summary.total_requests += r.request_count;
                summary.total_input_tokens += r.input_tokens;
                summary.total_output_tokens += r.output_tokens;
                *summary.by_provider.entry(r.provider_id.clone()).or_default() += r.cost;
                *summary.by_mode.entry(r.mode).or_default() += r.cost;
                summary
            })
    }

    /// 按 Provider 拆分的请求 / token / 费用，按 provider_id 排序
    pub fn get_provider_breakdown(&self, filter: &CostFilter) -> Vec<ProviderUsage> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut usage: BTreeMap<&str, ProviderUsage> = BTreeMap::new();
        for r in records.iter().filter(|r| filter.matches(r)) {
            let entry = usage.entry(r.provider_id.as_str()).or_insert_with(|| ProviderUsage {
                provider_id: r.provider_id.clone(),
                ..Default::default()
            });
            entry.requests += r.request_count;
            entry.input_tokens += r.input_tokens;
            entry.output_tokens += r.output_tokens;
            entry.cost += r.cost;
        }
        usage.into_values().collect()
    }

    /// 按 UTC 日期聚合，日期升序
    pub fn get_daily_breakdown(&self, filter: &CostFilter) -> Vec<DailyCost> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut days: BTreeMap<NaiveDate, (u64, f64)> = BTreeMap::new();
        for r in records.iter().filter(|r| filter.matches(r)) {
            let day = days.entry(r.timestamp.date_naive()).or_default();
            day.0 += r.request_count;
            day.1 += r.cost;
        }
        days.into_iter()
            .map(|(date, (requests, cost))| DailyCost { date, requests, cost })
            .collect()
    }

    pub fn records(&self) -> Vec<CostRecord> {
        self.records.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
