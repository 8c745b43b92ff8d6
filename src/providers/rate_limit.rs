//! 限流追踪：按 (provider, access mode) 统计请求数与 token 数
//!
//! - 订阅模式：每日窗口在配置的 UTC 时刻归零；每小时窗口按整点对齐
//! - API 模式：60 秒滚动窗口
//!
//! 单进程内顺序修改即可；若计数器放到多进程共享的存储中，递增必须在存储侧原子完成（CAS / INCR）。

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, DurationRound, NaiveTime, Utc};
use serde::Serialize;

use super::types::{AccessModeKind, ApiLimits, RateLimits, SubscriptionLimits};

/// 某个 (provider, mode) 当前的限流状态
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitStatus {
    pub is_limited: bool,
    /// 未配置请求上限时为 None
    pub remaining_requests: Option<u64>,
    pub resets_at: Option<DateTime<Utc>>,
}

impl RateLimitStatus {
    fn unlimited() -> Self {
        Self {
            is_limited: false,
            remaining_requests: None,
            resets_at: None,
        }
    }
}

#[derive(Debug, Clone)]
struct FixedWindow {
    requests: u64,
    tokens: u64,
    resets_at: DateTime<Utc>,
}

impl FixedWindow {
    fn empty(resets_at: DateTime<Utc>) -> Self {
        Self {
            requests: 0,
            tokens: 0,
            resets_at,
        }
    }

    /// 过期窗口视为空
    fn live(&self, now: DateTime<Utc>) -> Option<&Self> {
        (now < self.resets_at).then_some(self)
    }
}

#[derive(Debug)]
enum UsageWindow {
    Subscription {
        limits: SubscriptionLimits,
        daily: Option<FixedWindow>,
        hourly: Option<FixedWindow>,
    },
    Api {
        limits: ApiLimits,
        /// (时间, 请求数, token 数)
        recent: VecDeque<(DateTime<Utc>, u64, u64)>,
    },
}

#[derive(Debug)]
struct Entry {
    window: UsageWindow,
    /// 由适配器上报的限流（rate_limit 事件），在此之前一律视为受限
    limited_until: Option<DateTime<Utc>>,
}

impl Entry {
    fn new(limits: RateLimits) -> Self {
        let window = match limits {
            RateLimits::Subscription(limits) => UsageWindow::Subscription {
                limits,
                daily: None,
                hourly: None,
            },
            RateLimits::Api(limits) => UsageWindow::Api {
                limits,
                recent: VecDeque::new(),
            },
        };
        Self {
            window,
            limited_until: None,
        }
    }

    fn unconfigured(mode: AccessModeKind) -> Self {
        match mode {
            AccessModeKind::Api => Self::new(RateLimits::Api(ApiLimits::default())),
            _ => Self::new(RateLimits::Subscription(SubscriptionLimits::default())),
        }
    }
}

const ROLLING_WINDOW_SECS: i64 = 60;

/// 每日窗口边界：返回 (本窗口起点, 下次重置时刻)
pub(crate) fn daily_window(now: DateTime<Utc>, reset: NaiveTime) -> (DateTime<Utc>, DateTime<Utc>) {
    let today_reset = now.date_naive().and_time(reset).and_utc();
    let start = if now >= today_reset {
        today_reset
    } else {
        today_reset - Duration::days(1)
    };
    (start, start + Duration::days(1))
}

fn next_hour(now: DateTime<Utc>) -> DateTime<Utc> {
    now.duration_trunc(Duration::hours(1)).unwrap_or(now) + Duration::hours(1)
}

/// 限流追踪器
#[derive(Debug, Default)]
pub struct RateLimitTracker {
    entries: Mutex<HashMap<(String, AccessModeKind), Entry>>,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置/替换限流配置；窗口类型不变时保留已计数用量
    pub fn configure(&self, provider_id: &str, mode: AccessModeKind, limits: RateLimits) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (provider_id.to_string(), mode);
        let same_kind = matches!(
            (entries.get(&key).map(|e| &e.window), &limits),
            (Some(UsageWindow::Subscription { .. }), RateLimits::Subscription(_))
                | (Some(UsageWindow::Api { .. }), RateLimits::Api(_))
        );
        if !same_kind {
            entries.insert(key, Entry::new(limits));
            return;
        }
        if let Some(entry) = entries.get_mut(&key) {
            match (&mut entry.window, limits) {
                (UsageWindow::Subscription { limits: current, .. }, RateLimits::Subscription(new_limits)) => {
                    *current = new_limits
                }
                (UsageWindow::Api { limits: current, .. }, RateLimits::Api(new_limits)) => *current = new_limits,
                _ => {}
            }
        }
    }

    pub fn record_usage(
        &self,
        provider_id: &str,
        mode: AccessModeKind,
        request_count: u64,
        input_tokens: u64,
        output_tokens: u64,
    ) {
        self.record_usage_at(provider_id, mode, request_count, input_tokens, output_tokens, Utc::now());
    }

    /// 在当前窗口上累加；窗口已滚动时先归零再累加
    pub fn record_usage_at(
        &self,
        provider_id: &str,
        mode: AccessModeKind,
        request_count: u64,
        input_tokens: u64,
        output_tokens: u64,
        now: DateTime<Utc>,
    ) {
        let tokens = input_tokens + output_tokens;
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .entry((provider_id.to_string(), mode))
            .or_insert_with(|| Entry::unconfigured(mode));

        match &mut entry.window {
            UsageWindow::Subscription {
                limits,
                daily,
                hourly,
            } => {
                let daily = roll(daily, now, daily_window(now, limits.daily_reset_time).1);
                daily.requests += request_count;
                daily.tokens += tokens;

                let hourly = roll(hourly, now, next_hour(now));
                hourly.requests += request_count;
                hourly.tokens += tokens;
            }
            UsageWindow::Api { recent, .. } => {
                prune(recent, now);
                recent.push_back((now, request_count, tokens));
            }
        }
    }

    /// 适配器上报的限流：在 resets_at 之前该模式一律视为受限（无时间时按 1 分钟处理）
    pub fn mark_limited(&self, provider_id: &str, mode: AccessModeKind, resets_at: Option<DateTime<Utc>>) {
        let until = resets_at.unwrap_or_else(|| Utc::now() + Duration::seconds(ROLLING_WINDOW_SECS));
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .entry((provider_id.to_string(), mode))
            .or_insert_with(|| Entry::unconfigured(mode));
        entry.limited_until = Some(until);
        tracing::warn!(provider = provider_id, mode = %mode, resets_at = %until, "Access mode marked as rate limited");
    }

    pub fn get_status(&self, provider_id: &str, mode: AccessModeKind) -> RateLimitStatus {
        self.get_status_at(provider_id, mode, Utc::now())
    }

    pub fn get_status_at(&self, provider_id: &str, mode: AccessModeKind, now: DateTime<Utc>) -> RateLimitStatus {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = entries.get_mut(&(provider_id.to_string(), mode)) else {
            return RateLimitStatus::unlimited();
        };

        if let Some(until) = entry.limited_until {
            if now < until {
                return RateLimitStatus {
                    is_limited: true,
                    remaining_requests: Some(0),
                    resets_at: Some(until),
                };
            }
            entry.limited_until = None;
        }

        match &mut entry.window {
            UsageWindow::Subscription {
                limits,
                daily,
                hourly,
            } => subscription_status(limits, daily.as_ref(), hourly.as_ref(), now),
            UsageWindow::Api { limits, recent } => {
                prune(recent, now);
                api_status(limits, recent)
            }
        }
    }
}

fn roll(slot: &mut Option<FixedWindow>, now: DateTime<Utc>, next_reset: DateTime<Utc>) -> &mut FixedWindow {
    if slot.as_ref().map_or(true, |w| now >= w.resets_at) {
        *slot = None;
    }
    slot.get_or_insert_with(|| FixedWindow::empty(next_reset))
}

fn prune(recent: &mut VecDeque<(DateTime<Utc>, u64, u64)>, now: DateTime<Utc>) {
    let cutoff = now - Duration::seconds(ROLLING_WINDOW_SECS);
    while recent.front().is_some_and(|(at, _, _)| *at <= cutoff) {
        recent.pop_front();
    }
}

fn min_remaining(current: Option<u64>, limit: Option<u64>, used: u64) -> Option<u64> {
    match (current, limit) {
        (_, None) => current,
        (None, Some(limit)) => Some(limit.saturating_sub(used)),
        (Some(current), Some(limit)) => Some(current.min(limit.saturating_sub(used))),
    }
}

fn exhausted(limit: Option<u64>, used: u64) -> bool {
    limit.is_some_and(|limit| used >= limit)
}

fn subscription_status(
    limits: &SubscriptionLimits,
    daily: Option<&FixedWindow>,
    hourly: Option<&FixedWindow>,
    now: DateTime<Utc>,
) -> RateLimitStatus {
    let daily_reset = daily_window(now, limits.daily_reset_time).1;
    let (daily_requests, daily_tokens) = daily
        .and_then(|w| w.live(now))
        .map(|w| (w.requests, w.tokens))
        .unwrap_or((0, 0));
    let hourly_live = hourly.and_then(|w| w.live(now));
    let hourly_requests = hourly_live.map(|w| w.requests).unwrap_or(0);

    let daily_limited = exhausted(limits.requests_per_day, daily_requests)
        || exhausted(limits.tokens_per_day, daily_tokens);
    let hourly_limited = exhausted(limits.requests_per_hour, hourly_requests);

    let remaining = min_remaining(None, limits.requests_per_day, daily_requests);
    let remaining = min_remaining(remaining, limits.requests_per_hour, hourly_requests);

    // 受限时给出解除限制的时刻（多个窗口同时耗尽取较晚者）
    let resets_at = if daily_limited {
        daily_reset
    } else if hourly_limited {
        hourly_live.map(|w| w.resets_at).unwrap_or_else(|| next_hour(now))
    } else {
        daily_reset
    };

    RateLimitStatus {
        is_limited: daily_limited || hourly_limited,
        remaining_requests: remaining,
        resets_at: Some(resets_at),
    }
}

fn api_status(limits: &ApiLimits, recent: &VecDeque<(DateTime<Utc>, u64, u64)>) -> RateLimitStatus {
    let (requests, tokens) = recent
        .iter()
        .fold((0u64, 0u64), |(r, t), (_, req, tok)| (r + req, t + tok));
    let is_limited =
        exhausted(limits.requests_per_minute, requests) || exhausted(limits.tokens_per_minute, tokens);

    RateLimitStatus {
        is_limited,
        remaining_requests: min_remaining(None, limits.requests_per_minute, requests),
        resets_at: recent
            .front()
            .map(|(at, _, _)| *at + Duration::seconds(ROLLING_WINDOW_SECS)),
    }
}
