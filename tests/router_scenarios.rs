//! 路由场景：订阅额度耗尽后的限流与 API 回退

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hive::core::{RoutingError, TaskDefinition};
use hive::providers::{
    AccessMode, AccessModeKind, ApiLimits, CostConfirmation, CostConfirmationRequest, ProviderConfig,
    ProviderRouter, RoutingConfig, SubscriptionLimits, TokenCost,
};

fn demo_provider(per_day: u64) -> ProviderConfig {
    ProviderConfig::new("demo")
        .with_access_mode(AccessMode::subscription(1, SubscriptionLimits::per_day(per_day)))
        .with_access_mode(AccessMode::api(2, ApiLimits::default(), TokenCost::new(1.0, 15.0)))
}

fn task() -> TaskDefinition {
    TaskDefinition::new("refactor the parser", "demo", "/tmp/demo")
}

/// 记录调用次数并批准
#[derive(Default)]
struct CountingApproval {
    calls: AtomicUsize,
}

#[async_trait]
impl CostConfirmation for CountingApproval {
    async fn confirm(&self, request: &CostConfirmationRequest) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(request.provider_id, "demo");
        assert!((request.estimated_cost - 0.4).abs() < 1e-9);
        true
    }
}

#[tokio::test]
async fn subscription_is_preferred_while_quota_remains() {
    let router = ProviderRouter::standalone(RoutingConfig::default());
    router.register_provider(demo_provider(500));

    let first = router.select_provider(&task()).await.unwrap();
    let second = router.select_provider(&task()).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.access_mode, AccessModeKind::Subscription);
    assert!(first.reason.contains("subscription"));
}

#[tokio::test]
async fn exhausted_subscription_without_fallback_is_rate_limited() {
    let router = ProviderRouter::standalone(RoutingConfig {
        allow_api_fallback: false,
        ..RoutingConfig::default()
    });
    router.register_provider(demo_provider(1));
    router.record_usage("demo", AccessModeKind::Subscription, 1, 0, 0);

    let status = router.rate_limits().get_status("demo", AccessModeKind::Subscription);
    assert!(status.is_limited);
    assert_eq!(status.remaining_requests, Some(0));

    match router.select_provider(&task().with_api_failover(1.0)).await {
        Err(RoutingError::RateLimited { resets_at, .. }) => assert!(resets_at.is_some()),
        other => panic!("expected RateLimited, got {other:?}"),
    }
}

#[tokio::test]
async fn exhausted_subscription_falls_back_to_confirmed_api() {
    let router = ProviderRouter::standalone(RoutingConfig::default());
    router.register_provider(demo_provider(1));
    router.record_usage("demo", AccessModeKind::Subscription, 1, 0, 0);
    let confirmation = Arc::new(CountingApproval::default());
    router.set_cost_confirmation(confirmation.clone());

    let selection = router.select_provider(&task().with_api_failover(1.0)).await.unwrap();
    assert_eq!(selection.provider_id, "demo");
    assert_eq!(selection.access_mode, AccessModeKind::Api);
    let estimated = selection.estimated_cost.unwrap();
    assert!((estimated - 0.4).abs() < 1e-9);
    assert_eq!(confirmation.calls.load(Ordering::SeqCst), 1);
}
