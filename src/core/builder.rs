//! 编排器构建器：由 AppConfig 统一组装各组件
//!
//! CLI、测试与嵌入方共用同一条初始化路径：路由 / 审批 / 进度流 / 检查点存储 / 配置中的 Provider。

use std::sync::Arc;
use std::time::Duration;

use crate::adapter::{Adapter, ScriptedAdapter};
use crate::config::AppConfig;
use crate::core::checkpoint::{CheckpointStore, InMemoryCheckpointStore, SqliteCheckpointStore};
use crate::core::error::OrchestratorError;
use crate::core::orchestrator::{FailoverConfig, Orchestrator, OrchestratorConfig};
use crate::hitl::HitlController;
use crate::providers::{CostConfirmation, ProviderConfig, ProviderRouter};
use crate::stream::ProgressStream;

pub struct OrchestratorBuilder {
    config: AppConfig,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    confirmation: Option<Arc<dyn CostConfirmation>>,
    adapters: Vec<Arc<dyn Adapter>>,
    providers: Vec<ProviderConfig>,
    /// 为没有 Adapter 的 Provider 补上脚本化 Adapter 时的输出
    scripted_output: Option<String>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            checkpoints: None,
            confirmation: None,
            adapters: Vec::new(),
            providers: Vec::new(),
            scripted_output: None,
        }
    }

    /// 替换检查点存储（默认：配置了 checkpoint.path 用 SQLite，否则内存）
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// API 回退前的成本确认回调
    pub fn with_cost_confirmation(mut self, confirmation: Arc<dyn CostConfirmation>) -> Self {
        self.confirmation = Some(confirmation);
        self
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn Adapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    /// 追加 Provider（在配置文件中的 Provider 之后注册，同 id 覆盖）
    pub fn with_provider(mut self, provider: ProviderConfig) -> Self {
        self.providers.push(provider);
        self
    }

    /// 为所有未注册 Adapter 的 Provider 注册 ScriptedAdapter（本地演示，不调用外部服务）
    pub fn with_scripted_adapters(mut self, output: impl Into<String>) -> Self {
        self.scripted_output = Some(output.into());
        self
    }

    pub fn build(self) -> Result<Orchestrator, OrchestratorError> {
        let config = self.config;
        if config.orchestrator.max_concurrency == 0 {
            return Err(OrchestratorError::Config(
                "orchestrator.max_concurrency must be at least 1".to_string(),
            ));
        }
        if config.routing.daily_budget_usd < 0.0 {
            return Err(OrchestratorError::Config(
                "routing.daily_budget_usd must not be negative".to_string(),
            ));
        }

        let checkpoints: Arc<dyn CheckpointStore> = match (self.checkpoints, &config.checkpoint.path) {
            (Some(store), _) => store,
            (None, Some(path)) => {
                tracing::info!(path = %path.display(), "Using SQLite checkpoint store");
                Arc::new(SqliteCheckpointStore::open(path)?)
            }
            (None, None) => Arc::new(InMemoryCheckpointStore::new()),
        };

        let router = Arc::new(ProviderRouter::standalone(config.routing.to_routing_config()));
        if let Some(confirmation) = self.confirmation {
            router.set_cost_confirmation(confirmation);
        }

        let orchestrator = Orchestrator::new(
            OrchestratorConfig {
                max_concurrency: config.orchestrator.max_concurrency,
                failover: FailoverConfig {
                    max_retries: config.failover.max_retries,
                    retry_delay: Duration::from_millis(config.failover.retry_delay_ms),
                    backoff_multiplier: config.failover.backoff_multiplier,
                },
            },
            router,
            HitlController::new(config.hitl.to_hitl_config()),
            ProgressStream::with_retention(Duration::from_secs(config.stream.retention_secs)),
            checkpoints,
        );

        let mut provider_ids = Vec::new();
        for provider in config.providers.into_iter().chain(self.providers) {
            provider_ids.push(provider.id.clone());
            orchestrator.register_provider(provider);
        }
        for adapter in &self.adapters {
            orchestrator.register_adapter(Arc::clone(adapter));
        }
        if let Some(output) = self.scripted_output {
            for id in provider_ids {
                if self.adapters.iter().any(|a| a.id() == id) {
                    continue;
                }
                tracing::warn!(provider = %id, "No adapter for provider, using scripted adapter");
                orchestrator.register_adapter(Arc::new(ScriptedAdapter::demo(id, output.clone())));
            }
        }

        tracing::info!(
            max_concurrency = orchestrator.config().max_concurrency,
            providers = orchestrator.registry().len(),
            "Orchestrator ready"
        );
        Ok(orchestrator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::{TaskDefinition, TaskStatus};
    use crate::hitl::HitlPolicy;
    use crate::providers::{AccessMode, SubscriptionLimits};

    #[test]
    fn test_rejects_zero_concurrency() {
        let mut config = AppConfig::default();
        config.orchestrator.max_concurrency = 0;
        assert!(matches!(
            OrchestratorBuilder::new(config).build(),
            Err(OrchestratorError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_scripted_adapters_cover_configured_providers() {
        let mut config = AppConfig::default();
        config.providers.push(
            ProviderConfig::new("claude")
                .with_access_mode(AccessMode::subscription(1, SubscriptionLimits::per_day(10))),
        );
        let real = Arc::new(ScriptedAdapter::demo("codex", "from the registered adapter"));
        let orchestrator = OrchestratorBuilder::new(config)
            .with_provider(
                ProviderConfig::new("codex")
                    .with_access_mode(AccessMode::subscription(1, SubscriptionLimits::per_day(10))),
            )
            .with_adapter(real.clone())
            .with_scripted_adapters("scripted")
            .build()
            .unwrap();

        let definition = || TaskDefinition::new("p", "k", "/tmp").with_hitl_policy(HitlPolicy::Autonomous);
        let state = orchestrator.submit(definition()).await.unwrap().wait().await.unwrap();
        assert_eq!(state.status, TaskStatus::Completed);
        assert_eq!(state.provider_id.as_deref(), Some("claude"));
        assert_eq!(state.result.unwrap().output, "scripted");

        let state = orchestrator
            .submit(definition().with_preferred_providers(vec!["codex".into()]))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(state.result.unwrap().output, "from the registered adapter");
        assert_eq!(real.execution_count(), 1);
    }

    #[tokio::test]
    async fn test_build_and_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.checkpoint.path = Some(dir.path().join("checkpoints.db"));

        let orchestrator = OrchestratorBuilder::new(config)
            .with_provider(
                ProviderConfig::new("demo")
                    .with_access_mode(AccessMode::subscription(1, SubscriptionLimits::per_day(10))),
            )
            .with_adapter(Arc::new(ScriptedAdapter::demo("demo", "hello")))
            .build()
            .unwrap();
        assert_eq!(orchestrator.registry().len(), 1);

        let handle = orchestrator
            .submit(TaskDefinition::new("say hello", "demo", "/tmp").with_hitl_policy(HitlPolicy::Autonomous))
            .await
            .unwrap();
        let state = handle.wait().await.unwrap();
        assert_eq!(state.status, TaskStatus::Completed);

        let checkpoint_id = orchestrator.checkpoint(handle.task_id()).await.unwrap();
        assert!(checkpoint_id.starts_with("ckpt_"));
    }
}
