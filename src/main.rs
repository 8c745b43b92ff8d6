//! Hive - 多智能体编码任务编排控制面
//!
//! 入口：加载配置、初始化日志、组装编排器，提交命令行给出的任务并打印事件流。

use std::path::PathBuf;

use anyhow::Context;
use futures_util::StreamExt;
use hive::config::{load_config, AppConfig};
use hive::core::TaskStatus;
use hive::providers::{AccessMode, ProviderConfig, SubscriptionLimits};
use hive::{observability, OrchestratorBuilder, TaskDefinition};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::var_os("HIVE_CONFIG").map(PathBuf::from);
    let config = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    let prompt = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    let prompt = if prompt.trim().is_empty() {
        "Summarise the repository layout".to_string()
    } else {
        prompt
    };

    // 本地没有真实 Adapter：配置中的 Provider 都由脚本化 Adapter 驱动，未配置时补一个 demo
    let needs_demo = config.providers.is_empty();
    let mut builder =
        OrchestratorBuilder::new(config).with_scripted_adapters(format!("demo run for: {prompt}"));
    if needs_demo {
        builder = builder.with_provider(
            ProviderConfig::new("demo").with_access_mode(AccessMode::subscription(1, SubscriptionLimits::per_day(500))),
        );
    }
    let orchestrator = builder.build().context("Failed to build orchestrator")?;

    let repository = std::env::current_dir().context("Failed to resolve current directory")?;
    let handle = orchestrator
        .submit(TaskDefinition::new(prompt, "cli", repository))
        .await
        .context("Failed to submit task")?;

    let mut events = handle.subscribe();
    while let Some(event) = events.next().await {
        println!("{}", serde_json::to_string(&event)?);
    }

    let state = handle.get_status().await?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    if state.status != TaskStatus::Completed {
        std::process::exit(1);
    }
    Ok(())
}
