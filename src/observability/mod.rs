//! 可观测性：tracing 日志初始化
//!
//! 过滤规则来自 RUST_LOG，未设置时为 info。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // 测试或宿主程序可能已安装全局 subscriber，重复初始化时忽略
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();
}
