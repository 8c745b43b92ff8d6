//! Hive - 多智能体编码任务编排控制面
//!
//! 模块划分：
//! - **adapter**: 执行后端抽象（Adapter trait、事件类型、脚本化实现）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 任务模型、队列、检查点、编排器
//! - **hitl**: 人工审批、会话输入与升级
//! - **observability**: tracing 初始化
//! - **providers**: Provider 目录、限流、成本与路由
//! - **stream**: 任务进度事件与订阅
//! - **worker**: 远程 worker 池线路协议

pub mod adapter;
pub mod config;
pub mod core;
pub mod hitl;
pub mod observability;
pub mod providers;
pub mod stream;
pub mod worker;

pub use crate::core::{Orchestrator, OrchestratorBuilder, OrchestratorError, TaskDefinition, TaskHandle};
