//! 编排层错误类型
//!
//! 每个组件一个错误枚举，OrchestratorError 汇总并通过 `#[from]` 转换。

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::task::{TaskId, TaskStatus};

/// Provider 选择失败
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RoutingError {
    /// 没有符合约束的已启用 Provider
    #[error("No provider available: {0}")]
    ProviderUnavailable(String),

    /// 所有订阅额度用尽且不允许（或被拒绝）API 回退
    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        resets_at: Option<DateTime<Utc>>,
    },

    #[error(
        "Cost limit exceeded: estimated ${estimated_cost:.2} (task limit ${max_task_cost:.2}), \
         daily ${daily_cost:.2} of ${daily_budget:.2}"
    )]
    CostLimitExceeded {
        estimated_cost: f64,
        max_task_cost: f64,
        daily_cost: f64,
        daily_budget: f64,
    },
}

/// 审批相关错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HitlError {
    #[error("Approval request timed out: {0}")]
    Timeout(String),

    #[error("Approval request not found: {0}")]
    NotFound(String),

    #[error("Approval request already decided: {0}")]
    AlreadyDecided(String),

    /// 等待期间请求被取消或清理
    #[error("Approval request deleted: {0}")]
    Deleted(String),
}

/// Adapter 执行错误；recoverable 决定是否允许 failover 重试
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct AdapterError {
    pub message: String,
    pub recoverable: bool,
}

impl AdapterError {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: false,
        }
    }

    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: true,
        }
    }
}

/// 检查点存储错误
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint storage error: {0}")]
    Storage(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// 编排核心对外暴露的错误
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Hitl(#[from] HitlError),

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("Approval rejected: {0}")]
    ApprovalRejected(String),

    #[error("Approval timed out: {0}")]
    ApprovalTimeout(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Task {task_id} is {status}")]
    InvalidState { task_id: TaskId, status: TaskStatus },

    #[error("Config error: {0}")]
    Config(String),
}

impl OrchestratorError {
    pub fn task_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "Task",
            id: id.into(),
        }
    }

    pub fn checkpoint_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "Checkpoint",
            id: id.into(),
        }
    }
}
