//! 任务模型：定义（不可变）、状态（随执行推进）、优先级
//!
//! 状态机：
//! pending → queued → running ⇄ paused → completed | failed | cancelled
//! 终态不可再变。

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::adapter::ExecutionResult;
use crate::hitl::HitlPolicy;
use crate::providers::AccessModeKind;

/// 任务 ID
pub type TaskId = String;

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// 已创建，尚未入队
    Pending,
    /// 等待执行槽
    Queued,
    /// 正在执行
    Running,
    /// 已暂停（用户暂停或 Adapter 中断）
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务优先级
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Urgent = 3,
}

/// 路由约束
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskConstraints {
    /// Provider 必须具备的能力标签
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub estimated_input_tokens: Option<u64>,
    #[serde(default)]
    pub estimated_output_tokens: Option<u64>,
}

/// 提交时给出的任务定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub prompt: String,
    pub project_key: String,
    pub repository_path: PathBuf,
    /// 仅在这些 Provider 中选择（None 表示不限）
    #[serde(default)]
    pub preferred_providers: Option<Vec<String>>,
    #[serde(default)]
    pub exclude_providers: Vec<String>,
    #[serde(default)]
    pub preferred_access_mode: Option<AccessModeKind>,
    /// 订阅额度用尽时是否允许回退到计量 API
    #[serde(default)]
    pub allow_api_failover: bool,
    /// 单任务 API 费用上限（美元）
    #[serde(default)]
    pub max_api_cost_usd: f64,
    #[serde(default)]
    pub constraints: Option<TaskConstraints>,
    #[serde(default)]
    pub hitl_policy: HitlPolicy,
    #[serde(default)]
    pub priority: TaskPriority,
}

impl TaskDefinition {
    pub fn new(
        prompt: impl Into<String>,
        project_key: impl Into<String>,
        repository_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            project_key: project_key.into(),
            repository_path: repository_path.into(),
            preferred_providers: None,
            exclude_providers: Vec::new(),
            preferred_access_mode: None,
            allow_api_failover: false,
            max_api_cost_usd: 0.0,
            constraints: None,
            hitl_policy: HitlPolicy::default(),
            priority: TaskPriority::Normal,
        }
    }

    pub fn with_preferred_providers(mut self, providers: Vec<String>) -> Self {
        self.preferred_providers = Some(providers);
        self
    }

    pub fn with_excluded_providers(mut self, providers: Vec<String>) -> Self {
        self.exclude_providers = providers;
        self
    }

    pub fn with_preferred_access_mode(mut self, mode: AccessModeKind) -> Self {
        self.preferred_access_mode = Some(mode);
        self
    }

    /// 允许 API 回退，并设置单任务费用上限
    pub fn with_api_failover(mut self, max_cost_usd: f64) -> Self {
        self.allow_api_failover = true;
        self.max_api_cost_usd = max_cost_usd;
        self
    }

    pub fn with_constraints(mut self, constraints: TaskConstraints) -> Self {
        self.constraints = Some(constraints);
        self
    }

    pub fn with_hitl_policy(mut self, policy: HitlPolicy) -> Self {
        self.hitl_policy = policy;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// 任务运行状态（由编排核心独占修改，对外只给快照）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub id: TaskId,
    pub definition: TaskDefinition,
    pub status: TaskStatus,
    pub provider_id: Option<String>,
    pub access_mode: Option<AccessModeKind>,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<ExecutionResult>,
    pub error: Option<String>,
    /// 已尝试的 Provider 次数（含 failover）
    #[serde(default)]
    pub attempts: u32,
}

impl TaskState {
    pub fn new(definition: TaskDefinition) -> Self {
        Self::with_id(format!("task_{}", uuid::Uuid::new_v4()), definition)
    }

    pub fn with_id(id: impl Into<TaskId>, definition: TaskDefinition) -> Self {
        Self {
            id: id.into(),
            definition,
            status: TaskStatus::Pending,
            provider_id: None,
            access_mode: None,
            session_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            attempts: 0,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}
