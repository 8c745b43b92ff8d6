//! worker ↔ 编排器消息
//!
//! JSON 文本帧，`type` 字段区分消息（带点号的名字，如 `task.assign`），时间戳为 ISO-8601。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::adapter::{AgentEvent, ExecutionRequest, ExecutionResult, TokenUsage};
use crate::core::task::TaskId;
use crate::providers::AccessModeKind;

pub type WorkerId = String;

/// 资源描述
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    /// CPU 核数
    pub cpu: f64,
    /// 内存（MB）
    pub memory: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Draining,
}

/// worker → 编排器
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerMessage {
    #[serde(rename = "register")]
    Register {
        worker_id: WorkerId,
        /// 该 worker 能驱动的 Provider
        providers: Vec<String>,
        resources: Resources,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "heartbeat")]
    Heartbeat {
        worker_id: WorkerId,
        status: WorkerStatus,
        #[serde(default)]
        current_task: Option<TaskId>,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "task.progress")]
    TaskProgress {
        worker_id: WorkerId,
        task_id: TaskId,
        content: String,
        #[serde(default)]
        is_partial: bool,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "task.result")]
    TaskResult {
        worker_id: WorkerId,
        task_id: TaskId,
        success: bool,
        output: String,
        #[serde(default)]
        session_id: Option<String>,
        duration_ms: u64,
        #[serde(default)]
        tokens_used: Option<TokenUsage>,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "error")]
    Error {
        worker_id: WorkerId,
        #[serde(default)]
        task_id: Option<TaskId>,
        message: String,
        #[serde(default)]
        recoverable: bool,
        timestamp: DateTime<Utc>,
    },
}

impl WorkerMessage {
    pub fn worker_id(&self) -> &str {
        match self {
            Self::Register { worker_id, .. }
            | Self::Heartbeat { worker_id, .. }
            | Self::TaskProgress { worker_id, .. }
            | Self::TaskResult { worker_id, .. }
            | Self::Error { worker_id, .. } => worker_id,
        }
    }

    /// 与任务执行相关的消息转换为 Adapter 事件；register / heartbeat 返回 None
    pub fn to_agent_event(&self) -> Option<AgentEvent> {
        match self {
            Self::Register { .. } | Self::Heartbeat { .. } => None,
            Self::TaskProgress {
                content, is_partial, ..
            } => Some(AgentEvent::Output {
                content: content.clone(),
                is_partial: *is_partial,
            }),
            Self::TaskResult {
                success,
                output,
                session_id,
                duration_ms,
                tokens_used,
                ..
            } => Some(AgentEvent::Complete {
                result: ExecutionResult {
                    success: *success,
                    output: output.clone(),
                    session_id: session_id.clone(),
                    duration_ms: *duration_ms,
                    tokens_used: *tokens_used,
                },
            }),
            Self::Error {
                message, recoverable, ..
            } => Some(AgentEvent::Error {
                error: message.clone(),
                recoverable: *recoverable,
            }),
        }
    }
}

/// 编排器 → worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OrchestratorMessage {
    #[serde(rename = "registered")]
    Registered {
        worker_id: WorkerId,
        /// 期望的心跳间隔（毫秒）
        heartbeat_interval_ms: u64,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "task.assign")]
    TaskAssign {
        task_id: TaskId,
        prompt: String,
        repository_path: String,
        access_mode: AccessModeKind,
        #[serde(default)]
        guidance: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "task.cancel")]
    TaskCancel {
        task_id: TaskId,
        #[serde(default)]
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "shutdown")]
    Shutdown {
        #[serde(default)]
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "ping")]
    Ping { timestamp: DateTime<Utc> },
}

impl OrchestratorMessage {
    pub fn assign(request: &ExecutionRequest) -> Self {
        Self::TaskAssign {
            task_id: request.task_id.clone(),
            prompt: request.definition.prompt.clone(),
            repository_path: request.definition.repository_path.display().to_string(),
            access_mode: request.access_mode,
            guidance: request.guidance.clone(),
            timestamp: Utc::now(),
        }
    }

    pub fn cancel(task_id: impl Into<TaskId>, reason: Option<String>) -> Self {
        Self::TaskCancel {
            task_id: task_id.into(),
            reason,
            timestamp: Utc::now(),
        }
    }

    pub fn ping() -> Self {
        Self::Ping { timestamp: Utc::now() }
    }
}
