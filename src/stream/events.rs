//! 任务事件与状态投影
//!
//! TaskProgress 是事件序列的纯左折叠：同一序列折叠结果一定相同。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::adapter::{AgentEvent, TokenUsage};
use crate::core::task::{TaskId, TaskStatus};
use crate::hitl::ApprovalType;
use crate::providers::AccessModeKind;

/// 单个任务事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: TaskEventKind,
}

impl TaskEvent {
    pub fn new(task_id: impl Into<TaskId>, kind: TaskEventKind) -> Self {
        Self {
            task_id: task_id.into(),
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }

    /// 把 Adapter 原生事件映射为任务事件；start/output/complete/error/interrupt 之外的事件丢弃
    pub fn from_agent_event(task_id: &str, event: &AgentEvent) -> Option<Self> {
        let kind = match event {
            AgentEvent::Start { session_id } => TaskEventKind::Started {
                provider_id: None,
                access_mode: None,
                session_id: Some(session_id.clone()),
            },
            AgentEvent::Output { content, is_partial } => TaskEventKind::Output {
                content: content.clone(),
                is_partial: *is_partial,
            },
            AgentEvent::Complete { result } => TaskEventKind::Completed {
                output: result.output.clone(),
                duration_ms: result.duration_ms,
                tokens_used: result.tokens_used,
            },
            AgentEvent::Error { error, .. } => TaskEventKind::Failed { error: error.clone() },
            AgentEvent::Interrupt { reason } => TaskEventKind::Paused { reason: reason.clone() },
            _ => return None,
        };
        Some(Self::new(task_id, kind))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEventKind {
    Queued {
        position: usize,
    },
    Started {
        provider_id: Option<String>,
        access_mode: Option<AccessModeKind>,
        session_id: Option<String>,
    },
    Progress {
        /// 0-100，由事件产生方负责截断
        progress: u8,
        message: Option<String>,
    },
    Output {
        content: String,
        is_partial: bool,
    },
    Paused {
        reason: String,
    },
    Resumed,
    Completed {
        output: String,
        duration_ms: u64,
        tokens_used: Option<TokenUsage>,
    },
    Failed {
        error: String,
    },
    Cancelled {
        reason: String,
    },
    CheckpointCreated {
        checkpoint_id: String,
    },
    ApprovalRequested {
        approval_id: String,
        approval_type: ApprovalType,
        message: String,
    },
    ApprovalDecided {
        approval_id: String,
        approved: bool,
        reason: Option<String>,
    },
}

impl TaskEventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Queued { .. } => "queued",
            Self::Started { .. } => "started",
            Self::Progress { .. } => "progress",
            Self::Output { .. } => "output",
            Self::Paused { .. } => "paused",
            Self::Resumed => "resumed",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Cancelled { .. } => "cancelled",
            Self::CheckpointCreated { .. } => "checkpoint_created",
            Self::ApprovalRequested { .. } => "approval_requested",
            Self::ApprovalDecided { .. } => "approval_decided",
        }
    }
}

/// 任务状态投影（供 get_status 查询）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskProgress {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub progress: u8,
    pub output: String,
    pub provider_id: Option<String>,
    pub session_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl TaskProgress {
    pub fn new(task_id: impl Into<TaskId>, at: DateTime<Utc>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Pending,
            progress: 0,
            output: String::new(),
            provider_id: None,
            session_id: None,
            started_at: None,
            completed_at: None,
            error: None,
            last_updated: at,
        }
    }

    /// 折叠一个事件；终态之后的状态类事件被忽略，输出仍然累计
    pub fn apply(&mut self, event: &TaskEvent) {
        self.last_updated = event.timestamp;
        let terminal = self.status.is_terminal();
        match &event.kind {
            TaskEventKind::Output { content, .. } => self.output.push_str(content),
            _ if terminal => {}
            TaskEventKind::Queued { .. } => self.status = TaskStatus::Queued,
            TaskEventKind::Started {
                provider_id,
                session_id,
                ..
            } => {
                // 同一次运行里补发的 started（带上 session id）不清零进度
                if self.status != TaskStatus::Running {
                    self.progress = 0;
                }
                self.status = TaskStatus::Running;
                if provider_id.is_some() {
                    self.provider_id = provider_id.clone();
                }
                if session_id.is_some() {
                    self.session_id = session_id.clone();
                }
                self.started_at.get_or_insert(event.timestamp);
            }
            TaskEventKind::Progress { progress, .. } => self.progress = *progress,
            TaskEventKind::Paused { .. } => self.status = TaskStatus::Paused,
            TaskEventKind::Resumed => self.status = TaskStatus::Running,
            TaskEventKind::Completed { .. } => {
                self.status = TaskStatus::Completed;
                self.progress = 100;
                self.completed_at = Some(event.timestamp);
            }
            TaskEventKind::Failed { error } => {
                self.status = TaskStatus::Failed;
                self.error = Some(error.clone());
                self.completed_at = Some(event.timestamp);
            }
            TaskEventKind::Cancelled { .. } => {
                self.status = TaskStatus::Cancelled;
                self.completed_at = Some(event.timestamp);
            }
            TaskEventKind::CheckpointCreated { .. }
            | TaskEventKind::ApprovalRequested { .. }
            | TaskEventKind::ApprovalDecided { .. } => {}
        }
    }

    pub fn fold<'a>(task_id: &str, events: impl IntoIterator<Item = &'a TaskEvent>) -> Self {
        let mut progress = Self::new(task_id, Utc::now());
        for event in events {
            progress.apply(event);
        }
        progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ExecutionResult;

    fn ev(kind: TaskEventKind) -> TaskEvent {
        TaskEvent::new("t1", kind)
    }

    #[test]
    fn test_fold_output_and_completion() {
        let events = vec![
            ev(TaskEventKind::Queued { position: 0 }),
            ev(TaskEventKind::Started {
                provider_id: Some("demo".into()),
                access_mode: Some(AccessModeKind::Subscription),
                session_id: None,
            }),
            ev(TaskEventKind::Output {
                content: "hello ".into(),
                is_partial: true,
            }),
            ev(TaskEventKind::Progress {
                progress: 40,
                message: None,
            }),
            ev(TaskEventKind::Output {
                content: "world".into(),
                is_partial: false,
            }),
            ev(TaskEventKind::Completed {
                output: "hello world".into(),
                duration_ms: 5,
                tokens_used: None,
            }),
        ];
        let progress = TaskProgress::fold("t1", &events);
        assert_eq!(progress.status, TaskStatus::Completed);
        assert_eq!(progress.progress, 100);
        assert_eq!(progress.output, "hello world");
        assert_eq!(progress.provider_id.as_deref(), Some("demo"));
        assert!(progress.completed_at.is_some());
    }

    #[test]
    fn test_terminal_is_sticky() {
        let events = vec![
            ev(TaskEventKind::Cancelled { reason: "user".into() }),
            ev(TaskEventKind::Started {
                provider_id: None,
                access_mode: None,
                session_id: None,
            }),
            ev(TaskEventKind::Completed {
                output: String::new(),
                duration_ms: 0,
                tokens_used: None,
            }),
        ];
        let progress = TaskProgress::fold("t1", &events);
        assert_eq!(progress.status, TaskStatus::Cancelled);
        assert_eq!(progress.progress, 0);
    }

    #[test]
    fn test_session_started_keeps_progress() {
        let started = |session_id: Option<&str>| {
            ev(TaskEventKind::Started {
                provider_id: Some("demo".into()),
                access_mode: Some(AccessModeKind::Subscription),
                session_id: session_id.map(String::from),
            })
        };
        let progress = TaskProgress::fold(
            "t1",
            &[
                started(None),
                ev(TaskEventKind::Progress {
                    progress: 30,
                    message: None,
                }),
                started(Some("s1")),
            ],
        );
        assert_eq!(progress.status, TaskStatus::Running);
        assert_eq!(progress.progress, 30);
        assert_eq!(progress.session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn test_pause_resume_toggle() {
        let mut progress = TaskProgress::new("t1", Utc::now());
        progress.apply(&ev(TaskEventKind::Paused { reason: "user".into() }));
        assert_eq!(progress.status, TaskStatus::Paused);
        progress.apply(&ev(TaskEventKind::Resumed));
        assert_eq!(progress.status, TaskStatus::Running);
    }

    #[test]
    fn test_from_agent_event_mapping() {
        let complete = AgentEvent::Complete {
            result: ExecutionResult {
                success: true,
                output: "ok".into(),
                session_id: None,
                duration_ms: 1,
                tokens_used: None,
            },
        };
        let mapped = TaskEvent::from_agent_event("t1", &complete).unwrap();
        assert_eq!(mapped.kind.name(), "completed");

        let interrupt = AgentEvent::Interrupt { reason: "stop".into() };
        assert_eq!(TaskEvent::from_agent_event("t1", &interrupt).unwrap().kind.name(), "paused");

        let tool = AgentEvent::ToolUse {
            tool_name: "bash".into(),
            tool_input: serde_json::Value::Null,
        };
        assert!(TaskEvent::from_agent_event("t1", &tool).is_none());
    }

    #[test]
    fn test_event_wire_shape() {
        let json = serde_json::to_value(ev(TaskEventKind::Progress {
            progress: 40,
            message: None,
        }))
        .unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["task_id"], "t1");
        assert_eq!(json["progress"], 40);
    }
}
