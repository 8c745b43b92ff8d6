//! 人工审批数据模型：策略、审批类型、请求 / 决定、会话辅助状态与事件

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 任务的人工介入策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HitlPolicy {
    /// 全自动，不需要任何审批
    Autonomous,
    /// 仅文件修改需要审批
    #[default]
    ReviewEdits,
    /// 文件修改、命令执行、单步执行需要审批
    ApproveSteps,
    /// 所有动作都需要审批
    Manual,
}

impl HitlPolicy {
    /// 固定矩阵查表
    pub fn requires_approval(self, action: ApprovalType) -> bool {
        use ApprovalType::*;
        match self {
            Self::Autonomous => false,
            Self::ReviewEdits => matches!(action, FileEdit),
            Self::ApproveSteps => matches!(action, FileEdit | CommandExecution | StepExecution),
            Self::Manual => true,
        }
    }
}

/// 需要审批的动作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    FileEdit,
    CommandExecution,
    ApiCall,
    CostThreshold,
    StepExecution,
}

impl ApprovalType {
    pub const ALL: [ApprovalType; 5] = [
        Self::FileEdit,
        Self::CommandExecution,
        Self::ApiCall,
        Self::CostThreshold,
        Self::StepExecution,
    ];

    /// 由 Adapter 上报的工具名推断动作类型，无法识别时按单步执行处理
    pub fn from_tool_name(tool_name: &str) -> Self {
        let name = tool_name.to_ascii_lowercase();
        let has = |keys: &[&str]| keys.iter().any(|k| name.contains(k));
        if has(&["bash", "shell", "exec", "command", "terminal"]) {
            Self::CommandExecution
        } else if has(&["edit", "write", "patch", "create_file"]) {
            Self::FileEdit
        } else if has(&["fetch", "http", "api"]) {
            Self::ApiCall
        } else {
            Self::StepExecution
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::FileEdit => "file_edit",
            Self::CommandExecution => "command_execution",
            Self::ApiCall => "api_call",
            Self::CostThreshold => "cost_threshold",
            Self::StepExecution => "step_execution",
        }
    }
}

/// 审批请求状态；除 Pending 外均为终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Timeout,
}

/// 人工给出的决定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub approved: bool,
    #[serde(default)]
    pub reason: Option<String>,
    /// 审批人对动作参数的修改（原样转交执行方）
    #[serde(default)]
    pub modifications: Option<Value>,
}

impl ApprovalDecision {
    pub fn approve() -> Self {
        Self {
            approved: true,
            reason: None,
            modifications: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: Some(reason.into()),
            modifications: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// 审批请求（决定或超时后不可再变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub task_id: String,
    pub approval_type: ApprovalType,
    pub message: String,
    pub data: Option<Value>,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
    pub decision: Option<ApprovalDecision>,
    pub timeout_ms: u64,
}

impl ApprovalRequest {
    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }
}

/// 列表过滤；status 为空时只列出 Pending
#[derive(Debug, Clone, Default)]
pub struct ApprovalFilter {
    pub task_id: Option<String>,
    pub approval_type: Option<ApprovalType>,
    pub status: Option<ApprovalStatus>,
}

impl ApprovalFilter {
    pub fn for_task(task_id: impl Into<String>) -> Self {
        Self {
            task_id: Some(task_id.into()),
            ..Self::default()
        }
    }

    pub(crate) fn matches(&self, request: &ApprovalRequest) -> bool {
        self.task_id.as_deref().map_or(true, |id| request.task_id == id)
            && self.approval_type.map_or(true, |t| request.approval_type == t)
            && request.status == self.status.unwrap_or(ApprovalStatus::Pending)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// 升级通知（投递到 channel 由外部完成）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub id: String,
    pub session_id: String,
    pub channel: String,
    pub message: String,
    pub urgency: Urgency,
    pub created_at: DateTime<Utc>,
}

/// 会话级人工输入（恢复执行时作为指导注入）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInput {
    pub input: String,
    pub provided_at: DateTime<Utc>,
}

/// HITL 事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HitlEvent {
    ApprovalRequested {
        request: ApprovalRequest,
    },
    ApprovalDecided {
        request: ApprovalRequest,
    },
    ApprovalTimeout {
        request: ApprovalRequest,
        auto_approved: bool,
    },
    ApprovalCancelled {
        request_id: String,
    },
    SessionInterrupted {
        session_id: String,
        reason: String,
    },
    InputProvided {
        session_id: String,
        input: String,
    },
    EscalationCreated {
        escalation: Escalation,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_approval_matrix() {
        use ApprovalType::*;
        use HitlPolicy::*;
        let expected = [
            (Autonomous, [false, false, false, false, false]),
            (ReviewEdits, [true, false, false, false, false]),
            (ApproveSteps, [true, true, false, false, true]),
            (Manual, [true, true, true, true, true]),
        ];
        let columns = [FileEdit, CommandExecution, ApiCall, CostThreshold, StepExecution];
        assert_eq!(columns, ApprovalType::ALL);
        for (policy, row) in expected {
            for (action, want) in columns.iter().zip(row) {
                assert_eq!(policy.requires_approval(*action), want, "{policy:?} / {action:?}");
            }
        }
    }

    #[test]
    fn test_from_tool_name() {
        assert_eq!(ApprovalType::from_tool_name("Bash"), ApprovalType::CommandExecution);
        assert_eq!(ApprovalType::from_tool_name("str_replace_edit"), ApprovalType::FileEdit);
        assert_eq!(ApprovalType::from_tool_name("write_file"), ApprovalType::FileEdit);
        assert_eq!(ApprovalType::from_tool_name("web_fetch"), ApprovalType::ApiCall);
        assert_eq!(ApprovalType::from_tool_name("think"), ApprovalType::StepExecution);
    }

    #[test]
    fn test_policy_serde_names() {
        let policy: HitlPolicy = serde_json::from_str("\"review-edits\"").unwrap();
        assert_eq!(policy, HitlPolicy::ReviewEdits);
        assert_eq!(serde_json::to_string(&ApprovalType::CostThreshold).unwrap(), "\"cost_threshold\"");
    }
}
