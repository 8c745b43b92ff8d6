//! 人工介入（HITL）：审批请求状态机、策略矩阵、会话输入与升级

pub mod controller;
pub mod types;

pub use controller::{HitlConfig, HitlController, PendingApproval};
pub use types::{
    ApprovalDecision, ApprovalFilter, ApprovalRequest, ApprovalStatus, ApprovalType, Escalation, HitlEvent,
    HitlPolicy, SessionInput, Urgency,
};
