//! 人工审批控制器
//!
//! 每个 ApprovalRequest 是一个小状态机：pending → approved | rejected | timeout。
//! 等待方持有 oneshot 接收端；决定、取消、清理都在同一把锁下写入请求表并唤醒等待方，
//! 超时路径在锁内复查状态，保证每个请求只落到一个结局。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};

use super::types::{
    ApprovalDecision, ApprovalFilter, ApprovalRequest, ApprovalStatus, ApprovalType, Escalation, HitlEvent,
    HitlPolicy, SessionInput, Urgency,
};
use crate::core::error::HitlError;

const EVENT_CAPACITY: usize = 256;
const AUTO_APPROVE_REASON: &str = "Auto-approved on timeout";

/// 控制器配置
#[derive(Debug, Clone)]
pub struct HitlConfig {
    pub default_timeout: Duration,
    /// 超时后自动批准（否则等待方收到 Timeout 错误）
    pub auto_approve_on_timeout: bool,
}

impl Default for HitlConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(300),
            auto_approve_on_timeout: false,
        }
    }
}

enum WaiterOutcome {
    Decided(ApprovalDecision),
    Deleted,
}

#[derive(Default)]
struct Book {
    requests: HashMap<String, ApprovalRequest>,
    /// 插入顺序，用于创建时间相同时的稳定排序
    order: Vec<String>,
    waiters: HashMap<String, oneshot::Sender<WaiterOutcome>>,
}

impl Book {
    fn remove(&mut self, id: &str) -> Option<ApprovalRequest> {
        let request = self.requests.remove(id)?;
        self.order.retain(|x| x != id);
        if let Some(waiter) = self.waiters.remove(id) {
            let _ = waiter.send(WaiterOutcome::Deleted);
        }
        Some(request)
    }
}

/// HITL 控制器（Clone 共享同一份状态）
#[derive(Clone)]
pub struct HitlController {
    config: HitlConfig,
    book: Arc<Mutex<Book>>,
    session_inputs: Arc<Mutex<HashMap<String, Vec<SessionInput>>>>,
    events: broadcast::Sender<HitlEvent>,
}

impl Default for HitlController {
    fn default() -> Self {
        Self::new(HitlConfig::default())
    }
}

/// 已创建、尚未有结果的审批；`wait` 挂起直到决定、超时或被删除
pub struct PendingApproval {
    request: ApprovalRequest,
    rx: oneshot::Receiver<WaiterOutcome>,
    timeout: Duration,
    controller: HitlController,
}

impl PendingApproval {
    pub fn id(&self) -> &str {
        &self.request.id
    }

    pub fn request(&self) -> &ApprovalRequest {
        &self.request
    }

    pub async fn wait(mut self) -> Result<ApprovalDecision, HitlError> {
        // 借用接收端：决定先到时定时器随 timeout future 一起被丢弃
        let outcome = tokio::time::timeout(self.timeout, &mut self.rx).await;
        match outcome {
            Ok(Ok(WaiterOutcome::Decided(decision))) => Ok(decision),
            Ok(Ok(WaiterOutcome::Deleted)) | Ok(Err(_)) => Err(HitlError::Deleted(self.request.id)),
            Err(_) => self.controller.expire(&self.request.id, &mut self.rx),
        }
    }
}

impl HitlController {
    pub fn new(config: HitlConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            book: Arc::new(Mutex::new(Book::default())),
            session_inputs: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    pub fn config(&self) -> &HitlConfig {
        &self.config
    }

    /// 订阅 HITL 事件
    pub fn subscribe(&self) -> broadcast::Receiver<HitlEvent> {
        self.events.subscribe()
    }

    /// 策略矩阵查表
    pub fn requires_approval(policy: HitlPolicy, action: ApprovalType) -> bool {
        policy.requires_approval(action)
    }

    /// 创建审批请求并等待结果
    pub async fn request_approval(
        &self,
        task_id: &str,
        approval_type: ApprovalType,
        message: impl Into<String>,
        data: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<ApprovalDecision, HitlError> {
        self.open_request(task_id, approval_type, message, data, timeout)
            .wait()
            .await
    }

    /// 只创建请求（发出 approval_requested），由调用方决定何时等待
    pub fn open_request(
        &self,
        task_id: &str,
        approval_type: ApprovalType,
        message: impl Into<String>,
        data: Option<Value>,
        timeout: Option<Duration>,
    ) -> PendingApproval {
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        let request = ApprovalRequest {
            id: format!("approval_{}", uuid::Uuid::new_v4()),
            task_id: task_id.to_string(),
            approval_type,
            message: message.into(),
            data,
            status: ApprovalStatus::Pending,
            created_at: Utc::now(),
            responded_at: None,
            decision: None,
            timeout_ms: timeout.as_millis() as u64,
        };
        let (tx, rx) = oneshot::channel();
        {
            let mut book = self.lock_book();
            book.requests.insert(request.id.clone(), request.clone());
            book.order.push(request.id.clone());
            book.waiters.insert(request.id.clone(), tx);
        }
        tracing::info!(
            task_id,
            approval_id = %request.id,
            approval_type = approval_type.as_str(),
            "Approval requested"
        );
        self.publish(HitlEvent::ApprovalRequested {
            request: request.clone(),
        });
        PendingApproval {
            request,
            rx,
            timeout,
            controller: self.clone(),
        }
    }

    /// 提交决定；未知请求返回 NotFound，已有结果返回 AlreadyDecided（均不修改状态）
    pub fn submit_decision(&self, id: &str, decision: ApprovalDecision) -> Result<ApprovalRequest, HitlError> {
        let request = {
            let mut book = self.lock_book();
            let request = book
                .requests
                .get_mut(id)
                .ok_or_else(|| HitlError::NotFound(id.to_string()))?;
            if !request.is_pending() {
                return Err(HitlError::AlreadyDecided(id.to_string()));
            }
            request.status = if decision.approved {
                ApprovalStatus::Approved
            } else {
                ApprovalStatus::Rejected
            };
            request.responded_at = Some(Utc::now());
            request.decision = Some(decision.clone());
            let request = request.clone();
            if let Some(waiter) = book.waiters.remove(id) {
                let _ = waiter.send(WaiterOutcome::Decided(decision));
            }
            request
        };
        tracing::info!(
            task_id = %request.task_id,
            approval_id = id,
            status = ?request.status,
            "Approval decided"
        );
        self.publish(HitlEvent::ApprovalDecided {
            request: request.clone(),
        });
        Ok(request)
    }

    /// 取消请求，等待方收到 Deleted
    pub fn cancel_approval_request(&self, id: &str) -> Result<(), HitlError> {
        let removed = self.lock_book().remove(id);
        if removed.is_none() {
            return Err(HitlError::NotFound(id.to_string()));
        }
        tracing::info!(approval_id = id, "Approval request cancelled");
        self.publish(HitlEvent::ApprovalCancelled {
            request_id: id.to_string(),
        });
        Ok(())
    }

    /// 按创建时间升序列出匹配的请求
    pub fn get_pending_approvals(&self, filter: &ApprovalFilter) -> Vec<ApprovalRequest> {
        let book = self.lock_book();
        let mut matched: Vec<ApprovalRequest> = book
            .order
            .iter()
            .filter_map(|id| book.requests.get(id))
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        matched.sort_by_key(|r| r.created_at);
        matched
    }

    pub fn get_request(&self, id: &str) -> Option<ApprovalRequest> {
        self.lock_book().requests.get(id).cloned()
    }

    /// 删除早于 max_age 的请求，返回删除数量
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let cutoff = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.cleanup_before(cutoff)
    }

    /// 删除 created_at 严格早于 cutoff 的请求
    pub fn cleanup_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut book = self.lock_book();
        let expired: Vec<String> = book
            .order
            .iter()
            .filter(|id| book.requests.get(*id).map_or(false, |r| r.created_at < cutoff))
            .cloned()
            .collect();
        for id in &expired {
            book.remove(id);
        }
        if !expired.is_empty() {
            tracing::debug!(removed = expired.len(), "Approval requests cleaned up");
        }
        expired.len()
    }

    pub fn interrupt(&self, session_id: &str, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::info!(session_id, %reason, "Session interrupted");
        self.publish(HitlEvent::SessionInterrupted {
            session_id: session_id.to_string(),
            reason,
        });
    }

    /// 追加人工输入，恢复执行时作为指导注入
    pub fn provide_input(&self, session_id: &str, input: impl Into<String>) {
        let input = input.into();
        self.session_inputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(session_id.to_string())
            .or_default()
            .push(SessionInput {
                input: input.clone(),
                provided_at: Utc::now(),
            });
        self.publish(HitlEvent::InputProvided {
            session_id: session_id.to_string(),
            input,
        });
    }

    pub fn get_session_inputs(&self, session_id: &str) -> Vec<SessionInput> {
        self.session_inputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear_session_inputs(&self, session_id: &str) {
        self.session_inputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
    }

    pub fn escalate(
        &self,
        session_id: &str,
        channel: impl Into<String>,
        message: impl Into<String>,
        urgency: Urgency,
    ) -> Escalation {
        let escalation = Escalation {
            id: format!("escalation_{}", uuid::Uuid::new_v4()),
            session_id: session_id.to_string(),
            channel: channel.into(),
            message: message.into(),
            urgency,
            created_at: Utc::now(),
        };
        tracing::warn!(session_id, channel = %escalation.channel, ?urgency, "Escalation created");
        self.publish(HitlEvent::EscalationCreated {
            escalation: escalation.clone(),
        });
        escalation
    }

    /// 超时到期：锁内复查，只有仍为 pending 时才落到超时结局
    fn expire(&self, id: &str, rx: &mut oneshot::Receiver<WaiterOutcome>) -> Result<ApprovalDecision, HitlError> {
        let expired = {
            let mut book = self.lock_book();
            match book.requests.get_mut(id) {
                Some(request) if request.is_pending() => {
                    request.status = ApprovalStatus::Timeout;
                    request.responded_at = Some(Utc::now());
                    if self.config.auto_approve_on_timeout {
                        request.decision = Some(ApprovalDecision::approve().with_reason(AUTO_APPROVE_REASON));
                    }
                    let request = request.clone();
                    book.waiters.remove(id);
                    Some(request)
                }
                _ => None,
            }
        };

        let Some(request) = expired else {
            // 决定或删除已在锁内先行写入通道
            return match rx.try_recv() {
                Ok(WaiterOutcome::Decided(decision)) => Ok(decision),
                _ => Err(HitlError::Deleted(id.to_string())),
            };
        };

        let auto_approved = self.config.auto_approve_on_timeout;
        tracing::warn!(task_id = %request.task_id, approval_id = id, auto_approved, "Approval timed out");
        let decision = request.decision.clone();
        self.publish(HitlEvent::ApprovalTimeout { request, auto_approved });
        match decision {
            Some(decision) if auto_approved => Ok(decision),
            _ => Err(HitlError::Timeout(id.to_string())),
        }
    }

    fn publish(&self, event: HitlEvent) {
        // 没有订阅者时 send 返回 Err，忽略
        let _ = self.events.send(event);
    }

    fn lock_book(&self) -> std::sync::MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
