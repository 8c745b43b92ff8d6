//! 编排核心：任务生命周期的组合根
//!
//! 负责：为任务分配 id 并入队；执行器内依次完成 Provider 选择、Adapter 执行、
//! 事件翻译（进度流）与工具审批（HITL），并在结束时回写用量。
//! 对外提供 submit / status / cancel / pause / resume / checkpoint / restore / subscribe。
//!
//! 终态只写一次：所有终态转换都经过 `finish`，在任务表写锁内复查后才落状态并发出事件。

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

use super::checkpoint::{CheckpointRecord, CheckpointStore};
use super::error::{HitlError, OrchestratorError};
use super::queue::TaskQueue;
use super::task::{TaskDefinition, TaskId, TaskState, TaskStatus};
use crate::adapter::{Adapter, AgentEvent, ExecutionRequest, ExecutionResult};
use crate::hitl::{ApprovalFilter, ApprovalType, HitlController};
use crate::providers::{ProviderConfig, ProviderRegistry, ProviderRouter, ProviderSelection};
use crate::stream::{ProgressStream, TaskEvent, TaskEventKind, TaskEventStream};

/// 可恢复错误的 failover 配置
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// 第 n 次重试等待 retry_delay * multiplier^n
    pub backoff_multiplier: f64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        }
    }
}

impl FailoverConfig {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt as i32);
        self.retry_delay.mul_f64(factor)
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_concurrency: usize,
    pub failover: FailoverConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 2,
            failover: FailoverConfig::default(),
        }
    }
}

struct TaskRecord {
    state: TaskState,
    /// true 表示暂停：执行器停止拉取 Adapter 事件直到恢复
    pause: watch::Sender<bool>,
    active_adapter: Option<Arc<dyn Adapter>>,
}

impl TaskRecord {
    fn new(state: TaskState) -> Self {
        let (pause, _) = watch::channel(false);
        Self {
            state,
            pause,
            active_adapter: None,
        }
    }
}

struct Inner {
    config: OrchestratorConfig,
    queue: TaskQueue,
    router: Arc<ProviderRouter>,
    hitl: HitlController,
    stream: ProgressStream,
    checkpoints: Arc<dyn CheckpointStore>,
    adapters: StdRwLock<HashMap<String, Arc<dyn Adapter>>>,
    tasks: RwLock<HashMap<TaskId, TaskRecord>>,
}

/// 编排器（Clone 共享同一份状态）
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

/// submit / restore 返回的任务句柄
#[derive(Clone)]
pub struct TaskHandle {
    task_id: TaskId,
    orchestrator: Orchestrator,
}

impl TaskHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn subscribe(&self) -> TaskEventStream {
        self.orchestrator.subscribe(&self.task_id)
    }

    pub async fn get_status(&self) -> Result<TaskState, OrchestratorError> {
        self.orchestrator.status(&self.task_id).await
    }

    pub async fn cancel(&self) -> Result<TaskState, OrchestratorError> {
        self.orchestrator.cancel(&self.task_id).await
    }

    /// 等待事件流结束后返回最终状态
    pub async fn wait(&self) -> Result<TaskState, OrchestratorError> {
        let mut events = self.subscribe();
        while events.next().await.is_some() {}
        self.get_status().await
    }
}

/// 单次 Provider 尝试的结果
enum Attempt {
    /// 任务已进入终态（或被取消），不再继续
    Done,
    /// 可恢复失败，换 Provider 重试
    Retry { provider_id: String, error: String },
}

/// 工具审批的结果
enum Gate {
    Approved,
    /// 被拒绝或超时，任务已失败
    Stopped,
    Cancelled,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        router: Arc<ProviderRouter>,
        hitl: HitlController,
        stream: ProgressStream,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: TaskQueue::new(config.max_concurrency),
                config,
                router,
                hitl,
                stream,
                checkpoints,
                adapters: StdRwLock::new(HashMap::new()),
                tasks: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn router(&self) -> &Arc<ProviderRouter> {
        &self.inner.router
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        self.inner.router.registry()
    }

    pub fn hitl(&self) -> &HitlController {
        &self.inner.hitl
    }

    pub fn stream(&self) -> &ProgressStream {
        &self.inner.stream
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.inner.queue
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// 按 adapter.id() 注册（同 id 覆盖）
    pub fn register_adapter(&self, adapter: Arc<dyn Adapter>) {
        let id = adapter.id().to_string();
        tracing::info!(provider = %id, "Adapter registered");
        self.inner
            .adapters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, adapter);
    }

    /// 先 initialize 再注册
    pub async fn initialize_adapter(
        &self,
        adapter: Arc<dyn Adapter>,
        config: &serde_json::Value,
    ) -> Result<(), OrchestratorError> {
        adapter.initialize(config).await?;
        self.register_adapter(adapter);
        Ok(())
    }

    pub fn register_provider(&self, provider: ProviderConfig) {
        self.inner.router.register_provider(provider);
    }

    pub async fn submit(&self, definition: TaskDefinition) -> Result<TaskHandle, OrchestratorError> {
        self.submit_state(TaskState::new(definition)).await
    }

    /// 使用调用方给定的 task id 提交；同 id 的任务仍在进行中时返回 InvalidState
    pub async fn submit_with_id(
        &self,
        task_id: impl Into<TaskId>,
        definition: TaskDefinition,
    ) -> Result<TaskHandle, OrchestratorError> {
        self.submit_state(TaskState::with_id(task_id, definition)).await
    }

    async fn submit_state(&self, state: TaskState) -> Result<TaskHandle, OrchestratorError> {
        let task_id = state.id.clone();
        {
            let tasks = self.inner.tasks.read().await;
            if let Some(existing) = tasks.get(&task_id) {
                if !existing.state.is_finished() || self.inner.queue.is_running(&task_id) {
                    return Err(OrchestratorError::InvalidState {
                        task_id,
                        status: existing.state.status,
                    });
                }
            }
        }
        self.inner.stream.cleanup(&task_id);
        tracing::info!(task_id = %task_id, priority = ?state.definition.priority, "Task submitted");
        self.admit(state).await;
        Ok(self.handle(task_id))
    }

    /// pending → queued，发出 queued 事件后入队
    async fn admit(&self, mut state: TaskState) {
        let task_id = state.id.clone();
        let priority = state.definition.priority;
        state.status = TaskStatus::Queued;
        self.inner.tasks.write().await.insert(task_id.clone(), TaskRecord::new(state));

        let position = self.inner.queue.queued_ahead(priority);
        self.inner
            .stream
            .emit(TaskEvent::new(task_id.clone(), TaskEventKind::Queued { position }));

        let this = self.clone();
        let id = task_id.clone();
        self.inner
            .queue
            .enqueue(task_id, move |token| async move { this.run_task(id, token).await }, priority);
    }

    pub async fn status(&self, task_id: &str) -> Result<TaskState, OrchestratorError> {
        self.inner
            .tasks
            .read()
            .await
            .get(task_id)
            .map(|r| r.state.clone())
            .ok_or_else(|| OrchestratorError::task_not_found(task_id))
    }

    /// 所有已知任务的快照，按创建时间排序
    pub async fn list_tasks(&self) -> Vec<TaskState> {
        let mut tasks: Vec<TaskState> = self
            .inner
            .tasks
            .read()
            .await
            .values()
            .map(|r| r.state.clone())
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// 取消任务：运行中则中断 Adapter，排队中则移出队列；已在终态时原样返回
    pub async fn cancel(&self, task_id: &str) -> Result<TaskState, OrchestratorError> {
        let (state, adapter) = {
            let mut tasks = self.inner.tasks.write().await;
            let record = tasks
                .get_mut(task_id)
                .ok_or_else(|| OrchestratorError::task_not_found(task_id))?;
            if record.state.is_finished() {
                return Ok(record.state.clone());
            }
            record.state.status = TaskStatus::Cancelled;
            record.state.completed_at = Some(Utc::now());
            let adapter = record.active_adapter.take();
            self.inner.stream.emit(TaskEvent::new(
                task_id,
                TaskEventKind::Cancelled {
                    reason: "cancelled by user".to_string(),
                },
            ));
            (record.state.clone(), adapter)
        };

        let outcome = self.inner.queue.cancel(task_id);
        if let Some(adapter) = adapter {
            adapter.interrupt().await;
        }
        tracing::info!(task_id, ?outcome, "Task cancelled");
        Ok(state)
    }

    /// 暂停运行中的任务：执行器停止翻译 Adapter 事件
    pub async fn pause(&self, task_id: &str) -> Result<TaskState, OrchestratorError> {
        self.set_paused(task_id, true).await
    }

    pub async fn resume(&self, task_id: &str) -> Result<TaskState, OrchestratorError> {
        self.set_paused(task_id, false).await
    }

    async fn set_paused(&self, task_id: &str, paused: bool) -> Result<TaskState, OrchestratorError> {
        let mut tasks = self.inner.tasks.write().await;
        let record = tasks
            .get_mut(task_id)
            .ok_or_else(|| OrchestratorError::task_not_found(task_id))?;
        let expected = if paused {
            TaskStatus::Running
        } else {
            TaskStatus::Paused
        };
        if record.state.status != expected {
            return Err(OrchestratorError::InvalidState {
                task_id: task_id.to_string(),
                status: record.state.status,
            });
        }

        let kind = if paused {
            record.state.status = TaskStatus::Paused;
            TaskEventKind::Paused {
                reason: "paused by user".to_string(),
            }
        } else {
            record.state.status = TaskStatus::Running;
            TaskEventKind::Resumed
        };
        record.pause.send_replace(paused);
        self.inner.stream.emit(TaskEvent::new(task_id, kind));
        tracing::info!(task_id, paused, "Task pause toggled");
        Ok(record.state.clone())
    }

    /// 保存当前状态到检查点存储
    pub async fn checkpoint(&self, task_id: &str) -> Result<String, OrchestratorError> {
        let state = self.status(task_id).await?;
        let finished = state.is_finished();
        let mut record = CheckpointRecord::new(state);
        record.queue_position = self.inner.queue.position(task_id);
        record.pending_approvals = self
            .inner
            .hitl
            .get_pending_approvals(&ApprovalFilter::for_task(task_id))
            .into_iter()
            .map(|r| r.id)
            .collect();
        self.inner.checkpoints.save(&record).await?;

        let checkpoint_id = record.checkpoint_id;
        // 终态任务的回放缓冲以终态事件结尾，不再追加
        if !finished {
            self.inner.stream.emit(TaskEvent::new(
                task_id,
                TaskEventKind::CheckpointCreated {
                    checkpoint_id: checkpoint_id.clone(),
                },
            ));
        }
        tracing::info!(task_id, checkpoint_id = %checkpoint_id, "Checkpoint created");
        Ok(checkpoint_id)
    }

    /// 从检查点恢复：终态快照只登记不执行，其余重新入队
    pub async fn restore(&self, checkpoint_id: &str) -> Result<TaskHandle, OrchestratorError> {
        let record = self
            .inner
            .checkpoints
            .load(checkpoint_id)
            .await?
            .ok_or_else(|| OrchestratorError::checkpoint_not_found(checkpoint_id))?;
        let mut state = record.snapshot;
        let task_id = state.id.clone();

        {
            let tasks = self.inner.tasks.read().await;
            let active = tasks.get(&task_id).filter(|r| !r.state.is_finished());
            if let Some(active) = active {
                return Err(OrchestratorError::InvalidState {
                    task_id,
                    status: active.state.status,
                });
            }
        }
        if self.inner.queue.is_running(&task_id) {
            return Err(OrchestratorError::InvalidState {
                task_id,
                status: state.status,
            });
        }

        if state.is_finished() {
            tracing::info!(task_id = %task_id, checkpoint_id, status = %state.status, "Restored finished task");
            self.inner.tasks.write().await.insert(task_id.clone(), TaskRecord::new(state));
            return Ok(self.handle(task_id));
        }

        state.status = TaskStatus::Pending;
        state.started_at = None;
        state.completed_at = None;
        state.result = None;
        state.error = None;
        self.inner.stream.cleanup(&task_id);
        tracing::info!(task_id = %task_id, checkpoint_id, "Task restored from checkpoint");
        self.admit(state).await;
        Ok(self.handle(task_id))
    }

    pub fn subscribe(&self, task_id: &str) -> TaskEventStream {
        self.inner.stream.subscribe(task_id)
    }

    fn handle(&self, task_id: TaskId) -> TaskHandle {
        TaskHandle {
            task_id,
            orchestrator: self.clone(),
        }
    }

    fn adapter(&self, provider_id: &str) -> Option<Arc<dyn Adapter>> {
        self.inner
            .adapters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider_id)
            .cloned()
    }

    // ---------- 执行器 ----------

    async fn run_task(self, task_id: TaskId, token: CancellationToken) {
        let failover = self.inner.config.failover.clone();
        let mut excluded: Vec<String> = Vec::new();
        let mut retries = 0u32;

        loop {
            match self.run_attempt(&task_id, &token, &excluded).await {
                Attempt::Done => return,
                Attempt::Retry { provider_id, error } => {
                    if retries >= failover.max_retries {
                        self.fail(&task_id, format!("{error} (after {retries} failover retries)"))
                            .await;
                        return;
                    }
                    let delay = failover.delay_for(retries);
                    retries += 1;
                    tracing::warn!(
                        task_id = %task_id,
                        provider = %provider_id,
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "Recoverable failure, failing over"
                    );
                    excluded.push(provider_id);
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn run_attempt(&self, task_id: &str, token: &CancellationToken, excluded: &[String]) -> Attempt {
        // 重试间隔内被暂停时，恢复前不重新选择 Provider
        if token.is_cancelled() || !self.wait_while_paused(task_id, token).await {
            return Attempt::Done;
        }
        let Some(state) = self.active_state(task_id).await else {
            return Attempt::Done;
        };
        let definition = state.definition;

        // 选择 Provider（可能挂起在成本确认上）
        let selection = tokio::select! {
            _ = token.cancelled() => return Attempt::Done,
            selection = self.inner.router.select_provider_excluding(&definition, excluded) => selection,
        };
        let selection = match selection {
            Ok(selection) => selection,
            Err(err) => {
                self.fail(task_id, err.to_string()).await;
                return Attempt::Done;
            }
        };
        tracing::info!(
            task_id,
            provider = %selection.provider_id,
            mode = %selection.access_mode,
            reason = %selection.reason,
            "Provider selected"
        );

        let Some(adapter) = self.adapter(&selection.provider_id) else {
            self.fail(task_id, format!("No adapter registered for provider {}", selection.provider_id))
                .await;
            return Attempt::Done;
        };
        let available = tokio::select! {
            _ = token.cancelled() => return Attempt::Done,
            available = adapter.is_available() => available,
        };
        if !available {
            self.fail(task_id, format!("Provider {} is not available", selection.provider_id))
                .await;
            return Attempt::Done;
        }

        if !self.wait_while_paused(task_id, token).await {
            return Attempt::Done;
        }
        let Some(session_id) = self.mark_running(task_id, &selection, &adapter).await else {
            return Attempt::Done;
        };
        let mut guidance: Vec<String> = self
            .inner
            .hitl
            .get_session_inputs(task_id)
            .into_iter()
            .map(|i| i.input)
            .collect();
        if let Some(session_id) = &session_id {
            guidance.extend(self.inner.hitl.get_session_inputs(session_id).into_iter().map(|i| i.input));
        }

        let request = ExecutionRequest {
            task_id: task_id.to_string(),
            definition: definition.clone(),
            access_mode: selection.access_mode,
            guidance,
        };
        let execution = tokio::select! {
            _ = token.cancelled() => return Attempt::Done,
            execution = adapter.execute(request) => execution,
        };
        let mut events = match execution {
            Ok(events) => events,
            Err(err) if err.recoverable => {
                self.clear_active_adapter(task_id).await;
                return Attempt::Retry {
                    provider_id: selection.provider_id,
                    error: err.message,
                };
            }
            Err(err) => {
                self.fail(task_id, err.message).await;
                return Attempt::Done;
            }
        };

        let detector = adapter.rate_limit_detector();
        let started = Instant::now();
        loop {
            if !self.wait_while_paused(task_id, token).await {
                return Attempt::Done;
            }
            let event = tokio::select! {
                _ = token.cancelled() => return Attempt::Done,
                event = events.next() => event,
            };
            let Some(event) = event else {
                self.fail(
                    task_id,
                    format!("Provider {} ended the session without completing", selection.provider_id),
                )
                .await;
                return Attempt::Done;
            };
            // 终态之后到达的事件不再产生任何状态影响
            if self.active_state(task_id).await.is_none() {
                return Attempt::Done;
            }

            match event {
                AgentEvent::Start { session_id } => {
                    // 会话建立后补发带 session id 的 started；暂停中只记录到状态
                    if self.set_session(task_id, &session_id).await == Some(TaskStatus::Running) {
                        self.emit_started(task_id, &selection, Some(session_id));
                    }
                }
                AgentEvent::Output { content, is_partial } => {
                    self.inner
                        .stream
                        .emit(TaskEvent::new(task_id, TaskEventKind::Output { content, is_partial }));
                }
                AgentEvent::ToolUse { tool_name, tool_input } => {
                    let action = ApprovalType::from_tool_name(&tool_name);
                    if !definition.hitl_policy.requires_approval(action) {
                        tracing::debug!(task_id, tool = %tool_name, "Tool use allowed by policy");
                        continue;
                    }
                    match self.gate(task_id, action, &tool_name, tool_input, token).await {
                        Gate::Approved => {}
                        Gate::Stopped => {
                            adapter.interrupt().await;
                            return Attempt::Done;
                        }
                        Gate::Cancelled => return Attempt::Done,
                    }
                }
                AgentEvent::ToolResult {
                    tool_name, success, ..
                } => {
                    tracing::debug!(task_id, tool = %tool_name, success, "Tool result");
                }
                AgentEvent::RateLimit { reason, resets_at } => {
                    tracing::warn!(task_id, provider = %selection.provider_id, %reason, "Adapter reported rate limit");
                    self.inner
                        .router
                        .mark_rate_limited(&selection.provider_id, selection.access_mode, resets_at);
                }
                AgentEvent::Error { error, recoverable } => {
                    let signal = detector.detect(&error);
                    if let Some(signal) = &signal {
                        self.inner.router.mark_rate_limited(
                            &selection.provider_id,
                            selection.access_mode,
                            signal.resets_at,
                        );
                    }
                    if recoverable || signal.is_some() {
                        self.clear_active_adapter(task_id).await;
                        return Attempt::Retry {
                            provider_id: selection.provider_id,
                            error,
                        };
                    }
                    self.fail(task_id, error).await;
                    return Attempt::Done;
                }
                AgentEvent::Complete { mut result } => {
                    let tokens = result.tokens_used.unwrap_or_default();
                    self.inner.router.record_usage(
                        &selection.provider_id,
                        selection.access_mode,
                        1,
                        tokens.input_tokens,
                        tokens.output_tokens,
                    );
                    if result.duration_ms == 0 {
                        result.duration_ms = started.elapsed().as_millis() as u64;
                    }
                    if result.success {
                        self.complete(task_id, result).await;
                    } else {
                        let error = if result.output.is_empty() {
                            "Execution reported failure".to_string()
                        } else {
                            result.output.clone()
                        };
                        self.finish(task_id, TaskStatus::Failed, TaskEventKind::Failed { error: error.clone() }, Some(result), Some(error))
                            .await;
                    }
                    return Attempt::Done;
                }
                AgentEvent::Interrupt { reason } => {
                    self.pause_from_adapter(task_id, reason).await;
                }
            }
        }
    }

    /// 工具审批：挂起事件翻译直到决定、超时或任务取消
    async fn gate(
        &self,
        task_id: &str,
        action: ApprovalType,
        tool_name: &str,
        tool_input: serde_json::Value,
        token: &CancellationToken,
    ) -> Gate {
        let pending = self.inner.hitl.open_request(
            task_id,
            action,
            format!("Tool '{tool_name}' requires approval"),
            Some(json!({ "tool_name": tool_name, "tool_input": tool_input })),
            None,
        );
        let approval_id = pending.id().to_string();
        self.inner.stream.emit(TaskEvent::new(
            task_id,
            TaskEventKind::ApprovalRequested {
                approval_id: approval_id.clone(),
                approval_type: action,
                message: pending.request().message.clone(),
            },
        ));

        let outcome = tokio::select! {
            _ = token.cancelled() => {
                let _ = self.inner.hitl.cancel_approval_request(&approval_id);
                return Gate::Cancelled;
            }
            outcome = pending.wait() => outcome,
        };

        match outcome {
            Ok(decision) => {
                self.inner.stream.emit(TaskEvent::new(
                    task_id,
                    TaskEventKind::ApprovalDecided {
                        approval_id: approval_id.clone(),
                        approved: decision.approved,
                        reason: decision.reason.clone(),
                    },
                ));
                if decision.approved {
                    Gate::Approved
                } else {
                    let reason = decision.reason.unwrap_or_else(|| "no reason given".to_string());
                    let error = OrchestratorError::ApprovalRejected(format!("{tool_name}: {reason}"));
                    self.fail(task_id, error.to_string()).await;
                    Gate::Stopped
                }
            }
            Err(HitlError::Timeout(id)) => {
                self.fail(task_id, OrchestratorError::ApprovalTimeout(id).to_string())
                    .await;
                Gate::Stopped
            }
            Err(err) => {
                self.fail(task_id, err.to_string()).await;
                Gate::Stopped
            }
        }
    }

    /// 暂停期间挂起；返回 false 表示任务已取消或进入终态
    async fn wait_while_paused(&self, task_id: &str, token: &CancellationToken) -> bool {
        let mut paused = {
            let tasks = self.inner.tasks.read().await;
            match tasks.get(task_id) {
                Some(record) if !record.state.is_finished() => record.pause.subscribe(),
                _ => return false,
            }
        };
        if !*paused.borrow_and_update() {
            return true;
        }
        tracing::debug!(task_id, "Executor waiting for resume");
        tokio::select! {
            _ = token.cancelled() => false,
            resumed = paused.wait_for(|p| !*p) => resumed.is_ok(),
        }
    }

    /// 仍在进行中的任务快照
    async fn active_state(&self, task_id: &str) -> Option<TaskState> {
        self.inner
            .tasks
            .read()
            .await
            .get(task_id)
            .filter(|r| !r.state.is_finished())
            .map(|r| r.state.clone())
    }

    /// 进入 running 并发出 started；返回已知的 session id。任务已结束时返回 None
    ///
    /// 已被暂停的任务保持 paused（暂停标志不在这里清除），事件循环会等到 resume。
    async fn mark_running(
        &self,
        task_id: &str,
        selection: &ProviderSelection,
        adapter: &Arc<dyn Adapter>,
    ) -> Option<Option<String>> {
        let mut tasks = self.inner.tasks.write().await;
        let record = tasks.get_mut(task_id).filter(|r| !r.state.is_finished())?;
        record.state.provider_id = Some(selection.provider_id.clone());
        record.state.access_mode = Some(selection.access_mode);
        record.state.started_at.get_or_insert_with(Utc::now);
        record.state.attempts += 1;
        record.active_adapter = Some(Arc::clone(adapter));
        if record.state.status != TaskStatus::Paused {
            record.state.status = TaskStatus::Running;
            self.emit_started(task_id, selection, None);
        }
        Some(record.state.session_id.clone())
    }

    /// 记录 session id，返回当前状态
    async fn set_session(&self, task_id: &str, session_id: &str) -> Option<TaskStatus> {
        let mut tasks = self.inner.tasks.write().await;
        let record = tasks.get_mut(task_id)?;
        record.state.session_id = Some(session_id.to_string());
        Some(record.state.status)
    }

    async fn clear_active_adapter(&self, task_id: &str) {
        if let Some(record) = self.inner.tasks.write().await.get_mut(task_id) {
            record.active_adapter = None;
        }
    }

    async fn pause_from_adapter(&self, task_id: &str, reason: String) {
        let mut tasks = self.inner.tasks.write().await;
        let Some(record) = tasks.get_mut(task_id).filter(|r| !r.state.is_finished()) else {
            return;
        };
        record.state.status = TaskStatus::Paused;
        record.pause.send_replace(true);
        tracing::info!(task_id, %reason, "Adapter interrupted, task paused");
        self.inner
            .stream
            .emit(TaskEvent::new(task_id, TaskEventKind::Paused { reason }));
    }

    fn emit_started(&self, task_id: &str, selection: &ProviderSelection, session_id: Option<String>) {
        self.inner.stream.emit(TaskEvent::new(
            task_id,
            TaskEventKind::Started {
                provider_id: Some(selection.provider_id.clone()),
                access_mode: Some(selection.access_mode),
                session_id,
            },
        ));
    }

    async fn complete(&self, task_id: &str, result: ExecutionResult) {
        let kind = TaskEventKind::Completed {
            output: result.output.clone(),
            duration_ms: result.duration_ms,
            tokens_used: result.tokens_used,
        };
        if self
            .finish(task_id, TaskStatus::Completed, kind, Some(result), None)
            .await
        {
            tracing::info!(task_id, "Task completed");
        }
    }

    async fn fail(&self, task_id: &str, error: String) {
        let kind = TaskEventKind::Failed { error: error.clone() };
        if self
            .finish(task_id, TaskStatus::Failed, kind, None, Some(error.clone()))
            .await
        {
            tracing::error!(task_id, %error, "Task failed");
        }
    }

    /// 唯一的终态入口：已在终态时什么也不做并返回 false
    async fn finish(
        &self,
        task_id: &str,
        status: TaskStatus,
        kind: TaskEventKind,
        result: Option<ExecutionResult>,
        error: Option<String>,
    ) -> bool {
        let mut tasks = self.inner.tasks.write().await;
        let Some(record) = tasks.get_mut(task_id).filter(|r| !r.state.is_finished()) else {
            return false;
        };
        record.state.status = status;
        record.state.completed_at = Some(Utc::now());
        record.state.result = result;
        record.state.error = error;
        record.active_adapter = None;
        self.inner.stream.emit(TaskEvent::new(task_id, kind));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ScriptedAdapter;
    use crate::core::checkpoint::InMemoryCheckpointStore;
    use crate::core::error::AdapterError;
    use crate::core::task::TaskPriority;
    use crate::hitl::{ApprovalDecision, HitlPolicy};
    use crate::providers::{AccessMode, AccessModeKind, RoutingConfig, SubscriptionLimits};

    fn orchestrator(max_concurrency: usize) -> Orchestrator {
        orchestrator_with_delay(max_concurrency, Duration::from_millis(5))
    }

    fn orchestrator_with_delay(max_concurrency: usize, retry_delay: Duration) -> Orchestrator {
        let router = Arc::new(ProviderRouter::standalone(RoutingConfig::default()));
        Orchestrator::new(
            OrchestratorConfig {
                max_concurrency,
                failover: FailoverConfig {
                    max_retries: 1,
                    retry_delay,
                    backoff_multiplier: 1.0,
                },
            },
            router,
            HitlController::default(),
            ProgressStream::new(),
            Arc::new(InMemoryCheckpointStore::new()),
        )
    }

    fn provider(id: &str) -> ProviderConfig {
        ProviderConfig::new(id).with_access_mode(AccessMode::subscription(1, SubscriptionLimits::per_day(500)))
    }

    fn task() -> TaskDefinition {
        TaskDefinition::new("write tests", "proj", "/tmp/repo").with_hitl_policy(HitlPolicy::Autonomous)
    }

    #[test]
    fn test_failover_delay_grows() {
        let failover = FailoverConfig {
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
        };
        assert_eq!(failover.delay_for(0), Duration::from_millis(100));
        assert_eq!(failover.delay_for(2), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_unknown_task_is_not_found() {
        let orch = orchestrator(1);
        for result in [
            orch.status("nope").await.err(),
            orch.pause("nope").await.err(),
            orch.resume("nope").await.err(),
            orch.cancel("nope").await.err(),
            orch.checkpoint("nope").await.err(),
        ] {
            assert!(matches!(result, Some(OrchestratorError::NotFound { kind: "Task", .. })));
        }
        assert!(matches!(
            orch.restore("missing").await.err(),
            Some(OrchestratorError::NotFound { kind: "Checkpoint", .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_adapter_fails_task() {
        let orch = orchestrator(1);
        orch.register_provider(provider("demo"));
        let handle = orch.submit(task()).await.unwrap();
        let state = handle.wait().await.unwrap();
        assert_eq!(state.status, TaskStatus::Failed);
        assert!(state.error.unwrap().contains("No adapter"));
    }

    #[tokio::test]
    async fn test_unavailable_adapter_fails_task() {
        let orch = orchestrator(1);
        orch.register_provider(provider("demo"));
        let adapter = Arc::new(ScriptedAdapter::demo("demo", "out"));
        adapter.set_available(false);
        orch.register_adapter(adapter.clone());

        let state = orch.submit(task()).await.unwrap().wait().await.unwrap();
        assert_eq!(state.status, TaskStatus::Failed);
        assert_eq!(adapter.execution_count(), 0);
    }

    #[tokio::test]
    async fn test_recoverable_error_fails_over() {
        let orch = orchestrator(1);
        orch.register_provider(provider("flaky"));
        orch.register_provider(provider("steady"));
        orch.register_adapter(Arc::new(ScriptedAdapter::new(
            "flaky",
            vec![AgentEvent::Error {
                error: "connection reset".into(),
                recoverable: true,
            }],
        )));
        orch.register_adapter(Arc::new(ScriptedAdapter::demo("steady", "fixed")));

        let state = orch.submit(task()).await.unwrap().wait().await.unwrap();
        assert_eq!(state.status, TaskStatus::Completed);
        assert_eq!(state.provider_id.as_deref(), Some("steady"));
        assert_eq!(state.attempts, 2);
    }

    #[tokio::test]
    async fn test_rate_limit_error_is_recoverable() {
        let orch = orchestrator(1);
        orch.register_provider(provider("a"));
        orch.register_provider(provider("b"));
        orch.register_adapter(Arc::new(ScriptedAdapter::new(
            "a",
            vec![AgentEvent::Error {
                error: "429 rate limit reached".into(),
                recoverable: false,
            }],
        )));
        orch.register_adapter(Arc::new(ScriptedAdapter::demo("b", "ok")));

        let state = orch.submit(task()).await.unwrap().wait().await.unwrap();
        assert_eq!(state.status, TaskStatus::Completed);
        let limited = orch.router().rate_limits().get_status("a", AccessModeKind::Subscription);
        assert!(limited.is_limited);
    }

    #[tokio::test]
    async fn test_fatal_error_fails_without_retry() {
        let orch = orchestrator(1);
        orch.register_provider(provider("a"));
        orch.register_provider(provider("b"));
        orch.register_adapter(Arc::new(ScriptedAdapter::new(
            "a",
            vec![AgentEvent::Error {
                error: "invalid repository".into(),
                recoverable: false,
            }],
        )));
        let b = Arc::new(ScriptedAdapter::demo("b", "ok"));
        orch.register_adapter(b.clone());

        let state = orch.submit(task()).await.unwrap().wait().await.unwrap();
        assert_eq!(state.status, TaskStatus::Failed);
        assert_eq!(state.error.as_deref(), Some("invalid repository"));
        assert_eq!(b.execution_count(), 0);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let orch = orchestrator(1);
        orch.register_provider(provider("demo"));
        orch.register_adapter(Arc::new(
            ScriptedAdapter::demo("demo", "slow").with_step_delay(Duration::from_millis(30)),
        ));
        let handle = orch.submit(task()).await.unwrap();
        let mut events = handle.subscribe();
        // queued
        events.next().await.unwrap();

        // 等到 running 再暂停
        for _ in 0..100 {
            if handle.get_status().await.unwrap().status == TaskStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let paused = orch.pause(handle.task_id()).await.unwrap();
        assert_eq!(paused.status, TaskStatus::Paused);
        assert!(matches!(
            orch.pause(handle.task_id()).await,
            Err(OrchestratorError::InvalidState { .. })
        ));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(handle.get_status().await.unwrap().status, TaskStatus::Paused);

        orch.resume(handle.task_id()).await.unwrap();
        let state = handle.wait().await.unwrap();
        assert_eq!(state.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_checkpoint_and_restore() {
        let orch = orchestrator(1);
        orch.register_provider(provider("demo"));
        let blocker = Arc::new(ScriptedAdapter::demo("demo", "done").with_step_delay(Duration::from_millis(20)));
        orch.register_adapter(blocker);

        let first = orch.submit(task()).await.unwrap();
        let queued = orch
            .submit(task().with_priority(TaskPriority::Low))
            .await
            .unwrap();
        let checkpoint_id = orch.checkpoint(queued.task_id()).await.unwrap();
        orch.cancel(queued.task_id()).await.unwrap();

        let restored = orch.restore(&checkpoint_id).await.unwrap();
        assert_eq!(restored.task_id(), queued.task_id());
        let state = restored.wait().await.unwrap();
        assert_eq!(state.status, TaskStatus::Completed);
        assert_eq!(first.wait().await.unwrap().status, TaskStatus::Completed);

        // 终态快照只登记，不重新执行
        let done_checkpoint = orch.checkpoint(first.task_id()).await.unwrap();
        let restored_done = orch.restore(&done_checkpoint).await.unwrap();
        assert_eq!(
            restored_done.get_status().await.unwrap().status,
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_restore_active_task_is_rejected() {
        let orch = orchestrator(1);
        orch.register_provider(provider("demo"));
        orch.register_adapter(Arc::new(
            ScriptedAdapter::demo("demo", "done").with_step_delay(Duration::from_millis(50)),
        ));
        let handle = orch.submit(task()).await.unwrap();
        let checkpoint_id = orch.checkpoint(handle.task_id()).await.unwrap();
        assert!(matches!(
            orch.restore(&checkpoint_id).await,
            Err(OrchestratorError::InvalidState { .. })
        ));
        handle.cancel().await.unwrap();
    }

    #[tokio::test]
    async fn test_approved_tool_use_continues() {
        let orch = orchestrator(1);
        orch.register_provider(provider("demo"));
        let script = vec![
            AgentEvent::ToolUse {
                tool_name: "write_file".into(),
                tool_input: json!({"path": "src/lib.rs"}),
            },
            AgentEvent::Output {
                content: "edited".into(),
                is_partial: false,
            },
            AgentEvent::Complete {
                result: ExecutionResult {
                    success: true,
                    output: "edited".into(),
                    session_id: None,
                    duration_ms: 5,
                    tokens_used: None,
                },
            },
        ];
        orch.register_adapter(Arc::new(ScriptedAdapter::new("demo", script)));

        let mut approvals = orch.hitl().subscribe();
        let handle = orch
            .submit(task().with_hitl_policy(HitlPolicy::ReviewEdits))
            .await
            .unwrap();
        let request = loop {
            if let crate::hitl::HitlEvent::ApprovalRequested { request } = approvals.recv().await.unwrap() {
                break request;
            }
        };
        assert_eq!(request.approval_type, ApprovalType::FileEdit);
        orch.hitl()
            .submit_decision(&request.id, ApprovalDecision::approve())
            .unwrap();

        let state = handle.wait().await.unwrap();
        assert_eq!(state.status, TaskStatus::Completed);
        let names: Vec<_> = orch
            .stream()
            .buffered_events(handle.task_id())
            .iter()
            .map(|e| e.kind.name())
            .collect();
        assert!(names.contains(&"approval_requested"));
        assert!(names.contains(&"approval_decided"));
    }

    #[tokio::test]
    async fn test_pause_during_failover_backoff_holds_the_retry() {
        let orch = orchestrator_with_delay(1, Duration::from_millis(200));
        orch.register_provider(provider("flaky"));
        orch.register_provider(provider("steady"));
        let flaky = Arc::new(ScriptedAdapter::new(
            "flaky",
            vec![AgentEvent::Error {
                error: "connection reset".into(),
                recoverable: true,
            }],
        ));
        let steady = Arc::new(ScriptedAdapter::demo("steady", "fixed"));
        orch.register_adapter(flaky.clone());
        orch.register_adapter(steady.clone());

        let handle = orch.submit(task()).await.unwrap();
        for _ in 0..100 {
            if flaky.execution_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let paused = orch.pause(handle.task_id()).await.unwrap();
        assert_eq!(paused.status, TaskStatus::Paused);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(handle.get_status().await.unwrap().status, TaskStatus::Paused);
        assert_eq!(
            orch.stream().get_status(handle.task_id()).unwrap().status,
            TaskStatus::Paused
        );
        assert_eq!(steady.execution_count(), 0);

        orch.resume(handle.task_id()).await.unwrap();
        let state = handle.wait().await.unwrap();
        assert_eq!(state.status, TaskStatus::Completed);
        assert_eq!(state.provider_id.as_deref(), Some("steady"));
        assert_eq!(steady.execution_count(), 1);
    }

    #[tokio::test]
    async fn test_started_is_emitted_before_first_adapter_event() {
        let orch = orchestrator(1);
        orch.register_provider(provider("demo"));
        orch.register_adapter(Arc::new(ScriptedAdapter::new(
            "demo",
            vec![AgentEvent::ToolUse {
                tool_name: "edit_file".into(),
                tool_input: json!({"path": "src/main.rs"}),
            }],
        )));

        let mut approvals = orch.hitl().subscribe();
        let handle = orch
            .submit(task().with_hitl_policy(HitlPolicy::ReviewEdits))
            .await
            .unwrap();
        let request = loop {
            if let crate::hitl::HitlEvent::ApprovalRequested { request } = approvals.recv().await.unwrap() {
                break request;
            }
        };

        let progress = orch.stream().get_status(handle.task_id()).unwrap();
        assert_eq!(progress.status, TaskStatus::Running);
        assert_eq!(progress.provider_id.as_deref(), Some("demo"));
        let names: Vec<_> = orch
            .stream()
            .buffered_events(handle.task_id())
            .iter()
            .map(|e| e.kind.name())
            .collect();
        assert_eq!(names, vec!["queued", "started", "approval_requested"]);

        orch.hitl()
            .submit_decision(&request.id, ApprovalDecision::reject("not now"))
            .unwrap();
        assert_eq!(handle.wait().await.unwrap().status, TaskStatus::Failed);
    }

    struct MisconfiguredAdapter;

    #[async_trait::async_trait]
    impl Adapter for MisconfiguredAdapter {
        fn id(&self) -> &str {
            "broken"
        }

        async fn initialize(&self, config: &serde_json::Value) -> Result<(), AdapterError> {
            match config.get("binary") {
                Some(_) => Ok(()),
                None => Err(AdapterError::fatal("missing binary path")),
            }
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn execute(&self, _request: ExecutionRequest) -> Result<crate::adapter::AgentEventStream, AdapterError> {
            Err(AdapterError::fatal("not runnable"))
        }

        async fn interrupt(&self) {}

        fn context_file(&self) -> String {
            "AGENTS.md".to_string()
        }
    }

    #[tokio::test]
    async fn test_initialize_adapter_registers_only_on_success() {
        let orch = orchestrator(1);
        orch.register_provider(provider("broken"));

        let err = orch
            .initialize_adapter(Arc::new(MisconfiguredAdapter), &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Adapter(_)));
        let state = orch.submit(task()).await.unwrap().wait().await.unwrap();
        assert!(state.error.unwrap().contains("No adapter"));

        orch.initialize_adapter(Arc::new(MisconfiguredAdapter), &json!({"binary": "/usr/bin/agent"}))
            .await
            .unwrap();
        let state = orch.submit(task()).await.unwrap().wait().await.unwrap();
        assert_eq!(state.error.as_deref(), Some("not runnable"));
    }

    #[tokio::test]
    async fn test_list_tasks_in_submission_order() {
        let orch = orchestrator(2);
        orch.register_provider(provider("demo"));
        orch.register_adapter(Arc::new(ScriptedAdapter::demo("demo", "ok")));

        let first = orch.submit(task()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        let second = orch.submit(task()).await.unwrap();
        first.wait().await.unwrap();
        second.wait().await.unwrap();

        let tasks = orch.list_tasks().await;
        let ids: Vec<_> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec![first.task_id(), second.task_id()]);
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Completed));
    }
}
