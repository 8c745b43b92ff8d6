//! 脚本化 Adapter（用于测试与本地演示，不拉起任何进程）
//!
//! 每次 execute 按固定脚本依次产出事件；interrupt 后剩余事件不再产出。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;

use super::traits::{
    Adapter, AgentEvent, AgentEventStream, ExecutionRequest, ExecutionResult, KeywordRateLimitDetector,
    RateLimitDetector, TokenUsage,
};
use crate::core::error::AdapterError;

pub struct ScriptedAdapter {
    id: String,
    script: Vec<AgentEvent>,
    step_delay: Option<Duration>,
    execute_error: Option<AdapterError>,
    available: AtomicBool,
    executions: AtomicUsize,
    interrupts: AtomicUsize,
    interrupted: Arc<AtomicBool>,
}

impl ScriptedAdapter {
    pub fn new(id: impl Into<String>, script: Vec<AgentEvent>) -> Self {
        Self {
            id: id.into(),
            script,
            step_delay: None,
            execute_error: None,
            available: AtomicBool::new(true),
            executions: AtomicUsize::new(0),
            interrupts: AtomicUsize::new(0),
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// start → output → complete
    pub fn demo(id: impl Into<String>, output: impl Into<String>) -> Self {
        let output = output.into();
        let session_id = format!("session_{}", uuid::Uuid::new_v4());
        Self::new(
            id,
            vec![
                AgentEvent::Start {
                    session_id: session_id.clone(),
                },
                AgentEvent::Output {
                    content: output.clone(),
                    is_partial: false,
                },
                AgentEvent::Complete {
                    result: ExecutionResult {
                        success: true,
                        output,
                        session_id: Some(session_id),
                        duration_ms: 0,
                        tokens_used: Some(TokenUsage {
                            input_tokens: 1_200,
                            output_tokens: 300,
                        }),
                    },
                },
            ],
        )
    }

    /// 每个事件之间等待一段时间，便于测试暂停 / 取消
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = Some(delay);
        self
    }

    /// execute 直接返回错误
    pub fn with_execute_error(mut self, error: AdapterError) -> Self {
        self.execute_error = Some(error);
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn execution_count(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    pub fn interrupt_count(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Adapter for ScriptedAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn execute(&self, request: ExecutionRequest) -> Result<AgentEventStream, AdapterError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(adapter = %self.id, task_id = %request.task_id, "Scripted execution started");
        if let Some(error) = &self.execute_error {
            return Err(error.clone());
        }

        self.interrupted.store(false, Ordering::SeqCst);
        let state = (
            VecDeque::from(self.script.clone()),
            self.step_delay,
            Arc::clone(&self.interrupted),
        );
        let events = stream::unfold(state, |(mut pending, delay, interrupted)| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if interrupted.load(Ordering::SeqCst) {
                return None;
            }
            let event = pending.pop_front()?;
            Some((event, (pending, delay, interrupted)))
        });
        Ok(Box::pin(events))
    }

    async fn interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        self.interrupted.store(true, Ordering::SeqCst);
    }

    fn context_file(&self) -> String {
        "AGENTS.md".to_string()
    }

    fn rate_limit_detector(&self) -> Box<dyn RateLimitDetector> {
        Box::new(KeywordRateLimitDetector::default())
    }
}
