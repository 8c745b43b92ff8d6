//! 任务进度流：按任务的事件总线，带回放缓冲与多订阅者扇出
//!
//! emit 在同一把锁内完成「折叠状态 → 追加缓冲 → 投递订阅者」，
//! subscribe 在同一把锁内完成「复制缓冲 → 登记订阅者」，
//! 因此每个订阅者看到的序列都是完整且有序的，不会重复或遗漏。

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::{future, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::events::{TaskEvent, TaskProgress};
use crate::adapter::AgentEvent;
use crate::core::task::TaskId;

/// 终态事件后回放缓冲保留时长
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60);

pub type ListenerId = u64;
type Listener = Arc<dyn Fn(&TaskEvent) + Send + Sync>;

#[derive(Default)]
struct StreamState {
    statuses: HashMap<TaskId, TaskProgress>,
    buffers: HashMap<TaskId, Vec<TaskEvent>>,
    subscribers: HashMap<TaskId, HashMap<u64, mpsc::UnboundedSender<TaskEvent>>>,
    retention: HashMap<TaskId, JoinHandle<()>>,
    listeners: Vec<(ListenerId, Listener)>,
    next_id: u64,
}

impl StreamState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Clone)]
pub struct ProgressStream {
    state: Arc<Mutex<StreamState>>,
    retention: Duration,
}

impl Default for ProgressStream {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressStream {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(StreamState::default())),
            retention,
        }
    }

    /// 发布事件：更新投影、追加缓冲、投递给该任务的订阅者与全局监听器
    pub fn emit(&self, event: TaskEvent) {
        let listeners: Vec<Listener> = {
            let mut state = self.lock();
            let task_id = event.task_id.clone();
            state
                .statuses
                .entry(task_id.clone())
                .or_insert_with(|| TaskProgress::new(task_id.clone(), event.timestamp))
                .apply(&event);
            state.buffers.entry(task_id.clone()).or_default().push(event.clone());

            if event.is_terminal() {
                // 终态之后不再有 live 事件，发完即释放发送端
                if let Some(subscribers) = state.subscribers.remove(&task_id) {
                    for tx in subscribers.values() {
                        let _ = tx.send(event.clone());
                    }
                }
                self.schedule_retention(&mut state, &task_id);
            } else if let Some(subscribers) = state.subscribers.get_mut(&task_id) {
                subscribers.retain(|_, tx| tx.send(event.clone()).is_ok());
            }

            state.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
        };

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                tracing::warn!(task_id = %event.task_id, event = event.kind.name(), "Progress listener panicked");
            }
        }
    }

    /// 订阅任务事件：先回放缓冲，任务未结束时继续接收 live 事件，终态事件后结束
    pub fn subscribe(&self, task_id: &str) -> TaskEventStream {
        let mut state = self.lock();
        let replay: VecDeque<TaskEvent> = state.buffers.get(task_id).cloned().unwrap_or_default().into();
        let finished = state
            .statuses
            .get(task_id)
            .map_or(false, |s| s.status.is_terminal());
        if finished {
            return TaskEventStream {
                replay,
                live: None,
                registration: None,
                finished: false,
            };
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = state.next_id();
        state.subscribers.entry(task_id.to_string()).or_default().insert(id, tx);
        TaskEventStream {
            replay,
            live: Some(rx),
            registration: Some(Registration {
                state: Arc::downgrade(&self.state),
                task_id: task_id.to_string(),
                id,
            }),
            finished: false,
        }
    }

    /// 把外部 Adapter 事件流接入本流：映射、发布并原样产出映射后的事件
    pub fn from_agent_events<S>(&self, task_id: &str, source: S) -> impl Stream<Item = TaskEvent> + Send + 'static
    where
        S: Stream<Item = AgentEvent> + Send + 'static,
    {
        let stream = self.clone();
        let task_id = task_id.to_string();
        source.filter_map(move |event| {
            let mapped = TaskEvent::from_agent_event(&task_id, &event);
            if let Some(mapped) = &mapped {
                stream.emit(mapped.clone());
            }
            future::ready(mapped)
        })
    }

    pub fn get_status(&self, task_id: &str) -> Option<TaskProgress> {
        self.lock().statuses.get(task_id).cloned()
    }

    /// 所有任务的投影，按 task_id 排序
    pub fn get_all_statuses(&self) -> Vec<TaskProgress> {
        let mut all: Vec<TaskProgress> = self.lock().statuses.values().cloned().collect();
        all.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        all
    }

    /// 当前缓冲中的事件（保留期过后为空）
    pub fn buffered_events(&self, task_id: &str) -> Vec<TaskEvent> {
        self.lock().buffers.get(task_id).cloned().unwrap_or_default()
    }

    pub fn subscriber_count(&self, task_id: &str) -> usize {
        self.lock().subscribers.get(task_id).map_or(0, HashMap::len)
    }

    /// 清除单个任务的投影、缓冲与订阅者（订阅流随之结束）
    pub fn cleanup(&self, task_id: &str) {
        let mut state = self.lock();
        state.statuses.remove(task_id);
        state.buffers.remove(task_id);
        state.subscribers.remove(task_id);
        if let Some(handle) = state.retention.remove(task_id) {
            handle.abort();
        }
    }

    /// 清除全部任务（全局监听器保留）
    pub fn clear(&self) {
        let mut state = self.lock();
        state.statuses.clear();
        state.buffers.clear();
        state.subscribers.clear();
        for (_, handle) in state.retention.drain() {
            handle.abort();
        }
    }

    /// 注册全局监听器（所有任务的事件）
    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&TaskEvent) + Send + Sync + 'static,
    {
        let mut state = self.lock();
        let id = state.next_id();
        state.listeners.push((id, Arc::new(listener)));
        id
    }

    pub fn off(&self, id: ListenerId) -> bool {
        let mut state = self.lock();
        let before = state.listeners.len();
        state.listeners.retain(|(lid, _)| *lid != id);
        state.listeners.len() != before
    }

    fn schedule_retention(&self, state: &mut StreamState, task_id: &str) {
        // 没有运行时（同步测试等）时缓冲一直保留到显式 cleanup
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak = Arc::downgrade(&self.state);
        let retention = self.retention;
        let task = task_id.to_string();
        let handle = runtime.spawn(async move {
            tokio::time::sleep(retention).await;
            if let Some(state) = weak.upgrade() {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                state.buffers.remove(&task);
                state.retention.remove(&task);
                tracing::debug!(task_id = %task, "Replay buffer released");
            }
        });
        if let Some(previous) = state.retention.insert(task_id.to_string(), handle) {
            previous.abort();
        }
    }

    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Registration {
    state: Weak<Mutex<StreamState>>,
    task_id: TaskId,
    id: u64,
}

impl Registration {
    fn deregister(self) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(subscribers) = state.subscribers.get_mut(&self.task_id) {
            subscribers.remove(&self.id);
            if subscribers.is_empty() {
                state.subscribers.remove(&self.task_id);
            }
        }
    }
}

/// 单个订阅者的独立事件序列；产出终态事件后结束，Drop 时注销
pub struct TaskEventStream {
    replay: VecDeque<TaskEvent>,
    live: Option<mpsc::UnboundedReceiver<TaskEvent>>,
    registration: Option<Registration>,
    finished: bool,
}

impl TaskEventStream {
    fn finish(&mut self) {
        self.finished = true;
        self.live = None;
        if let Some(registration) = self.registration.take() {
            registration.deregister();
        }
    }
}

impl Stream for TaskEventStream {
    type Item = TaskEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<TaskEvent>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        if let Some(event) = this.replay.pop_front() {
            if event.is_terminal() {
                this.finish();
            }
            return Poll::Ready(Some(event));
        }
        let Some(live) = this.live.as_mut() else {
            this.finish();
            return Poll::Ready(None);
        };
        match live.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_terminal() {
                    this.finish();
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for TaskEventStream {
    fn drop(&mut self) {
        if let Some(registration) = self.registration.take() {
            registration.deregister();
        }
    }
}
