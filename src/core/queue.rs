//! 任务队列：有界并发准入
//!
//! 最多 max_concurrency 个执行器同时运行（tokio 协作式交错，不是并行线程）；
//! 槽位释放时取优先级最高、入队最早的一项。取消未开始的项直接丢弃其执行器，
//! 取消运行中的项只发出 CancellationToken 信号，由执行器自行收尾。

use std::cmp::Reverse;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;

use super::task::{TaskId, TaskPriority};

pub type Executor = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, ()> + Send>;

struct QueuedItem {
    task_id: TaskId,
    priority: TaskPriority,
    seq: u64,
    executor: Executor,
}

impl QueuedItem {
    fn rank(&self) -> (TaskPriority, Reverse<u64>) {
        (self.priority, Reverse(self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    pending: Vec<QueuedItem>,
    running: HashMap<TaskId, CancellationToken>,
    next_seq: u64,
}

/// cancel 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// 尚未开始，已移出队列
    Removed,
    /// 正在运行，已发出取消信号
    Signalled,
    NotFound,
}

#[derive(Clone)]
pub struct TaskQueue {
    max_concurrency: usize,
    state: Arc<Mutex<QueueState>>,
}

/// 执行器结束（含 panic）时释放槽位并继续调度
struct SlotGuard {
    queue: TaskQueue,
    task_id: TaskId,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.queue.lock().running.remove(&self.task_id);
        self.queue.pump();
    }
}

impl TaskQueue {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            state: Arc::new(Mutex::new(QueueState::default())),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// 入队并立即尝试调度，返回入队时前面等待的项数。需在 tokio 运行时内调用
    pub fn enqueue<F, Fut>(&self, task_id: impl Into<TaskId>, executor: F, priority: TaskPriority) -> usize
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task_id = task_id.into();
        let position = {
            let mut state = self.lock();
            let position = state.pending.iter().filter(|i| i.priority >= priority).count();
            state.next_seq += 1;
            let seq = state.next_seq;
            state.pending.push(QueuedItem {
                task_id: task_id.clone(),
                priority,
                seq,
                executor: Box::new(move |token| executor(token).boxed()),
            });
            position
        };
        tracing::debug!(task_id = %task_id, ?priority, position, "Task enqueued");
        self.pump();
        position
    }

    /// 移除未开始的项，或向运行中的执行器发出取消信号
    pub fn cancel(&self, task_id: &str) -> CancelOutcome {
        let mut state = self.lock();
        if let Some(index) = state.pending.iter().position(|i| i.task_id == task_id) {
            state.pending.remove(index);
            return CancelOutcome::Removed;
        }
        match state.running.get(task_id) {
            Some(token) => {
                token.cancel();
                CancelOutcome::Signalled
            }
            None => CancelOutcome::NotFound,
        }
    }

    /// 以该优先级入队时前面会有的等待项数
    pub fn queued_ahead(&self, priority: TaskPriority) -> usize {
        self.lock().pending.iter().filter(|i| i.priority >= priority).count()
    }

    /// 等待中的项数
    pub fn size(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn running_count(&self) -> usize {
        self.lock().running.len()
    }

    /// 在等待队列中的位置（0 表示下一个被调度）
    pub fn position(&self, task_id: &str) -> Option<usize> {
        let state = self.lock();
        let item = state.pending.iter().find(|i| i.task_id == task_id)?;
        let rank = item.rank();
        Some(state.pending.iter().filter(|i| i.rank() > rank).count())
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.lock().running.contains_key(task_id)
    }

    fn pump(&self) {
        loop {
            let (item, token) = {
                let mut state = self.lock();
                if state.running.len() >= self.max_concurrency {
                    return;
                }
                let Some(index) = state
                    .pending
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, i)| i.rank())
                    .map(|(index, _)| index)
                else {
                    return;
                };
                let item = state.pending.remove(index);
                let token = CancellationToken::new();
                state.running.insert(item.task_id.clone(), token.clone());
                (item, token)
            };

            tracing::debug!(task_id = %item.task_id, "Task dequeued");
            let guard = SlotGuard {
                queue: self.clone(),
                task_id: item.task_id,
            };
            let run = (item.executor)(token);
            tokio::spawn(async move {
                let _guard = guard;
                run.await;
            });
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::watch;

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn gated(rx: &watch::Receiver<bool>) -> impl FnOnce(CancellationToken) -> BoxFuture<'static, ()> {
        let mut rx = rx.clone();
        move |_token| {
            async move {
                let _ = rx.wait_for(|open| *open).await;
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_respects_max_concurrency() {
        let queue = TaskQueue::new(2);
        let (tx, rx) = watch::channel(false);
        for i in 0..4 {
            queue.enqueue(format!("t{i}"), gated(&rx), TaskPriority::Normal);
        }
        assert_eq!(queue.running_count(), 2);
        assert_eq!(queue.size(), 2);

        tx.send(true).unwrap();
        wait_until(|| queue.running_count() == 0 && queue.size() == 0).await;
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let queue = TaskQueue::new(1);
        let (tx, rx) = watch::channel(false);
        queue.enqueue("blocker", gated(&rx), TaskPriority::Normal);

        let order = Arc::new(Mutex::new(Vec::new()));
        for (id, priority) in [
            ("low", TaskPriority::Low),
            ("normal-1", TaskPriority::Normal),
            ("urgent", TaskPriority::Urgent),
            ("normal-2", TaskPriority::Normal),
        ] {
            let order = Arc::clone(&order);
            queue.enqueue(
                id,
                move |_| async move {
                    order.lock().unwrap().push(id);
                },
                priority,
            );
        }
        assert_eq!(queue.position("urgent"), Some(0));
        assert_eq!(queue.position("low"), Some(3));

        tx.send(true).unwrap();
        wait_until(|| order.lock().unwrap().len() == 4).await;
        assert_eq!(*order.lock().unwrap(), vec!["urgent", "normal-1", "normal-2", "low"]);
    }

    #[tokio::test]
    async fn test_cancel_pending_and_running() {
        let queue = TaskQueue::new(1);
        let (cancelled_tx, mut cancelled_rx) = tokio::sync::mpsc::unbounded_channel();
        queue.enqueue(
            "running",
            move |token: CancellationToken| async move {
                token.cancelled().await;
                let _ = cancelled_tx.send(());
            },
            TaskPriority::Normal,
        );

        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);
        queue.enqueue(
            "waiting",
            move |_| async move {
                *flag.lock().unwrap() = true;
            },
            TaskPriority::Normal,
        );

        assert_eq!(queue.cancel("waiting"), CancelOutcome::Removed);
        assert_eq!(queue.size(), 0);
        assert_eq!(queue.cancel("running"), CancelOutcome::Signalled);
        cancelled_rx.recv().await.unwrap();
        wait_until(|| queue.running_count() == 0).await;

        assert!(!*ran.lock().unwrap());
        assert_eq!(queue.cancel("missing"), CancelOutcome::NotFound);
    }
}
