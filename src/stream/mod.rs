//! 进度流：任务事件、状态投影与扇出订阅

pub mod events;
pub mod progress;

pub use events::{TaskEvent, TaskEventKind, TaskProgress};
pub use progress::{ListenerId, ProgressStream, TaskEventStream, DEFAULT_RETENTION};
