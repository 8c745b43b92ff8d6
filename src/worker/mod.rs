//! 远程 worker 池的线路协议
//!
//! 只定义消息格式与到 Adapter 事件的映射；worker 池本身（注册表、扩缩容）不在本 crate。

pub mod protocol;

pub use protocol::{OrchestratorMessage, Resources, WorkerId, WorkerMessage, WorkerStatus};
