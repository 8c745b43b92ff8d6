//! 核心编排层：任务模型、错误、有界队列、检查点、编排器与构建器

pub mod builder;
pub mod checkpoint;
pub mod error;
pub mod orchestrator;
pub mod queue;
pub mod task;

pub use builder::OrchestratorBuilder;
pub use checkpoint::{CheckpointRecord, CheckpointStore, InMemoryCheckpointStore, SqliteCheckpointStore};
pub use error::{AdapterError, CheckpointError, HitlError, OrchestratorError, RoutingError};
pub use orchestrator::{FailoverConfig, Orchestrator, OrchestratorConfig, TaskHandle};
pub use queue::{CancelOutcome, TaskQueue};
pub use task::{TaskConstraints, TaskDefinition, TaskId, TaskPriority, TaskState, TaskStatus};
