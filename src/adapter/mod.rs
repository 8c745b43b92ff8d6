//! Adapter 层：执行后端抽象与脚本化实现

pub mod mock;
pub mod traits;

pub use mock::ScriptedAdapter;
pub use traits::{
    Adapter, AgentEvent, AgentEventStream, ExecutionRequest, ExecutionResult, KeywordRateLimitDetector,
    NoopRateLimitDetector, RateLimitDetector, RateLimitSignal, TokenUsage,
};
