//! Adapter 抽象
//!
//! 每个 Provider 一个 Adapter 实现：负责拉起编码 Agent 进程（或委托给远端 worker），
//! 把其原生输出翻译成 AgentEvent 流。编排核心按需拉取事件（pull），
//! 审批等待或暂停期间不再拉取，由 Adapter 内部缓冲。

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::AdapterError;
use crate::core::task::{TaskDefinition, TaskId};
use crate::providers::AccessModeKind;

/// Token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// 一次执行的最终结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub session_id: Option<String>,
    pub duration_ms: u64,
    pub tokens_used: Option<TokenUsage>,
}

/// Adapter 产出的原生事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Start {
        session_id: String,
    },
    Output {
        content: String,
        #[serde(default)]
        is_partial: bool,
    },
    ToolUse {
        tool_name: String,
        tool_input: Value,
    },
    ToolResult {
        tool_name: String,
        success: bool,
        result: String,
    },
    Error {
        error: String,
        recoverable: bool,
    },
    RateLimit {
        reason: String,
        resets_at: Option<DateTime<Utc>>,
    },
    Complete {
        result: ExecutionResult,
    },
    Interrupt {
        reason: String,
    },
}

/// 交给 Adapter 的执行请求
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub task_id: TaskId,
    pub definition: TaskDefinition,
    pub access_mode: AccessModeKind,
    /// 会话内人工补充的指导（来自 HITL provide_input）
    pub guidance: Vec<String>,
}

pub type AgentEventStream = Pin<Box<dyn Stream<Item = AgentEvent> + Send>>;

/// 从错误文本识别出的限流信号
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitSignal {
    pub reason: String,
    pub resets_at: Option<DateTime<Utc>>,
}

/// 限流识别器：根据 Adapter 的错误输出判断是否是限流
pub trait RateLimitDetector: Send + Sync {
    fn detect(&self, text: &str) -> Option<RateLimitSignal>;
}

/// 从不报告限流
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRateLimitDetector;

impl RateLimitDetector for NoopRateLimitDetector {
    fn detect(&self, _text: &str) -> Option<RateLimitSignal> {
        None
    }
}

/// 基于关键字的识别器（大小写不敏感）
#[derive(Debug, Clone)]
pub struct KeywordRateLimitDetector {
    keywords: Vec<String>,
}

impl Default for KeywordRateLimitDetector {
    fn default() -> Self {
        Self::new(["rate limit", "429", "usage limit", "quota"])
    }
}

impl KeywordRateLimitDetector {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keywords: keywords.into_iter().map(|k| k.into().to_lowercase()).collect(),
        }
    }
}

impl RateLimitDetector for KeywordRateLimitDetector {
    fn detect(&self, text: &str) -> Option<RateLimitSignal> {
        let lower = text.to_lowercase();
        self.keywords
            .iter()
            .find(|k| lower.contains(k.as_str()))
            .map(|k| RateLimitSignal {
                reason: format!("matched '{k}'"),
                resets_at: None,
            })
    }
}

/// Provider 执行后端
#[async_trait]
pub trait Adapter: Send + Sync {
    /// 与 ProviderConfig.id 对应
    fn id(&self) -> &str;

    async fn initialize(&self, _config: &Value) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn is_available(&self) -> bool;

    /// 开始执行，返回惰性事件流
    async fn execute(&self, request: ExecutionRequest) -> Result<AgentEventStream, AdapterError>;

    /// 请求中断当前执行（尽力而为）
    async fn interrupt(&self);

    /// Agent 在仓库中读取的上下文文件名
    fn context_file(&self) -> String;

    fn rate_limit_detector(&self) -> Box<dyn RateLimitDetector> {
        Box::new(NoopRateLimitDetector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_event_wire_shape() {
        let event: AgentEvent = serde_json::from_str(
            r#"{"type": "tool_use", "tool_name": "bash", "tool_input": {"cmd": "ls"}}"#,
        )
        .unwrap();
        assert!(matches!(event, AgentEvent::ToolUse { ref tool_name, .. } if tool_name == "bash"));

        let json = serde_json::to_value(AgentEvent::Output {
            content: "hi".into(),
            is_partial: true,
        })
        .unwrap();
        assert_eq!(json["type"], "output");
        assert_eq!(json["is_partial"], true);
    }

    #[test]
    fn test_keyword_detector() {
        let detector = KeywordRateLimitDetector::default();
        assert!(detector.detect("HTTP 429 Too Many Requests").is_some());
        assert!(detector.detect("You have hit your Usage Limit").is_some());
        assert!(detector.detect("syntax error").is_none());
        assert!(NoopRateLimitDetector.detect("429").is_none());
    }
}
