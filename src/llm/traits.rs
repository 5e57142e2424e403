//! 补全服务抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 CompletionClient。响应文本视为
//! 不可信输入，由消费方（路由器等）做 schema 校验后再使用。

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::session::ChatMessage;
use crate::error::TripError;

/// 一次结构化补全请求
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// 整个调用的截止时间
    pub deadline: Duration,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            system: system.into(),
            messages,
            temperature: 0.7,
            max_tokens: 1024,
            deadline: Duration::from_secs(30),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }
}

/// 补全服务的失败模式
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("completion request timed out")]
    Timeout,

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("completion api error: {0}")]
    Api(String),

    #[error("malformed completion output: {0}")]
    MalformedOutput(String),
}

impl From<LlmError> for TripError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::Timeout => TripError::Timeout {
                operation: "llm.complete".to_string(),
            },
            LlmError::RateLimited { retry_after_ms } => TripError::RateLimited { retry_after_ms },
            LlmError::Api(msg) => TripError::Network(msg),
            LlmError::MalformedOutput(msg) => TripError::Validation(msg),
        }
    }
}

/// 补全客户端 trait
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError>;
}
