//! Mock 补全客户端（测试用，无需 API）
//!
//! 支持按顺序脚本化响应与失败；脚本耗尽后回退为回显最后一条 user 消息。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::session::Role;
use crate::llm::traits::{CompletionClient, CompletionRequest, LlmError};

/// Mock 客户端
#[derive(Default)]
pub struct MockCompletionClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    calls: AtomicU64,
}

impl MockCompletionClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置一条成功响应
    pub fn push_response(&self, content: impl Into<String>) {
        self.script
            .lock()
            .expect("mock script lock")
            .push_back(Ok(content.into()));
    }

    /// 预置一条失败
    pub fn push_error(&self, err: LlmError) {
        self.script
            .lock()
            .expect("mock script lock")
            .push_back(Err(err));
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CompletionClient for MockCompletionClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        if let Some(scripted) = self.script.lock().expect("mock script lock").pop_front() {
            return scripted;
        }

        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        Ok(format!("Echo from mock: {last_user}"))
    }
}
