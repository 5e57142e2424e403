//! 编排器：单轮对话的完整执行路径
//!
//! 校验 → 会话 → 路由 → 分发 → 失败时分类并走恢复链 → 落盘回复。
//! 编排器把所有失败都折叠成一条可返回给用户的文本；对外只在输入校验
//! 失败时报错，其余情况总能给出回复。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::core::session::{ChatMessage, ConversationState, Role, SessionManager};
use crate::error::classifier::{ErrorClassifier, ErrorContext};
use crate::error::recovery::{RecoveryOutcome, RecoveryRegistry, SAFE_RESPONSE};
use crate::error::TripError;
use crate::handlers::{HandlerRegistry, HandlerRequest};
use crate::routing::router::CapabilityRouter;

/// 单轮对话请求
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// 单轮对话响应
#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub response: String,
    pub handler_used: String,
    pub confidence: f64,
    pub processing_time_ms: u64,
    pub session_id: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// 编排参数
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// 整轮（路由 + 执行 + 恢复）的总时限
    pub turn_deadline: Duration,
    /// 交给路由器/处理器的历史窗口
    pub history_window: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            turn_deadline: Duration::from_secs(60),
            history_window: 10,
        }
    }
}

/// 编排器
pub struct Orchestrator {
    sessions: Arc<SessionManager>,
    router: Arc<CapabilityRouter>,
    registry: Arc<HandlerRegistry>,
    classifier: Arc<ErrorClassifier>,
    recovery: Arc<RecoveryRegistry>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        sessions: Arc<SessionManager>,
        router: Arc<CapabilityRouter>,
        registry: Arc<HandlerRegistry>,
        classifier: Arc<ErrorClassifier>,
        recovery: Arc<RecoveryRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            sessions,
            router,
            registry,
            classifier,
            recovery,
            config,
        }
    }

    /// 处理一轮对话
    pub async fn process(&self, request: ChatRequest) -> Result<ChatResponse, TripError> {
        let started = Instant::now();

        let user_text = Self::latest_user_text(&request.messages)?;
        let session_id = self
            .sessions
            .get_or_create(request.session_id.as_deref(), request.user_id.as_deref())
            .await;

        self.sessions
            .with_session(&session_id, |s| {
                s.push_message(ChatMessage::user(&user_text));
                s.turn_count += 1;
                s.set_state(ConversationState::Routing);
            })
            .await;

        let turn = self.run_turn(&session_id, &user_text);
        let (text, handler_used, confidence, mut metadata) =
            match tokio::time::timeout(self.config.turn_deadline, turn).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    // 整轮超时：按普通失败走分类与恢复
                    let err = TripError::Timeout {
                        operation: "orchestrator.turn".to_string(),
                    };
                    let (text, meta) = self.recover(&session_id, &err).await;
                    (text, "none".to_string(), 0.0, meta)
                }
            };

        self.sessions
            .with_session(&session_id, |s| {
                s.set_state(ConversationState::Responding);
                s.push_message(ChatMessage::assistant(&text));
                s.set_state(ConversationState::Idle);
            })
            .await;

        metadata.insert(
            "turn_count".into(),
            self.sessions
                .snapshot(&session_id)
                .await
                .map(|s| s.turn_count)
                .unwrap_or(0)
                .into(),
        );

        Ok(ChatResponse {
            response: text,
            handler_used,
            confidence,
            processing_time_ms: started.elapsed().as_millis() as u64,
            session_id,
            metadata,
        })
    }

    /// 路由 + 分发 + 失败恢复，总是产出可返回的文本
    async fn run_turn(
        &self,
        session_id: &str,
        user_text: &str,
    ) -> (String, String, f64, serde_json::Map<String, serde_json::Value>) {
        let snapshot = self.sessions.snapshot(session_id).await;
        let history: Vec<ChatMessage> = snapshot
            .as_ref()
            .map(|s| {
                // 最新一条是本轮用户消息，路由时不重复携带
                let msgs = s.recent(self.config.history_window + 1);
                msgs[..msgs.len().saturating_sub(1)].to_vec()
            })
            .unwrap_or_default();

        let decision = self
            .router
            .route(user_text, &history, snapshot.as_ref())
            .await;

        self.sessions
            .with_session(session_id, |s| {
                s.metadata
                    .insert("last_route".to_string(), decision.to_json());
                s.set_state(ConversationState::Executing);
            })
            .await;

        let handler_request = HandlerRequest {
            session_id: session_id.to_string(),
            text: user_text.to_string(),
            params: decision.params.clone(),
            history,
        };

        let mut metadata = serde_json::Map::new();
        metadata.insert("routing_decision".into(), decision.to_json());

        match self
            .registry
            .dispatch(decision.category, &handler_request)
            .await
        {
            Ok(response) => {
                let handler_used = response
                    .metadata
                    .get("handler")
                    .and_then(|v| v.as_str())
                    .unwrap_or(decision.category.as_str())
                    .to_string();
                for (k, v) in response.metadata {
                    metadata.insert(k, v);
                }
                (response.text, handler_used, decision.confidence, metadata)
            }
            Err(err) => {
                let (text, recovery_meta) = self.recover(session_id, &err).await;
                for (k, v) in recovery_meta {
                    metadata.insert(k, v);
                }
                (text, decision.category.as_str().to_string(), decision.confidence, metadata)
            }
        }
    }

    /// 分类错误并走恢复链，折叠成用户可见文本
    async fn recover(
        &self,
        session_id: &str,
        err: &TripError,
    ) -> (String, serde_json::Map<String, serde_json::Value>) {
        let mut context = ErrorContext::for_session(session_id);
        if let TripError::RateLimited { retry_after_ms } = err {
            context = context.with_meta("retry_after_ms", (*retry_after_ms).into());
        }
        let classified = self.classifier.classify_and_store(err, None, context).await;

        let mut metadata = serde_json::Map::new();
        metadata.insert("error_id".into(), classified.id.clone().into());
        metadata.insert(
            "error_category".into(),
            classified.category.as_str().into(),
        );

        let text = match self.recovery.handle(&classified).await {
            Some(RecoveryOutcome::Substitute(text)) => {
                self.classifier.mark_handled(&classified.id).await;
                metadata.insert("recovered".into(), true.into());
                text
            }
            Some(RecoveryOutcome::Retry) | Some(RecoveryOutcome::RetryAfter(_)) => {
                // 重试信号在对话边界无法消化，转成建议稍后再试的文案
                metadata.insert("recovered".into(), false.into());
                format!(
                    "That didn't go through just now. Please try again in a moment. \
(ref: {})",
                    classified.id
                )
            }
            None => {
                metadata.insert("recovered".into(), false.into());
                format!("{SAFE_RESPONSE} (ref: {})", classified.id)
            }
        };
        (text, metadata)
    }

    /// 取最新一条用户消息；没有则判为输入无效
    fn latest_user_text(messages: &[ChatMessage]) -> Result<String, TripError> {
        let text = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                TripError::Validation("request must contain a non-empty user message".to_string())
            })?;
        Ok(text)
    }
}
