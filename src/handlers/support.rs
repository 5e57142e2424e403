//! 默认处理器：通用客服对话
//!
//! 带旅行客服系统提示的 LLM 问答，常见问题直接写进提示里。作为指定默认
//! 处理器，它是其它类别失败时的兜底，自身必须尽量稳。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TripError;
use crate::handlers::{Handler, HandlerRequest, HandlerResponse};
use crate::llm::{CompletionClient, CompletionRequest};
use crate::routing::HandlerCategory;
use crate::task::TaskSpec;

const SUPPORT_SYSTEM_PROMPT: &str = "You are a friendly customer support assistant \
for a travel booking product. Answer briefly and helpfully. You can help with: \
finding travel packages, package pricing and itineraries, booking assistance, \
cancellations (free up to 7 days before departure), and payment questions \
(cards, UPI and bank transfer are accepted). If a question needs live data you \
don't have, say so and suggest what the traveller can ask instead. Never invent \
prices or availability.";

/// 通用客服处理器
pub struct GeneralSupportHandler {
    llm: Arc<dyn CompletionClient>,
    deadline: Duration,
}

impl GeneralSupportHandler {
    pub fn new(llm: Arc<dyn CompletionClient>, deadline: Duration) -> Self {
        Self { llm, deadline }
    }
}

#[async_trait]
impl Handler for GeneralSupportHandler {
    fn category(&self) -> HandlerCategory {
        HandlerCategory::GeneralSupport
    }

    fn task_spec(&self) -> TaskSpec {
        // 无必填参数：兜底路径不能被参数校验卡住
        TaskSpec::new("handler.general_support")
            .with_max_attempts(2)
            .with_timeout(self.deadline + Duration::from_secs(5))
    }

    async fn handle(&self, request: &HandlerRequest) -> Result<HandlerResponse, TripError> {
        let mut messages = request.history.clone();
        messages.push(crate::core::session::ChatMessage::user(&request.text));

        let completion = CompletionRequest::new(SUPPORT_SYSTEM_PROMPT, messages)
            .with_temperature(0.7)
            .with_deadline(self.deadline);

        let text = self
            .llm
            .complete(&completion)
            .await
            .map_err(TripError::from)?;

        Ok(HandlerResponse::text(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockCompletionClient;

    #[tokio::test]
    async fn test_support_answers_with_llm() {
        let mock = Arc::new(MockCompletionClient::new());
        mock.push_response("Happy to help with your trip!");
        let handler = GeneralSupportHandler::new(mock, Duration::from_secs(5));

        let response = handler
            .handle(&HandlerRequest {
                session_id: "s1".into(),
                text: "hello".into(),
                params: serde_json::Map::new(),
                history: vec![],
            })
            .await
            .unwrap();
        assert_eq!(response.text, "Happy to help with your trip!");
    }
}
