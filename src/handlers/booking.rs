//! 预订协助处理器
//!
//! 收集预订意向字段（套餐、日期、人数、联系方式），齐了生成交接摘要，
//! 缺了礼貌追问。不执行真实预订。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TripError;
use crate::handlers::{Handler, HandlerRequest, HandlerResponse};
use crate::llm::{CompletionClient, CompletionRequest};
use crate::routing::HandlerCategory;
use crate::task::{ParamKind, ParamSpec, TaskSpec};

const BOOKING_FIELDS: [&str; 4] = ["package_name", "travel_date", "travellers", "contact"];

const BOOKING_PROMPT: &str = "You are a travel booking assistant. Using the collected \
booking details below, either (a) if fields are missing, ask for them politely in one \
short message, or (b) if everything is present, produce a confirmation summary and say \
a booking specialist will follow up. Never claim the booking is already confirmed.";

/// 预订协助处理器
pub struct BookingAssistHandler {
    llm: Arc<dyn CompletionClient>,
    deadline: Duration,
}

impl BookingAssistHandler {
    pub fn new(llm: Arc<dyn CompletionClient>, deadline: Duration) -> Self {
        Self { llm, deadline }
    }

    fn collect_fields(
        params: &serde_json::Map<String, serde_json::Value>,
    ) -> (serde_json::Map<String, serde_json::Value>, Vec<&'static str>) {
        let mut present = serde_json::Map::new();
        let mut missing = Vec::new();
        for field in BOOKING_FIELDS {
            match params.get(field) {
                Some(v) if !v.is_null() => {
                    present.insert(field.to_string(), v.clone());
                }
                _ => missing.push(field),
            }
        }
        (present, missing)
    }
}

#[async_trait]
impl Handler for BookingAssistHandler {
    fn category(&self) -> HandlerCategory {
        HandlerCategory::BookingAssist
    }

    fn task_spec(&self) -> TaskSpec {
        TaskSpec::new("handler.booking_assist")
            .with_param(ParamSpec::optional("package_name", ParamKind::String))
            .with_param(ParamSpec::optional("travel_date", ParamKind::String))
            .with_param(ParamSpec::optional("travellers", ParamKind::Number))
            .with_param(ParamSpec::optional("contact", ParamKind::String))
            .with_max_attempts(2)
            .with_timeout(Duration::from_secs(30))
    }

    async fn handle(&self, request: &HandlerRequest) -> Result<HandlerResponse, TripError> {
        let (present, missing) = Self::collect_fields(&request.params);

        let state = serde_json::json!({
            "collected": present,
            "missing": missing,
            "latest_message": request.text,
        });
        let messages = vec![crate::core::session::ChatMessage::user(state.to_string())];
        let completion = CompletionRequest::new(BOOKING_PROMPT, messages)
            .with_temperature(0.4)
            .with_deadline(self.deadline);

        let text = match self.llm.complete(&completion).await {
            Ok(text) => text,
            // LLM 不可用时退化为模板追问/摘要
            Err(_) if missing.is_empty() => format!(
                "Thanks! I've noted your booking request: {}. A booking specialist \
will follow up to confirm.",
                serde_json::Value::Object(present.clone())
            ),
            Err(_) => format!(
                "To get your booking started I still need: {}.",
                missing.join(", ")
            ),
        };

        Ok(HandlerResponse::text(text)
            .with_meta("booking_fields", serde_json::Value::Object(present))
            .with_meta(
                "missing_fields",
                serde_json::Value::Array(missing.iter().map(|m| (*m).into()).collect()),
            ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockCompletionClient};
    use serde_json::json;

    fn request(params: serde_json::Value) -> HandlerRequest {
        HandlerRequest {
            session_id: "s1".into(),
            text: "book it".into(),
            params: params.as_object().cloned().unwrap_or_default(),
            history: vec![],
        }
    }

    #[tokio::test]
    async fn test_missing_fields_reported_in_metadata() {
        let mock = Arc::new(MockCompletionClient::new());
        mock.push_response("Could you share your travel date?");
        let handler = BookingAssistHandler::new(mock, Duration::from_secs(5));

        let response = handler
            .handle(&request(json!({"package_name": "Goa Getaway"})))
            .await
            .unwrap();
        let missing = response.metadata["missing_fields"].as_array().unwrap();
        assert!(missing.contains(&json!("travel_date")));
        assert!(!missing.contains(&json!("package_name")));
    }

    #[tokio::test]
    async fn test_template_fallback_when_llm_down() {
        let mock = Arc::new(MockCompletionClient::new());
        mock.push_error(LlmError::Timeout);
        let handler = BookingAssistHandler::new(mock, Duration::from_secs(5));

        let response = handler.handle(&request(json!({}))).await.unwrap();
        assert!(response.text.contains("package_name"));
    }
}
