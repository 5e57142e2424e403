//! OpenAI 兼容补全客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url），请求整体
//! 包在 deadline 内；限流类失败单独映射为 RateLimited 以便上层退避。

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::core::session::{ChatMessage, Role};
use crate::llm::traits::{CompletionClient, CompletionRequest, LlmError};

/// OpenAI 兼容客户端：持有 Client 与 model 名
pub struct OpenAiCompletionClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiCompletionClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
        }
    }

    fn to_openai_messages(
        &self,
        request: &CompletionRequest,
    ) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        let mut out = Vec::with_capacity(request.messages.len() + 1);
        out.push(ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(request.system.clone())
                .build()
                .map_err(|e| LlmError::Api(e.to_string()))?,
        ));
        for m in &request.messages {
            let msg = match m.role {
                Role::System => ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map_err(|e| LlmError::Api(e.to_string()))?,
                ),
                Role::User => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map_err(|e| LlmError::Api(e.to_string()))?,
                ),
                Role::Assistant => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map_err(|e| LlmError::Api(e.to_string()))?,
                ),
            };
            out.push(msg);
        }
        Ok(out)
    }

    fn map_api_error(message: String) -> LlmError {
        let lower = message.to_lowercase();
        if lower.contains("429") || lower.contains("rate limit") {
            return LlmError::RateLimited { retry_after_ms: 2000 };
        }
        if lower.contains("timeout") || lower.contains("timed out") {
            return LlmError::Timeout;
        }
        LlmError::Api(message)
    }
}

#[async_trait]
impl CompletionClient for OpenAiCompletionClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let api_request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .temperature(request.temperature)
            .max_tokens(request.max_tokens)
            .messages(self.to_openai_messages(request)?)
            .build()
            .map_err(|e| LlmError::Api(e.to_string()))?;

        let chat = self.client.chat();
        let call = chat.create(api_request);
        let response = match tokio::time::timeout(request.deadline, call).await {
            Ok(result) => result.map_err(|e| Self::map_api_error(e.to_string()))?,
            Err(_) => return Err(LlmError::Timeout),
        };

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        if content.is_empty() {
            return Err(LlmError::MalformedOutput("empty completion".to_string()));
        }
        Ok(content)
    }
}
