//! 能力路由器
//!
//! 用一次补全调用做分类：系统提示约束输出为固定 JSON schema（category、
//! confidence、params、priority），解析校验后产出 RouteDecision；任何
//! 调用或解析失败都降级为默认决策，route 绝不向调用方抛错，也不在内部重试。

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::core::session::{ChatMessage, SessionContext};
use crate::llm::{CompletionClient, CompletionRequest};
use crate::routing::HandlerCategory;

/// 路由决策，按请求新建，不跨请求持久化
#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub category: HandlerCategory,
    /// 已钳制到 [0, 1]
    pub confidence: f64,
    pub params: serde_json::Map<String, serde_json::Value>,
    pub priority: u8,
}

impl RouteDecision {
    /// 兜底决策：默认类别 + 固定低置信度 + 空参数
    pub fn fallback() -> Self {
        Self {
            category: HandlerCategory::DEFAULT,
            confidence: 0.3,
            params: serde_json::Map::new(),
            priority: 1,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "category": self.category.as_str(),
            "confidence": self.confidence,
            "params": self.params,
            "priority": self.priority,
        })
    }
}

/// 路由参数
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub confidence_floor: f64,
    pub deadline: Duration,
    /// 分类时携带的最近消息条数
    pub history_window: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            confidence_floor: 0.4,
            deadline: Duration::from_secs(10),
            history_window: 6,
        }
    }
}

/// LLM 返回的原始路由输出（schema 校验目标）
#[derive(Debug, Deserialize)]
struct RawRoute {
    category: String,
    confidence: f64,
    #[serde(default)]
    params: serde_json::Map<String, serde_json::Value>,
    #[serde(default = "default_priority")]
    priority: u8,
}

fn default_priority() -> u8 {
    1
}

const ROUTING_SYSTEM_PROMPT: &str = r#"You are a routing classifier for a travel assistant.
Classify the user's latest request into exactly one category:
- package_search: looking for travel packages (destination, duration, budget)
- package_detail: asking about a specific package (pricing, itinerary, inclusions)
- booking_assist: wants to book or modify a booking
- general_support: anything else (greetings, FAQs, account help)

Respond with ONLY a JSON object, no markdown, no explanation:
{"category": "<one of the four>", "confidence": <0.0-1.0>, "params": {<extracted parameters, e.g. "destination", "duration_days", "budget", "package_name">}, "priority": <1-3>}"#;

/// 能力路由器
pub struct CapabilityRouter {
    llm: Arc<dyn CompletionClient>,
    config: RouterConfig,
}

impl CapabilityRouter {
    pub fn new(llm: Arc<dyn CompletionClient>, config: RouterConfig) -> Self {
        Self { llm, config }
    }

    /// 路由一条请求；失败永远降级而不是报错
    pub async fn route(
        &self,
        request_text: &str,
        recent_history: &[ChatMessage],
        session: Option<&SessionContext>,
    ) -> RouteDecision {
        let mut messages: Vec<ChatMessage> = recent_history
            .iter()
            .rev()
            .take(self.config.history_window)
            .rev()
            .cloned()
            .collect();
        messages.push(ChatMessage::user(request_text));

        // 上一轮的决策作为连续性提示，但不替代新分类
        if let Some(hint) = session
            .and_then(|s| s.metadata.get("last_route"))
            .and_then(|v| v.get("category"))
            .and_then(|v| v.as_str())
        {
            messages.insert(
                0,
                ChatMessage::system(format!("Previous turn was routed to: {hint}")),
            );
        }

        let completion_request = CompletionRequest::new(ROUTING_SYSTEM_PROMPT, messages)
            .with_temperature(0.0)
            .with_max_tokens(256)
            .with_deadline(self.config.deadline);

        let raw = match self.llm.complete(&completion_request).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("routing completion failed, falling back: {e}");
                return RouteDecision::fallback();
            }
        };

        match self.parse(&raw) {
            Some(decision) if decision.confidence >= self.config.confidence_floor => {
                tracing::debug!(
                    category = decision.category.as_str(),
                    confidence = decision.confidence,
                    "route decision"
                );
                decision
            }
            Some(decision) => {
                tracing::debug!(
                    confidence = decision.confidence,
                    floor = self.config.confidence_floor,
                    "confidence below floor, using default category"
                );
                RouteDecision {
                    category: HandlerCategory::DEFAULT,
                    ..decision
                }
            }
            None => {
                tracing::warn!(output = %preview(&raw), "unparsable routing output, falling back");
                RouteDecision::fallback()
            }
        }
    }

    /// 解析并校验 LLM 输出；容忍 markdown 代码围栏
    fn parse(&self, raw: &str) -> Option<RouteDecision> {
        let cleaned = strip_code_fences(raw);
        let parsed: RawRoute = serde_json::from_str(cleaned).ok()?;
        let category = HandlerCategory::parse(&parsed.category)?;
        Some(RouteDecision {
            category,
            confidence: parsed.confidence.clamp(0.0, 1.0),
            params: parsed.params,
            priority: parsed.priority.clamp(1, 3),
        })
    }
}

fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
}

fn preview(s: &str) -> String {
    if s.len() > 120 {
        format!("{}...", s.chars().take(120).collect::<String>())
    } else {
        s.to_string()
    }
}
