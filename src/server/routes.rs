//! 路由处理函数
//!
//! /api/chat 在进入编排器前做传输层校验（消息条数与长度上限），校验失败
//! 返回 422 与结构化错误体；/api/health 汇总处理器、熔断、缓存与错误计数。

use std::collections::HashMap;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::core::{AppContext, ChatRequest, ChatResponse};
use crate::error::{ErrorCategory, TripError};
use crate::handlers::HandlerHealth;

/// 客户端可读的错误体
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub category: String,
}

impl ApiError {
    fn validation(message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
        (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ApiError {
                error: message.into(),
                category: "validation".to_string(),
            }),
        )
    }

    fn from_trip(err: &TripError) -> (StatusCode, Json<ApiError>) {
        // 编排器内的输入校验失败也是客户端错误，不能落到 500
        let status = match err.category() {
            ErrorCategory::Validation => StatusCode::UNPROCESSABLE_ENTITY,
            _ => err
                .status()
                .and_then(|s| StatusCode::from_u16(s).ok())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        };
        (
            status,
            Json(ApiError {
                error: err.to_string(),
                category: err.category().as_str().to_string(),
            }),
        )
    }
}

/// POST /api/chat
pub async fn api_chat(
    State(ctx): State<Arc<AppContext>>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, (StatusCode, Json<ApiError>)> {
    let limits = &ctx.config.server;
    if request.messages.is_empty() {
        return Err(ApiError::validation("messages must not be empty"));
    }
    if request.messages.len() > limits.max_messages {
        return Err(ApiError::validation(format!(
            "too many messages: {} (limit {})",
            request.messages.len(),
            limits.max_messages
        )));
    }
    if let Some(oversized) = request
        .messages
        .iter()
        .find(|m| m.content.chars().count() > limits.max_content_len)
    {
        return Err(ApiError::validation(format!(
            "message content too long: {} chars (limit {})",
            oversized.content.chars().count(),
            limits.max_content_len
        )));
    }

    ctx.orchestrator
        .process(request)
        .await
        .map(Json)
        .map_err(|e| ApiError::from_trip(&e))
}

/// 健康端点响应
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// healthy | degraded | unhealthy
    pub overall: &'static str,
    pub handlers: Vec<HandlerHealth>,
    pub active_sessions: usize,
    pub cache_entries: usize,
    pub open_circuits: Vec<String>,
    pub error_counts: HashMap<String, u64>,
}

/// GET /api/health
pub async fn api_health(State(ctx): State<Arc<AppContext>>) -> Json<HealthResponse> {
    let handlers = ctx.registry.health_snapshot().await;
    let open_circuits = ctx.circuits.open_circuits().await;
    let error_counts: HashMap<String, u64> = ctx
        .classifier
        .category_counts()
        .await
        .into_iter()
        .map(|(category, count)| (category.as_str().to_string(), count))
        .collect();

    let default_down = handlers
        .iter()
        .any(|h| h.category == crate::routing::HandlerCategory::DEFAULT && !h.healthy);
    let any_degraded =
        handlers.iter().any(|h| !h.healthy || !h.is_active) || !open_circuits.is_empty();
    let overall = if default_down {
        "unhealthy"
    } else if any_degraded {
        "degraded"
    } else {
        "healthy"
    };

    Json(HealthResponse {
        overall,
        handlers,
        active_sessions: ctx.sessions.active_count().await,
        cache_entries: ctx.cache.len().await,
        open_circuits,
        error_counts,
    })
}
