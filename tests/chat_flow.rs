//! 对话流集成测试
//!
//! 通过公开 API（HTTP 路由与编排器）验证端到端行为：校验拒绝、路由与回复、
//! 处理器兜底、任务重试与熔断快速拒绝。

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use tower::ServiceExt;

    use tripflow::config::AppConfig;
    use tripflow::core::AppContext;
    use tripflow::error::TripError;
    use tripflow::llm::MockCompletionClient;
    use tripflow::resilience::{CircuitBreakerConfig, CircuitBreakerRegistry};
    use tripflow::server::build_router;
    use tripflow::task::{TaskRunner, TaskSpec};

    fn test_config() -> AppConfig {
        let mut cfg = AppConfig::default();
        // 上游指向必然拒绝连接的端口，重试间隔压短
        cfg.upstream.base_url = "http://127.0.0.1:9/api/v1".to_string();
        cfg.resilience.retry.base_delay_ms = 10;
        cfg.resilience.retry.max_delay_ms = 50;
        cfg
    }

    async fn app(llm: Arc<MockCompletionClient>) -> (axum::Router, Arc<AppContext>) {
        let ctx = AppContext::build_with_llm(test_config(), llm)
            .await
            .unwrap();
        (build_router(ctx.clone()), ctx)
    }

    fn chat_request(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/chat")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_empty_messages_rejected_before_any_model_call() {
        let llm = Arc::new(MockCompletionClient::new());
        let (router, _ctx) = app(llm.clone()).await;

        let response = router
            .oneshot(chat_request(serde_json::json!({ "messages": [] })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        assert_eq!(body["category"], "validation");
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let llm = Arc::new(MockCompletionClient::new());
        let (router, _ctx) = app(llm.clone()).await;

        let response = router
            .oneshot(chat_request(serde_json::json!({
                "messages": [{ "role": "user", "content": "x".repeat(5000) }]
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_whitespace_only_message_is_client_error() {
        let llm = Arc::new(MockCompletionClient::new());
        let (router, _ctx) = app(llm.clone()).await;

        // 通过传输层长度检查，但编排器找不到有效的用户输入
        let response = router
            .oneshot(chat_request(serde_json::json!({
                "messages": [{ "role": "user", "content": "   " }]
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        assert_eq!(body["category"], "validation");
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_chat_routes_and_replies_end_to_end() {
        let llm = Arc::new(MockCompletionClient::new());
        llm.push_response(
            r#"{"category": "general_support", "confidence": 0.9, "params": {}}"#,
        );
        llm.push_response("You can cancel free of charge up to 7 days before departure.");
        let (router, _ctx) = app(llm).await;

        let response = router
            .oneshot(chat_request(serde_json::json!({
                "messages": [{ "role": "user", "content": "What is your cancellation policy?" }]
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["response"].as_str().unwrap().contains("cancel"));
        assert_eq!(body["handler_used"], "general_support");
        assert!(body["session_id"].as_str().unwrap().starts_with("session_"));
        assert_eq!(body["metadata"]["routing_decision"]["category"], "general_support");
        assert_eq!(body["metadata"]["fallback"], false);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_falls_back_to_default_handler() {
        let llm = Arc::new(MockCompletionClient::new());
        llm.push_response(
            r#"{"category": "package_search", "confidence": 0.95, "params": {"destination": "Goa"}}"#,
        );
        // 套餐处理器因上游不可达失败后，兜底的客服处理器消费这条
        llm.push_response("Our package search is briefly unavailable, but I can still help.");
        let (router, _ctx) = app(llm).await;

        let response = router
            .oneshot(chat_request(serde_json::json!({
                "messages": [{ "role": "user", "content": "Find me packages to Goa" }]
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["metadata"]["fallback"], true);
        assert_eq!(body["metadata"]["handler"], "general_support");
        assert!(body["metadata"]["primary_error"].is_string());
    }

    #[tokio::test]
    async fn test_router_degradation_still_produces_reply() {
        let llm = Arc::new(MockCompletionClient::new());
        llm.push_response("this is not json");
        llm.push_response("Happy to help!");
        let (router, _ctx) = app(llm).await;

        let response = router
            .oneshot(chat_request(serde_json::json!({
                "messages": [{ "role": "user", "content": "hello" }]
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        // 路由输出不可解析时落到默认类别与固定低置信度
        assert_eq!(body["handler_used"], "general_support");
        assert!((body["confidence"].as_f64().unwrap() - 0.3).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_health_reports_all_components() {
        let llm = Arc::new(MockCompletionClient::new());
        let (router, ctx) = app(llm).await;

        let response = router
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["overall"], "healthy");
        assert_eq!(body["handlers"].as_array().unwrap().len(), 4);
        assert_eq!(body["open_circuits"].as_array().unwrap().len(), 0);
        assert_eq!(ctx.sessions.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_task_middleware_recovers_after_transient_failures() {
        let runner = TaskRunner::new();
        let spec = TaskSpec::new("search.flaky")
            .with_max_attempts(3)
            .with_timeout(Duration::from_secs(1));
        let calls = Arc::new(AtomicU32::new(0));

        let calls_ref = calls.clone();
        let result = runner
            .run("s1", &spec, serde_json::json!({}), move |_| {
                let calls = calls_ref.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TripError::Network("connection reset".into()))
                    } else {
                        Ok(serde_json::json!({"ok": true}))
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let state = runner.state("s1", "search.flaky").await.unwrap();
        assert_eq!(state.attempts, 3);
    }

    #[tokio::test]
    async fn test_circuit_opens_and_rejects_without_invoking_operation() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 5,
            min_throughput: 5,
            recovery_timeout: Duration::from_secs(30),
        });
        let breaker = registry.breaker("upstream.search").await;

        for _ in 0..5 {
            let result: Result<(), TripError> = breaker
                .execute(async { Err(TripError::Network("down".into())) })
                .await;
            assert!(result.is_err());
        }
        assert_eq!(registry.open_circuits().await, vec!["upstream.search".to_string()]);

        // 熔断打开后不再触达底层操作
        let invoked = Arc::new(AtomicU32::new(0));
        let invoked_ref = invoked.clone();
        let result: Result<(), TripError> = breaker
            .execute(async move {
                invoked_ref.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        match result {
            Err(TripError::CircuitOpen { retry_in_ms, .. }) => assert!(retry_in_ms > 0),
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }
}
