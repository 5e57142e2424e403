//! 应用上下文：组件装配与后台清扫
//!
//! 所有组件按配置构建一次、Arc 共享注入，不走全局单例。后台清扫任务
//! （缓存过期、错误保留、重试历史、处理器健康、会话回收）挂在同一个
//! CancellationToken 下，关停时一起退出。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::core::session::SessionManager;
use crate::error::classifier::{ErrorClassifier, RetentionConfig};
use crate::error::recovery::RecoveryRegistry;
use crate::handlers::{
    BookingAssistHandler, GeneralSupportHandler, HandlerRegistry, PackageDetailHandler,
    PackageSearchHandler,
};
use crate::llm::{CompletionClient, OpenAiCompletionClient};
use crate::resilience::{
    CacheConfig, CircuitBreakerConfig, CircuitBreakerRegistry, ResultCache, RetryEngine,
    RetryPolicy,
};
use crate::routing::router::{CapabilityRouter, RouterConfig};
use crate::task::TaskRunner;
use crate::upstream::{TravelApiClient, TravelApiConfig};

/// 组件容器
pub struct AppContext {
    pub config: AppConfig,
    pub sessions: Arc<SessionManager>,
    pub tasks: Arc<TaskRunner>,
    pub circuits: Arc<CircuitBreakerRegistry>,
    pub retry: Arc<RetryEngine>,
    pub cache: Arc<ResultCache>,
    pub classifier: Arc<ErrorClassifier>,
    pub recovery: Arc<RecoveryRegistry>,
    pub registry: Arc<HandlerRegistry>,
    pub orchestrator: Arc<Orchestrator>,
    shutdown: CancellationToken,
}

impl AppContext {
    /// 按配置装配全部组件
    pub async fn build(config: AppConfig) -> anyhow::Result<Arc<Self>> {
        let llm: Arc<dyn CompletionClient> = Arc::new(OpenAiCompletionClient::new(
            config.llm.base_url.as_deref(),
            &config.llm.model,
            config.llm.api_key.as_deref(),
        ));
        Self::build_with_llm(config, llm).await
    }

    /// 以给定补全客户端装配（集成测试注入 mock 用）
    pub async fn build_with_llm(
        config: AppConfig,
        llm: Arc<dyn CompletionClient>,
    ) -> anyhow::Result<Arc<Self>> {
        let llm_deadline = Duration::from_secs(config.llm.request_timeout_secs);

        let circuits = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: config.resilience.circuit.failure_threshold,
            min_throughput: config.resilience.circuit.min_throughput,
            recovery_timeout: Duration::from_secs(config.resilience.circuit.recovery_timeout_secs),
        }));
        let retry = Arc::new(RetryEngine::new(circuits.clone()));
        let retry_policy = RetryPolicy::new(config.resilience.retry.max_attempts)
            .with_base_delay(Duration::from_millis(config.resilience.retry.base_delay_ms))
            .with_max_delay(Duration::from_millis(config.resilience.retry.max_delay_ms))
            .with_multiplier(config.resilience.retry.backoff_multiplier)
            .with_jitter(config.resilience.retry.jitter)
            .with_attempt_timeout(Duration::from_secs(
                config.resilience.retry.attempt_timeout_secs,
            ));
        let cache = Arc::new(ResultCache::new(CacheConfig {
            max_entries: config.resilience.cache.max_entries,
            max_value_bytes: config.resilience.cache.max_value_bytes,
            default_ttl: Duration::from_secs(config.resilience.cache.default_ttl_secs),
        }));

        let classifier = Arc::new(ErrorClassifier::new(RetentionConfig {
            max_age: Duration::from_secs(config.resilience.errors.max_age_secs),
            max_count: config.resilience.errors.max_count,
        }));
        let recovery = Arc::new(
            RecoveryRegistry::with_builtins(config.resilience.rate_limit.inline_wait).await,
        );

        let upstream = Arc::new(TravelApiClient::new(TravelApiConfig {
            base_url: config.upstream.base_url.clone(),
            email: config.upstream.email.clone().unwrap_or_default(),
            password: config.upstream.password.clone().unwrap_or_default(),
            page_size: config.upstream.page_size as usize,
            request_timeout: Duration::from_secs(config.upstream.request_timeout_secs),
            ..TravelApiConfig::default()
        })?);

        let tasks = Arc::new(TaskRunner::new());
        let registry = Arc::new(HandlerRegistry::new(tasks.clone()));
        registry
            .register(Arc::new(PackageSearchHandler::new(
                upstream.clone(),
                cache.clone(),
                retry.clone(),
                retry_policy.clone(),
                llm.clone(),
                llm_deadline,
            )))
            .await;
        registry
            .register(Arc::new(PackageDetailHandler::new(
                upstream.clone(),
                cache.clone(),
                retry.clone(),
                retry_policy.clone(),
                llm.clone(),
                llm_deadline,
            )))
            .await;
        registry
            .register(Arc::new(BookingAssistHandler::new(
                llm.clone(),
                llm_deadline,
            )))
            .await;
        registry
            .register(Arc::new(GeneralSupportHandler::new(
                llm.clone(),
                llm_deadline,
            )))
            .await;

        let router = Arc::new(CapabilityRouter::new(
            llm.clone(),
            RouterConfig {
                confidence_floor: config.routing.confidence_floor,
                deadline: Duration::from_secs(config.routing.deadline_secs),
                history_window: config.routing.history_window,
            },
        ));

        let sessions = Arc::new(SessionManager::new(Duration::from_secs(
            config.app.session_timeout_secs,
        )));
        let orchestrator = Arc::new(Orchestrator::new(
            sessions.clone(),
            router,
            registry.clone(),
            classifier.clone(),
            recovery.clone(),
            OrchestratorConfig {
                turn_deadline: Duration::from_secs(config.app.turn_deadline_secs),
                history_window: config.app.history_window,
            },
        ));

        Ok(Arc::new(Self {
            config,
            sessions,
            tasks,
            circuits,
            retry,
            cache,
            classifier,
            recovery,
            registry,
            orchestrator,
            shutdown: CancellationToken::new(),
        }))
    }

    /// 启动后台清扫任务
    pub fn spawn_sweeps(self: &Arc<Self>) {
        self.spawn_sweep("cache", Duration::from_secs(60), |ctx| async move {
            let removed = ctx.cache.evict_expired().await;
            if removed > 0 {
                tracing::debug!(removed, "cache sweep");
            }
        });
        self.spawn_sweep("errors", Duration::from_secs(300), |ctx| async move {
            let removed = ctx.classifier.prune().await;
            if removed > 0 {
                tracing::debug!(removed, "error retention sweep");
            }
        });
        self.spawn_sweep("retry_history", Duration::from_secs(300), |ctx| async move {
            ctx.retry.prune_history().await;
        });
        self.spawn_sweep("handler_health", Duration::from_secs(60), |ctx| async move {
            ctx.registry.health_sweep().await;
        });
        self.spawn_sweep("sessions", Duration::from_secs(120), |ctx| async move {
            // 回收会话的同时清掉其任务状态
            for session_id in ctx.sessions.cleanup_expired().await {
                ctx.tasks.evict_session(&session_id).await;
            }
        });
    }

    fn spawn_sweep<F, Fut>(self: &Arc<Self>, name: &'static str, period: Duration, body: F)
    where
        F: Fn(Arc<AppContext>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let ctx = self.clone();
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!(sweep = name, "sweep task stopped");
                        break;
                    }
                    _ = ticker.tick() => body(ctx.clone()).await,
                }
            }
        });
    }

    /// 通知所有后台任务退出
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
