//! 恢复策略注册表
//!
//! 策略 = 命名的 (matches, execute, priority) 三元组；handle 时按优先级降序
//! 依次调用匹配的策略，第一个返回非空结果的获胜；策略自身出错只记录日志并
//! 跳过，不影响整体处理。Critical 级 System 错误绕过假设部分功能可用的
//! 策略，直接走固定安全回复。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::classifier::ClassifiedError;
use crate::error::{ErrorCategory, Severity, TripError};

/// 策略产出：替代回复或重试信号
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome {
    /// 可直接返回给用户的替代文案
    Substitute(String),
    /// 建议调用方立即重试
    Retry,
    /// 建议调用方在等待指定时长后重试
    RetryAfter(Duration),
}

/// 恢复策略接口
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// 优先级，越大越先执行
    fn priority(&self) -> i32;

    fn matches(&self, err: &ClassifiedError) -> bool;

    /// 返回 Ok(None) 表示放弃，让后续策略接手
    async fn execute(&self, err: &ClassifiedError) -> Result<Option<RecoveryOutcome>, TripError>;
}

/// 固定安全回复，Critical 时使用
pub const SAFE_RESPONSE: &str = "We're having trouble completing that right now. \
Please try again in a moment, and contact support if the problem continues.";

/// 恢复注册表
pub struct RecoveryRegistry {
    strategies: RwLock<Vec<Arc<dyn RecoveryStrategy>>>,
}

impl RecoveryRegistry {
    pub fn new() -> Self {
        Self {
            strategies: RwLock::new(Vec::new()),
        }
    }

    /// 注册内置策略（固定优先级顺序），并保持对额外策略开放
    pub async fn with_builtins(inline_rate_limit_wait: bool) -> Self {
        let registry = Self::new();
        registry.register(Arc::new(NetworkRetryStrategy)).await;
        registry
            .register(Arc::new(RateLimitStrategy {
                inline_wait: inline_rate_limit_wait,
            }))
            .await;
        registry.register(Arc::new(FallbackResponseStrategy)).await;
        registry.register(Arc::new(ValidationGuidanceStrategy)).await;
        registry.register(Arc::new(CriticalSafeStrategy)).await;
        registry
    }

    pub async fn register(&self, strategy: Arc<dyn RecoveryStrategy>) {
        let mut strategies = self.strategies.write().await;
        strategies.push(strategy);
        strategies.sort_by_key(|s| std::cmp::Reverse(s.priority()));
    }

    pub async fn len(&self) -> usize {
        self.strategies.read().await.len()
    }

    /// 依次尝试匹配的策略，返回第一个非空产出
    pub async fn handle(&self, err: &ClassifiedError) -> Option<RecoveryOutcome> {
        // Critical 系统错误不进策略链
        if err.severity == Severity::Critical && err.category == ErrorCategory::System {
            tracing::error!(error_id = %err.id, "critical system error, returning safe response");
            return Some(RecoveryOutcome::Substitute(SAFE_RESPONSE.to_string()));
        }

        let strategies = self.strategies.read().await.clone();
        for strategy in strategies {
            if !strategy.matches(err) {
                continue;
            }
            match strategy.execute(err).await {
                Ok(Some(outcome)) => {
                    tracing::info!(
                        error_id = %err.id,
                        strategy = strategy.name(),
                        "recovery strategy produced outcome"
                    );
                    return Some(outcome);
                }
                Ok(None) => continue,
                Err(e) => {
                    // 策略自身失败不致命
                    tracing::warn!(
                        error_id = %err.id,
                        strategy = strategy.name(),
                        "recovery strategy failed, skipping: {e}"
                    );
                }
            }
        }
        None
    }
}

impl Default for RecoveryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// 网络错误且还有重试预算时给出重试信号
pub struct NetworkRetryStrategy;

#[async_trait]
impl RecoveryStrategy for NetworkRetryStrategy {
    fn name(&self) -> &str {
        "network_retry"
    }

    fn priority(&self) -> i32 {
        100
    }

    fn matches(&self, err: &ClassifiedError) -> bool {
        matches!(
            err.category,
            ErrorCategory::Network | ErrorCategory::Timeout
        ) && err.retryable
            && err.retry_count < err.max_retries
    }

    async fn execute(&self, _err: &ClassifiedError) -> Result<Option<RecoveryOutcome>, TripError> {
        Ok(Some(RecoveryOutcome::Retry))
    }
}

/// 限流退避：默认只向调用方发信号；inline_wait 打开时原地等待
pub struct RateLimitStrategy {
    pub inline_wait: bool,
}

impl RateLimitStrategy {
    fn wait_for(err: &ClassifiedError) -> Duration {
        err.context
            .metadata
            .get("retry_after_ms")
            .and_then(|v| v.as_u64())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(2))
    }
}

#[async_trait]
impl RecoveryStrategy for RateLimitStrategy {
    fn name(&self) -> &str {
        "rate_limit_backoff"
    }

    fn priority(&self) -> i32 {
        90
    }

    fn matches(&self, err: &ClassifiedError) -> bool {
        err.category == ErrorCategory::RateLimit
    }

    async fn execute(&self, err: &ClassifiedError) -> Result<Option<RecoveryOutcome>, TripError> {
        let wait = Self::wait_for(err);
        if self.inline_wait {
            tokio::time::sleep(wait).await;
            return Ok(Some(RecoveryOutcome::Retry));
        }
        Ok(Some(RecoveryOutcome::RetryAfter(wait)))
    }
}

/// API/网络高严重度失败的兜底用户文案
pub struct FallbackResponseStrategy;

#[async_trait]
impl RecoveryStrategy for FallbackResponseStrategy {
    fn name(&self) -> &str {
        "fallback_response"
    }

    fn priority(&self) -> i32 {
        50
    }

    fn matches(&self, err: &ClassifiedError) -> bool {
        matches!(
            err.category,
            ErrorCategory::Api | ErrorCategory::Network | ErrorCategory::Timeout | ErrorCategory::Task
        )
    }

    async fn execute(&self, err: &ClassifiedError) -> Result<Option<RecoveryOutcome>, TripError> {
        Ok(Some(RecoveryOutcome::Substitute(format!(
            "I couldn't reach our travel data service just now. \
Please try again shortly. (ref: {})",
            err.id
        ))))
    }
}

/// 校验错误转为面向用户的修正指引
pub struct ValidationGuidanceStrategy;

#[async_trait]
impl RecoveryStrategy for ValidationGuidanceStrategy {
    fn name(&self) -> &str {
        "validation_guidance"
    }

    fn priority(&self) -> i32 {
        40
    }

    fn matches(&self, err: &ClassifiedError) -> bool {
        err.category == ErrorCategory::Validation
    }

    async fn execute(&self, _err: &ClassifiedError) -> Result<Option<RecoveryOutcome>, TripError> {
        Ok(Some(RecoveryOutcome::Substitute(
            "I couldn't understand part of that request. Could you rephrase it? \
For package searches, a destination and travel dates help a lot.".to_string(),
        )))
    }
}

/// 兜底安全回复
pub struct CriticalSafeStrategy;

#[async_trait]
impl RecoveryStrategy for CriticalSafeStrategy {
    fn name(&self) -> &str {
        "critical_safe_response"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn matches(&self, err: &ClassifiedError) -> bool {
        err.severity >= Severity::High
    }

    async fn execute(&self, _err: &ClassifiedError) -> Result<Option<RecoveryOutcome>, TripError> {
        Ok(Some(RecoveryOutcome::Substitute(SAFE_RESPONSE.to_string())))
    }
}
