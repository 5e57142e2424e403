//! 重试引擎：有界循环 + 指数退避 + 抖动
//!
//! 每次尝试都经过该 op_id 的熔断器与超时守卫；不可重试或次数耗尽时
//! 抛出带尝试次数与最终原因的聚合错误。显式循环而非递归，避免病态
//! 配置下的栈增长。每次尝试追加到按 op_id 维护的历史，供可观测性使用。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use regex::RegexSet;
use tokio::sync::RwLock;

use crate::error::{RetryError, TripError};
use crate::resilience::circuit::CircuitBreakerRegistry;
use crate::resilience::timeout::with_deadline;

/// 默认可重试的 HTTP 状态码
pub const RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// 默认可重试的错误消息模式（大小写不敏感）
const RETRYABLE_PATTERNS: [&str; 6] = [
    r"(?i)timeout",
    r"(?i)timed? out",
    r"(?i)network",
    r"(?i)connection (reset|refused|closed)",
    r"(?i)rate limit",
    r"(?i)temporarily unavailable",
];

/// 重试回调：参数为 (attempt, error)
pub type RetryHook = Arc<dyn Fn(u32, &TripError) + Send + Sync>;

/// 重试策略
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    /// 单次尝试的截止时间
    pub attempt_timeout: Duration,
    pub retryable_statuses: Vec<u16>,
    retryable_patterns: RegexSet,
    pub on_retry: Option<RetryHook>,
    pub on_failure: Option<RetryHook>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("jitter", &self.jitter)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(300),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
            attempt_timeout: Duration::from_secs(20),
            retryable_statuses: RETRYABLE_STATUSES.to_vec(),
            retryable_patterns: RegexSet::new(RETRYABLE_PATTERNS)
                .unwrap_or_else(|_| RegexSet::empty()),
            on_retry: None,
            on_failure: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_on_retry(mut self, hook: RetryHook) -> Self {
        self.on_retry = Some(hook);
        self
    }

    pub fn with_on_failure(mut self, hook: RetryHook) -> Self {
        self.on_failure = Some(hook);
        self
    }

    /// 第 k 次尝试失败后的退避（未加抖动）：min(base × multiplier^(k-1), max)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let millis = (self.base_delay.as_millis() as f64) * exp;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// 抖动：均匀缩放到 [0.5, 1.0] 倍
    fn apply_jitter(&self, delay: Duration) -> Duration {
        if !self.jitter {
            return delay;
        }
        let factor: f64 = rand::thread_rng().gen_range(0.5..=1.0);
        Duration::from_millis((delay.as_millis() as f64 * factor) as u64)
    }

    /// 错误是否可重试：区分超时/网络类别、可重试状态码、消息模式
    pub fn is_retryable(&self, err: &TripError) -> bool {
        match err {
            TripError::Timeout { .. } | TripError::RateLimited { .. } => true,
            // 熔断拒绝走单独变体，这里的 Network 都是真实网络故障
            TripError::Network(_) => true,
            TripError::CircuitOpen { .. } => false,
            TripError::Api { status, message } => {
                self.retryable_statuses.contains(status)
                    || self.retryable_patterns.is_match(message)
            }
            TripError::Validation(_) | TripError::Authentication(_) | TripError::System(_) => {
                false
            }
            TripError::Task { message, .. } => self.retryable_patterns.is_match(message),
        }
    }
}

/// 单次尝试记录
#[derive(Debug, Clone)]
pub struct OperationAttempt {
    pub attempt_number: u32,
    pub delay_before_attempt: Duration,
    pub error: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// 重试引擎：持有熔断器注册表与按 op_id 的尝试历史
pub struct RetryEngine {
    circuits: Arc<CircuitBreakerRegistry>,
    history: RwLock<HashMap<String, Vec<OperationAttempt>>>,
    /// 尝试历史保留窗口
    retention: chrono::Duration,
}

impl RetryEngine {
    pub fn new(circuits: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            circuits,
            history: RwLock::new(HashMap::new()),
            retention: chrono::Duration::minutes(10),
        }
    }

    /// 在重试策略下执行操作；成功时清空该 op_id 的历史
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        op_id: &str,
        policy: &RetryPolicy,
        mut operation: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TripError>>,
    {
        let breaker = self.circuits.breaker(op_id).await;
        let mut delay_before = Duration::ZERO;
        // 字段公开，struct-update 可绕过 new 的钳制；至少执行一次
        let max_attempts = policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let result = breaker
                .execute(with_deadline(op_id, policy.attempt_timeout, operation()))
                .await;

            match result {
                Ok(value) => {
                    self.clear_history(op_id).await;
                    return Ok(value);
                }
                Err(err) => {
                    self.record_attempt(op_id, attempt, delay_before, &err).await;

                    let last = attempt == max_attempts;
                    if last || !policy.is_retryable(&err) {
                        if let Some(hook) = &policy.on_failure {
                            hook(attempt, &err);
                        }
                        tracing::warn!(
                            op_id,
                            attempt,
                            error = %err,
                            retryable = policy.is_retryable(&err),
                            "retry exhausted"
                        );
                        return Err(RetryError {
                            operation: op_id.to_string(),
                            attempts: attempt,
                            source: err,
                        });
                    }

                    let delay = policy.apply_jitter(policy.delay_for_attempt(attempt));
                    if let Some(hook) = &policy.on_retry {
                        hook(attempt, &err);
                    }
                    tracing::debug!(op_id, attempt, delay_ms = delay.as_millis() as u64, "retrying");
                    delay_before = delay;
                    tokio::time::sleep(delay).await;
                }
            }
        }

        // max_attempts >= 1，循环内必然返回
        unreachable!("retry loop exited without returning")
    }

    async fn record_attempt(
        &self,
        op_id: &str,
        attempt: u32,
        delay_before: Duration,
        err: &TripError,
    ) {
        let mut history = self.history.write().await;
        history
            .entry(op_id.to_string())
            .or_default()
            .push(OperationAttempt {
                attempt_number: attempt,
                delay_before_attempt: delay_before,
                error: Some(err.to_string()),
                timestamp: chrono::Utc::now(),
            });
    }

    async fn clear_history(&self, op_id: &str) {
        self.history.write().await.remove(op_id);
    }

    /// 某操作的尝试历史快照
    pub async fn attempts(&self, op_id: &str) -> Vec<OperationAttempt> {
        self.history
            .read()
            .await
            .get(op_id)
            .cloned()
            .unwrap_or_default()
    }

    /// 定期清扫：丢弃超出保留窗口的尝试记录
    pub async fn prune_history(&self) -> usize {
        let cutoff = chrono::Utc::now() - self.retention;
        let mut history = self.history.write().await;
        let mut removed = 0;
        history.retain(|_, attempts| {
            let before = attempts.len();
            attempts.retain(|a| a.timestamp > cutoff);
            removed += before - attempts.len();
            !attempts.is_empty()
        });
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit::CircuitBreakerConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn engine() -> RetryEngine {
        // 阈值调高，避免重试测试触发熔断
        RetryEngine::new(Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 100,
            min_throughput: 100,
            recovery_timeout: Duration::from_secs(30),
        })))
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts)
            .with_base_delay(Duration::from_millis(5))
            .with_max_delay(Duration::from_millis(20))
            .with_jitter(false)
    }

    #[tokio::test]
    async fn test_permanent_failure_invoked_exactly_n_times() {
        let engine = engine();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<(), _> = engine
            .execute_with_retry("op.fail", &fast_policy(4), move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(TripError::Network("connection reset".into()))
                }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(engine.attempts("op.fail").await.len(), 4);
    }

    #[tokio::test]
    async fn test_success_after_transient_failures_clears_history() {
        let engine = engine();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result = engine
            .execute_with_retry("op.flaky", &fast_policy(3), move || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TripError::Network("reset".into()))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(engine.attempts("op.flaky").await.is_empty());
    }

    #[tokio::test]
    async fn test_non_retryable_stops_immediately() {
        let engine = engine();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<(), _> = engine
            .execute_with_retry("op.invalid", &fast_policy(5), move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(TripError::Validation("bad input".into()))
                }
            })
            .await;

        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_max_attempts_still_runs_once() {
        let engine = engine();
        let policy = RetryPolicy {
            max_attempts: 0,
            ..fast_policy(1)
        };
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result = engine
            .execute_with_retry("op.zero", &policy, move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok("ok")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_on_retry_hook_invoked() {
        let engine = engine();
        let hook_calls = Arc::new(AtomicU32::new(0));
        let h = hook_calls.clone();
        let policy = fast_policy(3).with_on_retry(Arc::new(move |_, _| {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        let _: Result<(), _> = engine
            .execute_with_retry("op.hook", &policy, || async {
                Err(TripError::Network("down".into()))
            })
            .await;

        // 3 次尝试 = 2 次重试回调（最后一次失败走 on_failure）
        assert_eq!(hook_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_backoff_formula_without_jitter() {
        let policy = RetryPolicy::new(5)
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(600))
            .with_multiplier(2.0)
            .with_jitter(false);

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        // 上限截断
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(600));
    }

    #[test]
    fn test_jitter_within_half_to_full_range() {
        let policy = RetryPolicy::new(3)
            .with_base_delay(Duration::from_millis(200))
            .with_jitter(true);
        for _ in 0..50 {
            let d = policy.apply_jitter(Duration::from_millis(200));
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(200));
        }
    }

    #[test]
    fn test_retryable_classification() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable(&TripError::Timeout { operation: "x".into() }));
        assert!(policy.is_retryable(&TripError::Api {
            status: 503,
            message: "unavailable".into()
        }));
        assert!(policy.is_retryable(&TripError::Api {
            status: 400,
            message: "request timed out upstream".into()
        }));
        assert!(!policy.is_retryable(&TripError::Api {
            status: 404,
            message: "not found".into()
        }));
        assert!(!policy.is_retryable(&TripError::CircuitOpen {
            operation: "x".into(),
            retry_in_ms: 10
        }));
    }

    #[tokio::test]
    async fn test_attempt_timeout_classified_as_timeout() {
        let engine = engine();
        let policy = fast_policy(2).with_attempt_timeout(Duration::from_millis(20));

        let result: Result<(), _> = engine
            .execute_with_retry("op.slow", &policy, || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err.source, TripError::Timeout { .. }));
        assert_eq!(err.attempts, 2);
    }
}
