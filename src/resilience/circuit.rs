//! 熔断器：按操作 ID 隔离的失败闸门
//!
//! Closed 正常放行；窗口内失败达阈值（且吞吐量合格）转 Open；冷却期满后
//! 转 HalfOpen 放行恰好一个试探调用，成功则 Closed 并清零计数，失败则回 Open。
//! 试探被调用方弃单时槽位按时效过期，不会永久占用。这里只做闸门，不做重试。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};

use crate::error::TripError;

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// 熔断参数
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// 进入 Open 所需的最小失败次数
    pub failure_threshold: u32,
    /// 吞吐量门槛：请求数达到该值前不熔断
    pub min_throughput: u32,
    /// Open 状态的冷却时长
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            min_throughput: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    requests: u32,
    opened_at: Option<Instant>,
    /// HalfOpen 下在途试探的开始时间；None 表示槽位空闲
    trial_started_at: Option<Instant>,
}

impl CircuitInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            requests: 0,
            opened_at: None,
            trial_started_at: None,
        }
    }
}

/// 单个操作 ID 的熔断器；状态更新在内部 Mutex 下串行化
pub struct CircuitBreaker {
    op_id: String,
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    pub fn new(op_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            op_id: op_id.into(),
            config,
            inner: Mutex::new(CircuitInner::new()),
        }
    }

    pub fn op_id(&self) -> &str {
        &self.op_id
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    #[cfg(test)]
    async fn counters(&self) -> (u32, u32, u32) {
        let inner = self.inner.lock().await;
        (inner.failures, inner.successes, inner.requests)
    }

    /// 执行一次调用：先做准入判定（不跨 await 持锁），再记录结果
    pub async fn execute<T, F>(&self, fut: F) -> Result<T, TripError>
    where
        F: std::future::Future<Output = Result<T, TripError>>,
    {
        self.admit().await?;

        let result = fut.await;
        match &result {
            Ok(_) => self.on_success().await,
            Err(_) => self.on_failure().await,
        }
        result
    }

    /// 准入判定：Open 未冷却直接拒绝；冷却期满转 HalfOpen 并只放一个试探
    async fn admit(&self) -> Result<(), TripError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => {
                inner.requests += 1;
                Ok(())
            }
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed <= self.config.recovery_timeout {
                    let remaining = self.config.recovery_timeout.saturating_sub(elapsed);
                    return Err(TripError::CircuitOpen {
                        operation: self.op_id.clone(),
                        retry_in_ms: remaining.as_millis().max(1) as u64,
                    });
                }
                self.transition(&mut inner, CircuitState::HalfOpen);
                inner.trial_started_at = Some(Instant::now());
                Ok(())
            }
            CircuitState::HalfOpen => {
                if let Some(started) = inner.trial_started_at {
                    // 试探在途，其余调用一律拒绝；调用方弃单（deadline 到期
                    // 丢弃 future）不会走到结果回调，槽位按时效过期释放
                    if started.elapsed() <= self.config.recovery_timeout {
                        return Err(TripError::CircuitOpen {
                            operation: self.op_id.clone(),
                            retry_in_ms: 1,
                        });
                    }
                }
                inner.trial_started_at = Some(Instant::now());
                Ok(())
            }
        }
    }

    async fn on_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.successes += 1;
        if inner.state == CircuitState::HalfOpen {
            self.transition(&mut inner, CircuitState::Closed);
            inner.failures = 0;
            inner.successes = 0;
            inner.requests = 0;
            inner.trial_started_at = None;
        }
    }

    async fn on_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.failures += 1;
        match inner.state {
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Open);
                inner.opened_at = Some(Instant::now());
                inner.trial_started_at = None;
            }
            CircuitState::Closed => {
                if inner.requests >= self.config.min_throughput
                    && inner.failures >= self.config.failure_threshold
                {
                    self.transition(&mut inner, CircuitState::Open);
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Open => {}
        }
    }

    fn transition(&self, inner: &mut CircuitInner, to: CircuitState) {
        tracing::info!(
            op_id = %self.op_id,
            from = inner.state.as_str(),
            to = to.as_str(),
            failures = inner.failures,
            requests = inner.requests,
            "circuit state transition"
        );
        inner.state = to;
    }
}

/// 熔断器注册表：op_id -> CircuitBreaker；不同 ID 之间互不阻塞
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// 取指定 op_id 的熔断器，不存在则创建
    pub async fn breaker(&self, op_id: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().await;
            if let Some(b) = breakers.get(op_id) {
                return b.clone();
            }
        }
        let mut breakers = self.breakers.write().await;
        breakers
            .entry(op_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(op_id, self.config.clone())))
            .clone()
    }

    /// 当前处于 Open 的操作 ID（健康端点用）
    pub async fn open_circuits(&self) -> Vec<String> {
        let breakers = self.breakers.read().await;
        let mut open = Vec::new();
        for (id, b) in breakers.iter() {
            if b.state().await == CircuitState::Open {
                open.push(id.clone());
            }
        }
        open.sort();
        open
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config(recovery_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            min_throughput: 3,
            recovery_timeout: Duration::from_millis(recovery_ms),
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), TripError> {
        breaker
            .execute(async { Err::<(), _>(TripError::Network("down".into())) })
            .await
    }

    #[tokio::test]
    async fn test_opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new("x", test_config(1000));
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state().await, CircuitState::Open);

        // Open 期间直接拒绝，底层操作不被调用
        let calls = AtomicUsize::new(0);
        let result = breaker
            .execute(async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TripError>(())
            })
            .await;
        assert!(matches!(result, Err(TripError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_open_below_min_throughput() {
        let mut cfg = test_config(1000);
        cfg.min_throughput = 10;
        let breaker = CircuitBreaker::new("low", cfg);
        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_trial_success_closes() {
        let breaker = CircuitBreaker::new("y", test_config(30));
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let result = breaker.execute(async { Ok::<_, TripError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_trial_failure_reopens() {
        let breaker = CircuitBreaker::new("z", test_config(30));
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_half_open_admits_single_trial() {
        let breaker = Arc::new(CircuitBreaker::new("trial", test_config(200)));
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(220)).await;

        // 第一个调用占住试探位并挂起，第二个并发调用必须被拒绝
        let b1 = breaker.clone();
        let slow = tokio::spawn(async move {
            b1.execute(async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, TripError>(())
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = breaker.execute(async { Ok::<_, TripError>(()) }).await;
        assert!(matches!(result, Err(TripError::CircuitOpen { .. })));
        assert!(slow.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_abandoned_trial_frees_half_open_slot() {
        let breaker = CircuitBreaker::new("w", test_config(30));
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        // 调用方 deadline 到期丢弃在途试探，结果回调不会执行
        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            breaker.execute(async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok::<_, TripError>(())
            }),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        // 槽位按时效过期，之后的试探照常放行
        tokio::time::sleep(Duration::from_millis(60)).await;
        let result = breaker.execute(async { Ok::<_, TripError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_counters_reset_on_close() {
        let breaker = CircuitBreaker::new("c", test_config(30));
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = breaker.execute(async { Ok::<_, TripError>(()) }).await;

        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert_eq!(breaker.counters().await, (0, 0, 0));
    }

    #[tokio::test]
    async fn test_registry_isolates_op_ids() {
        let registry = CircuitBreakerRegistry::new(test_config(1000));
        let bx = registry.breaker("x").await;
        for _ in 0..3 {
            let _ = fail(&bx).await;
        }
        assert_eq!(bx.state().await, CircuitState::Open);
        assert_eq!(registry.breaker("y").await.state().await, CircuitState::Closed);
        assert_eq!(registry.open_circuits().await, vec!["x".to_string()]);
    }
}
