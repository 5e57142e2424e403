//! 弹性层：熔断、重试、超时、结果缓存

pub mod cache;
pub mod circuit;
pub mod retry;
pub mod timeout;

pub use cache::{CacheConfig, ResultCache};
pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
pub use retry::{OperationAttempt, RetryEngine, RetryPolicy, RETRYABLE_STATUSES};
pub use timeout::with_deadline;
