//! 错误层：分类（category × severity）、存储与恢复策略
//!
//! TripError 是贯穿重试/任务/处理器的统一原始错误；ErrorClassifier 负责
//! 归档与计数，RecoveryRegistry 按优先级尝试产出替代结果或重试信号。

pub mod classifier;
pub mod recovery;

pub use classifier::{ClassifiedError, ErrorClassifier, ErrorContext};
pub use recovery::{
    CriticalSafeStrategy, FallbackResponseStrategy, NetworkRetryStrategy, RateLimitStrategy,
    RecoveryOutcome, RecoveryRegistry, RecoveryStrategy, ValidationGuidanceStrategy,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 错误类别（与严重程度正交）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Network,
    Api,
    Authentication,
    RateLimit,
    Timeout,
    Task,
    System,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 8] = [
        ErrorCategory::Validation,
        ErrorCategory::Network,
        ErrorCategory::Api,
        ErrorCategory::Authentication,
        ErrorCategory::RateLimit,
        ErrorCategory::Timeout,
        ErrorCategory::Task,
        ErrorCategory::System,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Network => "network",
            ErrorCategory::Api => "api",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Task => "task",
            ErrorCategory::System => "system",
        }
    }

    /// 类别本身是否属于可重试集合
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Network
                | ErrorCategory::Api
                | ErrorCategory::Timeout
                | ErrorCategory::RateLimit
        )
    }

    /// 每类别默认的最大重试次数
    pub fn default_max_retries(&self) -> u32 {
        match self {
            ErrorCategory::Validation => 0,
            ErrorCategory::Network => 3,
            ErrorCategory::Api => 2,
            ErrorCategory::Authentication => 1,
            ErrorCategory::RateLimit => 3,
            ErrorCategory::Timeout => 2,
            ErrorCategory::Task => 1,
            ErrorCategory::System => 0,
        }
    }
}

/// 错误严重程度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// 统一原始错误：外部调用与任务执行产生的失败都先落到这里
#[derive(Error, Debug, Clone)]
pub enum TripError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("operation '{operation}' timed out")]
    Timeout { operation: String },

    /// 熔断器处于 Open，携带剩余冷却时间
    #[error("circuit open for '{operation}', retry in {retry_in_ms}ms")]
    CircuitOpen { operation: String, retry_in_ms: u64 },

    #[error("task '{task}' failed after {attempts} attempts: {message}")]
    Task {
        task: String,
        attempts: u32,
        message: String,
    },

    #[error("system error: {0}")]
    System(String),
}

impl TripError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            TripError::Validation(_) => ErrorCategory::Validation,
            TripError::Network(_) => ErrorCategory::Network,
            TripError::Api { .. } => ErrorCategory::Api,
            TripError::Authentication(_) => ErrorCategory::Authentication,
            TripError::RateLimited { .. } => ErrorCategory::RateLimit,
            TripError::Timeout { .. } => ErrorCategory::Timeout,
            // 熔断拒绝按网络故障归类，但单独标记为不可立即重试
            TripError::CircuitOpen { .. } => ErrorCategory::Network,
            TripError::Task { .. } => ErrorCategory::Task,
            TripError::System(_) => ErrorCategory::System,
        }
    }

    /// 附带的 HTTP 状态码（仅 Api 错误有）
    pub fn status(&self) -> Option<u16> {
        match self {
            TripError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn default_severity(&self) -> Severity {
        match self {
            TripError::Validation(_) => Severity::Low,
            TripError::Network(_) | TripError::Timeout { .. } => Severity::Medium,
            TripError::Api { status, .. } if *status >= 500 => Severity::High,
            TripError::Api { .. } => Severity::Medium,
            TripError::Authentication(_) => Severity::High,
            TripError::RateLimited { .. } => Severity::Medium,
            TripError::CircuitOpen { .. } => Severity::Medium,
            TripError::Task { .. } => Severity::High,
            TripError::System(_) => Severity::Critical,
        }
    }
}

/// 重试引擎耗尽后的聚合错误：记录尝试次数与最终原因
#[derive(Error, Debug)]
#[error("operation '{operation}' failed after {attempts} attempts: {source}")]
pub struct RetryError {
    pub operation: String,
    pub attempts: u32,
    #[source]
    pub source: TripError,
}

impl RetryError {
    pub fn into_inner(self) -> TripError {
        self.source
    }
}

/// 任务中间件的类型化错误
#[derive(Error, Debug)]
pub enum TaskError {
    /// 参数校验失败，不消耗尝试次数
    #[error("task '{task}' param validation failed: {message}")]
    Validation { task: String, message: String },

    #[error("task '{task}' exceeded max attempts ({max_attempts})")]
    MaxAttemptsExceeded { task: String, max_attempts: u32 },

    #[error("task '{task}' failed after {attempts} attempts: {source}")]
    ExecutionFailed {
        task: String,
        attempts: u32,
        #[source]
        source: TripError,
    },
}

impl From<TaskError> for TripError {
    fn from(e: TaskError) -> Self {
        match e {
            TaskError::Validation { message, .. } => TripError::Validation(message),
            TaskError::MaxAttemptsExceeded { task, max_attempts } => TripError::Task {
                task,
                attempts: max_attempts,
                message: "max attempts exceeded".to_string(),
            },
            TaskError::ExecutionFailed {
                task,
                attempts,
                source,
            } => TripError::Task {
                task,
                attempts,
                message: source.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_retryable_set() {
        assert!(ErrorCategory::Network.is_retryable());
        assert!(ErrorCategory::RateLimit.is_retryable());
        assert!(ErrorCategory::Timeout.is_retryable());
        assert!(ErrorCategory::Api.is_retryable());
        assert!(!ErrorCategory::Validation.is_retryable());
        assert!(!ErrorCategory::System.is_retryable());
    }

    #[test]
    fn test_trip_error_category_mapping() {
        let e = TripError::RateLimited { retry_after_ms: 500 };
        assert_eq!(e.category(), ErrorCategory::RateLimit);

        let e = TripError::Api {
            status: 503,
            message: "unavailable".into(),
        };
        assert_eq!(e.category(), ErrorCategory::Api);
        assert_eq!(e.status(), Some(503));
        assert_eq!(e.default_severity(), Severity::High);
    }

    #[test]
    fn test_task_error_into_trip() {
        let e = TaskError::ExecutionFailed {
            task: "search".into(),
            attempts: 3,
            source: TripError::Network("reset".into()),
        };
        let trip: TripError = e.into();
        assert_eq!(trip.category(), ErrorCategory::Task);
    }
}
