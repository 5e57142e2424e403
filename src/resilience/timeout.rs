//! 超时守卫
//!
//! 用 tokio::time::timeout 给任意外部调用加截止时间；到期即丢弃在途 future，
//! 迟到的结果不再被消费，调用方绝不阻塞超过配置的 deadline。

use std::future::Future;
use std::time::Duration;

use crate::error::TripError;

/// 在 deadline 内执行 fut；到期返回可区分的 Timeout 错误
pub async fn with_deadline<T, F>(operation: &str, deadline: Duration, fut: F) -> Result<T, TripError>
where
    F: Future<Output = Result<T, TripError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(TripError::Timeout {
            operation: operation.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deadline_passes_fast_operation() {
        let result = with_deadline("fast", Duration::from_millis(100), async {
            Ok::<_, TripError>(42)
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_deadline_expires_slow_operation() {
        let result = with_deadline("slow", Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, TripError>(42)
        })
        .await;
        assert!(matches!(result, Err(TripError::Timeout { operation }) if operation == "slow"));
    }

    #[tokio::test]
    async fn test_deadline_preserves_inner_error() {
        let result = with_deadline("err", Duration::from_millis(100), async {
            Err::<i32, _>(TripError::Network("refused".into()))
        })
        .await;
        assert!(matches!(result, Err(TripError::Network(_))));
    }
}
