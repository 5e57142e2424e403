//! 错误分类器：归档、计数、通知与定期清理
//!
//! 每个捕获的失败生成唯一 id 的 ClassifiedError；retryable 由类别成员资格
//! 或消息模式推导，max_retries 按类别查表。同一原始错误分类两次会得到
//! 两个不同 id（不去重），但推导结果一致。

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use regex::RegexSet;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::{ErrorCategory, Severity, TripError};

/// 分类时附带的上下文（会话/任务标识与自由元数据）
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorContext {
    pub session_id: Option<String>,
    pub task_name: Option<String>,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ErrorContext {
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    pub fn with_task(mut self, task_name: impl Into<String>) -> Self {
        self.task_name = Some(task_name.into());
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// 已分类的错误记录
#[derive(Debug, Clone, Serialize)]
pub struct ClassifiedError {
    pub id: String,
    pub message: String,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub context: ErrorContext,
    pub retryable: bool,
    pub retry_count: u32,
    pub max_retries: u32,
    pub handled: bool,
    #[serde(skip)]
    pub created_at: Instant,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// 分类器内部存储
#[derive(Default)]
struct ClassifierStore {
    errors: HashMap<String, ClassifiedError>,
    /// 插入顺序，用于超量时最旧优先清除
    order: VecDeque<String>,
    counters: HashMap<ErrorCategory, u64>,
}

/// 错误观察者回调
pub type ErrorObserver = Box<dyn Fn(&ClassifiedError) + Send + Sync>;

/// 保留策略
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub max_age: std::time::Duration,
    pub max_count: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age: std::time::Duration::from_secs(3600),
            max_count: 1000,
        }
    }
}

/// 错误分类器
pub struct ErrorClassifier {
    store: RwLock<ClassifierStore>,
    observers: RwLock<Vec<ErrorObserver>>,
    retention: RetentionConfig,
    retryable_patterns: RegexSet,
}

impl ErrorClassifier {
    pub fn new(retention: RetentionConfig) -> Self {
        Self {
            store: RwLock::new(ClassifierStore::default()),
            observers: RwLock::new(Vec::new()),
            retention,
            retryable_patterns: RegexSet::new([
                r"(?i)timeout",
                r"(?i)network",
                r"(?i)connection",
                r"(?i)rate limit",
                r"(?i)temporarily",
            ])
            .unwrap_or_else(|_| RegexSet::empty()),
        }
    }

    /// 注册观察者；每次分类后同步通知
    pub async fn subscribe(&self, observer: ErrorObserver) {
        self.observers.write().await.push(observer);
    }

    /// 分类并归档一个原始错误
    pub async fn classify_and_store(
        &self,
        raw: &TripError,
        severity: Option<Severity>,
        context: ErrorContext,
    ) -> ClassifiedError {
        let category = raw.category();
        let message = raw.to_string();
        let retryable = category.is_retryable() || self.retryable_patterns.is_match(&message);

        let record = ClassifiedError {
            id: uuid::Uuid::new_v4().to_string(),
            message,
            category,
            severity: severity.unwrap_or_else(|| raw.default_severity()),
            context,
            retryable,
            retry_count: 0,
            max_retries: category.default_max_retries(),
            handled: false,
            created_at: Instant::now(),
            timestamp: chrono::Utc::now(),
        };

        {
            let mut store = self.store.write().await;
            *store.counters.entry(category).or_insert(0) += 1;
            store.order.push_back(record.id.clone());
            store.errors.insert(record.id.clone(), record.clone());
            // 超量即时裁剪，定期清扫之外的兜底
            while store.errors.len() > self.retention.max_count {
                if let Some(oldest) = store.order.pop_front() {
                    store.errors.remove(&oldest);
                } else {
                    break;
                }
            }
        }

        tracing::warn!(
            error_id = %record.id,
            category = category.as_str(),
            severity = ?record.severity,
            retryable,
            session_id = record.context.session_id.as_deref().unwrap_or("-"),
            "classified error: {}",
            record.message
        );

        for observer in self.observers.read().await.iter() {
            observer(&record);
        }

        record
    }

    pub async fn get(&self, id: &str) -> Option<ClassifiedError> {
        self.store.read().await.errors.get(id).cloned()
    }

    pub async fn mark_handled(&self, id: &str) {
        if let Some(e) = self.store.write().await.errors.get_mut(id) {
            e.handled = true;
        }
    }

    /// 各类别累计计数（健康端点用）
    pub async fn category_counts(&self) -> HashMap<ErrorCategory, u64> {
        self.store.read().await.counters.clone()
    }

    pub async fn stored_count(&self) -> usize {
        self.store.read().await.errors.len()
    }

    /// 定期清扫：按年龄与数量裁剪，返回移除条数
    pub async fn prune(&self) -> usize {
        let mut store = self.store.write().await;
        let before = store.errors.len();
        let max_age = self.retention.max_age;
        store.errors.retain(|_, e| e.created_at.elapsed() <= max_age);
        while store.errors.len() > self.retention.max_count {
            let Some(oldest) = store.order.pop_front() else {
                break;
            };
            store.errors.remove(&oldest);
        }
        let remaining: std::collections::HashSet<String> =
            store.errors.keys().cloned().collect();
        store.order.retain(|id| remaining.contains(id));
        before - store.errors.len()
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(RetentionConfig::default())
    }
}
