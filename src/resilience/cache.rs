//! 结果缓存：按条目 TTL + 容量上界的 key-value 存储
//!
//! get 时惰性检查过期并移除陈旧条目；超过序列化大小上限的值不缓存；
//! 条目数到达上限时按插入顺序淘汰最旧的一条。并发下 last-write-wins，
//! 缓存的都是幂等重算结果，可以接受。

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

/// 缓存参数
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_entries: usize,
    /// 值的序列化字节数上限，超过则放弃缓存
    pub max_value_bytes: usize,
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 500,
            max_value_bytes: 64 * 1024,
            default_ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: serde_json::Value,
    created_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// 插入顺序，用于最旧优先淘汰；被覆盖/失效的 key 惰性跳过
    order: VecDeque<String>,
}

/// 结果缓存
pub struct ResultCache {
    inner: RwLock<CacheInner>,
    config: CacheConfig,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: RwLock::new(CacheInner::default()),
            config,
        }
    }

    /// 读取；过期视为 miss 并顺手移除陈旧条目
    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        {
            let inner = self.inner.read().await;
            match inner.entries.get(key) {
                Some(entry) if !entry.is_expired() => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        // 过期：升级为写锁移除
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.entries.get(key) {
            if entry.is_expired() {
                inner.entries.remove(key);
            }
        }
        None
    }

    /// 写入；返回是否真正缓存（超大值为 no-op）
    pub async fn put(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> bool {
        let size = serde_json::to_string(&value).map(|s| s.len()).unwrap_or(usize::MAX);
        if size > self.config.max_value_bytes {
            tracing::debug!(key, size, "value too large, not cached");
            return false;
        }

        let mut inner = self.inner.write().await;
        if inner.entries.contains_key(key) {
            inner.order.retain(|k| k != key);
        }
        // 到达容量：先淘汰最旧的一条，再插入
        while inner.entries.len() >= self.config.max_entries {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            if inner.entries.remove(&oldest).is_some() {
                tracing::debug!(key = %oldest, "evicted oldest cache entry");
            }
        }
        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                created_at: Instant::now(),
                ttl: ttl.unwrap_or(self.config.default_ttl),
            },
        );
        inner.order.push_back(key.to_string());
        true
    }

    pub async fn invalidate(&self, key: &str) {
        let mut inner = self.inner.write().await;
        inner.entries.remove(key);
        inner.order.retain(|k| k != key);
    }

    /// 按前缀批量失效，返回移除条数
    pub async fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut inner = self.inner.write().await;
        let before = inner.entries.len();
        inner.entries.retain(|k, _| !k.starts_with(prefix));
        let remaining: std::collections::HashSet<String> =
            inner.entries.keys().cloned().collect();
        inner.order.retain(|k| remaining.contains(k));
        before - inner.entries.len()
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.entries.clear();
        inner.order.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// 定期清扫：移除所有已过期条目，返回移除条数
    pub async fn evict_expired(&self) -> usize {
        let mut inner = self.inner.write().await;
        let before = inner.entries.len();
        inner.entries.retain(|_, e| !e.is_expired());
        let remaining: std::collections::HashSet<String> =
            inner.entries.keys().cloned().collect();
        inner.order.retain(|k| remaining.contains(k));
        before - inner.entries.len()
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn small_cache(max_entries: usize) -> ResultCache {
        ResultCache::new(CacheConfig {
            max_entries,
            max_value_bytes: 256,
            default_ttl: Duration::from_secs(60),
        })
    }

    #[tokio::test]
    async fn test_round_trip() {
        let cache = small_cache(10);
        assert!(cache.put("k", json!({"a": 1}), None).await);
        assert_eq!(cache.get("k").await, Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_ttl_expiry_behaves_as_miss() {
        let cache = small_cache(10);
        cache
            .put("k", json!("v"), Some(Duration::from_millis(20)))
            .await;
        assert_eq!(cache.get("k").await, Some(json!("v")));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.get("k").await, None);
        assert_eq!(cache.len().await, 0);

        // 新 key 的写入不会复活过期条目
        cache.put("fresh", json!("x"), None).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn test_oversized_value_is_noop() {
        let cache = small_cache(10);
        let big = json!("y".repeat(1000));
        assert!(!cache.put("big", big, None).await);
        assert_eq!(cache.get("big").await, None);
    }

    #[tokio::test]
    async fn test_oldest_first_eviction_at_capacity() {
        let cache = small_cache(2);
        cache.put("a", json!(1), None).await;
        cache.put("b", json!(2), None).await;
        cache.put("c", json!(3), None).await;

        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.get("a").await, None);
        assert_eq!(cache.get("b").await, Some(json!(2)));
        assert_eq!(cache.get("c").await, Some(json!(3)));
    }

    #[tokio::test]
    async fn test_overwrite_refreshes_insertion_order() {
        let cache = small_cache(2);
        cache.put("a", json!(1), None).await;
        cache.put("b", json!(2), None).await;
        // 覆盖 a 后最旧的是 b
        cache.put("a", json!(10), None).await;
        cache.put("c", json!(3), None).await;

        assert_eq!(cache.get("b").await, None);
        assert_eq!(cache.get("a").await, Some(json!(10)));
    }

    #[tokio::test]
    async fn test_invalidate_prefix() {
        let cache = small_cache(10);
        cache.put("packages.search:goa", json!(1), None).await;
        cache.put("packages.search:bali", json!(2), None).await;
        cache.put("pricing:42", json!(3), None).await;

        assert_eq!(cache.invalidate_prefix("packages.search:").await, 2);
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.get("pricing:42").await, Some(json!(3)));
    }

    #[tokio::test]
    async fn test_sweep_evicts_expired() {
        let cache = small_cache(10);
        cache
            .put("short", json!(1), Some(Duration::from_millis(10)))
            .await;
        cache.put("long", json!(2), None).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.evict_expired().await, 1);
        assert_eq!(cache.len().await, 1);
    }
}
