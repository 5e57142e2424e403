//! 会话层：消息、会话上下文与按不活跃时间回收的会话管理器
//!
//! 会话按 session_id 独立加锁互不竞争；对话是回合制的，但仍做防御性并发保护。

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 会话级对话状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Idle,
    Routing,
    Executing,
    Responding,
}

/// 单个会话上下文
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub id: String,
    pub user_id: Option<String>,
    /// 会话内只追加
    pub messages: Vec<ChatMessage>,
    pub state: ConversationState,
    pub task_queue: VecDeque<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub turn_count: u64,
    pub created_at: Instant,
    pub last_active: Instant,
}

impl SessionContext {
    pub fn new(id: String, user_id: Option<String>) -> Self {
        let now = Instant::now();
        Self {
            id,
            user_id,
            messages: Vec::new(),
            state: ConversationState::Idle,
            task_queue: VecDeque::new(),
            metadata: serde_json::Map::new(),
            turn_count: 0,
            created_at: now,
            last_active: now,
        }
    }

    pub fn push_message(&mut self, msg: ChatMessage) {
        self.messages.push(msg);
        self.last_active = Instant::now();
    }

    /// 最近 n 条消息
    pub fn recent(&self, n: usize) -> &[ChatMessage] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    pub fn set_state(&mut self, state: ConversationState) {
        self.state = state;
        self.last_active = Instant::now();
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.last_active.elapsed() > timeout
    }
}

/// 会话管理器：session_id -> SessionContext，定期回收不活跃会话
pub struct SessionManager {
    sessions: RwLock<HashMap<String, SessionContext>>,
    inactivity_timeout: Duration,
}

impl SessionManager {
    pub fn new(inactivity_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            inactivity_timeout,
        }
    }

    /// 取或建会话；未提供 id 时生成一个
    pub async fn get_or_create(&self, session_id: Option<&str>, user_id: Option<&str>) -> String {
        let id = session_id
            .map(String::from)
            .unwrap_or_else(|| format!("session_{}", uuid::Uuid::new_v4()));

        let mut sessions = self.sessions.write().await;
        sessions
            .entry(id.clone())
            .or_insert_with(|| SessionContext::new(id.clone(), user_id.map(String::from)));
        id
    }

    /// 在会话上执行闭包（持写锁，调用方保持闭包轻量）
    pub async fn with_session<F, R>(&self, session_id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut SessionContext) -> R,
    {
        let mut sessions = self.sessions.write().await;
        sessions.get_mut(session_id).map(f)
    }

    pub async fn snapshot(&self, session_id: &str) -> Option<SessionContext> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// 定期清扫：回收不活跃会话，返回被回收的 id（供任务状态联动清理）
    pub async fn cleanup_expired(&self) -> Vec<String> {
        let mut sessions = self.sessions.write().await;
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.is_expired(self.inactivity_timeout))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "evicted inactive sessions");
        }
        expired
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(1800))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_or_create_generates_id() {
        let manager = SessionManager::default();
        let id = manager.get_or_create(None, Some("u1")).await;
        assert!(id.starts_with("session_"));
        assert_eq!(manager.active_count().await, 1);

        // 相同 id 不重复创建
        let same = manager.get_or_create(Some(&id), None).await;
        assert_eq!(same, id);
        assert_eq!(manager.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_messages_append_only() {
        let manager = SessionManager::default();
        let id = manager.get_or_create(Some("s1"), None).await;
        manager
            .with_session(&id, |s| {
                s.push_message(ChatMessage::user("hi"));
                s.push_message(ChatMessage::assistant("hello"));
            })
            .await;

        let snap = manager.snapshot(&id).await.unwrap();
        assert_eq!(snap.messages.len(), 2);
        assert_eq!(snap.recent(1)[0].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let manager = SessionManager::new(Duration::from_millis(20));
        manager.get_or_create(Some("old"), None).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.get_or_create(Some("fresh"), None).await;

        let evicted = manager.cleanup_expired().await;
        assert_eq!(evicted, vec!["old".to_string()]);
        assert_eq!(manager.active_count().await, 1);
    }
}
