//! 处理器层：Handler trait、注册表与具体处理器
//!
//! 每个 HandlerCategory 对应一个注册的处理器实现；注册表负责健康检查、
//! 指标统计与带兜底的分发。处理器的外部调用一律通过任务执行中间件。

pub mod booking;
pub mod packages;
pub mod registry;
pub mod support;

pub use booking::BookingAssistHandler;
pub use packages::{PackageDetailHandler, PackageSearchHandler};
pub use registry::{HandlerHealth, HandlerMetrics, HandlerRegistry};
pub use support::GeneralSupportHandler;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::session::ChatMessage;
use crate::error::TripError;
use crate::routing::HandlerCategory;
use crate::task::TaskSpec;

/// 分发到处理器的请求
#[derive(Debug, Clone)]
pub struct HandlerRequest {
    pub session_id: String,
    /// 用户最新一条输入
    pub text: String,
    /// 路由器抽取的参数
    pub params: serde_json::Map<String, serde_json::Value>,
    /// 最近对话历史（只读快照）
    pub history: Vec<ChatMessage>,
}

/// 处理器产出
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerResponse {
    pub text: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl HandlerResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// 处理器接口
#[async_trait]
pub trait Handler: Send + Sync {
    fn category(&self) -> HandlerCategory;

    /// 处理器任务声明：参数 schema、尝试上限、超时（任务中间件用）
    fn task_spec(&self) -> TaskSpec;

    async fn handle(&self, request: &HandlerRequest) -> Result<HandlerResponse, TripError>;

    /// 轻量自检，健康清扫调用
    async fn health_check(&self) -> bool {
        true
    }
}
