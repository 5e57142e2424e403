//! 处理器注册表
//!
//! 封闭类别到处理器实现的映射；分发时缺失/停用/不健康的类别落到默认处理器，
//! 处理器出错只做一次兜底（不级联），响应元数据标记 fallback。每次分发后
//! 更新计数加权的成功率与平均时延；健康清扫定期刷新各处理器状态。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::TripError;
use crate::handlers::{Handler, HandlerRequest, HandlerResponse};
use crate::routing::HandlerCategory;
use crate::task::TaskRunner;

/// 每处理器滚动指标（计数加权）
#[derive(Debug, Clone, Default, Serialize)]
pub struct HandlerMetrics {
    pub total_tasks: u64,
    pub successes: u64,
    pub avg_response_time_ms: f64,
}

impl HandlerMetrics {
    fn record(&mut self, success: bool, elapsed_ms: f64) {
        self.total_tasks += 1;
        if success {
            self.successes += 1;
        }
        self.avg_response_time_ms += (elapsed_ms - self.avg_response_time_ms) / self.total_tasks as f64;
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_tasks == 0 {
            // 无数据时视为满分，避免新处理器一上来就被降权
            1.0
        } else {
            self.successes as f64 / self.total_tasks as f64
        }
    }
}

struct HandlerRegistration {
    handler: Arc<dyn Handler>,
    is_active: bool,
    healthy: bool,
    last_health_check: Option<Instant>,
    metrics: HandlerMetrics,
}

/// 健康端点用的处理器快照
#[derive(Debug, Clone, Serialize)]
pub struct HandlerHealth {
    pub category: HandlerCategory,
    pub healthy: bool,
    pub is_active: bool,
    pub success_rate: f64,
    pub avg_response_time_ms: f64,
    pub total_tasks: u64,
}

/// 处理器注册表
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<HandlerCategory, HandlerRegistration>>,
    tasks: Arc<TaskRunner>,
}

impl HandlerRegistry {
    pub fn new(tasks: Arc<TaskRunner>) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            tasks,
        }
    }

    pub async fn register(&self, handler: Arc<dyn Handler>) {
        let category = handler.category();
        self.handlers.write().await.insert(
            category,
            HandlerRegistration {
                handler,
                is_active: true,
                healthy: true,
                last_health_check: None,
                metrics: HandlerMetrics::default(),
            },
        );
        tracing::info!(category = category.as_str(), "handler registered");
    }

    pub async fn set_active(&self, category: HandlerCategory, active: bool) {
        if let Some(reg) = self.handlers.write().await.get_mut(&category) {
            reg.is_active = active;
        }
    }

    /// 分发：解析可用处理器 → 任务中间件执行 → 指标记账 → 一次性兜底
    pub async fn dispatch(
        &self,
        category: HandlerCategory,
        request: &HandlerRequest,
    ) -> Result<HandlerResponse, TripError> {
        let resolved = self.resolve(category).await;
        let routed_away = resolved != category;
        if routed_away {
            tracing::debug!(
                requested = category.as_str(),
                resolved = resolved.as_str(),
                "handler unavailable, using default"
            );
        }

        match self.execute(resolved, request).await {
            Ok(mut response) => {
                response
                    .metadata
                    .insert("handler".into(), resolved.as_str().into());
                response.metadata.insert("fallback".into(), routed_away.into());
                Ok(response)
            }
            Err(err) if resolved != HandlerCategory::DEFAULT => {
                // 主处理器失败：恰好一次兜底，不再级联
                tracing::warn!(
                    category = resolved.as_str(),
                    "handler failed, falling back to default: {err}"
                );
                let mut response = self.execute(HandlerCategory::DEFAULT, request).await?;
                response
                    .metadata
                    .insert("handler".into(), HandlerCategory::DEFAULT.as_str().into());
                response.metadata.insert("fallback".into(), true.into());
                response
                    .metadata
                    .insert("primary_error".into(), err.to_string().into());
                Ok(response)
            }
            Err(err) => Err(err),
        }
    }

    /// 选择实际执行的类别：缺失/停用/不健康 → 默认
    async fn resolve(&self, category: HandlerCategory) -> HandlerCategory {
        let handlers = self.handlers.read().await;
        match handlers.get(&category) {
            Some(reg) if reg.is_active && reg.healthy => category,
            _ => HandlerCategory::DEFAULT,
        }
    }

    /// 在任务中间件内执行单个处理器并记账
    async fn execute(
        &self,
        category: HandlerCategory,
        request: &HandlerRequest,
    ) -> Result<HandlerResponse, TripError> {
        let (handler, spec) = {
            let handlers = self.handlers.read().await;
            let reg = handlers.get(&category).ok_or_else(|| {
                TripError::System(format!("no handler registered for {}", category.as_str()))
            })?;
            (reg.handler.clone(), reg.handler.task_spec())
        };

        let started = Instant::now();
        let params = serde_json::Value::Object(request.params.clone());
        let result = self
            .tasks
            .run(&request.session_id, &spec, params, |_| {
                let handler = handler.clone();
                let request = request.clone();
                async move {
                    let response = handler.handle(&request).await?;
                    serde_json::to_value(&response).map_err(|e| {
                        TripError::System(format!("response serialization failed: {e}"))
                    })
                }
            })
            .await;
        let elapsed_ms = started.elapsed().as_millis() as f64;

        let success = result.is_ok();
        {
            let mut handlers = self.handlers.write().await;
            if let Some(reg) = handlers.get_mut(&category) {
                reg.metrics.record(success, elapsed_ms);
            }
        }

        let value = result.map_err(TripError::from)?;
        serde_json::from_value(value)
            .map_err(|e| TripError::System(format!("response deserialization failed: {e}")))
    }

    /// 健康清扫：逐个调用处理器自检并记录
    pub async fn health_sweep(&self) {
        let snapshot: Vec<(HandlerCategory, Arc<dyn Handler>)> = {
            let handlers = self.handlers.read().await;
            handlers
                .iter()
                .map(|(c, r)| (*c, r.handler.clone()))
                .collect()
        };

        for (category, handler) in snapshot {
            let healthy = handler.health_check().await;
            let mut handlers = self.handlers.write().await;
            if let Some(reg) = handlers.get_mut(&category) {
                if reg.healthy != healthy {
                    tracing::info!(
                        category = category.as_str(),
                        healthy,
                        "handler health changed"
                    );
                }
                reg.healthy = healthy;
                reg.last_health_check = Some(Instant::now());
            }
        }
    }

    /// 健康端点快照
    pub async fn health_snapshot(&self) -> Vec<HandlerHealth> {
        let handlers = self.handlers.read().await;
        let mut out: Vec<HandlerHealth> = handlers
            .iter()
            .map(|(category, reg)| HandlerHealth {
                category: *category,
                healthy: reg.healthy,
                is_active: reg.is_active,
                success_rate: reg.metrics.success_rate(),
                avg_response_time_ms: reg.metrics.avg_response_time_ms,
                total_tasks: reg.metrics.total_tasks,
            })
            .collect();
        out.sort_by_key(|h| h.category.as_str());
        out
    }

    pub async fn metrics(&self, category: HandlerCategory) -> Option<HandlerMetrics> {
        self.handlers
            .read()
            .await
            .get(&category)
            .map(|r| r.metrics.clone())
    }
}
