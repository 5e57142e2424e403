//! 套餐处理器：搜索与详情
//!
//! 上游调用走 重试引擎 + 熔断 + 结果缓存；LLM 只负责把数据润色成回复，
//! 润色失败时降级为纯文本格式化，不把数据路径的成功变成整体失败。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TripError;
use crate::handlers::{Handler, HandlerRequest, HandlerResponse};
use crate::llm::{CompletionClient, CompletionRequest};
use crate::resilience::{ResultCache, RetryEngine, RetryPolicy};
use crate::routing::HandlerCategory;
use crate::task::{ParamKind, ParamSpec, TaskSpec};
use crate::upstream::{PackageQuery, TravelApiClient, TravelPackage};

const PHRASING_PROMPT: &str = "You are a travel assistant. Rewrite the JSON package \
data below into a short, friendly reply for the traveller. Keep concrete numbers \
(days, prices) exactly as given. Do not invent packages that are not in the data.";

/// 共享的套餐数据通道：缓存 + 重试后的上游调用
struct PackageBackend {
    upstream: Arc<TravelApiClient>,
    cache: Arc<ResultCache>,
    retry: Arc<RetryEngine>,
    policy: RetryPolicy,
}

impl PackageBackend {
    async fn search(&self, query: &PackageQuery) -> Result<Vec<TravelPackage>, TripError> {
        let key = format!(
            "packages.search:{}:{}:{}",
            query.destination.as_deref().unwrap_or("*"),
            query.duration_days.map(|d| d.to_string()).unwrap_or_else(|| "*".into()),
            query.budget.map(|b| b.to_string()).unwrap_or_else(|| "*".into()),
        );
        if let Some(hit) = self.cache.get(&key).await {
            if let Ok(packages) = serde_json::from_value(hit) {
                return Ok(packages);
            }
        }

        let upstream = self.upstream.clone();
        let packages = self
            .retry
            .execute_with_retry("upstream.search_packages", &self.policy, || {
                let upstream = upstream.clone();
                let query = query.clone();
                async move { upstream.search_packages(&query).await }
            })
            .await
            .map_err(|e| e.into_inner())?;

        if let Ok(value) = serde_json::to_value(&packages) {
            self.cache.put(&key, value, None).await;
        }
        Ok(packages)
    }

    async fn detail(
        &self,
        package_id: &str,
        pricing_params: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<serde_json::Value, TripError> {
        let key = format!("packages.detail:{package_id}");
        if let Some(hit) = self.cache.get(&key).await {
            return Ok(hit);
        }

        let upstream = self.upstream.clone();
        let id = package_id.to_string();
        let package = self
            .retry
            .execute_with_retry("upstream.get_package", &self.policy, || {
                let upstream = upstream.clone();
                let id = id.clone();
                async move { upstream.get_package(&id).await }
            })
            .await
            .map_err(|e| e.into_inner())?;

        let pricing = if pricing_params.is_empty() {
            serde_json::Value::Null
        } else {
            let upstream = self.upstream.clone();
            let id = package_id.to_string();
            let params = pricing_params.clone();
            self.retry
                .execute_with_retry("upstream.get_pricing", &self.policy, || {
                    let upstream = upstream.clone();
                    let id = id.clone();
                    let params = params.clone();
                    async move { upstream.get_pricing(&id, &params).await }
                })
                .await
                .map_err(|e| e.into_inner())?
        };

        let detail = serde_json::json!({ "package": package, "pricing": pricing });
        self.cache.put(&key, detail.clone(), None).await;
        Ok(detail)
    }
}

/// 把数据交给 LLM 润色；失败则降级为给定的纯文本
async fn phrase_or_fallback(
    llm: &Arc<dyn CompletionClient>,
    deadline: Duration,
    user_text: &str,
    data: &serde_json::Value,
    plain: String,
) -> String {
    let messages = vec![crate::core::session::ChatMessage::user(format!(
        "Traveller asked: {user_text}\n\nPackage data:\n{data}"
    ))];
    let completion = CompletionRequest::new(PHRASING_PROMPT, messages)
        .with_temperature(0.5)
        .with_deadline(deadline);
    match llm.complete(&completion).await {
        Ok(text) => text,
        Err(e) => {
            tracing::debug!("phrasing degraded to plain formatting: {e}");
            plain
        }
    }
}

/// 套餐搜索处理器
pub struct PackageSearchHandler {
    backend: PackageBackend,
    llm: Arc<dyn CompletionClient>,
    llm_deadline: Duration,
}

impl PackageSearchHandler {
    pub fn new(
        upstream: Arc<TravelApiClient>,
        cache: Arc<ResultCache>,
        retry: Arc<RetryEngine>,
        policy: RetryPolicy,
        llm: Arc<dyn CompletionClient>,
        llm_deadline: Duration,
    ) -> Self {
        Self {
            backend: PackageBackend {
                upstream,
                cache,
                retry,
                policy,
            },
            llm,
            llm_deadline,
        }
    }
}

#[async_trait]
impl Handler for PackageSearchHandler {
    fn category(&self) -> HandlerCategory {
        HandlerCategory::PackageSearch
    }

    fn task_spec(&self) -> TaskSpec {
        TaskSpec::new("handler.package_search")
            .with_param(ParamSpec::optional("destination", ParamKind::String))
            .with_param(ParamSpec::optional("duration_days", ParamKind::Number))
            .with_param(ParamSpec::optional("budget", ParamKind::Number))
            .with_max_attempts(2)
            .with_timeout(Duration::from_secs(45))
    }

    async fn handle(&self, request: &HandlerRequest) -> Result<HandlerResponse, TripError> {
        let query = PackageQuery {
            destination: request
                .params
                .get("destination")
                .and_then(|v| v.as_str())
                .map(String::from),
            duration_days: request
                .params
                .get("duration_days")
                .and_then(|v| v.as_u64())
                .map(|d| d as u32),
            budget: request.params.get("budget").and_then(|v| v.as_f64()),
        };

        let packages = self.backend.search(&query).await?;
        if packages.is_empty() {
            return Ok(HandlerResponse::text(
                "I couldn't find packages matching that. Try a different destination \
or a wider budget?",
            )
            .with_meta("result_count", 0.into()));
        }

        let data = serde_json::to_value(&packages)
            .map_err(|e| TripError::System(format!("package serialization failed: {e}")))?;
        let plain = packages
            .iter()
            .take(5)
            .map(|p| {
                format!(
                    "- {} ({} days, from {})",
                    p.name,
                    p.duration_days.map(|d| d.to_string()).unwrap_or_else(|| "?".into()),
                    p.price_from.map(|v| v.to_string()).unwrap_or_else(|| "N/A".into()),
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let text = phrase_or_fallback(
            &self.llm,
            self.llm_deadline,
            &request.text,
            &data,
            format!("Here are some packages I found:\n{plain}"),
        )
        .await;

        Ok(HandlerResponse::text(text).with_meta("result_count", packages.len().into()))
    }

    async fn health_check(&self) -> bool {
        // 数据通道依赖上游，自检只确认组件在位，不打真实请求
        true
    }
}

/// 套餐详情处理器
pub struct PackageDetailHandler {
    backend: PackageBackend,
    llm: Arc<dyn CompletionClient>,
    llm_deadline: Duration,
}

impl PackageDetailHandler {
    pub fn new(
        upstream: Arc<TravelApiClient>,
        cache: Arc<ResultCache>,
        retry: Arc<RetryEngine>,
        policy: RetryPolicy,
        llm: Arc<dyn CompletionClient>,
        llm_deadline: Duration,
    ) -> Self {
        Self {
            backend: PackageBackend {
                upstream,
                cache,
                retry,
                policy,
            },
            llm,
            llm_deadline,
        }
    }
}

#[async_trait]
impl Handler for PackageDetailHandler {
    fn category(&self) -> HandlerCategory {
        HandlerCategory::PackageDetail
    }

    fn task_spec(&self) -> TaskSpec {
        TaskSpec::new("handler.package_detail")
            .with_param(ParamSpec::required("package_id", ParamKind::String))
            .with_max_attempts(2)
            .with_timeout(Duration::from_secs(45))
    }

    async fn handle(&self, request: &HandlerRequest) -> Result<HandlerResponse, TripError> {
        let package_id = request
            .params
            .get("package_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TripError::Validation("missing package_id".to_string()))?;

        let mut pricing_params = serde_json::Map::new();
        for key in ["adults", "children", "travel_date"] {
            if let Some(v) = request.params.get(key) {
                pricing_params.insert(key.to_string(), v.clone());
            }
        }

        let detail = self.backend.detail(package_id, &pricing_params).await?;
        let text = phrase_or_fallback(
            &self.llm,
            self.llm_deadline,
            &request.text,
            &detail,
            format!("Package details:\n{detail}"),
        )
        .await;

        Ok(HandlerResponse::text(text).with_meta("package_id", package_id.into()))
    }
}
