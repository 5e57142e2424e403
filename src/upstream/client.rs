//! 上游旅行数据 API 客户端
//!
//! 带参数的只读请求，返回 JSON 集合；offset/limit 分页直到短页收尾；
//! Bearer token 带过期时间缓存，收到 401 时透明刷新并重放一次。
//! 每个请求都有独立截止时间，错误映射到统一的 TripError 类别。

use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::RwLock;

use crate::error::TripError;

/// 上游客户端参数
#[derive(Debug, Clone)]
pub struct TravelApiConfig {
    pub base_url: String,
    pub email: String,
    pub password: String,
    /// 每页条数
    pub page_size: usize,
    pub request_timeout: Duration,
    /// 上游未给出过期时间时的 token 兜底 TTL
    pub fallback_token_ttl: Duration,
}

impl Default for TravelApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.example-travel.com/v1".to_string(),
            email: String::new(),
            password: String::new(),
            page_size: 20,
            request_timeout: Duration::from_secs(15),
            fallback_token_ttl: Duration::from_secs(3600),
        }
    }
}

/// 套餐搜索条件
#[derive(Debug, Clone, Default)]
pub struct PackageQuery {
    pub destination: Option<String>,
    pub duration_days: Option<u32>,
    pub budget: Option<f64>,
}

/// 旅行套餐（上游字段的宽松映射）
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct TravelPackage {
    #[serde(alias = "_id", alias = "packageId")]
    pub id: String,
    #[serde(alias = "packageName")]
    pub name: String,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default, alias = "noOfDays")]
    pub duration_days: Option<u32>,
    #[serde(default, alias = "startFrom")]
    pub price_from: Option<f64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_valid(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(alias = "accessToken", alias = "access_token", alias = "token")]
    access_token: String,
    #[serde(default, alias = "expiresIn", alias = "expires_in")]
    expires_in: Option<u64>,
}

/// 上游客户端
pub struct TravelApiClient {
    http: reqwest::Client,
    config: TravelApiConfig,
    token: RwLock<Option<CachedToken>>,
}

impl TravelApiClient {
    pub fn new(config: TravelApiConfig) -> Result<Self, TripError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| TripError::System(format!("http client init failed: {e}")))?;
        Ok(Self {
            http,
            config,
            token: RwLock::new(None),
        })
    }

    /// 取有效 token；过期或缺失则重新认证
    async fn token(&self) -> Result<String, TripError> {
        {
            let token = self.token.read().await;
            if let Some(t) = token.as_ref() {
                if t.is_valid() {
                    return Ok(t.token.clone());
                }
            }
        }
        self.authenticate().await
    }

    async fn authenticate(&self) -> Result<String, TripError> {
        let url = format!("{}/auth/login", self.config.base_url);
        let body = serde_json::json!({
            "email": self.config.email,
            "password": self.config.password,
        });

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status().as_u16();
        if status == 401 || status == 403 {
            return Err(TripError::Authentication(
                "upstream credentials rejected".to_string(),
            ));
        }
        if !(200..300).contains(&status) {
            return Err(TripError::Api {
                status,
                message: "login failed".to_string(),
            });
        }

        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| TripError::Api {
                status,
                message: format!("malformed login response: {e}"),
            })?;

        let ttl = login
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(self.config.fallback_token_ttl);
        let token = login.access_token;
        *self.token.write().await = Some(CachedToken {
            token: token.clone(),
            // 留 30 秒余量，避免压线过期
            expires_at: Instant::now() + ttl.saturating_sub(Duration::from_secs(30)),
        });
        tracing::debug!("upstream token refreshed");
        Ok(token)
    }

    /// 认证 GET；401 时作废缓存 token、刷新并重放一次
    async fn get_json(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<serde_json::Value, TripError> {
        let mut refreshed = false;
        loop {
            let token = self.token().await?;
            let url = format!("{}{}", self.config.base_url, path);
            let response = self
                .http
                .get(&url)
                .bearer_auth(&token)
                .query(query)
                .send()
                .await
                .map_err(map_transport_error)?;

            let status = response.status().as_u16();
            match status {
                200..=299 => {
                    return response.json().await.map_err(|e| TripError::Api {
                        status,
                        message: format!("malformed response body: {e}"),
                    });
                }
                401 if !refreshed => {
                    *self.token.write().await = None;
                    refreshed = true;
                    continue;
                }
                401 => {
                    return Err(TripError::Authentication(
                        "token rejected after refresh".to_string(),
                    ));
                }
                429 => {
                    let retry_after_ms = response
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok())
                        .map(|secs| secs * 1000)
                        .unwrap_or(2000);
                    return Err(TripError::RateLimited { retry_after_ms });
                }
                408 => {
                    return Err(TripError::Timeout {
                        operation: path.to_string(),
                    });
                }
                _ => {
                    return Err(TripError::Api {
                        status,
                        message: format!("GET {path} failed"),
                    });
                }
            }
        }
    }

    /// 搜索套餐：翻页直到短页
    pub async fn search_packages(
        &self,
        query: &PackageQuery,
    ) -> Result<Vec<TravelPackage>, TripError> {
        let limit = self.config.page_size;
        let mut offset = 0usize;
        let mut all = Vec::new();

        loop {
            let mut params = vec![
                ("limit".to_string(), limit.to_string()),
                ("offset".to_string(), offset.to_string()),
            ];
            if let Some(dest) = &query.destination {
                params.push(("search".to_string(), dest.clone()));
            }
            if let Some(days) = query.duration_days {
                params.push(("noOfDays".to_string(), days.to_string()));
            }
            if let Some(budget) = query.budget {
                params.push(("maxBudget".to_string(), budget.to_string()));
            }

            let body = self.get_json("/package", &params).await?;
            let page = extract_collection(&body)?;
            let page_len = page.len();
            for item in page {
                match serde_json::from_value::<TravelPackage>(item.clone()) {
                    Ok(p) => all.push(p),
                    Err(e) => tracing::debug!("skipping malformed package: {e}"),
                }
            }

            // 短页即末页
            if page_len < limit {
                break;
            }
            offset += limit;
        }
        Ok(all)
    }

    /// 按 id 取单个套餐
    pub async fn get_package(&self, id: &str) -> Result<TravelPackage, TripError> {
        let body = self.get_json(&format!("/package/{id}"), &[]).await?;
        let item = body.get("result").unwrap_or(&body);
        serde_json::from_value(item.clone()).map_err(|e| TripError::Api {
            status: 200,
            message: format!("malformed package payload: {e}"),
        })
    }

    /// 套餐报价（人数等参数直接透传）
    pub async fn get_pricing(
        &self,
        package_id: &str,
        params: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<serde_json::Value, TripError> {
        let query: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect();
        self.get_json(&format!("/package/{package_id}/pricing"), &query)
            .await
    }
}

/// 上游集合响应的外层可能是数组或 {result: {docs: [...]}} 包装
fn extract_collection(body: &serde_json::Value) -> Result<Vec<serde_json::Value>, TripError> {
    if let Some(arr) = body.as_array() {
        return Ok(arr.clone());
    }
    for path in [&["docs"][..], &["result", "docs"][..], &["result"][..], &["data"][..]] {
        let mut node = body;
        for key in path {
            match node.get(key) {
                Some(next) => node = next,
                None => break,
            }
        }
        if let Some(arr) = node.as_array() {
            return Ok(arr.clone());
        }
    }
    Err(TripError::Api {
        status: 200,
        message: "expected a JSON collection".to_string(),
    })
}

fn map_transport_error(e: reqwest::Error) -> TripError {
    if e.is_timeout() {
        TripError::Timeout {
            operation: "upstream.request".to_string(),
        }
    } else {
        TripError::Network(e.to_string())
    }
}
