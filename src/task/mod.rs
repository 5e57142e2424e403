//! 任务执行中间件
//!
//! 每个 (session, task_name) 一台状态机：pending → running → success/failed/timed_out。
//! run 先做参数校验（不消耗尝试次数），再在超时守卫内调用执行器；可重试失败
//! 按固定退避表等待后循环，耗尽则抛类型化错误。每次结果输出 JSON 审计日志。

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::{TaskError, TripError};
use crate::resilience::retry::RetryPolicy;
use crate::resilience::timeout::with_deadline;

/// 任务状态机的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    TimedOut,
}

/// 参数类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Number,
    Bool,
    Object,
    Array,
}

impl ParamKind {
    fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            ParamKind::String => value.is_string(),
            ParamKind::Number => value.is_number(),
            ParamKind::Bool => value.is_boolean(),
            ParamKind::Object => value.is_object(),
            ParamKind::Array => value.is_array(),
        }
    }
}

/// 单个参数声明
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
        }
    }
}

/// 任务声明：名称、参数 schema、尝试上限与超时
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub name: String,
    pub params: Vec<ParamSpec>,
    pub max_attempts: u32,
    pub timeout: Duration,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            max_attempts: 3,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// 单个 (session, task) 的状态
#[derive(Debug, Clone)]
pub struct TaskState {
    pub task_name: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: TaskStatus,
    pub last_error: Option<String>,
    pub started_at: Option<Instant>,
    pub timeout: Duration,
    pub result: Option<serde_json::Value>,
    updated_at: Instant,
}

impl TaskState {
    fn new(spec: &TaskSpec) -> Self {
        Self {
            task_name: spec.name.clone(),
            attempts: 0,
            max_attempts: spec.max_attempts,
            status: TaskStatus::Pending,
            last_error: None,
            started_at: None,
            timeout: spec.timeout,
            result: None,
            updated_at: Instant::now(),
        }
    }
}

/// 任务级指标：调用数、失败数、平均时延（计数加权滑动）
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskMetrics {
    pub calls: u64,
    pub failures: u64,
    pub avg_latency_ms: f64,
}

impl TaskMetrics {
    fn record(&mut self, success: bool, latency_ms: f64) {
        self.calls += 1;
        if !success {
            self.failures += 1;
        }
        self.avg_latency_ms += (latency_ms - self.avg_latency_ms) / self.calls as f64;
    }
}

/// 固定退避表：按尝试序号索引，超出取末项
const BACKOFF_TABLE: [Duration; 4] = [
    Duration::from_millis(200),
    Duration::from_millis(500),
    Duration::from_millis(1000),
    Duration::from_millis(2000),
];

type StateKey = (String, String);

/// 任务执行中间件
pub struct TaskRunner {
    states: RwLock<HashMap<StateKey, TaskState>>,
    metrics: RwLock<HashMap<String, TaskMetrics>>,
    /// 可重试性判定复用重试引擎的分类
    retry_classifier: RetryPolicy,
    backoff_table: Vec<Duration>,
}

impl TaskRunner {
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            metrics: RwLock::new(HashMap::new()),
            retry_classifier: RetryPolicy::default(),
            backoff_table: BACKOFF_TABLE.to_vec(),
        }
    }

    #[cfg(test)]
    fn with_backoff_table(mut self, table: Vec<Duration>) -> Self {
        self.backoff_table = table;
        self
    }

    /// 执行任务：校验 → 状态机推进 → 超时守卫下调用执行器 → 记账
    pub async fn run<F, Fut>(
        &self,
        session_id: &str,
        spec: &TaskSpec,
        params: serde_json::Value,
        mut executor: F,
    ) -> Result<serde_json::Value, TaskError>
    where
        F: FnMut(serde_json::Value) -> Fut,
        Fut: Future<Output = Result<serde_json::Value, TripError>>,
    {
        // 参数校验失败快速返回，不消耗尝试次数
        Self::validate_params(spec, &params)?;

        let key = (session_id.to_string(), spec.name.clone());
        {
            let mut states = self.states.write().await;
            let state = states.entry(key.clone()).or_insert_with(|| TaskState::new(spec));
            // 尝试上限约束单次逻辑执行；上次成功后重新计数
            if state.status == TaskStatus::Success {
                *state = TaskState::new(spec);
            }
            if state.attempts >= state.max_attempts {
                return Err(TaskError::MaxAttemptsExceeded {
                    task: spec.name.clone(),
                    max_attempts: state.max_attempts,
                });
            }
        }

        // 显式循环而非递归
        loop {
            let attempt = {
                let mut states = self.states.write().await;
                let state = states
                    .entry(key.clone())
                    .or_insert_with(|| TaskState::new(spec));
                state.attempts += 1;
                state.status = TaskStatus::Running;
                state.started_at = Some(Instant::now());
                state.updated_at = Instant::now();
                state.attempts
            };

            let started = Instant::now();
            let result =
                with_deadline(&spec.name, spec.timeout, executor(params.clone())).await;
            let latency_ms = started.elapsed().as_millis() as f64;

            match result {
                Ok(value) => {
                    {
                        let mut states = self.states.write().await;
                        if let Some(state) = states.get_mut(&key) {
                            state.status = TaskStatus::Success;
                            state.result = Some(value.clone());
                            state.last_error = None;
                            state.updated_at = Instant::now();
                        }
                    }
                    self.record_metrics(&spec.name, true, latency_ms).await;
                    self.audit(&spec.name, session_id, attempt, "success", latency_ms);
                    return Ok(value);
                }
                Err(err) => {
                    let timed_out = matches!(err, TripError::Timeout { .. });
                    self.record_metrics(&spec.name, false, latency_ms).await;

                    let retryable = self.retry_classifier.is_retryable(&err);
                    let attempts_remain = attempt < spec.max_attempts;

                    {
                        let mut states = self.states.write().await;
                        if let Some(state) = states.get_mut(&key) {
                            state.last_error = Some(err.to_string());
                            state.updated_at = Instant::now();
                            if !(retryable && attempts_remain) {
                                state.status = if timed_out {
                                    TaskStatus::TimedOut
                                } else {
                                    TaskStatus::Failed
                                };
                            }
                        }
                    }

                    if retryable && attempts_remain {
                        let delay = self.backoff_for(attempt);
                        self.audit(&spec.name, session_id, attempt, "retry", latency_ms);
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    self.audit(&spec.name, session_id, attempt, "failure", latency_ms);
                    return Err(TaskError::ExecutionFailed {
                        task: spec.name.clone(),
                        attempts: attempt,
                        source: err,
                    });
                }
            }
        }
    }

    fn validate_params(spec: &TaskSpec, params: &serde_json::Value) -> Result<(), TaskError> {
        let obj = params.as_object().ok_or_else(|| TaskError::Validation {
            task: spec.name.clone(),
            message: "params must be a JSON object".to_string(),
        })?;

        for param in &spec.params {
            match obj.get(&param.name) {
                None | Some(serde_json::Value::Null) if param.required => {
                    return Err(TaskError::Validation {
                        task: spec.name.clone(),
                        message: format!("missing required param '{}'", param.name),
                    });
                }
                Some(value) if !value.is_null() && !param.kind.matches(value) => {
                    return Err(TaskError::Validation {
                        task: spec.name.clone(),
                        message: format!(
                            "param '{}' has wrong type, expected {:?}",
                            param.name, param.kind
                        ),
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let idx = (attempt as usize).saturating_sub(1);
        self.backoff_table
            .get(idx)
            .or_else(|| self.backoff_table.last())
            .copied()
            .unwrap_or(Duration::from_millis(500))
    }

    async fn record_metrics(&self, task_name: &str, success: bool, latency_ms: f64) {
        let mut metrics = self.metrics.write().await;
        metrics
            .entry(task_name.to_string())
            .or_default()
            .record(success, latency_ms);
    }

    fn audit(&self, task: &str, session_id: &str, attempt: u32, outcome: &str, latency_ms: f64) {
        let audit = serde_json::json!({
            "event": "task_audit",
            "task": task,
            "session_id": session_id,
            "attempt": attempt,
            "outcome": outcome,
            "duration_ms": latency_ms as u64,
        });
        tracing::info!(audit = %audit, "task");
    }

    /// 当前状态快照
    pub async fn state(&self, session_id: &str, task_name: &str) -> Option<TaskState> {
        self.states
            .read()
            .await
            .get(&(session_id.to_string(), task_name.to_string()))
            .cloned()
    }

    pub async fn metrics(&self, task_name: &str) -> Option<TaskMetrics> {
        self.metrics.read().await.get(task_name).cloned()
    }

    /// 会话被回收时丢弃其全部任务状态
    pub async fn evict_session(&self, session_id: &str) {
        self.states
            .write()
            .await
            .retain(|(sid, _), _| sid != session_id);
    }

    /// 年龄清扫：移除长时间未更新的状态，返回移除条数
    pub async fn evict_stale(&self, max_age: Duration) -> usize {
        let mut states = self.states.write().await;
        let before = states.len();
        states.retain(|_, s| s.updated_at.elapsed() <= max_age);
        before - states.len()
    }
}

impl Default for TaskRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_runner() -> TaskRunner {
        TaskRunner::new().with_backoff_table(vec![Duration::from_millis(5)])
    }

    fn search_spec() -> TaskSpec {
        TaskSpec::new("packages.search")
            .with_param(ParamSpec::required("destination", ParamKind::String))
            .with_param(ParamSpec::optional("duration_days", ParamKind::Number))
            .with_max_attempts(3)
            .with_timeout(Duration::from_millis(500))
    }

    #[tokio::test]
    async fn test_validation_failure_consumes_no_attempt() {
        let runner = fast_runner();
        let result = runner
            .run("s1", &search_spec(), json!({}), |_| async {
                Ok(json!("never"))
            })
            .await;
        assert!(matches!(result, Err(TaskError::Validation { .. })));
        assert!(runner.state("s1", "packages.search").await.is_none());
    }

    #[tokio::test]
    async fn test_wrong_param_type_rejected() {
        let runner = fast_runner();
        let result = runner
            .run(
                "s1",
                &search_spec(),
                json!({"destination": 42}),
                |_| async { Ok(json!("never")) },
            )
            .await;
        assert!(matches!(result, Err(TaskError::Validation { .. })));
    }

    #[tokio::test]
    async fn test_fails_twice_then_succeeds() {
        let runner = fast_runner();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result = runner
            .run(
                "s1",
                &search_spec(),
                json!({"destination": "Goa"}),
                move |_| {
                    let c = c.clone();
                    async move {
                        if c.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(TripError::Network("reset".into()))
                        } else {
                            Ok(json!({"packages": ["Goa Getaway"]}))
                        }
                    }
                },
            )
            .await;

        assert!(result.is_ok());
        let state = runner.state("s1", "packages.search").await.unwrap();
        assert_eq!(state.status, TaskStatus::Success);
        assert_eq!(state.attempts, 3);

        let metrics = runner.metrics("packages.search").await.unwrap();
        assert_eq!(metrics.calls, 3);
        assert_eq!(metrics.failures, 2);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_without_retry() {
        let runner = fast_runner();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result = runner
            .run(
                "s1",
                &search_spec(),
                json!({"destination": "Goa"}),
                move |_| {
                    let c = c.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Err(TripError::Authentication("bad token".into()))
                    }
                },
            )
            .await;

        match result {
            Err(TaskError::ExecutionFailed { attempts, .. }) => assert_eq!(attempts, 1),
            other => panic!("expected ExecutionFailed, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let state = runner.state("s1", "packages.search").await.unwrap();
        assert_eq!(state.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_max_attempts_exceeded_fails_immediately() {
        let runner = fast_runner();
        let spec = search_spec().with_max_attempts(2);
        let params = json!({"destination": "Goa"});

        let _ = runner
            .run("s1", &spec, params.clone(), |_| async {
                Err(TripError::Network("down".into()))
            })
            .await;

        // 两次尝试已耗尽，再 run 直接拒绝且不调用执行器
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = runner
            .run("s1", &spec, params, move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("never"))
                }
            })
            .await;

        assert!(matches!(result, Err(TaskError::MaxAttemptsExceeded { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_successful_runs_do_not_consume_attempt_budget() {
        let runner = fast_runner();
        let spec = search_spec().with_max_attempts(2);
        let params = json!({"destination": "Goa"});

        // 同一 (session, task) 连续成功运行的次数不受尝试上限约束
        for _ in 0..3 {
            let result = runner
                .run("s1", &spec, params.clone(), |_| async { Ok(json!("ok")) })
                .await;
            assert!(result.is_ok());
        }

        let state = runner.state("s1", "packages.search").await.unwrap();
        assert_eq!(state.status, TaskStatus::Success);
        assert_eq!(state.attempts, 1);
    }

    #[tokio::test]
    async fn test_timeout_sets_timed_out_status() {
        let runner = fast_runner();
        let spec = TaskSpec::new("slow")
            .with_max_attempts(1)
            .with_timeout(Duration::from_millis(20));

        let result = runner
            .run("s1", &spec, json!({}), |_| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(json!("late"))
            })
            .await;

        assert!(result.is_err());
        let state = runner.state("s1", "slow").await.unwrap();
        assert_eq!(state.status, TaskStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_evict_session_drops_state() {
        let runner = fast_runner();
        let spec = search_spec();
        let _ = runner
            .run("s1", &spec, json!({"destination": "Goa"}), |_| async {
                Ok(json!("ok"))
            })
            .await;
        assert!(runner.state("s1", "packages.search").await.is_some());

        runner.evict_session("s1").await;
        assert!(runner.state("s1", "packages.search").await.is_none());
    }
}
