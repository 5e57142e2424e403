//! Tripflow - 旅行对话助手后端：弹性执行与编排层
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 会话、编排器与应用上下文装配
//! - **error**: 错误类型、分类器与恢复策略注册表
//! - **handlers**: 能力处理器（套餐搜索/详情、预订协助、通用客服）与注册表
//! - **llm**: 补全客户端抽象（OpenAI 兼容 / Mock）
//! - **observability**: tracing 初始化
//! - **resilience**: 熔断、重试、超时守卫与结果缓存
//! - **routing**: 能力路由器（LLM 分类 + 降级）
//! - **server**: axum HTTP 入口
//! - **task**: 任务执行中间件（参数校验、状态机、指标与审计日志）
//! - **upstream**: 旅行数据上游客户端（认证、分页、限流处置）

pub mod config;
pub mod core;
pub mod error;
pub mod handlers;
pub mod llm;
pub mod observability;
pub mod resilience;
pub mod routing;
pub mod server;
pub mod task;
pub mod upstream;
