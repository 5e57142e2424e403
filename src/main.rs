//! Tripflow - 旅行对话助手后端
//!
//! 入口：初始化日志、加载配置、装配组件并启动 HTTP 服务。

use anyhow::Context;
use tripflow::config::load_config;
use tripflow::core::AppContext;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tripflow::observability::init();

    let cfg = load_config(None).context("Failed to load configuration")?;
    let ctx = AppContext::build(cfg)
        .await
        .context("Failed to build application context")?;
    ctx.spawn_sweeps();

    tripflow::server::serve(ctx).await.context("Server failed")?;
    Ok(())
}
