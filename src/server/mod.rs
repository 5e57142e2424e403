//! HTTP 入口：axum 路由与启动

pub mod routes;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use crate::core::AppContext;

/// 构建应用路由
pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/api/chat", post(routes::api_chat))
        .route("/api/health", get(routes::api_health))
        .with_state(ctx)
}

/// 绑定端口并服务到进程收到 ctrl-c
pub async fn serve(ctx: Arc<AppContext>) -> anyhow::Result<()> {
    let host = ctx.config.server.host.clone();
    let port = ctx.config.server.port;
    let app = build_router(ctx.clone());

    let addr: std::net::SocketAddr = format!("{host}:{port}").parse()?;
    tracing::info!("listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            ctx.shutdown();
        })
        .await?;
    Ok(())
}
