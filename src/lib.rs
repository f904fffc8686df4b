//! Shipdeck - 多项目部署面板核心
//!
//! 每个环境一把分布式锁，多主机并行执行部署命令，实时日志推送与部署日志归档

pub mod error;
pub mod middleware;
pub mod infra;
pub mod domain;
pub mod config;
pub mod state;
pub mod api;
pub mod services;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;

use crate::config::env::constants::HUB_CLEANUP_INTERVAL_SECS;
use crate::state::{get_shutdown_token, AppState};

/// 启动 HTTP 服务，直到全局 shutdown 被触发
pub async fn serve(state: Arc<AppState>, listener: TcpListener) -> std::io::Result<()> {
    let shutdown = get_shutdown_token();

    // 定期清理已封存的会话通道，历史从日志存储回放
    let hub = state.log_hub.clone();
    let cleanup_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(HUB_CLEANUP_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = cleanup_shutdown.cancelled() => break,
                _ = interval.tick() => hub.cleanup().await,
            }
        }
    });

    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "Shipdeck listening");
    }

    let app = api::router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
