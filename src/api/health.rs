//! 健康检查和项目总览 API
//!
//! 包含 /health, /projects 端点

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;

use crate::config::env::constants::VERSION;
use crate::error::ApiResult;
use crate::state::AppState;

/// 健康检查响应
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    node: String,
    timestamp: String,
    uptime_secs: i64,
    running_deploys: usize,
    channels: usize,
    active_channels: usize,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/projects", get(list_projects))
}

/// 健康检查
///
/// GET /health
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let now = chrono::Utc::now();
    Json(HealthResponse {
        status: "ok",
        service: "shipdeck",
        version: VERSION,
        node: state.config.node.clone(),
        timestamp: now.to_rfc3339(),
        uptime_secs: (now - state.started_at).num_seconds(),
        running_deploys: state.deployer.running().await.len(),
        channels: state.log_hub.count().await,
        active_channels: state.log_hub.active_count().await,
    })
}

/// 项目总览：拓扑 + 锁 + 备注 + 运行中的会话
///
/// GET /projects
async fn list_projects(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.deployer.overview().await?))
}
